//! The `ocr` subcommand.

use clap::Args;
use futures::StreamExt as _;

use crate::{
    async_utils::io::{read_json_or_toml, write_output},
    config::{EngineValue, OcrOptions, parse_variable},
    engine::{EngineBackend, MAX_PAGE_SEG_MODE},
    pipeline::{OcrStream, dispatch::DispatchCounters, ocr_to_text, plan::PageRange},
    prelude::*,
    ui::{ProgressConfig, Ui},
};

/// OCR command line arguments. Anything not given here comes from
/// `--config`, or from the built-in defaults.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// The PDF to OCR.
    pub input_path: PathBuf,

    /// Write JSONL output to this path instead of standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Load options from a JSON or TOML file. Command-line flags win.
    #[clap(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Pages to render at a time. Raised to the number of jobs if smaller.
    #[clap(long)]
    pub batch_size: Option<usize>,

    /// First page to OCR, starting from 1.
    #[clap(long)]
    pub first_page: Option<usize>,

    /// Last page to OCR. 0 means the last page, -1 the one before, and so on.
    #[clap(long, allow_negative_numbers = true)]
    pub last_page: Option<i64>,

    /// Rasterization resolution.
    #[clap(long)]
    pub dpi: Option<u32>,

    /// Rasterize and OCR in grayscale.
    #[clap(long)]
    pub grayscale: bool,

    /// Page segmentation mode.
    #[clap(long, value_parser = clap::value_parser!(u8).range(0..=MAX_PAGE_SEG_MODE as i64))]
    pub psm: Option<u8>,

    /// OCR language(s), like `eng` or `eng+deu`.
    #[clap(long = "lang")]
    pub language: Option<String>,

    /// Directory containing trained language data.
    #[clap(long)]
    pub tessdata_dir: Option<PathBuf>,

    /// OCR engine implementation.
    #[clap(long, value_enum)]
    pub engine: Option<EngineBackend>,

    /// Set an engine variable. May be repeated.
    #[clap(short = 'c', value_name = "KEY=VALUE", value_parser = parse_variable)]
    pub variables: Vec<(String, EngineValue)>,

    /// Seconds to allow for each page. 0 means no limit.
    #[clap(long, value_name = "SECS")]
    pub task_timeout: Option<u64>,

    /// Skip windows that can't be rendered, instead of failing.
    #[clap(long)]
    pub skip_failed_windows: bool,

    /// Number of OCR worker processes. Defaults to the number of CPUs.
    #[clap(short = 'j', long)]
    pub jobs: Option<usize>,
}

impl OcrOpts {
    /// Build our final options: defaults, then `--config`, then flags.
    pub async fn to_options(&self) -> Result<OcrOptions> {
        let mut options = match &self.config {
            Some(path) => read_json_or_toml::<OcrOptions>(path).await?,
            None => OcrOptions::default(),
        };
        self.apply_to(&mut options);
        options.validate()?;
        Ok(options)
    }

    /// Override `options` with any flags we were given.
    fn apply_to(&self, options: &mut OcrOptions) {
        if let Some(batch_size) = self.batch_size {
            options.batch_size = batch_size;
        }
        if let Some(first_page) = self.first_page {
            options.first_page = first_page;
        }
        if let Some(last_page) = self.last_page {
            options.last_page = last_page;
        }
        if let Some(dpi) = self.dpi {
            options.user_defined_dpi = dpi;
        }
        if self.grayscale {
            options.grayscale = true;
        }
        if self.psm.is_some() {
            options.psm = self.psm;
        }
        if let Some(language) = &self.language {
            options.language = language.clone();
        }
        if self.tessdata_dir.is_some() {
            options.tessdata_dir = self.tessdata_dir.clone();
        }
        if let Some(engine) = self.engine {
            options.engine = engine;
        }
        options.variables.extend(self.variables.iter().cloned());
        if let Some(task_timeout) = self.task_timeout {
            options.task_timeout_secs = task_timeout;
        }
        if self.skip_failed_windows {
            options.skip_failed_windows = true;
        }
        if self.jobs.is_some() {
            options.jobs = self.jobs;
        }
    }
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all, fields(path = %opts.input_path.display()))]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<()> {
    let options = opts.to_options().await?;
    debug!("OCR options: {:?}", options);

    let OcrStream {
        stream,
        range,
        counters,
        ..
    } = ocr_to_text(&opts.input_path, &options).await?;

    // Configure our progress bar.
    let pb = ui.new_page_progress(
        &ProgressConfig {
            emoji: "📄",
            msg: "OCRing pages",
            done_msg: "OCRed pages",
        },
        range.len(),
    );

    let output = pb
        .wrap_stream(stream)
        .map(|page_text| {
            page_text.and_then(|page_text| {
                serde_json::to_value(&page_text).context("failed to serialize page text")
            })
        })
        .boxed();
    let result = write_output(opts.output_path.as_deref(), output).await;

    let counters = counters.lock().expect("lock poisoned").clone();
    report_summary(range, &counters);
    result
}

/// Pages we planned to OCR but didn't produce, in order.
fn missing_pages(counters: &DispatchCounters) -> Vec<usize> {
    let mut missing = counters
        .failed_pages
        .iter()
        .chain(&counters.skipped_pages)
        .copied()
        .collect::<Vec<_>>();
    missing.sort_unstable();
    missing
}

/// Log how many pages we produced, and which ones we lost.
fn report_summary(range: PageRange, counters: &DispatchCounters) {
    info!(
        produced = counters.succeeded,
        planned = range.len(),
        "OCRed {} of {} pages",
        counters.succeeded,
        range.len()
    );
    let missing = missing_pages(counters);
    if !missing.is_empty() {
        warn!(?missing, "{} pages could not be OCRed", missing.len());
    }
}

use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod config;
mod cpu_limit;
mod engine;
mod pdf;
mod pipeline;
mod prelude;
mod ui;
mod worker;

/// OCR PDF documents page by page, in parallel.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
External Tools:
  - pdfinfo, pdftoppm and pdftotext from poppler-utils.
  - tesseract, plus trained data for the languages you use.

Environment Variables:
  - RUST_LOG (optional): Log filter, like "info" or "pdf_page_ocr=debug".
  - TESSDATA_PREFIX (optional): Where tesseract looks for trained data.
  - OMP_THREAD_LIMIT (optional): Threads per tesseract process. Defaults
    to 1 for our worker processes.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// OCR a PDF, writing one JSON line per page.
    Ocr(cmd::ocr::OcrOpts),
    /// Extract embedded text with `pdftotext`, without OCR.
    Text(cmd::text::TextOpts),
    /// Print the number of pages in a PDF, or 0 if it can't be read.
    Pages(cmd::pages::PagesOpts),
    /// Print schemas for output and configuration formats.
    Schema(cmd::schema::SchemaOpts),
    /// OCR a single page image. Used internally by `ocr`.
    #[clap(hide = true)]
    Worker,
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Ocr(opts) => opts.output_path.is_none(),
            Cmd::Schema(opts) => opts.output_path.is_none(),
            Cmd::Text(_) => false,
            Cmd::Pages(_) | Cmd::Worker => true,
        }
    }

    /// The log level to use when `RUST_LOG` is not set.
    fn default_log_directive(&self) -> &'static str {
        match self {
            // Workers run many at a time, so only report problems.
            Cmd::Worker => "warn",
            _ => "info",
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from a `.env` file, if it exists, before
    // we read `RUST_LOG`.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();

    let ui = Ui::init();

    // Initialize tracing.
    let directive = Directive::from_str(opts.subcmd.default_log_directive())
        .expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui, opts).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui, opts: Opts) -> Result<()> {
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Ocr(ocr_opts) => {
            cmd::ocr::cmd_ocr(ui, ocr_opts).await?;
        }
        Cmd::Text(text_opts) => {
            cmd::text::cmd_text(text_opts).await?;
        }
        Cmd::Pages(pages_opts) => {
            cmd::pages::cmd_pages(pages_opts).await?;
        }
        Cmd::Schema(schema_opts) => {
            cmd::schema::cmd_schema(schema_opts).await?;
        }
        Cmd::Worker => {
            cmd::worker::cmd_worker().await?;
        }
    }
    Ok(())
}

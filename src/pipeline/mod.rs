//! The batched OCR pipeline.
//!
//! We count the document's pages, resolve the requested page range, and split
//! it into windows. Then, one window at a time, we rasterize the window's
//! pages into a temporary directory, OCR them in parallel worker processes,
//! yield the results as they complete, and delete the directory before moving
//! on to the next window.
//!
//! Windows are always yielded in page order. Within a window, results come
//! out in completion order, so use [`PageText::page`] rather than stream
//! position to identify pages.

pub mod dispatch;
pub mod plan;

use std::{sync::Arc, vec};

use futures::{StreamExt as _, stream};
use schemars::JsonSchema;

use crate::{
    async_utils::BoxedStream,
    config::OcrOptions,
    cpu_limit::available_parallelism,
    pdf::render::{PageRenderer, Poppler, RenderOptions, RenderedWindow},
    prelude::*,
    worker::{PageWorker, ProcessWorker},
};

use self::{
    dispatch::{Dispatcher, SharedCounters},
    plan::{PageRange, Window, plan_windows},
};

/// The text of a single page.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct PageText {
    /// The 1-based page number within the original document.
    pub page: usize,

    /// The recognized text. Empty if the engine found no text on the page.
    pub text: String,
}

/// A running OCR job.
pub struct OcrStream {
    /// Page results, window by window. Ends early with an `Err` if a window
    /// can't be rendered and we weren't asked to skip such windows.
    pub stream: BoxedStream<Result<PageText>>,

    /// The total number of pages in the document, or 0 if unknown.
    pub total_pages: usize,

    /// The pages we'll attempt to OCR.
    pub range: PageRange,

    /// Success and failure counts, updated as the stream is consumed.
    pub counters: SharedCounters,
}

/// OCR `path` using Poppler and one worker process per page.
pub async fn ocr_to_text(path: &Path, options: &OcrOptions) -> Result<OcrStream> {
    let worker = ProcessWorker::current_exe()?;
    ocr_to_text_with(path, options, Arc::new(Poppler), Arc::new(worker)).await
}

/// OCR `path` using the supplied renderer and worker.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn ocr_to_text_with(
    path: &Path,
    options: &OcrOptions,
    renderer: Arc<dyn PageRenderer>,
    worker: Arc<dyn PageWorker>,
) -> Result<OcrStream> {
    options.validate()?;

    // Resolve our page range exactly once, up front.
    let total_pages = renderer.page_count(path).await;
    let range = PageRange::resolve(options.first_page, options.last_page, total_pages)?;
    let parallelism = options.jobs.unwrap_or_else(available_parallelism);
    let windows = plan_windows(range, options.batch_size, parallelism);
    info!(
        total_pages,
        first_page = range.first_page,
        last_page = range.last_page,
        windows = windows.len(),
        workers = parallelism,
        "Planned OCR run"
    );

    // Check the engine once here, rather than failing every page. Skip this
    // when there's nothing to OCR.
    let engine = if windows.is_empty() {
        options.engine_config()
    } else {
        worker.prepare(options.engine_config()).await?
    };

    let dispatcher = Dispatcher::new(worker, engine, parallelism, options.task_timeout());
    let counters = dispatcher.counters();
    let state = DriverState {
        path: path.to_owned(),
        renderer,
        render_options: RenderOptions {
            dpi: options.user_defined_dpi,
            grayscale: options.grayscale,
        },
        skip_failed_windows: options.skip_failed_windows,
        dispatcher,
        windows: windows.into_iter(),
        current: None,
    };
    let stream = stream::unfold(state, |mut state| async move {
        let item = state.next_item().await?;
        Some((item, state))
    })
    .boxed();

    Ok(OcrStream {
        stream,
        total_pages,
        range,
        counters,
    })
}

/// The window we're currently yielding results for.
struct CurrentWindow {
    /// Our page images. Must outlive `results`.
    rendered: RenderedWindow,
    /// Results from the dispatcher.
    results: BoxedStream<PageText>,
}

/// State carried between items of the output stream.
struct DriverState {
    path: PathBuf,
    renderer: Arc<dyn PageRenderer>,
    render_options: RenderOptions,
    skip_failed_windows: bool,
    dispatcher: Dispatcher,
    /// Windows we haven't started yet.
    windows: vec::IntoIter<Window>,
    current: Option<CurrentWindow>,
}

impl DriverState {
    /// Produce the next output item, advancing through windows as needed.
    async fn next_item(&mut self) -> Option<Result<PageText>> {
        loop {
            if let Some(current) = &mut self.current {
                if let Some(page_text) = current.results.next().await {
                    return Some(Ok(page_text));
                }
                // This window is done. Release its images before starting
                // the next one.
                if let Some(CurrentWindow { rendered, results }) = self.current.take() {
                    drop(results);
                    let window = rendered.window();
                    if let Err(err) = rendered.close() {
                        error!("{:#}", err);
                    }
                    debug!(start = window.start, end = window.end, "Finished window");
                }
                continue;
            }

            let window = self.windows.next()?;
            match self
                .renderer
                .render_window(&self.path, window, &self.render_options)
                .await
            {
                Ok(rendered) => {
                    let results = self.dispatcher.dispatch_window(rendered.pages());
                    self.current = Some(CurrentWindow { rendered, results });
                }
                Err(err) if self.skip_failed_windows => {
                    warn!(
                        start = window.start,
                        end = window.end,
                        "Skipping window that could not be rendered: {:#}",
                        err
                    );
                    self.dispatcher
                        .counters()
                        .lock()
                        .expect("lock poisoned")
                        .skipped_pages
                        .extend(window.pages());
                }
                Err(err) => {
                    // Fatal: report the error and stop.
                    self.windows = Vec::new().into_iter();
                    return Some(Err(err.context(format!(
                        "failed to render pages {}-{}",
                        window.start, window.end
                    ))));
                }
            }
        }
    }
}

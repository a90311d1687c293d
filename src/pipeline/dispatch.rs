//! Dispatching a window's pages to a bounded pool of OCR workers.
//!
//! Every page becomes one task on a [`JoinSet`]. We remember which page each
//! task belongs to, and yield results in whatever order the tasks finish, so
//! a slow page never holds up the pages behind it. A failed page is logged,
//! counted and left out of the output; the rest of the window carries on.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{StreamExt as _, stream};
use tokio::{
    sync::Semaphore,
    task::{self, JoinSet},
};

use crate::{
    async_utils::BoxedStream,
    engine::EngineConfig,
    pdf::render::RenderedPage,
    prelude::*,
    worker::{PageWorker, WorkerRequest, WorkerResponse},
};

use super::PageText;

/// Running totals for an OCR run, shared between the dispatcher and whoever
/// reports on the run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchCounters {
    /// Pages OCRed successfully.
    pub succeeded: usize,
    /// Pages whose OCR task failed or timed out.
    pub failed_pages: Vec<usize>,
    /// Pages in windows which could not be rendered, and were skipped.
    pub skipped_pages: Vec<usize>,
}

/// Shared, lockable [`DispatchCounters`].
pub type SharedCounters = Arc<Mutex<DispatchCounters>>;

/// Submits OCR tasks to a bounded pool of workers.
#[derive(Clone)]
pub struct Dispatcher {
    /// Where tasks actually run.
    worker: Arc<dyn PageWorker>,
    /// Engine configuration copied into every request.
    engine: Arc<EngineConfig>,
    /// Maximum number of tasks running at once.
    capacity: usize,
    /// Time limit per task.
    task_timeout: Option<Duration>,
    /// Totals for the whole run.
    counters: SharedCounters,
}

impl Dispatcher {
    /// Create a new dispatcher. A `capacity` of zero is treated as one.
    pub fn new(
        worker: Arc<dyn PageWorker>,
        engine: EngineConfig,
        capacity: usize,
        task_timeout: Option<Duration>,
    ) -> Self {
        Self {
            worker,
            engine: Arc::new(engine),
            capacity: capacity.max(1),
            task_timeout,
            counters: SharedCounters::default(),
        }
    }

    /// Our counters.
    pub fn counters(&self) -> SharedCounters {
        self.counters.clone()
    }

    /// Start OCRing every page, and return a stream of results in
    /// completion order.
    ///
    /// Must be called from inside a Tokio runtime. Dropping the stream aborts
    /// any unfinished tasks.
    #[instrument(level = "debug", skip_all, fields(pages = pages.len()))]
    pub fn dispatch_window(&self, pages: &[RenderedPage]) -> BoxedStream<PageText> {
        // Our pool. Sized by the number of workers, not the window, so big
        // windows still only run `capacity` OCR processes at once.
        let pool = Arc::new(Semaphore::new(self.capacity));
        let mut tasks = JoinSet::new();
        let mut page_by_task = HashMap::with_capacity(pages.len());
        for page in pages {
            let request = WorkerRequest {
                image_path: page.image_path.clone(),
                engine: (*self.engine).clone(),
            };
            let handle = tasks.spawn(run_task(
                self.worker.clone(),
                pool.clone(),
                self.task_timeout,
                request,
            ));
            page_by_task.insert(handle.id(), page.page_number);
        }

        let state = WindowTasks {
            tasks,
            page_by_task,
            counters: self.counters.clone(),
        };
        stream::unfold(state, |mut state| async move {
            let page_text = state.next_success().await?;
            Some((page_text, state))
        })
        .boxed()
    }
}

/// Run one task once the pool has room for it.
async fn run_task(
    worker: Arc<dyn PageWorker>,
    pool: Arc<Semaphore>,
    task_timeout: Option<Duration>,
    request: WorkerRequest,
) -> Result<WorkerResponse> {
    let _permit = pool
        .acquire_owned()
        .await
        .context("OCR worker pool was closed")?;
    match task_timeout {
        Some(limit) => tokio::time::timeout(limit, worker.ocr_page(request))
            .await
            .map_err(|_| anyhow!("OCR timed out after {:?}", limit))?,
        None => worker.ocr_page(request).await,
    }
}

/// The in-flight tasks for one window.
struct WindowTasks {
    /// Our tasks.
    tasks: JoinSet<Result<WorkerResponse>>,
    /// Which page each task is working on.
    page_by_task: HashMap<task::Id, usize>,
    /// Totals for the whole run.
    counters: SharedCounters,
}

impl WindowTasks {
    /// Wait for the next task to succeed, logging and counting any failures
    /// along the way. Returns `None` once all tasks are done.
    async fn next_success(&mut self) -> Option<PageText> {
        loop {
            let (id, result) = match self.tasks.join_next_with_id().await? {
                Ok((id, result)) => (id, result),
                Err(err) => (err.id(), Err(anyhow!("OCR task did not complete: {}", err))),
            };
            let Some(page) = self.page_by_task.remove(&id) else {
                error!(task = %id, "OCR task finished for an unknown page");
                continue;
            };
            let mut counters = self.counters.lock().expect("lock poisoned");
            match result {
                Ok(response) => {
                    counters.succeeded += 1;
                    debug!(page, "OCRed page");
                    return Some(PageText {
                        page,
                        text: response.text.unwrap_or_default(),
                    });
                }
                Err(err) => {
                    error!(page, "page #{} generated an error: {:#}", page, err);
                    counters.failed_pages.push(page);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{BTreeMap, BTreeSet},
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::engine::EngineBackend;

    fn engine_config() -> EngineConfig {
        EngineConfig {
            backend: EngineBackend::Cli,
            language: "eng".to_owned(),
            datapath: None,
            variables: BTreeMap::new(),
            psm: None,
            grayscale: false,
            languages_checked: false,
        }
    }

    fn pages(numbers: impl IntoIterator<Item = usize>) -> Vec<RenderedPage> {
        numbers
            .into_iter()
            .map(|page_number| RenderedPage {
                page_number,
                image_path: PathBuf::from(format!("/fake/page-{page_number:03}.tif")),
            })
            .collect()
    }

    /// Page number encoded in a fake image path.
    fn page_of(request: &WorkerRequest) -> usize {
        let name = request.image_path.file_stem().unwrap().to_string_lossy();
        name.trim_start_matches("page-").parse().unwrap()
    }

    /// A worker that takes longer for lower page numbers, and fails,
    /// panics, or hangs on request.
    #[derive(Default)]
    struct FakeWorker {
        fail: BTreeSet<usize>,
        panic: BTreeSet<usize>,
        hang: BTreeSet<usize>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    #[async_trait]
    impl PageWorker for FakeWorker {
        async fn ocr_page(&self, request: WorkerRequest) -> Result<WorkerResponse> {
            let page = page_of(&request);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            let delay = if self.hang.contains(&page) {
                Duration::from_secs(3600)
            } else {
                Duration::from_millis(20 * (10 - page.min(10)) as u64)
            };
            tokio::time::sleep(delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.panic.contains(&page) {
                panic!("worker crashed on page {page}");
            }
            if self.fail.contains(&page) {
                return Err(anyhow!("cannot decode page {page}"));
            }
            Ok(WorkerResponse {
                text: Some(format!("text of page {page}")),
            })
        }
    }

    async fn collect(dispatcher: &Dispatcher, pages: &[RenderedPage]) -> Vec<PageText> {
        dispatcher.dispatch_window(pages).collect().await
    }

    #[tokio::test]
    async fn every_page_is_tagged_correctly() {
        let dispatcher = Dispatcher::new(Arc::new(FakeWorker::default()), engine_config(), 4, None);
        let results = collect(&dispatcher, &pages(1..=6)).await;
        assert_eq!(results.len(), 6);
        for result in &results {
            assert_eq!(result.text, format!("text of page {}", result.page));
        }
        let numbers = results.iter().map(|r| r.page).collect::<BTreeSet<_>>();
        assert_eq!(numbers, (1..=6).collect());
        assert_eq!(dispatcher.counters().lock().unwrap().succeeded, 6);
    }

    #[tokio::test]
    async fn results_arrive_in_completion_order() {
        // Later pages finish first, so they should be yielded first.
        let dispatcher = Dispatcher::new(Arc::new(FakeWorker::default()), engine_config(), 3, None);
        let results = collect(&dispatcher, &pages(1..=3)).await;
        let order = results.iter().map(|r| r.page).collect::<Vec<_>>();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn one_failure_is_isolated() {
        let worker = FakeWorker {
            fail: BTreeSet::from([3]),
            ..FakeWorker::default()
        };
        let dispatcher = Dispatcher::new(Arc::new(worker), engine_config(), 2, None);
        let results = collect(&dispatcher, &pages(1..=5)).await;
        let numbers = results.iter().map(|r| r.page).collect::<BTreeSet<_>>();
        assert_eq!(numbers, BTreeSet::from([1, 2, 4, 5]));
        let counters = dispatcher.counters().lock().unwrap().clone();
        assert_eq!(counters.failed_pages, vec![3]);
        assert_eq!(counters.succeeded, 4);
    }

    #[tokio::test]
    async fn panicking_task_is_isolated() {
        let worker = FakeWorker {
            panic: BTreeSet::from([2]),
            ..FakeWorker::default()
        };
        let dispatcher = Dispatcher::new(Arc::new(worker), engine_config(), 4, None);
        let results = collect(&dispatcher, &pages(1..=3)).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.page != 2));
        assert_eq!(dispatcher.counters().lock().unwrap().failed_pages, vec![2]);
    }

    #[tokio::test]
    async fn hung_task_times_out() {
        let worker = FakeWorker {
            hang: BTreeSet::from([1]),
            ..FakeWorker::default()
        };
        let dispatcher = Dispatcher::new(
            Arc::new(worker),
            engine_config(),
            2,
            Some(Duration::from_millis(400)),
        );
        let results = collect(&dispatcher, &pages(1..=2)).await;
        assert_eq!(results.iter().map(|r| r.page).collect::<Vec<_>>(), vec![2]);
        assert_eq!(dispatcher.counters().lock().unwrap().failed_pages, vec![1]);
    }

    #[tokio::test]
    async fn pool_bounds_concurrency() {
        let worker = Arc::new(FakeWorker::default());
        let dispatcher = Dispatcher::new(worker.clone(), engine_config(), 2, None);
        let results = collect(&dispatcher, &pages(1..=8)).await;
        assert_eq!(results.len(), 8);
        let max_running = worker.max_running.load(Ordering::SeqCst);
        assert!(max_running <= 2, "{max_running} tasks ran at once");
    }

    #[tokio::test]
    async fn empty_window_yields_nothing() {
        let dispatcher = Dispatcher::new(Arc::new(FakeWorker::default()), engine_config(), 2, None);
        assert!(collect(&dispatcher, &[]).await.is_empty());
    }
}

//! OCR worker tasks, and running them in isolated worker processes.
//!
//! Engine handles aren't thread-safe, so we run each page in a separate
//! process: our own binary, started with the hidden `worker` subcommand. The
//! parent sends one [`WorkerRequest`] as JSON on standard input, and the child
//! replies with one [`WorkerResponse`] on standard output.

use std::{env, ffi::OsString, process::Stdio};

use tokio::{io::AsyncWriteExt as _, process::Command};

use crate::{
    async_utils::{check_for_command_failure, spawn_blocking_propagating_panics},
    engine::{EngineConfig, OcrEngine, RawImage, check_engine, new_engine},
    prelude::*,
};

/// A request to OCR a single page image.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct WorkerRequest {
    /// The image to OCR.
    pub image_path: PathBuf,
    /// A copy of the run's engine configuration.
    pub engine: EngineConfig,
}

/// The result of OCRing a single page image.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct WorkerResponse {
    /// The recognized text, or `None` if the engine found nothing.
    pub text: Option<String>,
}

/// Load an image and convert it to raw 8-bit pixels.
///
/// Grayscale images have one channel, everything else is converted to RGB.
pub fn load_raw_image(path: &Path, grayscale: bool) -> Result<RawImage> {
    let image = image::open(path)
        .with_context(|| format!("failed to load image {:?}", path.display()))?;
    let (data, width, height, channels) = if grayscale {
        let gray = image.into_luma8();
        let (width, height) = gray.dimensions();
        (gray.into_raw(), width, height, 1)
    } else {
        let rgb = image.into_rgb8();
        let (width, height) = rgb.dimensions();
        (rgb.into_raw(), width, height, 3)
    };
    Ok(RawImage {
        data,
        width,
        height,
        channels,
    })
}

/// OCR one page, using a fresh engine handle for this task.
#[instrument(level = "debug", skip_all, fields(image = %request.image_path.display()))]
pub fn run_worker_task(request: &WorkerRequest) -> Result<WorkerResponse> {
    let mut engine = new_engine(&request.engine)?;
    run_worker_task_with(engine.as_mut(), request)
}

/// OCR one page using the supplied engine handle.
pub fn run_worker_task_with(
    engine: &mut dyn OcrEngine,
    request: &WorkerRequest,
) -> Result<WorkerResponse> {
    let config = &request.engine;
    let image = load_raw_image(&request.image_path, config.grayscale)?;
    debug!(
        width = image.width,
        height = image.height,
        channels = image.channels,
        "Loaded page image"
    );
    engine.init(&config.language, config.datapath.as_deref())?;
    engine.configure(&config.variables, config.psm);
    let text = engine.recognize(&image)?;
    Ok(WorkerResponse { text })
}

/// Something which can OCR a page image somewhere, usually in another
/// process.
#[async_trait]
pub trait PageWorker: Send + Sync + 'static {
    /// Called once before any pages are sent. Fails if the engine can't
    /// run, and otherwise returns the configuration to send with each page.
    async fn prepare(&self, engine: EngineConfig) -> Result<EngineConfig> {
        Ok(engine)
    }

    /// OCR a single page.
    async fn ocr_page(&self, request: WorkerRequest) -> Result<WorkerResponse>;
}

/// A [`PageWorker`] which runs every task in a fresh child process.
#[derive(Clone, Debug)]
pub struct ProcessWorker {
    /// The binary to run. Must support the `worker` subcommand.
    program: OsString,
}

impl ProcessWorker {
    /// Create a worker which runs a specific binary.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Create a worker which re-runs the current executable.
    pub fn current_exe() -> Result<Self> {
        let program = env::current_exe().context("cannot find our own executable")?;
        Ok(Self::new(program))
    }
}

#[async_trait]
impl PageWorker for ProcessWorker {
    /// Check the engine and its languages in this process, so that workers
    /// don't each have to.
    async fn prepare(&self, mut engine: EngineConfig) -> Result<EngineConfig> {
        let config = engine.clone();
        spawn_blocking_propagating_panics(move || check_engine(&config))
            .await
            .context("OCR engine is not usable")?;
        engine.languages_checked = true;
        Ok(engine)
    }

    #[instrument(level = "trace", skip_all, fields(image = %request.image_path.display()))]
    async fn ocr_page(&self, request: WorkerRequest) -> Result<WorkerResponse> {
        let payload =
            serde_json::to_vec(&request).context("failed to serialize worker request")?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // If we're cancelled or time out, take the child down with us.
            .kill_on_drop(true);
        // Turn off tesseract's inner multithreading, since we already run one
        // worker per CPU.
        if env::var_os("OMP_THREAD_LIMIT").is_none() {
            cmd.env("OMP_THREAD_LIMIT", "1");
        }
        let mut child = cmd.spawn().context("failed to start OCR worker process")?;

        let mut stdin = child.stdin.take().context("worker has no stdin")?;
        stdin
            .write_all(&payload)
            .await
            .context("failed to send request to OCR worker")?;
        // Close stdin so the worker sees EOF.
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .context("failed to wait for OCR worker")?;
        check_for_command_failure("OCR worker", &output)?;
        serde_json::from_slice(&output.stdout).context("failed to parse OCR worker response")
    }
}

//! OCR engine handles.
//!
//! An engine handle wraps one instance of the recognition engine. Handles are
//! stateful and not safe to share between threads, so every OCR worker
//! process constructs, initializes and drops its own.
//!
//! The call sequence is always `init` → `configure` → `recognize`.

use std::collections::BTreeMap;

use clap::ValueEnum;
use schemars::JsonSchema;

use crate::prelude::*;

pub mod cli;
#[cfg(feature = "native-tesseract")]
pub mod native;

/// Highest page segmentation mode understood by the engine.
pub const MAX_PAGE_SEG_MODE: u8 = 13;

/// Errors reported by an engine handle.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// `recognize` was called before `init` succeeded.
    #[error("OCR engine is not ready: it must be initialized with a language model first")]
    NotReady,

    /// The engine could not load its language model, or is not installed.
    #[error("OCR engine initialization failed: {0}")]
    InitFailed(String),

    /// The engine ran, but could not recognize the image.
    #[error("OCR recognition failed: {0}")]
    Recognition(String),

    /// An I/O error talking to the engine.
    #[error("OCR engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which engine implementation should we use?
#[derive(
    Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum EngineBackend {
    /// Run the `tesseract` command-line tool.
    #[default]
    Cli,
    /// Call libtesseract directly. Requires the `native-tesseract` feature.
    Native,
}

/// Read-only engine configuration, copied into each worker task.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EngineConfig {
    /// Engine implementation.
    pub backend: EngineBackend,
    /// Language model(s), like `eng` or `eng+fra`.
    pub language: String,
    /// Override for the trained data directory.
    pub datapath: Option<PathBuf>,
    /// Run-time engine variables.
    pub variables: BTreeMap<String, String>,
    /// Page segmentation mode.
    pub psm: Option<u8>,
    /// Should images be converted to a single gray channel before OCR?
    pub grayscale: bool,
    /// Has the parent process already checked that the engine and every
    /// language are installed? Lets each worker skip the check.
    #[serde(default)]
    pub languages_checked: bool,
}

/// Raw, uncompressed 8-bit pixels handed to the engine.
#[derive(Clone, Debug)]
pub struct RawImage {
    /// Row-major pixel data, `width * height * channels` bytes.
    pub data: Vec<u8>,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per pixel: 1 (gray), 3 (RGB) or 4 (RGBA).
    pub channels: u8,
}

impl RawImage {
    /// Bytes per row of pixels.
    pub fn bytes_per_line(&self) -> usize {
        self.width as usize * usize::from(self.channels)
    }

    /// Make sure our buffer is as large as our dimensions claim.
    pub fn check(&self) -> Result<(), EngineError> {
        if !matches!(self.channels, 1 | 3 | 4) {
            return Err(EngineError::Recognition(format!(
                "unsupported channel depth {}",
                self.channels
            )));
        }
        let expected = self.bytes_per_line() * self.height as usize;
        if self.data.len() != expected || expected == 0 {
            return Err(EngineError::Recognition(format!(
                "image buffer has {} bytes, but {}x{}x{} needs {}",
                self.data.len(),
                self.width,
                self.height,
                self.channels,
                expected
            )));
        }
        Ok(())
    }
}

/// A handle to one instance of an OCR engine.
pub trait OcrEngine {
    /// Load the language model. Must succeed before [`OcrEngine::recognize`].
    fn init(&mut self, language: &str, datapath: Option<&Path>) -> Result<(), EngineError>;

    /// Set run-time variables and the page segmentation mode. These are
    /// applied at recognition time, and not validated until then.
    fn configure(&mut self, variables: &BTreeMap<String, String>, psm: Option<u8>);

    /// Recognize text in an image. Returns `None` if the engine produced no
    /// text.
    fn recognize(&mut self, image: &RawImage) -> Result<Option<String>, EngineError>;
}

/// Create a new, uninitialized engine handle for `config`.
pub fn new_engine(config: &EngineConfig) -> Result<Box<dyn OcrEngine>, EngineError> {
    match config.backend {
        EngineBackend::Cli => {
            let engine = cli::TesseractCli::new();
            if config.languages_checked {
                Ok(Box::new(engine.without_language_check()))
            } else {
                Ok(Box::new(engine))
            }
        }
        #[cfg(feature = "native-tesseract")]
        EngineBackend::Native => Ok(Box::new(native::NativeTesseract::new())),
        #[cfg(not(feature = "native-tesseract"))]
        EngineBackend::Native => Err(EngineError::InitFailed(
            "this binary was built without the `native-tesseract` feature".to_owned(),
        )),
    }
}

/// Make sure the engine in `config` can be created and loads every
/// requested language, then drop it.
#[instrument(level = "debug", skip_all, fields(language = %config.language))]
pub fn check_engine(config: &EngineConfig) -> Result<(), EngineError> {
    let mut engine = new_engine(config)?;
    engine.init(&config.language, config.datapath.as_deref())
}

/// Treat whitespace-only engine output as no output.
pub(crate) fn non_empty_text(text: String) -> Option<String> {
    if text.trim().is_empty() { None } else { Some(text) }
}

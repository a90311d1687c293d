//! Engine handle calling libtesseract in-process.
//!
//! The underlying `TessBaseAPI` is not thread-safe. That's fine, because each
//! worker process owns exactly one of these.

use std::collections::BTreeMap;

use kreuzberg_tesseract::{TessPageSegMode, TesseractAPI};

use crate::prelude::*;

use super::{EngineError, OcrEngine, RawImage, non_empty_text};

/// Engine handle wrapping a `TessBaseAPI` instance.
pub struct NativeTesseract {
    /// The initialized API, if `init` has succeeded.
    api: Option<TesseractAPI>,
    /// Run-time variables, applied before each recognition.
    variables: BTreeMap<String, String>,
    /// Page segmentation mode.
    psm: Option<u8>,
}

impl NativeTesseract {
    /// Create a new, uninitialized handle.
    pub fn new() -> Self {
        Self {
            api: None,
            variables: BTreeMap::new(),
            psm: None,
        }
    }
}

impl Default for NativeTesseract {
    fn default() -> Self {
        Self::new()
    }
}

impl OcrEngine for NativeTesseract {
    #[instrument(level = "debug", skip(self))]
    fn init(&mut self, language: &str, datapath: Option<&Path>) -> Result<(), EngineError> {
        self.api = None;
        // libtesseract may crash instead of failing on an empty language.
        if language.trim().is_empty() {
            return Err(EngineError::InitFailed(
                "language cannot be empty".to_owned(),
            ));
        }
        let datapath = datapath
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let api = TesseractAPI::new();
        api.init(&datapath, language).map_err(|err| {
            EngineError::InitFailed(format!(
                "failed to load language {:?}: {}",
                language, err
            ))
        })?;
        self.api = Some(api);
        Ok(())
    }

    fn configure(&mut self, variables: &BTreeMap<String, String>, psm: Option<u8>) {
        self.variables = variables.clone();
        self.psm = psm;
    }

    #[instrument(level = "debug", skip_all, fields(width = image.width, height = image.height))]
    fn recognize(&mut self, image: &RawImage) -> Result<Option<String>, EngineError> {
        let api = self.api.as_ref().ok_or(EngineError::NotReady)?;
        image.check()?;

        let recognition = |what: &str, err: &dyn std::fmt::Display| {
            EngineError::Recognition(format!("{what}: {err}"))
        };
        if let Some(psm) = self.psm {
            api.set_page_seg_mode(TessPageSegMode::from_int(i32::from(psm)))
                .map_err(|e| recognition("failed to set page segmentation mode", &e))?;
        }
        for (key, value) in &self.variables {
            api.set_variable(key, value)
                .map_err(|e| recognition(&format!("failed to set {key}"), &e))?;
        }

        let dimension = |v: usize| {
            i32::try_from(v).map_err(|_| {
                EngineError::Recognition(format!("image dimension {v} is too large"))
            })
        };
        api.set_image(
            &image.data,
            dimension(image.width as usize)?,
            dimension(image.height as usize)?,
            i32::from(image.channels),
            dimension(image.bytes_per_line())?,
        )
        .map_err(|e| recognition("failed to set image", &e))?;
        api.recognize()
            .map_err(|e| recognition("failed to recognize text", &e))?;
        let text = api
            .get_utf8_text()
            .map_err(|e| recognition("failed to extract text", &e))?;
        Ok(non_empty_text(text))
    }
}

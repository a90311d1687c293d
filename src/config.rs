//! Options for an OCR run.
//!
//! These can be loaded from a JSON or TOML file with `--config`, and then
//! overridden from the command line.

use std::{collections::BTreeMap, time::Duration};

use schemars::JsonSchema;

use crate::{
    engine::{EngineBackend, EngineConfig, MAX_PAGE_SEG_MODE},
    prelude::*,
};

/// Default number of pages rendered per window.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default rasterization resolution.
pub const DEFAULT_DPI: u32 = 250;

/// Default OCR language.
pub const DEFAULT_LANGUAGE: &str = "eng";

/// Engine variable holding the resolution of the images we hand it.
pub const DPI_VARIABLE: &str = "user_defined_dpi";

/// Default time limit for OCRing a single page.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;

/// A value for an engine variable. Engine variables are always passed to the
/// engine as strings, but config files may use native TOML or JSON types.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EngineValue {
    /// Used verbatim.
    String(String),
    /// `true` becomes `"1"` and `false` becomes `"0"`.
    Bool(bool),
    /// Formatted in decimal.
    Integer(i64),
    /// Formatted with Rust's shortest round-trip representation.
    Float(f64),
}

impl EngineValue {
    /// Convert to the string form expected by the engine.
    pub fn to_engine_string(&self) -> String {
        match self {
            EngineValue::String(s) => s.clone(),
            EngineValue::Bool(true) => "1".to_owned(),
            EngineValue::Bool(false) => "0".to_owned(),
            EngineValue::Integer(i) => i.to_string(),
            EngineValue::Float(f) => f.to_string(),
        }
    }
}

/// Options controlling an OCR run.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(default, rename_all = "snake_case", deny_unknown_fields)]
pub struct OcrOptions {
    /// Requested number of pages per window. Raised to the number of
    /// available workers if smaller.
    pub batch_size: usize,

    /// First page to OCR, 1-based.
    pub first_page: usize,

    /// Last page to OCR, inclusive. Zero or negative values count back from
    /// the end of the document: 0 is the last page, -1 the second-to-last.
    pub last_page: i64,

    /// Rasterization resolution.
    #[serde(alias = "dpi")]
    pub user_defined_dpi: u32,

    /// Rasterize and OCR in grayscale.
    pub grayscale: bool,

    /// Page segmentation mode, `0..=13`. Uses the engine's default if unset.
    pub psm: Option<u8>,

    /// Language model(s) to load, like `eng` or `eng+deu`.
    pub language: String,

    /// Override the directory containing trained language data.
    pub tessdata_dir: Option<PathBuf>,

    /// Which engine implementation to use.
    pub engine: EngineBackend,

    /// Engine variables, forwarded verbatim before each recognition.
    pub variables: BTreeMap<String, EngineValue>,

    /// Maximum seconds to spend on a single page. 0 disables the limit.
    pub task_timeout_secs: u64,

    /// Log and skip windows that fail to rasterize instead of aborting.
    pub skip_failed_windows: bool,

    /// Number of concurrent OCR worker processes. Defaults to the number of
    /// available CPUs.
    pub jobs: Option<usize>,
}

impl Default for OcrOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            first_page: 1,
            last_page: 0,
            user_defined_dpi: DEFAULT_DPI,
            grayscale: false,
            psm: None,
            language: DEFAULT_LANGUAGE.to_owned(),
            tessdata_dir: None,
            engine: EngineBackend::default(),
            variables: BTreeMap::new(),
            task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            skip_failed_windows: false,
            jobs: None,
        }
    }
}

impl OcrOptions {
    /// Check for configuration errors which would make the run pointless.
    pub fn validate(&self) -> Result<()> {
        if self.first_page == 0 {
            return Err(anyhow!("first page must be at least 1 (pages are 1-based)"));
        }
        if self.user_defined_dpi == 0 {
            return Err(anyhow!("DPI must be positive"));
        }
        if let Some(psm) = self.psm
            && psm > MAX_PAGE_SEG_MODE
        {
            return Err(anyhow!(
                "page segmentation mode {} is out of range 0..={}",
                psm,
                MAX_PAGE_SEG_MODE
            ));
        }
        if self.language.trim().is_empty() {
            return Err(anyhow!("OCR language cannot be empty"));
        }
        if self.jobs == Some(0) {
            return Err(anyhow!("need at least one OCR worker"));
        }
        Ok(())
    }

    /// The per-page time limit, if any.
    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_secs > 0).then(|| Duration::from_secs(self.task_timeout_secs))
    }

    /// The read-only engine configuration copied into every worker task.
    ///
    /// The engine is told the resolution we render at, unless an explicit
    /// `user_defined_dpi` variable overrides it.
    pub fn engine_config(&self) -> EngineConfig {
        let mut variables = self
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.to_engine_string()))
            .collect::<BTreeMap<_, _>>();
        variables
            .entry(DPI_VARIABLE.to_owned())
            .or_insert_with(|| self.user_defined_dpi.to_string());
        EngineConfig {
            backend: self.engine,
            language: self.language.clone(),
            datapath: self.tessdata_dir.clone(),
            variables,
            psm: self.psm,
            grayscale: self.grayscale,
            languages_checked: false,
        }
    }
}

/// Parse a `key=value` engine variable from the command line.
pub fn parse_variable(s: &str) -> Result<(String, EngineValue)> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got {:?}", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("engine variable name cannot be empty in {:?}", s));
    }
    Ok((key.to_owned(), EngineValue::String(value.to_owned())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let opts = OcrOptions::default();
        assert_eq!(opts.batch_size, 10);
        assert_eq!(opts.first_page, 1);
        assert_eq!(opts.last_page, 0);
        assert_eq!(opts.user_defined_dpi, 250);
        assert!(!opts.grayscale);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_options() {
        let bad = [
            OcrOptions {
                first_page: 0,
                ..OcrOptions::default()
            },
            OcrOptions {
                psm: Some(14),
                ..OcrOptions::default()
            },
            OcrOptions {
                language: " ".to_owned(),
                ..OcrOptions::default()
            },
            OcrOptions {
                jobs: Some(0),
                ..OcrOptions::default()
            },
        ];
        for opts in bad {
            assert!(opts.validate().is_err(), "{opts:?}");
        }
    }

    #[test]
    fn engine_values_become_strings() {
        let json = r#"{
            "variables": {
                "tessedit_char_whitelist": "0123456789",
                "load_system_dawg": false,
                "user_defined_dpi": 300,
                "textord_min_xheight": 1.5
            },
            "dpi": 200
        }"#;
        let opts: OcrOptions = serde_json::from_str(json).expect("valid options");
        assert_eq!(opts.user_defined_dpi, 200);
        let config = opts.engine_config();
        assert_eq!(config.variables["tessedit_char_whitelist"], "0123456789");
        assert_eq!(config.variables["load_system_dawg"], "0");
        assert_eq!(config.variables["user_defined_dpi"], "300");
        assert_eq!(config.variables["textord_min_xheight"], "1.5");
    }

    #[test]
    fn render_dpi_reaches_engine() {
        let opts = OcrOptions {
            user_defined_dpi: 300,
            ..OcrOptions::default()
        };
        let config = opts.engine_config();
        assert_eq!(
            config.variables.get("user_defined_dpi").map(String::as_str),
            Some("300")
        );

        // An explicit engine variable wins.
        let opts = OcrOptions {
            user_defined_dpi: 300,
            variables: BTreeMap::from([(
                "user_defined_dpi".to_owned(),
                EngineValue::Integer(150),
            )]),
            ..OcrOptions::default()
        };
        assert_eq!(opts.engine_config().variables["user_defined_dpi"], "150");
    }

    #[test]
    fn unknown_option_fields_are_rejected() {
        let result = serde_json::from_str::<OcrOptions>(r#"{"batchsize": 3}"#);
        assert!(result.is_err());
    }

    #[test]
    fn parse_variable_splits_on_first_equals() -> Result<()> {
        let (key, value) = parse_variable("preserve_interword_spaces=a=b")?;
        assert_eq!(key, "preserve_interword_spaces");
        assert_eq!(value.to_engine_string(), "a=b");
        assert!(parse_variable("no_equals").is_err());
        assert!(parse_variable("=1").is_err());
        Ok(())
    }

    #[test]
    fn task_timeout_zero_disables() {
        let opts = OcrOptions {
            task_timeout_secs: 0,
            ..OcrOptions::default()
        };
        assert_eq!(opts.task_timeout(), None);
        assert_eq!(
            OcrOptions::default().task_timeout(),
            Some(Duration::from_secs(300))
        );
    }
}

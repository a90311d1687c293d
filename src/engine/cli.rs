//! Engine handle wrapping the `tesseract` CLI tool.

use std::{collections::BTreeMap, ffi::OsString, process::Command};

use image::{DynamicImage, GrayImage, ImageFormat, RgbImage, RgbaImage};

use crate::{async_utils::check_for_command_failure, prelude::*};

use super::{EngineError, OcrEngine, RawImage, non_empty_text};

/// Engine handle which runs one `tesseract` process per recognition.
///
/// By default, `init` checks that the binary runs and has every requested
/// language, so that a broken installation fails up front with
/// [`EngineError::InitFailed`]. Worker processes skip this check when the
/// parent has already made it.
#[derive(Debug)]
pub struct TesseractCli {
    /// The program to run.
    program: OsString,
    /// Language(s), set once `init` succeeds.
    language: Option<String>,
    /// Trained data directory override.
    datapath: Option<PathBuf>,
    /// Run-time variables passed with `-c`.
    variables: BTreeMap<String, String>,
    /// Page segmentation mode passed with `--psm`.
    psm: Option<u8>,
    /// Run `tesseract --list-langs` in `init`?
    check_languages: bool,
}

impl TesseractCli {
    /// Create a new, uninitialized handle using `tesseract` from `PATH`.
    pub fn new() -> Self {
        Self::with_program("tesseract")
    }

    /// Create a new, uninitialized handle using a specific binary.
    pub fn with_program(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            language: None,
            datapath: None,
            variables: BTreeMap::new(),
            psm: None,
            check_languages: true,
        }
    }

    /// Trust that the binary and languages are installed, and don't run
    /// `tesseract --list-langs` in `init`.
    pub fn without_language_check(mut self) -> Self {
        self.check_languages = false;
        self
    }

    /// Add `--tessdata-dir` if we have one.
    fn add_datapath_arg(&self, cmd: &mut Command) {
        if let Some(datapath) = &self.datapath {
            cmd.arg("--tessdata-dir").arg(datapath);
        }
    }
}

impl Default for TesseractCli {
    fn default() -> Self {
        Self::new()
    }
}

impl OcrEngine for TesseractCli {
    #[instrument(level = "debug", skip(self))]
    fn init(&mut self, language: &str, datapath: Option<&Path>) -> Result<(), EngineError> {
        self.language = None;
        self.datapath = datapath.map(Path::to_owned);
        if language.trim().is_empty() {
            return Err(EngineError::InitFailed(
                "language cannot be empty".to_owned(),
            ));
        }
        if !self.check_languages {
            self.language = Some(language.to_owned());
            return Ok(());
        }

        let mut cmd = Command::new(&self.program);
        self.add_datapath_arg(&mut cmd);
        let output = cmd.arg("--list-langs").output().map_err(|err| {
            EngineError::InitFailed(format!(
                "cannot run {:?}: {}",
                self.program.to_string_lossy(),
                err
            ))
        })?;
        check_for_command_failure("tesseract --list-langs", &output)
            .map_err(|err| EngineError::InitFailed(format!("{err:#}")))?;

        // Older versions print the list to stderr.
        let mut listing = String::from_utf8_lossy(&output.stdout).into_owned();
        listing.push_str(&String::from_utf8_lossy(&output.stderr));
        let available = parse_language_list(&listing);
        for lang in language.split('+').map(str::trim).filter(|l| !l.is_empty()) {
            if !available.iter().any(|a| a == lang) {
                return Err(EngineError::InitFailed(format!(
                    "language {:?} is not installed (available: {})",
                    lang,
                    available.join(", ")
                )));
            }
        }

        self.language = Some(language.to_owned());
        Ok(())
    }

    fn configure(&mut self, variables: &BTreeMap<String, String>, psm: Option<u8>) {
        self.variables = variables.clone();
        self.psm = psm;
    }

    #[instrument(level = "debug", skip_all, fields(width = image.width, height = image.height))]
    fn recognize(&mut self, image: &RawImage) -> Result<Option<String>, EngineError> {
        let language = self.language.as_deref().ok_or(EngineError::NotReady)?;
        image.check()?;

        // Hand the pixels over as a lossless PNG in a private temporary
        // directory, removed when `tmpdir` drops.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        to_dynamic_image(image)?
            .save_with_format(&input_path, ImageFormat::Png)
            .map_err(|err| {
                EngineError::Recognition(format!("cannot write engine input: {err}"))
            })?;

        let mut cmd = Command::new(&self.program);
        cmd.arg(&input_path).arg("stdout").arg("-l").arg(language);
        self.add_datapath_arg(&mut cmd);
        if let Some(psm) = self.psm {
            cmd.arg("--psm").arg(psm.to_string());
        }
        for (key, value) in &self.variables {
            cmd.arg("-c").arg(format!("{key}={value}"));
        }
        let output = cmd.output()?;
        check_for_command_failure("tesseract", &output)
            .map_err(|err| EngineError::Recognition(format!("{err:#}")))?;

        let mut text = String::from_utf8(output.stdout).map_err(|err| {
            EngineError::Recognition(format!("tesseract output was not UTF-8: {err}"))
        })?;
        // The CLI ends each page with a form feed. The library API doesn't.
        if text.ends_with(PAGE_SEPARATOR) {
            text.pop();
        }
        Ok(non_empty_text(text))
    }
}

/// What `tesseract` prints after each page by default.
const PAGE_SEPARATOR: char = '\x0c';

/// Parse the output of `tesseract --list-langs`.
fn parse_language_list(listing: &str) -> Vec<String> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("List of available languages"))
        // Skip any warnings mixed into stderr.
        .filter(|line| !line.contains(' ') && !line.contains(':'))
        .map(str::to_owned)
        .collect()
}

/// Wrap raw pixels in an [`image`] type so we can encode them.
fn to_dynamic_image(image: &RawImage) -> Result<DynamicImage, EngineError> {
    let (w, h, data) = (image.width, image.height, image.data.clone());
    let dynamic = match image.channels {
        1 => GrayImage::from_raw(w, h, data).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(w, h, data).map(DynamicImage::ImageRgb8),
        4 => RgbaImage::from_raw(w, h, data).map(DynamicImage::ImageRgba8),
        _ => None,
    };
    dynamic.ok_or_else(|| {
        EngineError::Recognition(format!(
            "cannot build a {}-channel {}x{} image",
            image.channels, w, h
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Write a fake `tesseract` which handles `--list-langs` by running
    /// `list_langs`, and otherwise prints its arguments followed by a page
    /// separator.
    #[cfg(unix)]
    fn fake_tesseract(dir: &Path, list_langs: &str) -> std::io::Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt as _;

        let path = dir.join("tesseract");
        let script = format!(
            "#!/bin/sh\n\
             for arg in \"$@\"; do\n\
             if [ \"$arg\" = \"--list-langs\" ]; then {list_langs}; fi\n\
             done\n\
             printf '%s\\n\\f' \"$*\"\n"
        );
        std::fs::write(&path, script)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    fn white_image() -> RawImage {
        RawImage {
            data: vec![255; 4],
            width: 2,
            height: 2,
            channels: 1,
        }
    }

    #[test]
    fn parses_language_list() {
        let listing = "List of available languages in \"/usr/share/tessdata/\" (3):\n\
                       eng\nosd\nchi_sim\n";
        assert_eq!(parse_language_list(listing), vec!["eng", "osd", "chi_sim"]);
    }

    #[test]
    fn recognize_before_init_is_not_ready() {
        let mut engine = TesseractCli::new();
        let image = RawImage {
            data: vec![255; 4],
            width: 2,
            height: 2,
            channels: 1,
        };
        assert!(matches!(
            engine.recognize(&image),
            Err(EngineError::NotReady)
        ));
    }

    #[test]
    fn init_with_missing_binary_fails() {
        let mut engine = TesseractCli::with_program("/nonexistent/tesseract-binary");
        let err = engine.init("eng", None).expect_err("binary does not exist");
        assert!(matches!(err, EngineError::InitFailed(_)));
        assert!(engine.language.is_none());
    }

    #[test]
    fn init_with_empty_language_fails() {
        let mut engine = TesseractCli::new();
        assert!(matches!(
            engine.init("  ", None),
            Err(EngineError::InitFailed(_))
        ));
    }

    #[test]
    #[ignore = "Requires tesseract to be installed"]
    fn init_with_missing_language_fails() {
        let mut engine = TesseractCli::new();
        assert!(matches!(
            engine.init("no_such_language_xyz", None),
            Err(EngineError::InitFailed(_))
        ));
    }

    #[test]
    #[ignore = "Requires tesseract to be installed"]
    fn blank_page_produces_no_text() -> Result<(), EngineError> {
        let mut engine = TesseractCli::new();
        engine.init("eng", None)?;
        engine.configure(&BTreeMap::new(), Some(6));
        let image = RawImage {
            data: vec![255; 64 * 64],
            width: 64,
            height: 64,
            channels: 1,
        };
        assert_eq!(engine.recognize(&image)?, None);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn recognize_strips_page_separator_and_passes_options() -> Result<(), EngineError> {
        let dir = tempfile::tempdir()?;
        let program = fake_tesseract(
            dir.path(),
            "echo 'List of available languages (2):'; echo eng; echo osd; exit 0",
        )?;
        let mut engine = TesseractCli::with_program(program);
        engine.init("eng", None)?;
        engine.configure(
            &BTreeMap::from([("user_defined_dpi".to_owned(), "300".to_owned())]),
            Some(6),
        );
        let text = engine.recognize(&white_image())?.expect("fake output");
        assert!(text.ends_with('\n'), "{text:?}");
        assert!(!text.contains('\x0c'), "{text:?}");
        assert!(text.contains("stdout -l eng"), "{text:?}");
        assert!(text.contains("--psm 6"), "{text:?}");
        assert!(text.contains("-c user_defined_dpi=300"), "{text:?}");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn language_check_can_be_skipped() -> Result<(), EngineError> {
        let dir = tempfile::tempdir()?;
        let program = fake_tesseract(dir.path(), "exit 1")?;

        let mut engine = TesseractCli::with_program(&program);
        assert!(matches!(
            engine.init("eng", None),
            Err(EngineError::InitFailed(_))
        ));

        let mut engine = TesseractCli::with_program(&program).without_language_check();
        engine.init("eng", None)?;
        assert!(engine.recognize(&white_image())?.is_some());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn missing_language_fails_init() -> Result<(), EngineError> {
        let dir = tempfile::tempdir()?;
        let program = fake_tesseract(dir.path(), "echo eng; exit 0")?;
        let mut engine = TesseractCli::with_program(program);
        assert!(matches!(
            engine.init("eng+deu", None),
            Err(EngineError::InitFailed(_))
        ));
        assert!(matches!(
            engine.recognize(&white_image()),
            Err(EngineError::NotReady)
        ));
        Ok(())
    }
}

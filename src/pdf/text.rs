//! Extracting embedded text with `pdftotext`, without any OCR.
//!
//! This will miss any "non-searchable" text in a PDF, but sometimes you just
//! want cheap and fast.

use tokio::process::Command;

use crate::prelude::*;

/// Where does `pdf_to_text` write the text for `pdf_path`?
pub fn text_output_path(pdf_path: &Path, target_dir: &Path) -> Result<PathBuf> {
    let stem = pdf_path
        .file_stem()
        .with_context(|| format!("failed to get filename from {:?}", pdf_path.display()))?;
    let mut file_name = stem.to_owned();
    file_name.push(".txt");
    Ok(target_dir.join(file_name))
}

/// Write the layout-preserving text of `pdf_path` to `<target_dir>/<stem>.txt`.
///
/// Returns an empty string on success, and the tool's standard error if it
/// fails. Only returns `Err` if `pdftotext` can't be run at all.
#[instrument(level = "debug", skip_all, fields(path = %pdf_path.display()))]
pub async fn pdf_to_text(pdf_path: &Path, target_dir: &Path) -> Result<String> {
    let output_path = text_output_path(pdf_path, target_dir)?;
    let output = Command::new("pdftotext")
        .arg("-layout")
        .arg(pdf_path)
        .arg(&output_path)
        .output()
        .await
        .context("cannot run pdftotext")?;
    if output.status.success() {
        debug!(output = %output_path.display(), "Wrote text");
        Ok(String::new())
    } else {
        Ok(String::from_utf8_lossy(&output.stderr).into_owned())
    }
}

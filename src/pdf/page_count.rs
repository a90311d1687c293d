//! Counting pages with Poppler's `pdfinfo`.

use std::collections::BTreeMap;

use tokio::process::Command;

use crate::{async_utils::check_for_command_failure, prelude::*};

/// Get the number of pages in a PDF file.
///
/// Returns 0 if `pdfinfo` can't be run, fails, or prints something we can't
/// understand. Callers should treat 0 as "nothing to process", because
/// `pdfinfo` may legitimately report nothing for a malformed document.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_page_count(path: &Path) -> usize {
    match try_get_page_count(path).await {
        Ok(page_count) => page_count,
        Err(err) => {
            warn!("Could not count pages, assuming none: {:#}", err);
            0
        }
    }
}

/// Like [`get_page_count`], but report why we failed.
pub async fn try_get_page_count(path: &Path) -> Result<usize> {
    let output = Command::new("pdfinfo")
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output)?;
    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    parse_page_count(&output).with_context(|| {
        format!("failed to get page count for {:?}", path.display())
    })
}

/// Parse the output of `pdfinfo` and extract the `Pages` property.
fn parse_page_count(output: &str) -> Result<usize> {
    let mut properties = BTreeMap::new();
    for line in output.lines() {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();
        properties.insert(key.to_string(), value.to_string());
    }

    let page_count_str = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("no Pages field in pdfinfo output"))?;
    page_count_str
        .parse::<usize>()
        .with_context(|| format!("could not parse page count {:?}", page_count_str))
}

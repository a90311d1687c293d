//! Rasterizing windows of PDF pages to temporary image files.

use std::sync::LazyLock;

use regex::Regex;
use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore, pipeline::plan::Window,
    prelude::*,
};

use super::page_count::get_page_count;

/// A default error regex for checking command output.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line contain an error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Options for rasterizing pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderOptions {
    /// Resolution in dots per inch.
    pub dpi: u32,
    /// Render in grayscale instead of color.
    pub grayscale: bool,
}

/// A single page image, valid only as long as its [`RenderedWindow`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedPage {
    /// Absolute, 1-based page number within the document.
    pub page_number: usize,
    /// Path to the rendered image.
    pub image_path: PathBuf,
}

/// The rendered images for one window, and the temporary directory holding
/// them.
///
/// The directory and everything in it is deleted by [`RenderedWindow::close`]
/// or, failing that, by [`Drop`].
#[derive(Debug)]
pub struct RenderedWindow {
    /// The window we rendered.
    window: Window,
    /// Temporary directory holding our page images.
    tmpdir: Option<tempfile::TempDir>,
    /// Our pages, in page order.
    pages: Vec<RenderedPage>,
}

impl RenderedWindow {
    /// Create a [`RenderedWindow`] from a [`tempfile::TempDir`] full of page
    /// images named in lexical order.
    ///
    /// The rasterizer only knows window-local order, so the `i`th image
    /// becomes page `window.start + i`.
    pub fn from_tempdir(window: Window, tmpdir: tempfile::TempDir) -> Result<Self> {
        let tmpdir_path = tmpdir.path();
        let mut dir_paths = tmpdir_path
            .read_dir()
            .with_context(|| {
                format!(
                    "failed to read temporary directory {:?}",
                    tmpdir_path.display()
                )
            })?
            .map(|entry| {
                let entry = entry.with_context(|| {
                    format!(
                        "failed to read entry in temporary directory {:?}",
                        tmpdir_path.display()
                    )
                })?;
                Ok(entry.path())
            })
            .collect::<Result<Vec<_>>>()?;
        dir_paths.sort();

        if dir_paths.len() != window.len() {
            return Err(anyhow!(
                "expected {} page images for pages {}-{}, found {}",
                window.len(),
                window.start,
                window.end,
                dir_paths.len()
            ));
        }

        let pages = window
            .pages()
            .zip(dir_paths)
            .map(|(page_number, image_path)| RenderedPage {
                page_number,
                image_path,
            })
            .collect();
        Ok(Self {
            window,
            tmpdir: Some(tmpdir),
            pages,
        })
    }

    /// The window we rendered.
    pub fn window(&self) -> Window {
        self.window
    }

    /// Our rendered pages, in page order.
    pub fn pages(&self) -> &[RenderedPage] {
        &self.pages
    }

    /// The temporary directory holding our images, until we're closed.
    pub fn dir(&self) -> Option<&Path> {
        self.tmpdir.as_ref().map(|tmpdir| tmpdir.path())
    }

    /// Delete our temporary directory now, reporting any errors.
    pub fn close(mut self) -> Result<()> {
        match self.tmpdir.take() {
            Some(tmpdir) => {
                let tmpdir_path = tmpdir.path().to_owned();
                tmpdir.close().with_context(|| {
                    format!(
                        "failed to delete temporary directory {:?}",
                        tmpdir_path.display()
                    )
                })
            }
            None => Ok(()),
        }
    }
}

impl Drop for RenderedWindow {
    fn drop(&mut self) {
        // Delete our temporary directory, if we still have one.
        if let Some(tmpdir) = self.tmpdir.take() {
            let tmpdir_path = tmpdir.path().to_owned();
            if let Err(err) = tmpdir.close() {
                error!(
                    directory = ?tmpdir_path.display(),
                    "failed to delete temporary directory: {}",
                    err
                );
            }
        }
    }
}

/// Source of page counts and page images for a document.
#[async_trait]
pub trait PageRenderer: Send + Sync + 'static {
    /// Count the pages in a document, returning 0 if we can't.
    async fn page_count(&self, path: &Path) -> usize;

    /// Render every page in `window` into a fresh temporary directory.
    async fn render_window(
        &self,
        path: &Path,
        window: Window,
        options: &RenderOptions,
    ) -> Result<RenderedWindow>;
}

/// [`PageRenderer`] using Poppler's `pdfinfo` and `pdftoppm` CLI tools.
#[derive(Clone, Copy, Debug, Default)]
pub struct Poppler;

#[async_trait]
impl PageRenderer for Poppler {
    async fn page_count(&self, path: &Path) -> usize {
        get_page_count(path).await
    }

    #[instrument(level = "debug", skip_all, fields(path = %path.display(), start = window.start, end = window.end))]
    async fn render_window(
        &self,
        path: &Path,
        window: Window,
        options: &RenderOptions,
    ) -> Result<RenderedWindow> {
        // Create a temporary directory to hold the images.
        let tmpdir = tempfile::TempDir::with_prefix("pages")?;
        let out_prefix = tmpdir.path().join("page");

        // Run pdftoppm to write uncompressed TIFF files. pdftoppm will add
        // zero-padded page numbers to our prefix, so lexical order is page
        // order.
        //
        // We use `with_cpu_semaphore` because `pdftoppm` will use _at least_
        // 100% of a CPU.
        let mut cmd = Command::new("pdftoppm");
        cmd.arg("-tiff")
            .arg("-r")
            .arg(options.dpi.to_string())
            .arg("-f")
            .arg(window.start.to_string())
            .arg("-l")
            .arg(window.end.to_string());
        if options.grayscale {
            cmd.arg("-gray");
        }
        let output = with_cpu_semaphore(|| async {
            cmd.arg(path).arg(&out_prefix).output().await.with_context(|| {
                format!("failed to run pdftoppm on {:?}", path.display())
            })
        })
        .await?;
        check_for_command_failure("pdftoppm", &output)?;

        collect_rendered_pages(window, tmpdir, &String::from_utf8_lossy(&output.stderr))
    }
}

/// Collect the images `pdftoppm` wrote for `window`.
///
/// `pdftoppm` reports "Syntax Error" and friends for damaged documents that
/// it can still render. We only treat those lines as fatal if some images
/// are missing, and then we include them in the error.
fn collect_rendered_pages(
    window: Window,
    tmpdir: tempfile::TempDir,
    stderr: &str,
) -> Result<RenderedWindow> {
    let error_lines = stderr
        .lines()
        .filter(|line| is_error_line(line))
        .collect::<Vec<_>>();
    match RenderedWindow::from_tempdir(window, tmpdir) {
        Ok(rendered) => {
            if !error_lines.is_empty() {
                warn!(
                    start = window.start,
                    end = window.end,
                    "pdftoppm reported errors, but rendered every page"
                );
            }
            Ok(rendered)
        }
        Err(err) if error_lines.is_empty() => Err(err),
        Err(err) => Err(err.context(format!(
            "pdftoppm printed error output:\n{}",
            error_lines.join("\n")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static TEST_PDF_PATH: &str = "tests/fixtures/ocr/two_pages.pdf";

    /// Make a temporary directory holding `count` fake page images.
    fn fake_pages(count: usize) -> Result<tempfile::TempDir> {
        let tmpdir = tempfile::TempDir::with_prefix("pages")?;
        for i in 1..=count {
            std::fs::write(tmpdir.path().join(format!("page-{i:02}.tif")), b"fake")?;
        }
        Ok(tmpdir)
    }

    #[test]
    fn is_error_line_works() {
        assert!(is_error_line("error: something went wrong"));
        assert!(is_error_line("ERROR: something went wrong"));
        assert!(!is_error_line("Warning: something is odd"));
        assert!(!is_error_line(
            "Internal Error: xref num 1234 not found but needed, document has changes, reconstruct aborted"
        ));
    }

    #[test]
    fn images_get_absolute_page_numbers() -> Result<()> {
        let window = Window { start: 11, end: 13 };
        let rendered = RenderedWindow::from_tempdir(window, fake_pages(3)?)?;
        let numbers = rendered
            .pages()
            .iter()
            .map(|p| p.page_number)
            .collect::<Vec<_>>();
        assert_eq!(numbers, vec![11, 12, 13]);
        assert!(rendered.pages()[0].image_path.ends_with("page-01.tif"));
        assert!(rendered.pages()[2].image_path.ends_with("page-03.tif"));
        Ok(())
    }

    #[test]
    fn image_count_mismatch_is_an_error() -> Result<()> {
        let window = Window { start: 1, end: 3 };
        assert!(RenderedWindow::from_tempdir(window, fake_pages(2)?).is_err());
        Ok(())
    }

    #[test]
    fn recoverable_errors_do_not_fail_a_complete_window() -> Result<()> {
        let window = Window { start: 4, end: 5 };
        let stderr = "Syntax Error (1234): Illegal character ')'\n\
                      Syntax Error: Couldn't find trailer dictionary\n";
        let rendered = collect_rendered_pages(window, fake_pages(2)?, stderr)?;
        assert_eq!(rendered.pages().len(), 2);
        Ok(())
    }

    #[test]
    fn errors_are_reported_when_pages_are_missing() -> Result<()> {
        let window = Window { start: 1, end: 3 };
        let stderr = "Syntax Error: Invalid page 3\n";
        let err = collect_rendered_pages(window, fake_pages(2)?, stderr)
            .expect_err("missing page image");
        let msg = format!("{err:#}");
        assert!(msg.contains("Invalid page 3"), "{msg}");
        assert!(msg.contains("expected 3 page images"), "{msg}");

        // Without error output, the count mismatch is still fatal.
        assert!(collect_rendered_pages(window, fake_pages(1)?, "").is_err());
        Ok(())
    }

    #[test]
    fn close_and_drop_remove_images() -> Result<()> {
        let window = Window { start: 1, end: 2 };

        let rendered = RenderedWindow::from_tempdir(window, fake_pages(2)?)?;
        let dir = rendered.dir().expect("open window has a dir").to_owned();
        assert!(dir.exists());
        rendered.close()?;
        assert!(!dir.exists());

        let rendered = RenderedWindow::from_tempdir(window, fake_pages(2)?)?;
        let dir = rendered.dir().expect("open window has a dir").to_owned();
        drop(rendered);
        assert!(!dir.exists());
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn poppler_renders_requested_window() -> Result<()> {
        let options = RenderOptions {
            dpi: 72,
            grayscale: true,
        };
        let window = Window { start: 2, end: 2 };
        let rendered = Poppler
            .render_window(Path::new(TEST_PDF_PATH), window, &options)
            .await?;
        assert_eq!(rendered.pages().len(), 1);
        assert_eq!(rendered.pages()[0].page_number, 2);
        let image = image::open(&rendered.pages()[0].image_path)?;
        assert!(image.width() > 0);
        Ok(())
    }
}

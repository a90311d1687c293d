//! The `text` subcommand.

use clap::Args;

use crate::{
    pdf::text::{pdf_to_text, text_output_path},
    prelude::*,
};

/// Text extraction command line arguments.
#[derive(Debug, Args)]
pub struct TextOpts {
    /// The PDF to extract text from.
    pub path: PathBuf,

    /// Directory to write `<name>.txt` into. Must already exist.
    pub target_dir: PathBuf,
}

/// The `text` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_text(opts: &TextOpts) -> Result<()> {
    let stderr = pdf_to_text(&opts.path, &opts.target_dir).await?;
    if !stderr.is_empty() {
        eprint!("{stderr}");
        return Err(anyhow!(
            "pdftotext failed to extract text from {:?}",
            opts.path.display()
        ));
    }
    let output_path = text_output_path(&opts.path, &opts.target_dir)?;
    info!("Wrote text to {:?}", output_path.display());
    Ok(())
}

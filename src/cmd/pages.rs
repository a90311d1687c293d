//! The `pages` subcommand.

use clap::Args;

use crate::{pdf::page_count::get_page_count, prelude::*};

/// Page count command line arguments.
#[derive(Debug, Args)]
pub struct PagesOpts {
    /// The PDF to inspect.
    pub path: PathBuf,
}

/// The `pages` subcommand. Prints 0 if the document can't be read.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_pages(opts: &PagesOpts) -> Result<()> {
    let page_count = get_page_count(&opts.path).await;
    println!("{page_count}");
    Ok(())
}

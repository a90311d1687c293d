//! The hidden `worker` subcommand, which OCRs one page per process.

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    prelude::*,
    worker::{WorkerRequest, run_worker_task},
};

/// Read a [`WorkerRequest`] from stdin, and write a
/// [`crate::worker::WorkerResponse`] to stdout.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_worker() -> Result<()> {
    let mut input = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut input)
        .await
        .context("failed to read worker request")?;
    let request: WorkerRequest =
        serde_json::from_slice(&input).context("failed to parse worker request")?;

    // The engine blocks, so keep it off the async executor.
    let response =
        spawn_blocking_propagating_panics(move || run_worker_task(&request)).await?;

    let output =
        serde_json::to_vec(&response).context("failed to serialize worker response")?;
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(&output)
        .await
        .context("failed to write worker response")?;
    stdout
        .flush()
        .await
        .context("failed to flush worker response")?;
    Ok(())
}

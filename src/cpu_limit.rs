//! Tools for limiting the number of concurrent CPU-bound tasks.

use std::sync::LazyLock;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// Semaphore used to limit the number of concurrent `pdftoppm` processes.
static CPU_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(available_parallelism()));

/// How many CPU-bound worker processes can this host usefully run at once?
///
/// Never returns zero, even if CPU detection fails.
pub fn available_parallelism() -> usize {
    num_cpus::get().max(1)
}

/// Call an async function while holding a permit from the CPU semaphore.
///
/// We do this to limit the number of external processes that are each trying
/// to use 100% of a CPU core. OCR worker processes are bounded separately, by
/// the dispatcher's own pool.
#[instrument(level = "trace", skip_all)]
pub async fn with_cpu_semaphore<Func, Fut, R>(f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    // Acquire a permit from the semaphore.
    let permit = CPU_SEMAPHORE
        .acquire()
        .await
        .context("Could not acquire CPU permit")?;
    // Run the function while holding the permit.
    let result = f().await;
    // Release the permit.
    drop(permit);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_parallelism_is_never_zero() {
        assert!(available_parallelism() >= 1);
    }

    #[tokio::test]
    async fn with_cpu_semaphore_returns_inner_result() -> Result<()> {
        let value = with_cpu_semaphore(|| async { Ok(42) }).await?;
        assert_eq!(value, 42);
        let err = with_cpu_semaphore(|| async { Err::<(), _>(anyhow!("boom")) }).await;
        assert!(err.is_err());
        Ok(())
    }
}

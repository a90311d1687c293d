//! Asynchronous utilities for use with Tokio.
//!
//! We keep the small amount of Tokio plumbing the rest of the program needs
//! here: boxed stream types, running blocking work off the executor, and
//! checking the output of external commands.

use std::{panic, pin::Pin};

use futures::Stream;

use crate::prelude::*;

pub mod io;

/// A type alias for a boxed stream. This is used to make it easier to work
/// streams that return complex types.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
        Err(err) => panic!("blocking task was cancelled: {err}"),
    }
}

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels. Only the exit status decides whether the command
/// failed.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        warn!(
            command_name = command_name,
            output = %stderr.trim_end(),
            "Standard error from command",
        );
    }

    if output.status.success() {
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    #[test]
    fn check_for_command_failure_reports_exit_code() {
        let output = Command::new("sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .output()
            .expect("sh should run");
        let err = check_for_command_failure("sh", &output)
            .expect_err("non-zero exit should fail");
        let msg = err.to_string();
        assert!(msg.contains("exit code 3"), "{msg}");
        assert!(msg.contains("oops"), "{msg}");
    }

    #[test]
    fn check_for_command_failure_ignores_stderr_on_success() {
        let output = Command::new("sh")
            .args(["-c", "echo 'Syntax Error: bad' >&2"])
            .output()
            .expect("sh should run");
        assert!(check_for_command_failure("sh", &output).is_ok());
    }

    #[tokio::test]
    async fn spawn_blocking_returns_value() {
        let value = spawn_blocking_propagating_panics(|| 2 + 2).await;
        assert_eq!(value, 4);
    }
}

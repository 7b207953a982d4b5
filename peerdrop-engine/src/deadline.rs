use std::future::Future;
use std::time::Duration;

use anyhow::Context;

/// Runs one stream or file operation under a deadline.
///
/// A remote that stops responding fails the operation with a timeout error
/// instead of parking the calling task forever.
///
/// # Errors
///
/// Returns the operation's own error, or a timeout error naming `what`.
pub async fn within<T, F>(limit: Duration, what: &str, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .with_context(|| format!("{what} timed out after {limit:?}"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn given_stalled_operation_when_deadline_passes_then_returns_timeout_error() {
        let result: anyhow::Result<()> = within(
            Duration::from_secs(5),
            "reading announcement",
            std::future::pending(),
        )
        .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("reading announcement timed out"));
    }

    #[tokio::test]
    async fn given_failing_operation_when_run_then_original_error_is_returned() {
        let result: anyhow::Result<()> = within(Duration::from_secs(5), "writing", async {
            anyhow::bail!("broken pipe")
        })
        .await;
        assert_eq!(result.unwrap_err().to_string(), "broken pipe");
    }
}

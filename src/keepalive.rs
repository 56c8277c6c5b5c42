//! Application-level keepalive: a single space written whenever the outbound
//! stream has been idle for the configured interval.
//!
//! The write goes through the shared writer slot, so it can never interleave
//! with an application write. Write failures are swallowed — whatever broke
//! the socket will surface on the main path.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::WriterHandle;

/// Start the keepalive task. Returns `None` when the interval is zero
/// (keepalives disabled).
pub(crate) fn spawn(
    writer: WriterHandle,
    interval: Duration,
    closed: CancellationToken,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }

    Some(tokio::spawn(async move {
        loop {
            if writer.idle_for() >= interval {
                if let Err(e) = writer.write_str(" ").await {
                    debug!(error = %e, "keepalive write failed");
                }
            }

            // Sleep until the next keepalive would be due. A successful
            // write above reset the idle clock, making this a full interval.
            let wait = interval.saturating_sub(writer.idle_for());
            let wait = if wait.is_zero() { interval } else { wait };
            tokio::select! {
                _ = closed.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }))
}

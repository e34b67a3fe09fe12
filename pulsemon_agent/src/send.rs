//! One delivery cycle: reconcile the on-disk backlog with the server, then
//! send the current snapshot, buffering it again on any failure.
//!
//! Every failure path ends in "buffer and stop" — the cycle never crashes the
//! process, and the queue only shrinks on a fully accepted batch.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::buffer::Buffer;
use crate::client::{Client, HttpPost};
use crate::error::ClientError;
use crate::types::{BatchResponse, IngestResponse, Snapshot};

/// Delivery seam for the cycle, implemented by `Client` and mocked in tests.
pub trait Deliver {
    async fn send_snapshot(
        &self,
        snapshot: &Snapshot,
        cancel: &CancellationToken,
    ) -> Result<IngestResponse, ClientError>;

    async fn send_batch(
        &self,
        snapshots: &[Snapshot],
        cancel: &CancellationToken,
    ) -> Result<BatchResponse, ClientError>;
}

impl<T: HttpPost> Deliver for Client<T> {
    async fn send_snapshot(
        &self,
        snapshot: &Snapshot,
        cancel: &CancellationToken,
    ) -> Result<IngestResponse, ClientError> {
        Client::send_snapshot(self, snapshot, cancel).await
    }

    async fn send_batch(
        &self,
        snapshots: &[Snapshot],
        cancel: &CancellationToken,
    ) -> Result<BatchResponse, ClientError> {
        Client::send_batch(self, snapshots, cancel).await
    }
}

pub async fn run_send_cycle<D: Deliver>(
    deliver: &D,
    buffer: &Buffer,
    snapshot: Snapshot,
    cancel: &CancellationToken,
) {
    let backlog = match buffer.count() {
        Ok(count) => count,
        Err(e) => {
            warn!(error = %e, "failed to inspect buffer; treating backlog as empty");
            0
        }
    };

    if backlog > 0 {
        // non-destructive drain: the backlog stays on disk until the batch is
        // fully accepted, so a failed attempt cannot lose it
        let pending = match buffer.pending() {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "failed to read buffer");
                Vec::new()
            }
        };

        if !pending.is_empty() {
            match deliver.send_batch(&pending, cancel).await {
                Err(e) => {
                    buffer_current(buffer, &snapshot, "batch send failed", &e);
                    return;
                }
                Ok(response) if response.rejected > 0 => {
                    warn!(
                        rejected = response.rejected,
                        "batch partially rejected; keeping buffered snapshots"
                    );
                    if let Err(push_err) = buffer.push(&snapshot) {
                        warn!(error = %push_err, "buffering current snapshot failed");
                    }
                    return;
                }
                Ok(response) => {
                    info!(accepted = response.accepted, "backlog delivered");
                    if let Err(e) = buffer.clear() {
                        warn!(error = %e, "flushed backlog but failed to clear buffer");
                    }
                }
            }
        }
    }

    match deliver.send_snapshot(&snapshot, cancel).await {
        Err(e) => buffer_current(buffer, &snapshot, "send failed", &e),
        Ok(response) => {
            if response.clock_skew {
                warn!("server detected clock skew > 5 minutes; check ntpd/chrony");
            }
        }
    }
}

fn buffer_current(buffer: &Buffer, snapshot: &Snapshot, what: &str, err: &ClientError) {
    let kind = if err.is_transient() {
        "transient"
    } else {
        "fatal"
    };
    match buffer.push(snapshot) {
        Ok(()) => warn!(error = %err, kind, "{what}; current snapshot buffered"),
        Err(push_err) => {
            warn!(error = %err, buffer_error = %push_err, "{what} and buffering current snapshot failed");
        }
    }
}

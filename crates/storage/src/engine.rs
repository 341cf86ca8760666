//! Bulk transfer engine
//!
//! Read and write on a [`DeviceSession`]. Both directions submit an
//! asynchronous transfer to the session's transport and are completed exactly
//! once through a oneshot channel. Read waits for its completion; write
//! returns right after submission by default and leaves buffer release and
//! fault recording to a detached completion task. The two directions share no
//! state beyond the owning session.

use std::sync::Arc;

use common::{Error, Result};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::session::{DeviceSession, WritePolicy};
use crate::transport::CompletionStatus;

/// Reference held by an in-flight transfer context.
///
/// Keeps the session alive until the matching completion has been consumed,
/// even when the submitting caller has already gone away.
struct TransferGuard {
    session: Arc<DeviceSession>,
}

impl TransferGuard {
    fn new(session: &Arc<DeviceSession>) -> Self {
        session.retain();
        Self {
            session: Arc::clone(session),
        }
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        self.session.release_ref();
    }
}

/// Fallible transfer buffer allocation.
fn alloc_buffer(len: usize) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| Error::AllocationFailed)?;
    buffer.resize(len, 0);
    Ok(buffer)
}

impl DeviceSession {
    /// Read one bulk-in transfer's worth of data into `out`.
    ///
    /// A single call moves at most one endpoint-sized chunk:
    /// `min(max_packet_size, out.len())` bytes. Zero-length reads return
    /// zero without submitting anything. Blocks until the completion fires.
    pub async fn read(self: &Arc<Self>, out: &mut [u8]) -> Result<usize> {
        self.read_inner(out, None).await
    }

    /// Like [`read`](Self::read), but stops waiting when `cancel` resolves
    /// (or its sender is dropped) and returns [`Error::Interrupted`].
    ///
    /// Cancellation cannot retract the submitted request: its eventual
    /// completion still fires on a detached task, still records its outcome
    /// and still releases the buffer it owns.
    pub async fn read_cancellable(
        self: &Arc<Self>,
        out: &mut [u8],
        cancel: oneshot::Receiver<()>,
    ) -> Result<usize> {
        self.read_inner(out, Some(cancel)).await
    }

    async fn read_inner(
        self: &Arc<Self>,
        out: &mut [u8],
        cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<usize> {
        let Some(endpoint) = self.bulk_in().copied() else {
            return Err(Error::NotReadable);
        };
        // End-of-stream convention, not an error.
        if out.is_empty() {
            return Ok(0);
        }

        // One outstanding read per session. The owned guard follows the
        // transfer, not this call: a cancelled wait hands it to the reaper,
        // so no second IN transfer can be submitted while the first is
        // still pending on the device.
        let lane = Arc::clone(&self.read_lane).lock_owned().await;

        let len = usize::from(endpoint.max_packet_size).min(out.len());
        let buffer = alloc_buffer(len)?;

        let (tx, mut rx) = oneshot::channel();
        let guard = TransferGuard::new(self);
        self.transport().submit_in(endpoint.address, buffer, tx)?;

        let completion = match cancel {
            None => rx.await.ok(),
            Some(mut cancel) => {
                tokio::select! {
                    done = &mut rx => done.ok(),
                    _ = &mut cancel => {
                        // The request stays outstanding. Hand our transfer
                        // reference, the lane, and the pending completion to
                        // a reaper; the buffer is released and the lane
                        // reopened only once the transport delivers it.
                        let session = Arc::clone(self);
                        tokio::spawn(async move {
                            if let Ok(done) = rx.await {
                                session.record_read(&done);
                            }
                            drop(guard);
                            drop(lane);
                        });
                        return Err(Error::Interrupted);
                    }
                }
            }
        };
        drop(guard);

        let Some(done) = completion else {
            // Transport went away without completing; treat like shutdown.
            return Ok(0);
        };
        self.record_read(&done);

        match done.status {
            CompletionStatus::Success { transferred } => {
                let n = transferred.min(out.len());
                out[..n].copy_from_slice(&done.buffer[..n]);
                debug!(node = %self.node_name(), bytes = n, "bulk-in transfer complete");
                Ok(n)
            }
            CompletionStatus::Shutdown { status } => {
                debug!(node = %self.node_name(), status, "bulk-in ended by device teardown");
                Ok(0)
            }
            CompletionStatus::Failed { status } => {
                warn!(node = %self.node_name(), status, "nonzero bulk-in status received");
                Err(Error::TransferFailed(status))
            }
        }
    }

    /// Write `data` as one bulk-out transfer.
    ///
    /// Zero-length input returns zero without allocating or submitting.
    /// Under the default fire-and-forget policy the call returns the full
    /// length as soon as submission succeeds; late completion failures are
    /// logged and counted on the session, never reported to this caller.
    pub async fn write(self: &Arc<Self>, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let Some(endpoint) = self.bulk_out().copied() else {
            return Err(Error::NotWritable);
        };

        // One outstanding write per session; the owned guard stays with the
        // transfer until its completion is consumed.
        let lane = Arc::clone(&self.write_lane).lock_owned().await;

        let mut buffer = alloc_buffer(data.len())?;
        buffer.copy_from_slice(data);

        let (tx, rx) = oneshot::channel();
        let guard = TransferGuard::new(self);
        // A submission error means the transport already released the buffer.
        self.transport().submit_out(endpoint.address, buffer, tx)?;

        match self.write_policy() {
            WritePolicy::Blocking => {
                let done = rx.await.ok();
                drop(guard);

                let Some(done) = done else {
                    return Ok(0);
                };
                self.record_write(&done);
                match done.status {
                    CompletionStatus::Success { transferred } => Ok(transferred),
                    CompletionStatus::Shutdown { status } => {
                        debug!(node = %self.node_name(), status, "bulk-out ended by device teardown");
                        Ok(0)
                    }
                    CompletionStatus::Failed { status } => {
                        warn!(node = %self.node_name(), status, "nonzero bulk-out status received");
                        Err(Error::TransferFailed(status))
                    }
                }
            }
            WritePolicy::FireAndForget => {
                // The completion context owns the buffer release and the
                // write lane; it has no caller left to report to, so
                // failures only reach the session's fault counter and the
                // log.
                let session = Arc::clone(self);
                tokio::spawn(async move {
                    if let Ok(done) = rx.await {
                        session.record_write(&done);
                        if let CompletionStatus::Failed { status } = done.status {
                            warn!(
                                node = %session.node_name(),
                                status,
                                "bulk-out completed with nonzero status after write returned"
                            );
                            session.note_write_fault();
                        }
                    }
                    drop(guard);
                    drop(lane);
                });
                Ok(data.len())
            }
        }
    }
}

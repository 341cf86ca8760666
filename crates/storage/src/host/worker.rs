//! Blocking bulk transfer worker
//!
//! One dedicated OS thread per attached device executes bulk transfers
//! against the claimed device handle and resolves each submission's oneshot
//! completion. Submissions arrive over a bounded channel, so the submitting
//! side never blocks on the device; closing the transport closes the channel
//! and the worker drains what is left before releasing the handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_channel::{Receiver, Sender, TrySendError};
use common::{Error, Result};
use rusb::{Context, DeviceHandle};
use tracing::{debug, warn};

use crate::transport::{
    ActivityToken, BulkTransport, Completion, CompletionSender, CompletionStatus, STATUS_ACCESS,
    STATUS_BUSY, STATUS_INTERRUPTED, STATUS_INVALID_PARAM, STATUS_IO, STATUS_NO_DEVICE,
    STATUS_NO_MEM, STATUS_NOT_FOUND, STATUS_NOT_SUPPORTED, STATUS_OTHER, STATUS_OVERFLOW,
    STATUS_PIPE, STATUS_TIMEOUT,
};

/// Outstanding submissions the channel will hold before rejecting.
const QUEUE_DEPTH: usize = 8;

enum TransferCommand {
    BulkIn {
        endpoint: u8,
        buffer: Vec<u8>,
        completion: CompletionSender,
    },
    BulkOut {
        endpoint: u8,
        buffer: Vec<u8>,
        completion: CompletionSender,
    },
}

/// rusb-backed [`BulkTransport`] over a claimed device handle.
pub struct UsbTransport {
    commands: Sender<TransferCommand>,
    leases: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl UsbTransport {
    /// Take ownership of `handle` and spawn the worker thread for it.
    pub fn spawn(handle: DeviceHandle<Context>, timeout: Duration) -> Result<Self> {
        let (commands, receiver) = async_channel::bounded(QUEUE_DEPTH);

        std::thread::Builder::new()
            .name("usb-bulk-worker".to_string())
            .spawn(move || run_worker(handle, receiver, timeout))
            .map_err(|e| Error::Usb(format!("spawn bulk worker: {}", e)))?;

        Ok(Self {
            commands,
            leases: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        })
    }

    fn submit(&self, command: TransferCommand) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NoSuchDevice);
        }
        // try_send keeps submission non-blocking; the buffer inside a
        // rejected command is dropped right here, before we return.
        self.commands.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => Error::Channel("transfer queue full".into()),
            TrySendError::Closed(_) => Error::NoSuchDevice,
        })
    }
}

impl BulkTransport for UsbTransport {
    fn submit_in(&self, endpoint: u8, buffer: Vec<u8>, completion: CompletionSender) -> Result<()> {
        self.submit(TransferCommand::BulkIn {
            endpoint,
            buffer,
            completion,
        })
    }

    fn submit_out(
        &self,
        endpoint: u8,
        buffer: Vec<u8>,
        completion: CompletionSender,
    ) -> Result<()> {
        self.submit(TransferCommand::BulkOut {
            endpoint,
            buffer,
            completion,
        })
    }

    fn keep_active(&self) -> Result<ActivityToken> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::DeviceUnavailable);
        }
        Ok(ActivityToken::new(Arc::clone(&self.leases)))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // The worker drains already-queued transfers, then exits and drops
        // the device handle.
        self.commands.close();
    }
}

fn run_worker(handle: DeviceHandle<Context>, receiver: Receiver<TransferCommand>, timeout: Duration) {
    debug!("usb bulk worker started");

    while let Ok(command) = receiver.recv_blocking() {
        match command {
            TransferCommand::BulkIn {
                endpoint,
                mut buffer,
                completion,
            } => {
                let status = match handle.read_bulk(endpoint, &mut buffer, timeout) {
                    Ok(transferred) => CompletionStatus::Success { transferred },
                    Err(e) => completion_error(e),
                };
                // If the reader stopped waiting, the buffer drops here.
                let _ = completion.send(Completion { status, buffer });
            }
            TransferCommand::BulkOut {
                endpoint,
                buffer,
                completion,
            } => {
                let status = match handle.write_bulk(endpoint, &buffer, timeout) {
                    Ok(transferred) => CompletionStatus::Success { transferred },
                    Err(e) => completion_error(e),
                };
                let _ = completion.send(Completion { status, buffer });
            }
        }
    }

    debug!("usb bulk worker stopped");
}

/// Map a failed rusb transfer to a completion status.
///
/// Device-gone and cancellation codes form the benign shutdown family; they
/// never surface as caller faults.
fn completion_error(err: rusb::Error) -> CompletionStatus {
    let status = status_code(err);
    match err {
        rusb::Error::NoDevice | rusb::Error::NotFound | rusb::Error::Interrupted => {
            CompletionStatus::Shutdown { status }
        }
        other => {
            warn!("bulk transfer failed: {}", other);
            CompletionStatus::Failed { status }
        }
    }
}

/// libusb-style status code for a rusb error.
fn status_code(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Io => STATUS_IO,
        rusb::Error::InvalidParam => STATUS_INVALID_PARAM,
        rusb::Error::Access => STATUS_ACCESS,
        rusb::Error::NoDevice => STATUS_NO_DEVICE,
        rusb::Error::NotFound => STATUS_NOT_FOUND,
        rusb::Error::Busy => STATUS_BUSY,
        rusb::Error::Timeout => STATUS_TIMEOUT,
        rusb::Error::Overflow => STATUS_OVERFLOW,
        rusb::Error::Pipe => STATUS_PIPE,
        rusb::Error::Interrupted => STATUS_INTERRUPTED,
        rusb::Error::NoMem => STATUS_NO_MEM,
        rusb::Error::NotSupported => STATUS_NOT_SUPPORTED,
        _ => STATUS_OTHER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_match_libusb_convention() {
        assert_eq!(status_code(rusb::Error::Io), -1);
        assert_eq!(status_code(rusb::Error::NoDevice), -4);
        assert_eq!(status_code(rusb::Error::Timeout), -7);
        assert_eq!(status_code(rusb::Error::Pipe), -9);
    }

    #[test]
    fn test_device_gone_is_benign() {
        assert!(matches!(
            completion_error(rusb::Error::NoDevice),
            CompletionStatus::Shutdown { status: STATUS_NO_DEVICE }
        ));
        assert!(matches!(
            completion_error(rusb::Error::Pipe),
            CompletionStatus::Failed { status: STATUS_PIPE }
        ));
    }
}

//! Transport seam between the transfer engine and a bulk backend
//!
//! A [`BulkTransport`] accepts asynchronous bulk transfer submissions and
//! delivers each completion exactly once through a oneshot channel. Buffer
//! ownership moves to the transport at submission and comes back inside the
//! [`Completion`]; while a request is in flight nobody else may touch or free
//! the buffer.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::Result;
use tokio::sync::oneshot;

/// libusb-style status codes carried in completions. Zero is success.
pub const STATUS_IO: i32 = -1;
pub const STATUS_INVALID_PARAM: i32 = -2;
pub const STATUS_ACCESS: i32 = -3;
pub const STATUS_NO_DEVICE: i32 = -4;
pub const STATUS_NOT_FOUND: i32 = -5;
pub const STATUS_BUSY: i32 = -6;
pub const STATUS_TIMEOUT: i32 = -7;
pub const STATUS_OVERFLOW: i32 = -8;
pub const STATUS_PIPE: i32 = -9;
pub const STATUS_INTERRUPTED: i32 = -10;
pub const STATUS_NO_MEM: i32 = -11;
pub const STATUS_NOT_SUPPORTED: i32 = -12;
pub const STATUS_OTHER: i32 = -99;

/// Outcome of a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The transfer moved `transferred` bytes.
    Success { transferred: usize },
    /// Benign teardown family: device unplug, endpoint reset, request
    /// cancellation. Recorded, but never surfaced as a caller fault.
    Shutdown { status: i32 },
    /// Any other nonzero completion status.
    Failed { status: i32 },
}

/// Delivered exactly once per submitted transfer.
///
/// `buffer` is the transfer buffer handed back by the transport. For in
/// transfers the first `transferred` bytes are valid; the receiver owns the
/// buffer from here on.
#[derive(Debug)]
pub struct Completion {
    pub status: CompletionStatus,
    pub buffer: Vec<u8>,
}

/// Sender half resolving one submitted transfer.
pub type CompletionSender = oneshot::Sender<Completion>;

/// Lease keeping the device out of low-power suspend.
///
/// Dropped when the holder no longer needs the device awake.
#[derive(Debug)]
pub struct ActivityToken {
    leases: Arc<AtomicUsize>,
}

impl ActivityToken {
    pub(crate) fn new(leases: Arc<AtomicUsize>) -> Self {
        leases.fetch_add(1, Ordering::AcqRel);
        Self { leases }
    }
}

impl Drop for ActivityToken {
    fn drop(&mut self) {
        self.leases.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Asynchronous bulk transfer backend for one attached device.
///
/// Submissions never block on transfer completion. A submission error means
/// the transport already released the buffer it was given. Once a submission
/// succeeds the transport owns the buffer until it resolves the completion
/// sender; if the receiving side has gone away by then, the transport drops
/// the buffer itself.
pub trait BulkTransport: Send + Sync {
    /// Submit an inbound transfer on `endpoint` filling `buffer`.
    fn submit_in(&self, endpoint: u8, buffer: Vec<u8>, completion: CompletionSender) -> Result<()>;

    /// Submit an outbound transfer on `endpoint` sending `buffer`.
    fn submit_out(&self, endpoint: u8, buffer: Vec<u8>, completion: CompletionSender)
    -> Result<()>;

    /// Obtain an activity token holding the device in an active power state.
    fn keep_active(&self) -> Result<ActivityToken>;

    /// Release the underlying device handle. Called once during final
    /// session teardown; submissions after this fail.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_token_lease_counting() {
        let leases = Arc::new(AtomicUsize::new(0));

        let token = ActivityToken::new(Arc::clone(&leases));
        assert_eq!(leases.load(Ordering::Acquire), 1);

        let second = ActivityToken::new(Arc::clone(&leases));
        assert_eq!(leases.load(Ordering::Acquire), 2);

        drop(token);
        assert_eq!(leases.load(Ordering::Acquire), 1);
        drop(second);
        assert_eq!(leases.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_completion_status_equality() {
        assert_eq!(
            CompletionStatus::Success { transferred: 8 },
            CompletionStatus::Success { transferred: 8 }
        );
        assert_ne!(
            CompletionStatus::Shutdown { status: STATUS_NO_DEVICE },
            CompletionStatus::Failed { status: STATUS_NO_DEVICE }
        );
    }
}

//! Test doubles for the driver stack
//!
//! Provides [`LoopbackTransport`], a controllable [`BulkTransport`] that
//! echoes bulk-out payloads back to bulk-in, plus small session builders.
//! Used by unit tests across the crate and by the integration suite.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use common::{Error, Result};

use crate::endpoints::{Direction, EndpointDescriptor, TransferKind};
use crate::session::{DeviceSession, WritePolicy};
use crate::transport::{
    ActivityToken, BulkTransport, Completion, CompletionSender, CompletionStatus,
};

/// Bulk-in descriptor with the given address and max packet size.
pub fn bulk_in(address: u8, max_packet_size: u16) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        max_packet_size,
        direction: Direction::In,
        kind: TransferKind::Bulk,
    }
}

/// Bulk-out descriptor with the given address and max packet size.
pub fn bulk_out(address: u8, max_packet_size: u16) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        max_packet_size,
        direction: Direction::Out,
        kind: TransferKind::Bulk,
    }
}

/// Session at slot 0 over the given transport, endpoints optional.
pub fn session_with<T: BulkTransport + 'static>(
    transport: Arc<T>,
    bulk_in: Option<EndpointDescriptor>,
    bulk_out: Option<EndpointDescriptor>,
    write_policy: WritePolicy,
) -> Arc<DeviceSession> {
    session_at(0, transport, bulk_in, bulk_out, write_policy)
}

/// Session at an explicit slot, endpoints optional.
pub fn session_at<T: BulkTransport + 'static>(
    slot: u32,
    transport: Arc<T>,
    bulk_in: Option<EndpointDescriptor>,
    bulk_out: Option<EndpointDescriptor>,
    write_policy: WritePolicy,
) -> Arc<DeviceSession> {
    Arc::new(DeviceSession::with_endpoints(
        slot,
        transport,
        bulk_in,
        bulk_out,
        write_policy,
    ))
}

struct PendingTransfer {
    buffer: Vec<u8>,
    completion: CompletionSender,
}

#[derive(Default)]
struct LoopbackState {
    /// Payloads written to bulk-out, echoed to bulk-in in FIFO order.
    echo: VecDeque<Vec<u8>>,
    /// Held bulk-in requests while `hold_reads` is set.
    pending: VecDeque<PendingTransfer>,
    /// Held bulk-out requests while `hold_writes` is set.
    pending_writes: VecDeque<PendingTransfer>,
}

/// Loopback transport double.
///
/// Bulk-out payloads are queued and echoed back by subsequent bulk-in
/// transfers. Knobs inject submit refusals, completion failures, held
/// (delayed) read completions, and activity-token refusal.
///
/// `buffer_releases` counts the moments the transport relinquishes ownership
/// of a transfer buffer: a completion delivered (or dropped because the
/// receiver went away) and a buffer freed on submission failure both count
/// exactly once.
pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
    leases: Arc<AtomicUsize>,

    refuse_activity: AtomicBool,
    refuse_submits: AtomicBool,
    hold_reads: AtomicBool,
    hold_writes: AtomicBool,
    /// Nonzero: bulk-in completions carry this status instead of data.
    fail_read_status: AtomicI32,
    fail_read_benign: AtomicBool,
    /// Nonzero: bulk-out completions carry this status.
    fail_write_status: AtomicI32,

    submitted_reads: AtomicUsize,
    submitted_writes: AtomicUsize,
    buffer_releases: AtomicUsize,
    close_count: AtomicUsize,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LoopbackState::default()),
            leases: Arc::new(AtomicUsize::new(0)),
            refuse_activity: AtomicBool::new(false),
            refuse_submits: AtomicBool::new(false),
            hold_reads: AtomicBool::new(false),
            hold_writes: AtomicBool::new(false),
            fail_read_status: AtomicI32::new(0),
            fail_read_benign: AtomicBool::new(false),
            fail_write_status: AtomicI32::new(0),
            submitted_reads: AtomicUsize::new(0),
            submitted_writes: AtomicUsize::new(0),
            buffer_releases: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Queue a packet as if the device had data pending on bulk-in.
    pub fn queue_packet(&self, data: &[u8]) {
        lock(&self.state).echo.push_back(data.to_vec());
    }

    /// Hold bulk-in completions until [`complete_pending_read`] is called.
    pub fn hold_reads(&self, hold: bool) {
        self.hold_reads.store(hold, Ordering::Release);
    }

    /// Hold bulk-out completions until [`complete_pending_write`] is called.
    pub fn hold_writes(&self, hold: bool) {
        self.hold_writes.store(hold, Ordering::Release);
    }

    /// Refuse new submissions with a channel error.
    pub fn refuse_submits(&self, refuse: bool) {
        self.refuse_submits.store(refuse, Ordering::Release);
    }

    /// Refuse activity tokens, as a suspended/unavailable device would.
    pub fn refuse_activity(&self, refuse: bool) {
        self.refuse_activity.store(refuse, Ordering::Release);
    }

    /// Complete bulk-in transfers with `status`; benign selects the
    /// shutdown family.
    pub fn fail_reads(&self, status: i32, benign: bool) {
        self.fail_read_status.store(status, Ordering::Release);
        self.fail_read_benign.store(benign, Ordering::Release);
    }

    /// Complete bulk-out transfers with `status`.
    pub fn fail_writes(&self, status: i32) {
        self.fail_write_status.store(status, Ordering::Release);
    }

    /// Deliver the oldest held bulk-in completion. Returns false if none
    /// was pending.
    pub fn complete_pending_read(&self) -> bool {
        let pending = lock(&self.state).pending.pop_front();
        match pending {
            Some(pending) => {
                self.finish_read(pending.buffer, pending.completion);
                true
            }
            None => false,
        }
    }

    /// Deliver the oldest held bulk-out completion. Returns false if none
    /// was pending.
    pub fn complete_pending_write(&self) -> bool {
        let pending = lock(&self.state).pending_writes.pop_front();
        match pending {
            Some(pending) => {
                self.finish_write(pending.buffer, pending.completion);
                true
            }
            None => false,
        }
    }

    pub fn pending_reads(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn pending_writes(&self) -> usize {
        lock(&self.state).pending_writes.len()
    }

    pub fn queued_packets(&self) -> usize {
        lock(&self.state).echo.len()
    }

    pub fn submitted_reads(&self) -> usize {
        self.submitted_reads.load(Ordering::Acquire)
    }

    pub fn submitted_writes(&self) -> usize {
        self.submitted_writes.load(Ordering::Acquire)
    }

    /// Transfer buffers relinquished by the transport so far.
    pub fn buffer_releases(&self) -> usize {
        self.buffer_releases.load(Ordering::Acquire)
    }

    pub fn active_leases(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::Acquire)
    }

    fn release(&self) {
        self.buffer_releases.fetch_add(1, Ordering::AcqRel);
    }

    fn deliver(&self, completion: CompletionSender, done: Completion) {
        self.release();
        // Receiver may be gone (interrupted reader); the buffer then drops
        // right here, which is the release the caller could not perform.
        let _ = completion.send(done);
    }

    fn finish_read(&self, mut buffer: Vec<u8>, completion: CompletionSender) {
        let status = self.fail_read_status.load(Ordering::Acquire);
        if status != 0 {
            let status = if self.fail_read_benign.load(Ordering::Acquire) {
                CompletionStatus::Shutdown { status }
            } else {
                CompletionStatus::Failed { status }
            };
            self.deliver(completion, Completion { status, buffer });
            return;
        }

        let transferred = match lock(&self.state).echo.pop_front() {
            Some(packet) => {
                let n = packet.len().min(buffer.len());
                buffer[..n].copy_from_slice(&packet[..n]);
                n
            }
            None => 0,
        };
        self.deliver(
            completion,
            Completion {
                status: CompletionStatus::Success { transferred },
                buffer,
            },
        );
    }

    fn finish_write(&self, buffer: Vec<u8>, completion: CompletionSender) {
        let status = self.fail_write_status.load(Ordering::Acquire);
        if status != 0 {
            self.deliver(
                completion,
                Completion {
                    status: CompletionStatus::Failed { status },
                    buffer,
                },
            );
            return;
        }

        lock(&self.state).echo.push_back(buffer.clone());
        self.deliver(
            completion,
            Completion {
                status: CompletionStatus::Success {
                    transferred: buffer.len(),
                },
                buffer,
            },
        );
    }
}

impl BulkTransport for LoopbackTransport {
    fn submit_in(&self, _endpoint: u8, buffer: Vec<u8>, completion: CompletionSender) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            self.release();
            return Err(Error::NoSuchDevice);
        }
        if self.refuse_submits.load(Ordering::Acquire) {
            self.release();
            return Err(Error::Channel("submit refused".into()));
        }
        self.submitted_reads.fetch_add(1, Ordering::AcqRel);

        if self.hold_reads.load(Ordering::Acquire) {
            lock(&self.state)
                .pending
                .push_back(PendingTransfer { buffer, completion });
            return Ok(());
        }
        self.finish_read(buffer, completion);
        Ok(())
    }

    fn submit_out(
        &self,
        _endpoint: u8,
        buffer: Vec<u8>,
        completion: CompletionSender,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            self.release();
            return Err(Error::NoSuchDevice);
        }
        if self.refuse_submits.load(Ordering::Acquire) {
            self.release();
            return Err(Error::Channel("submit refused".into()));
        }
        self.submitted_writes.fetch_add(1, Ordering::AcqRel);

        if self.hold_writes.load(Ordering::Acquire) {
            lock(&self.state)
                .pending_writes
                .push_back(PendingTransfer { buffer, completion });
            return Ok(());
        }
        self.finish_write(buffer, completion);
        Ok(())
    }

    fn keep_active(&self) -> Result<ActivityToken> {
        if self.closed.load(Ordering::Acquire) || self.refuse_activity.load(Ordering::Acquire) {
            return Err(Error::DeviceUnavailable);
        }
        Ok(ActivityToken::new(Arc::clone(&self.leases)))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_count.fetch_add(1, Ordering::AcqRel);
    }
}

//! Per-device session object
//!
//! One [`DeviceSession`] exists per physical attach event and is never reused
//! across attaches. It is shared by the registry, every open client handle,
//! and every in-flight transfer context; an explicit atomic reference count
//! decides when the underlying device handle is released. The count reaching
//! zero finalizes the session exactly once, and only after detach has been
//! requested.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::debug;

use crate::endpoints::EndpointDescriptor;
use crate::transport::{BulkTransport, Completion, CompletionStatus};

/// Session lifecycle state.
///
/// `Ready` with more than one live reference is the *active* phase; it is
/// derived from the count rather than stored separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created at attach, endpoints not yet resolved
    Resolving,
    /// Endpoints resolved, published in the registry
    Ready,
    /// Detach requested, waiting for the last reference
    Detaching,
    /// Finalized; device handle and buffers released
    Terminated,
}

/// Completion policy for the write path.
///
/// The original driver returns from write as soon as the transfer is
/// submitted and lets the completion callback release the buffer; that stays
/// the default. `Blocking` makes write wait for its completion the same way
/// read does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritePolicy {
    #[default]
    FireAndForget,
    Blocking,
}

/// Result of the most recently completed transfer in one direction.
#[derive(Debug, Clone, Copy, Default)]
pub struct LaneResult {
    /// Bytes moved by the last successful transfer
    pub bytes: usize,
    /// Status of the last completion; zero on success
    pub status: i32,
}

/// The live, reference-counted state bound to one device attachment.
pub struct DeviceSession {
    slot: u32,
    transport: Arc<dyn BulkTransport>,
    bulk_in: Option<EndpointDescriptor>,
    bulk_out: Option<EndpointDescriptor>,
    write_policy: WritePolicy,

    state: StdMutex<SessionState>,
    /// Live holders: registry entry, open client handles, in-flight
    /// transfer contexts.
    refs: AtomicU32,

    /// At most one outstanding transfer per direction. The lane guard is
    /// held from submission until the completion is consumed, including by
    /// the detached task that inherits a cancelled or fire-and-forget
    /// transfer.
    pub(crate) read_lane: Arc<Mutex<()>>,
    pub(crate) write_lane: Arc<Mutex<()>>,

    read_result: StdMutex<LaneResult>,
    write_result: StdMutex<LaneResult>,

    /// Write completions that failed after the call already returned.
    write_faults: AtomicU64,
}

/// Locks ignoring poisoning; session state must stay reachable for teardown
/// even if a holder panicked.
fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl DeviceSession {
    /// Create a session in the `Resolving` state with the registry's
    /// initial reference.
    pub(crate) fn resolving<T: BulkTransport + 'static>(
        slot: u32,
        transport: Arc<T>,
        write_policy: WritePolicy,
    ) -> Self {
        Self {
            slot,
            transport,
            bulk_in: None,
            bulk_out: None,
            write_policy,
            state: StdMutex::new(SessionState::Resolving),
            refs: AtomicU32::new(1),
            read_lane: Arc::new(Mutex::new(())),
            write_lane: Arc::new(Mutex::new(())),
            read_result: StdMutex::new(LaneResult::default()),
            write_result: StdMutex::new(LaneResult::default()),
            write_faults: AtomicU64::new(0),
        }
    }

    /// Record the resolved endpoint pair and move to `Ready`.
    ///
    /// Runs before the session is shared; endpoints are immutable afterward.
    pub(crate) fn resolve(&mut self, bulk_in: EndpointDescriptor, bulk_out: EndpointDescriptor) {
        self.bulk_in = Some(bulk_in);
        self.bulk_out = Some(bulk_out);
        *lock(&self.state) = SessionState::Ready;
    }

    /// Test constructor allowing a partially resolved endpoint set.
    pub(crate) fn with_endpoints<T: BulkTransport + 'static>(
        slot: u32,
        transport: Arc<T>,
        bulk_in: Option<EndpointDescriptor>,
        bulk_out: Option<EndpointDescriptor>,
        write_policy: WritePolicy,
    ) -> Self {
        let mut session = Self::resolving(slot, transport, write_policy);
        session.bulk_in = bulk_in;
        session.bulk_out = bulk_out;
        *lock(&session.state) = SessionState::Ready;
        session
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Class-scoped node name of this session, `storage<N>`.
    pub fn node_name(&self) -> String {
        format!("storage{}", self.slot)
    }

    pub fn bulk_in(&self) -> Option<&EndpointDescriptor> {
        self.bulk_in.as_ref()
    }

    pub fn bulk_out(&self) -> Option<&EndpointDescriptor> {
        self.bulk_out.as_ref()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn BulkTransport> {
        &self.transport
    }

    pub(crate) fn write_policy(&self) -> WritePolicy {
        self.write_policy
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Whether any reference beyond the registry's own exists.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Ready && self.ref_count() > 1
    }

    /// Take an additional reference.
    pub(crate) fn retain(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference; the transition to zero finalizes the session.
    pub(crate) fn release_ref(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finalize();
        }
    }

    /// Mark the detach request. Called by the attachment controller after
    /// the registry entry has been removed.
    pub(crate) fn begin_detach(&self) {
        *lock(&self.state) = SessionState::Detaching;
    }

    /// Release owned resources. Reached only from the unique
    /// transition-to-zero of the reference count, and acts only once detach
    /// has been requested.
    fn finalize(&self) {
        let mut state = lock(&self.state);
        if *state == SessionState::Detaching {
            *state = SessionState::Terminated;
            drop(state);
            self.transport.close();
            debug!(node = %self.node_name(), "session finalized");
        }
    }

    pub fn last_read(&self) -> LaneResult {
        *lock(&self.read_result)
    }

    pub fn last_write(&self) -> LaneResult {
        *lock(&self.write_result)
    }

    /// Count of write transfers that completed with a non-benign status
    /// after the write call already returned.
    pub fn write_fault_count(&self) -> u64 {
        self.write_faults.load(Ordering::Acquire)
    }

    pub(crate) fn record_read(&self, completion: &Completion) {
        *lock(&self.read_result) = lane_result(completion.status);
    }

    pub(crate) fn record_write(&self, completion: &Completion) {
        *lock(&self.write_result) = lane_result(completion.status);
    }

    pub(crate) fn note_write_fault(&self) {
        self.write_faults.fetch_add(1, Ordering::AcqRel);
    }
}

fn lane_result(status: CompletionStatus) -> LaneResult {
    match status {
        CompletionStatus::Success { transferred } => LaneResult {
            bytes: transferred,
            status: 0,
        },
        CompletionStatus::Shutdown { status } | CompletionStatus::Failed { status } => {
            LaneResult { bytes: 0, status }
        }
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("slot", &self.slot)
            .field("state", &self.state())
            .field("refs", &self.ref_count())
            .field("bulk_in", &self.bulk_in)
            .field("bulk_out", &self.bulk_out)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LoopbackTransport;

    fn bulk(address: u8) -> EndpointDescriptor {
        use crate::endpoints::{Direction, TransferKind};
        EndpointDescriptor {
            address,
            max_packet_size: 64,
            direction: if address & 0x80 != 0 {
                Direction::In
            } else {
                Direction::Out
            },
            kind: TransferKind::Bulk,
        }
    }

    #[test]
    fn test_resolve_moves_to_ready() {
        let transport = LoopbackTransport::new();
        let mut session = DeviceSession::resolving(0, transport, WritePolicy::default());
        assert_eq!(session.state(), SessionState::Resolving);

        session.resolve(bulk(0x81), bulk(0x01));
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.bulk_in().unwrap().address, 0x81);
        assert_eq!(session.bulk_out().unwrap().address, 0x01);
    }

    #[test]
    fn test_finalize_requires_detach_request() {
        let transport = LoopbackTransport::new();
        let mut session =
            DeviceSession::resolving(3, Arc::clone(&transport), WritePolicy::default());
        session.resolve(bulk(0x81), bulk(0x01));

        session.retain();
        session.release_ref();
        // Count went 1 -> 2 -> 1, never zero: nothing finalized.
        assert_eq!(session.state(), SessionState::Ready);
        assert!(!transport.is_closed());

        session.begin_detach();
        session.release_ref();
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(transport.is_closed());
        assert_eq!(transport.close_count(), 1);
    }

    #[test]
    fn test_node_name_convention() {
        let transport = LoopbackTransport::new();
        let session = DeviceSession::with_endpoints(
            7,
            transport,
            Some(bulk(0x81)),
            Some(bulk(0x01)),
            WritePolicy::default(),
        );
        assert_eq!(session.node_name(), "storage7");
    }

    #[test]
    fn test_active_is_derived_from_count() {
        let transport = LoopbackTransport::new();
        let session = DeviceSession::with_endpoints(
            0,
            transport,
            Some(bulk(0x81)),
            Some(bulk(0x01)),
            WritePolicy::default(),
        );

        assert!(!session.is_active());
        session.retain();
        assert!(session.is_active());
        session.release_ref();
        assert!(!session.is_active());
    }
}

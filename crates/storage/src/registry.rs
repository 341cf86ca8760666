//! Session registry and open/close lifecycle
//!
//! Maps client-addressable slots to device sessions. `acquire` is the open
//! path: it takes an activity token so the device stays awake, then a session
//! reference; dropping the returned [`SessionRef`] is the close path.
//! Concurrent opens on one slot each succeed and release independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use common::{Error, Result};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::session::DeviceSession;
use crate::transport::ActivityToken;

/// Registry of addressable device sessions.
pub struct SessionRegistry {
    slots: Mutex<HashMap<u32, Arc<DeviceSession>>>,
    next_slot: AtomicU32,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_slot: AtomicU32::new(0),
        }
    }

    /// Allocate the next slot number. Slots are never reused across attach
    /// events.
    pub(crate) fn allocate_slot(&self) -> u32 {
        self.next_slot.fetch_add(1, Ordering::Relaxed)
    }

    /// Publish a ready session under its slot.
    pub(crate) fn publish(&self, session: Arc<DeviceSession>) {
        info!(node = %session.node_name(), "device session published");
        lock(&self.slots).insert(session.slot(), session);
    }

    /// Remove a session's registry entry. No acquire can succeed afterward.
    pub(crate) fn remove(&self, slot: u32) -> Option<Arc<DeviceSession>> {
        lock(&self.slots).remove(&slot)
    }

    /// Open a client reference to the session at `slot`.
    ///
    /// Misses fail with [`Error::NoSuchDevice`]. On a hit the activity token
    /// is obtained first; if the device cannot be held active the call fails
    /// with [`Error::DeviceUnavailable`] and the reference count is left
    /// untouched. The count is incremented while the registry lock is still
    /// held so a concurrent detach cannot finalize underneath us.
    pub fn acquire(&self, slot: u32) -> Result<SessionRef> {
        let slots = lock(&self.slots);
        let session = slots.get(&slot).ok_or(Error::NoSuchDevice)?;

        let activity = session.transport().keep_active()?;
        session.retain();
        debug!(node = %session.node_name(), refs = session.ref_count(), "session acquired");

        Ok(SessionRef {
            session: Arc::clone(session),
            _activity: activity,
        })
    }

    /// Number of published sessions.
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.slots).is_empty()
    }

    /// Node names of all published sessions.
    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.slots)
            .values()
            .map(|session| session.node_name())
            .collect();
        names.sort();
        names
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One open client handle onto a device session.
///
/// Holds a session reference and the activity token for its duration; both
/// are released on drop. If this was the last reference after a detach, the
/// drop finalizes the session.
pub struct SessionRef {
    session: Arc<DeviceSession>,
    _activity: ActivityToken,
}

impl SessionRef {
    pub fn node_name(&self) -> String {
        self.session.node_name()
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    /// Read into `out`; see [`DeviceSession::read`].
    pub async fn read(&self, out: &mut [u8]) -> Result<usize> {
        self.session.read(out).await
    }

    /// Cancellable read; see [`DeviceSession::read_cancellable`].
    pub async fn read_cancellable(
        &self,
        out: &mut [u8],
        cancel: oneshot::Receiver<()>,
    ) -> Result<usize> {
        self.session.read_cancellable(out, cancel).await
    }

    /// Write `data`; see [`DeviceSession::write`].
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.session.write(data).await
    }
}

impl Drop for SessionRef {
    fn drop(&mut self) {
        self.session.release_ref();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::WritePolicy;
    use crate::testing::{LoopbackTransport, bulk_in, bulk_out, session_with};

    fn published_session(
        registry: &SessionRegistry,
        transport: Arc<LoopbackTransport>,
    ) -> Arc<DeviceSession> {
        let session = session_with(
            transport,
            Some(bulk_in(0x81, 64)),
            Some(bulk_out(0x01, 64)),
            WritePolicy::FireAndForget,
        );
        registry.publish(Arc::clone(&session));
        session
    }

    #[test]
    fn test_acquire_unknown_slot_fails() {
        let registry = SessionRegistry::new();
        assert!(matches!(registry.acquire(5), Err(Error::NoSuchDevice)));
    }

    #[test]
    fn test_acquire_increments_and_release_decrements() {
        let registry = SessionRegistry::new();
        let transport = LoopbackTransport::new();
        let session = published_session(&registry, Arc::clone(&transport));

        assert_eq!(session.ref_count(), 1);
        let handle = registry.acquire(session.slot()).unwrap();
        assert_eq!(session.ref_count(), 2);
        assert_eq!(transport.active_leases(), 1);

        drop(handle);
        assert_eq!(session.ref_count(), 1);
        assert_eq!(transport.active_leases(), 0);
    }

    #[test]
    fn test_activity_token_failure_leaves_count_untouched() {
        let registry = SessionRegistry::new();
        let transport = LoopbackTransport::new();
        let session = published_session(&registry, Arc::clone(&transport));

        transport.refuse_activity(true);
        assert!(matches!(
            registry.acquire(session.slot()),
            Err(Error::DeviceUnavailable)
        ));
        assert_eq!(session.ref_count(), 1);
        assert_eq!(transport.active_leases(), 0);
    }

    #[test]
    fn test_concurrent_opens_each_succeed() {
        let registry = SessionRegistry::new();
        let transport = LoopbackTransport::new();
        let session = published_session(&registry, transport);

        let first = registry.acquire(session.slot()).unwrap();
        let second = registry.acquire(session.slot()).unwrap();
        assert_eq!(session.ref_count(), 3);

        drop(first);
        drop(second);
        assert_eq!(session.ref_count(), 1);
    }

    #[test]
    fn test_node_names_sorted() {
        use crate::testing::session_at;

        let registry = SessionRegistry::new();
        for slot in [2, 0, 1] {
            let session = session_at(
                slot,
                LoopbackTransport::new(),
                Some(bulk_in(0x81, 64)),
                Some(bulk_out(0x01, 64)),
                WritePolicy::FireAndForget,
            );
            registry.publish(session);
        }
        assert_eq!(registry.node_names(), vec!["storage0", "storage1", "storage2"]);
    }
}

//! Attachment controller
//!
//! Drives the per-device state machine in response to attach and detach
//! events from the discovery layer:
//! `Unattached -> Resolving -> Ready -> Detaching -> Terminated`.
//! Attach resolves the bulk endpoint pair and publishes a registry entry;
//! detach retracts the entry immediately and defers finalization to the last
//! lingering reference.

use std::sync::Arc;

use common::{Error, Result};
use tracing::{info, warn};

use crate::endpoints::{EndpointDescriptor, resolve_bulk_endpoints};
use crate::registry::SessionRegistry;
use crate::session::{DeviceSession, WritePolicy};
use crate::transport::BulkTransport;

pub struct AttachmentController {
    registry: Arc<SessionRegistry>,
    write_policy: WritePolicy,
}

impl AttachmentController {
    pub fn new(registry: Arc<SessionRegistry>, write_policy: WritePolicy) -> Self {
        Self {
            registry,
            write_policy,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Handle a device-attach event.
    ///
    /// Resolver failure aborts the attach: the partially built transport is
    /// released, nothing becomes visible in the registry, and the device is
    /// left unclaimed. Success publishes a new `storage<N>` session holding
    /// the registry's reference.
    pub fn attach<T: BulkTransport + 'static>(
        &self,
        transport: Arc<T>,
        endpoints: &[EndpointDescriptor],
    ) -> Result<u32> {
        let (bulk_in, bulk_out) = match resolve_bulk_endpoints(endpoints) {
            Ok(pair) => pair,
            Err(err) => {
                warn!("attach aborted: no bulk endpoint pair on device");
                transport.close();
                return Err(err);
            }
        };

        let slot = self.registry.allocate_slot();
        let mut session = DeviceSession::resolving(slot, transport, self.write_policy);
        session.resolve(bulk_in, bulk_out);
        let session = Arc::new(session);

        info!(
            node = %session.node_name(),
            bulk_in = format_args!("{:#04x}", bulk_in.address),
            bulk_out = format_args!("{:#04x}", bulk_out.address),
            "device attached"
        );
        self.registry.publish(session);
        Ok(slot)
    }

    /// Handle a device-detach event.
    ///
    /// The registry entry disappears first so no new acquire can succeed,
    /// then the registry's own reference is dropped. If nothing else holds
    /// the session this finalizes synchronously; otherwise the last client
    /// or in-flight transfer release does it.
    pub fn detach(&self, slot: u32) -> Result<()> {
        let session = self.registry.remove(slot).ok_or(Error::NoSuchDevice)?;
        info!(node = %session.node_name(), refs = session.ref_count(), "device detaching");

        session.begin_detach();
        session.release_ref();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::{Direction, TransferKind};
    use crate::session::SessionState;
    use crate::testing::{LoopbackTransport, bulk_in, bulk_out};

    fn controller() -> AttachmentController {
        AttachmentController::new(
            Arc::new(SessionRegistry::new()),
            WritePolicy::FireAndForget,
        )
    }

    #[test]
    fn test_attach_publishes_session() {
        let controller = controller();
        let transport = LoopbackTransport::new();

        let slot = controller
            .attach(transport, &[bulk_in(0x81, 64), bulk_out(0x01, 64)])
            .unwrap();

        assert_eq!(controller.registry().len(), 1);
        let handle = controller.registry().acquire(slot).unwrap();
        assert_eq!(handle.node_name(), format!("storage{}", slot));
    }

    #[test]
    fn test_attach_without_endpoints_publishes_nothing() {
        let controller = controller();
        let transport = LoopbackTransport::new();

        let interrupt_only = [EndpointDescriptor {
            address: 0x81,
            max_packet_size: 8,
            direction: Direction::In,
            kind: TransferKind::Interrupt,
        }];
        let result = controller.attach(Arc::clone(&transport), &interrupt_only);

        assert!(matches!(result, Err(Error::EndpointsNotFound)));
        assert!(controller.registry().is_empty());
        // Partially built attach released its device handle.
        assert!(transport.is_closed());
    }

    #[test]
    fn test_detach_without_clients_finalizes_synchronously() {
        let controller = controller();
        let transport = LoopbackTransport::new();
        let slot = controller
            .attach(
                Arc::clone(&transport),
                &[bulk_in(0x81, 64), bulk_out(0x01, 64)],
            )
            .unwrap();

        controller.detach(slot).unwrap();
        assert!(controller.registry().is_empty());
        assert!(transport.is_closed());
        assert_eq!(transport.close_count(), 1);
    }

    #[test]
    fn test_detach_with_open_client_defers_finalization() {
        let controller = controller();
        let transport = LoopbackTransport::new();
        let slot = controller
            .attach(
                Arc::clone(&transport),
                &[bulk_in(0x81, 64), bulk_out(0x01, 64)],
            )
            .unwrap();

        let handle = controller.registry().acquire(slot).unwrap();
        let session = Arc::clone(handle.session());

        controller.detach(slot).unwrap();
        // Entry is gone and new opens fail, but the session lives on.
        assert!(matches!(
            controller.registry().acquire(slot),
            Err(Error::NoSuchDevice)
        ));
        assert_eq!(session.state(), SessionState::Detaching);
        assert!(!transport.is_closed());

        drop(handle);
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(transport.is_closed());
    }

    #[test]
    fn test_detach_unknown_slot_fails() {
        let controller = controller();
        assert!(matches!(controller.detach(9), Err(Error::NoSuchDevice)));
    }

    #[test]
    fn test_slots_are_not_reused() {
        let controller = controller();

        let first = controller
            .attach(LoopbackTransport::new(), &[bulk_in(0x81, 64), bulk_out(0x01, 64)])
            .unwrap();
        controller.detach(first).unwrap();

        let second = controller
            .attach(LoopbackTransport::new(), &[bulk_in(0x81, 64), bulk_out(0x01, 64)])
            .unwrap();
        assert_ne!(first, second);
    }
}

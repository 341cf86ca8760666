//! Endpoint descriptors and the bulk endpoint resolver
//!
//! The resolver scans a device's active interface configuration once, in
//! declared order, and picks the first bulk-in and first bulk-out endpoint.
//! First match wins; a device exposing more than one bulk pipe per direction
//! always gets its earliest-declared pipe used.

use common::{Error, Result};

/// Endpoint data direction, host-relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// USB endpoint transfer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// One endpoint of the active interface configuration.
///
/// Immutable once resolved into a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Endpoint address, direction bit included
    pub address: u8,
    /// wMaxPacketSize of the endpoint
    pub max_packet_size: u16,
    pub direction: Direction,
    pub kind: TransferKind,
}

impl EndpointDescriptor {
    pub fn is_bulk_in(&self) -> bool {
        self.kind == TransferKind::Bulk && self.direction == Direction::In
    }

    pub fn is_bulk_out(&self) -> bool {
        self.kind == TransferKind::Bulk && self.direction == Direction::Out
    }
}

/// Resolve the bulk endpoint pair of an interface configuration.
///
/// Single pass over `endpoints` in declared order; the first bulk-in and the
/// first bulk-out endpoint are recorded and later matches of the same
/// direction are ignored. Fails with [`Error::EndpointsNotFound`] if either
/// direction never matches.
pub fn resolve_bulk_endpoints(
    endpoints: &[EndpointDescriptor],
) -> Result<(EndpointDescriptor, EndpointDescriptor)> {
    let mut bulk_in = None;
    let mut bulk_out = None;

    for endpoint in endpoints {
        if bulk_in.is_none() && endpoint.is_bulk_in() {
            bulk_in = Some(*endpoint);
        }
        if bulk_out.is_none() && endpoint.is_bulk_out() {
            bulk_out = Some(*endpoint);
        }
    }

    match (bulk_in, bulk_out) {
        (Some(bulk_in), Some(bulk_out)) => Ok((bulk_in, bulk_out)),
        _ => Err(Error::EndpointsNotFound),
    }
}

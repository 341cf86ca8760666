//! USB device wrapper
//!
//! Wraps a discovered rusb device with its cached descriptor, matches it
//! against the configured identity pair, and prepares it for bulk transfers:
//! kernel driver detach, interface claim, and conversion of the active
//! configuration's endpoints for the resolver.

use common::{Error, Result};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle};
use tracing::{debug, warn};

use crate::config::DeviceMatch;
use crate::endpoints::{Direction, EndpointDescriptor, TransferKind};

/// USB device wrapper with cached descriptor information.
pub struct UsbDevice {
    device: Device<Context>,
    descriptor: DeviceDescriptor,
}

impl UsbDevice {
    /// Create a new wrapper, reading and caching the device descriptor.
    pub fn new(device: Device<Context>) -> std::result::Result<Self, rusb::Error> {
        let descriptor = device.device_descriptor()?;
        Ok(Self { device, descriptor })
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id()
    }

    pub fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    pub fn address(&self) -> u8 {
        self.device.address()
    }

    /// Whether this device carries the identity pair the driver binds to.
    pub fn matches(&self, identity: &DeviceMatch) -> bool {
        self.vendor_id() == identity.vendor_id && self.product_id() == identity.product_id
    }

    /// Endpoints of the active configuration's first interface setting, in
    /// declared order, plus the interface number to claim.
    pub fn endpoints(&self) -> Result<(u8, Vec<EndpointDescriptor>)> {
        let config = self
            .device
            .active_config_descriptor()
            .map_err(|e| Error::Usb(format!("active config descriptor: {}", e)))?;

        let interface = config
            .interfaces()
            .next()
            .ok_or_else(|| Error::Usb("device has no interfaces".into()))?;
        let setting = interface
            .descriptors()
            .next()
            .ok_or_else(|| Error::Usb("interface has no settings".into()))?;

        let endpoints = setting
            .endpoint_descriptors()
            .map(|endpoint| EndpointDescriptor {
                address: endpoint.address(),
                max_packet_size: endpoint.max_packet_size(),
                direction: map_direction(endpoint.direction()),
                kind: map_transfer_type(endpoint.transfer_type()),
            })
            .collect();

        Ok((interface.number(), endpoints))
    }

    /// Open the device and claim `interface` for bulk transfers.
    ///
    /// Detaches an active kernel driver first; a failed detach is logged and
    /// the claim is still attempted.
    pub fn open(&self, interface: u8) -> Result<DeviceHandle<Context>> {
        let handle = self.device.open().map_err(|e| match e {
            rusb::Error::NoDevice | rusb::Error::NotFound => Error::NoSuchDevice,
            rusb::Error::Access => Error::DeviceUnavailable,
            other => Error::Usb(format!("open: {}", other)),
        })?;

        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!(interface, "detaching kernel driver");
                if let Err(e) = handle.detach_kernel_driver(interface) {
                    warn!(interface, "failed to detach kernel driver: {}", e);
                }
            }
            Ok(false) => {}
            Err(e) => {
                debug!(interface, "could not check kernel driver status: {}", e);
            }
        }

        handle
            .claim_interface(interface)
            .map_err(|e| Error::Usb(format!("claim interface {}: {}", interface, e)))?;
        debug!(
            interface,
            bus = self.bus_number(),
            address = self.address(),
            "device opened and interface claimed"
        );

        Ok(handle)
    }
}

fn map_direction(direction: rusb::Direction) -> Direction {
    match direction {
        rusb::Direction::In => Direction::In,
        rusb::Direction::Out => Direction::Out,
    }
}

fn map_transfer_type(kind: rusb::TransferType) -> TransferKind {
    match kind {
        rusb::TransferType::Control => TransferKind::Control,
        rusb::TransferType::Isochronous => TransferKind::Isochronous,
        rusb::TransferType::Bulk => TransferKind::Bulk,
        rusb::TransferType::Interrupt => TransferKind::Interrupt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_direction() {
        assert_eq!(map_direction(rusb::Direction::In), Direction::In);
        assert_eq!(map_direction(rusb::Direction::Out), Direction::Out);
    }

    #[test]
    fn test_map_transfer_type() {
        assert_eq!(map_transfer_type(rusb::TransferType::Bulk), TransferKind::Bulk);
        assert_eq!(
            map_transfer_type(rusb::TransferType::Interrupt),
            TransferKind::Interrupt
        );
    }
}

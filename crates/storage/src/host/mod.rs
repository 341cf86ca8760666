//! rusb-backed host transport
//!
//! Real-device backend for the driver stack: a device wrapper that claims the
//! interface and lists its endpoints, and a per-device blocking worker thread
//! that executes bulk transfers and delivers completions.

pub mod device;
pub mod worker;

pub use device::UsbDevice;
pub use worker::UsbTransport;

//! Host-side driver stack for a USB bulk-storage device
//!
//! The stack enumerates a matching device, resolves its first bulk-in and
//! bulk-out endpoints, and exposes each attached device as a `storage<N>`
//! registry slot that clients open for read/write sessions. Transfers are
//! executed asynchronously by a transport backend and completed exactly once
//! through oneshot channels; read calls wait for their completion, write
//! calls are fire-and-forget by default.
//!
//! Module map:
//! - [`endpoints`]: endpoint descriptors and the bulk endpoint resolver
//! - [`transport`]: the `BulkTransport` seam between engine and backend
//! - [`session`]: the reference-counted per-device session object
//! - [`engine`]: the bulk transfer engine (read/write on a session)
//! - [`registry`]: slot registry and acquire/release session lifecycle
//! - [`controller`]: attach/detach state machine
//! - [`host`]: rusb-backed transport with a blocking worker thread
//! - [`testing`]: loopback transport double for tests

pub mod config;
pub mod controller;
pub mod endpoints;
pub mod engine;
pub mod host;
pub mod registry;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::DriverConfig;
pub use controller::AttachmentController;
pub use endpoints::{Direction, EndpointDescriptor, TransferKind, resolve_bulk_endpoints};
pub use registry::{SessionRef, SessionRegistry};
pub use session::{DeviceSession, SessionState, WritePolicy};
pub use transport::{ActivityToken, BulkTransport, Completion, CompletionStatus};

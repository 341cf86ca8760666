//! Driver error taxonomy
//!
//! Every fallible operation in the stack reports one of these variants.
//! Transfer status codes are libusb-style negative integers; zero means
//! success.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Buffer or control-structure allocation could not be satisfied.
    /// Fatal to the operation in progress, never to the process.
    #[error("allocation failed")]
    AllocationFailed,

    /// The device exposes no usable bulk endpoint pair. Fatal to attach;
    /// the device is left unclaimed.
    #[error("no bulk-in/bulk-out endpoint pair found")]
    EndpointsNotFound,

    /// A transfer completed with a nonzero status outside the benign
    /// shutdown/reset/cancel family.
    #[error("bulk transfer failed with status {0}")]
    TransferFailed(i32),

    /// The caller's wait was cancelled before the completion fired.
    /// Not a device fault; the submitted request stays outstanding.
    #[error("wait for transfer completion was interrupted")]
    Interrupted,

    /// The activity token keeping the device out of suspend could not
    /// be obtained.
    #[error("device is suspended or unavailable")]
    DeviceUnavailable,

    /// No bulk-in endpoint was resolved for this session.
    #[error("session has no readable bulk endpoint")]
    NotReadable,

    /// No bulk-out endpoint was resolved for this session.
    #[error("session has no writable bulk endpoint")]
    NotWritable,

    /// A caller-supplied buffer could not be copied across the trust
    /// boundary.
    #[error("caller buffer could not be copied")]
    FaultyInput,

    /// The registry slot does not exist, or the device detached before
    /// or during the call.
    #[error("no such device")]
    NoSuchDevice,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("USB error: {0}")]
    Usb(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_failed_display() {
        let err = Error::TransferFailed(-9);
        let msg = format!("{}", err);
        assert!(msg.contains("status -9"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}

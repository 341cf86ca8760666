//! Common utilities for usbstor
//!
//! This crate provides the error taxonomy and logging setup shared by the
//! driver crates.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::setup_logging;

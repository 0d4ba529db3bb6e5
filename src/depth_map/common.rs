//! Common utilities module
//!
//! This module contains shared utilities used across the depth map device layer.

pub mod error;

pub use error::{DeviceError, ErrorKind, Result};

use std::panic::Location;

use thiserror::Error;

/// Coarse classification of a [`DeviceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AllocationFailure,
    TransferFailure,
    BindingFailure,
    KernelFailure,
    InvalidSlot,
    InvariantViolation,
    InvalidConfiguration,
}

/// Fatal accelerator error. Nothing in this crate retries or rolls back after one.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Allocation failed in {operation} at {location}: {diagnostic}")]
    AllocationFailure {
        operation: &'static str,
        location: &'static Location<'static>,
        diagnostic: String,
    },

    #[error("Transfer failed in {operation} at {location}: {diagnostic}")]
    TransferFailure {
        operation: &'static str,
        location: &'static Location<'static>,
        diagnostic: String,
    },

    #[error("Texture binding failed in {operation} at {location}: {diagnostic}")]
    BindingFailure {
        operation: &'static str,
        location: &'static Location<'static>,
        diagnostic: String,
    },

    #[error("Kernel failed in {operation} at {location}: {diagnostic}")]
    KernelFailure {
        operation: &'static str,
        location: &'static Location<'static>,
        diagnostic: String,
    },

    #[error("Invalid camera parameter slot: slot={slot}, capacity={capacity}")]
    InvalidSlot { slot: usize, capacity: usize },

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl DeviceError {
    #[track_caller]
    pub fn allocation(operation: &'static str, diagnostic: impl Into<String>) -> Self {
        Self::AllocationFailure {
            operation,
            location: Location::caller(),
            diagnostic: diagnostic.into(),
        }
    }

    #[track_caller]
    pub fn transfer(operation: &'static str, diagnostic: impl Into<String>) -> Self {
        Self::TransferFailure {
            operation,
            location: Location::caller(),
            diagnostic: diagnostic.into(),
        }
    }

    #[track_caller]
    pub fn binding(operation: &'static str, diagnostic: impl Into<String>) -> Self {
        Self::BindingFailure {
            operation,
            location: Location::caller(),
            diagnostic: diagnostic.into(),
        }
    }

    #[track_caller]
    pub fn kernel(operation: &'static str, diagnostic: impl Into<String>) -> Self {
        Self::KernelFailure {
            operation,
            location: Location::caller(),
            diagnostic: diagnostic.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AllocationFailure { .. } => ErrorKind::AllocationFailure,
            Self::TransferFailure { .. } => ErrorKind::TransferFailure,
            Self::BindingFailure { .. } => ErrorKind::BindingFailure,
            Self::KernelFailure { .. } => ErrorKind::KernelFailure,
            Self::InvalidSlot { .. } => ErrorKind::InvalidSlot,
            Self::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Self::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
        }
    }

    /// Name of the failing runtime operation, when the error came from the runtime.
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            Self::AllocationFailure { operation, .. }
            | Self::TransferFailure { operation, .. }
            | Self::BindingFailure { operation, .. }
            | Self::KernelFailure { operation, .. } => Some(operation),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;

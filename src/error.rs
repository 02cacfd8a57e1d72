//! Error types for device-group verification.
//!
//! `VerifierError` is what an iteration returns; the iteration driver maps
//! it onto a skip or a failure. `DriverError` covers everything the driver
//! collaborator can report.

use crate::driver::{ImageLayout, MemoryPropertyFlags, ResourceHandle};
use image::RgbaImage;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for a verification run.
#[derive(Error, Debug)]
pub enum VerifierError {
    /// A capability, extension, feature or peer-access relationship is absent.
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// No memory type satisfies a resource's constraints.
    #[error("No compatible memory type (type bits 0x{type_bits:X}, required {required})")]
    NoCompatibleMemory {
        type_bits: u32,
        required: MemoryPropertyFlags,
    },

    /// The driver reported a failure.
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// Captured image did not match the reference.
    #[error("Image comparison failed on devices {first}/{second}: {summary}")]
    VerificationMismatch {
        first: u32,
        second: u32,
        summary: String,
        diff: Option<Box<RgbaImage>>,
    },

    /// Reference image could not be decoded or written.
    #[error("Reference image error: {0}")]
    Reference(#[from] image::ImageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VerifierError {
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::UnsupportedConfiguration(reason.into())
    }

    /// True for errors that turn the whole case into a skip.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedConfiguration(_) | Self::NoCompatibleMemory { .. }
        )
    }
}

/// Failures reported by the driver collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// No logical device is open.
    #[error("No logical device has been created")]
    NoDevice,

    /// Device group index out of range at device creation.
    #[error("Device group {index} not found ({available} available)")]
    GroupNotFound { index: usize, available: usize },

    /// Extension requested at device creation is not supported.
    #[error("Extension not present: {0}")]
    ExtensionNotPresent(&'static str),

    /// An operation needs an extension the device was created without.
    #[error("Extension not enabled: {0}")]
    ExtensionNotEnabled(&'static str),

    /// Handle does not name a live object.
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Parameter rejected by the driver.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Allocation request rejected.
    #[error("Out of device memory: requested {requested} bytes on memory type {memory_type}")]
    OutOfMemory { requested: u64, memory_type: u32 },

    /// Resource bound twice, or bound to memory it is not allowed to use.
    #[error("Invalid binding of {resource}: {reason}")]
    InvalidBinding {
        resource: ResourceHandle,
        reason: String,
    },

    /// Memory freed while resources were still bound to it.
    #[error("Memory #{memory} freed while {bound} resources are still bound")]
    MemoryInUse { memory: u64, bound: usize },

    /// Host access to memory that cannot be mapped.
    #[error("Memory #{memory} cannot be mapped: {reason}")]
    MapFailed { memory: u64, reason: &'static str },

    /// Device touched an instance that was never allocated.
    #[error("Device {device} accessed missing instance {instance} of memory #{memory}")]
    MissingInstance {
        device: u32,
        instance: u32,
        memory: u64,
    },

    /// Device accessed another device's instance without the peer feature.
    #[error("Device {device} needs peer feature {feature} on instance {instance} (heap {heap})")]
    PeerAccessDenied {
        device: u32,
        instance: u32,
        heap: u32,
        feature: &'static str,
    },

    /// Image used in a layout other than the one it is in.
    #[error("Image layout mismatch on device {device}: expected {expected:?}, found {found:?}")]
    LayoutMismatch {
        device: u32,
        expected: ImageLayout,
        found: ImageLayout,
    },

    /// Command recorded out of order or without required state.
    #[error("Invalid command sequence: {0}")]
    InvalidCommand(String),

    /// Fence did not signal within the timeout.
    #[error("Fence wait timed out after {0:?}")]
    Timeout(Duration),

    /// Device stopped responding.
    #[error("Device lost")]
    DeviceLost,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::BufferHandle;

    #[test]
    fn test_skip_classification() {
        assert!(VerifierError::unsupported("peer fetch not supported").is_skip());
        assert!(VerifierError::NoCompatibleMemory {
            type_bits: 0x3,
            required: MemoryPropertyFlags::DEVICE_LOCAL,
        }
        .is_skip());
        assert!(!VerifierError::Driver(DriverError::DeviceLost).is_skip());
        assert!(!VerifierError::VerificationMismatch {
            first: 0,
            second: 1,
            summary: "bad".into(),
            diff: None,
        }
        .is_skip());
    }

    #[test]
    fn test_unsupported_display() {
        let err = VerifierError::unsupported("peer fetch not supported");
        assert!(err.to_string().contains("peer fetch not supported"));
    }

    #[test]
    fn test_no_compatible_memory_display() {
        let err = VerifierError::NoCompatibleMemory {
            type_bits: 0xA,
            required: MemoryPropertyFlags::DEVICE_LOCAL,
        };
        let msg = err.to_string();
        assert!(msg.contains("0xA"));
        assert!(msg.contains("DEVICE_LOCAL"));
    }

    #[test]
    fn test_driver_error_to_verifier_error() {
        let err: VerifierError = DriverError::Timeout(Duration::from_secs(5)).into();
        assert!(matches!(err, VerifierError::Driver(DriverError::Timeout(_))));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_invalid_binding_display() {
        let err = DriverError::InvalidBinding {
            resource: ResourceHandle::Buffer(BufferHandle(3)),
            reason: "already bound".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("buffer#3"));
        assert!(msg.contains("already bound"));
    }

    #[test]
    fn test_mismatch_display_names_devices() {
        let err = VerifierError::VerificationMismatch {
            first: 1,
            second: 0,
            summary: "12 pixels differ".into(),
            diff: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("1/0"));
        assert!(msg.contains("12 pixels differ"));
    }
}

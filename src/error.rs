// DPI Accelerator Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types for DPI accelerator operations.

use thiserror::Error;

/// Errors that can occur while driving the DPI accelerator.
#[derive(Debug, Error)]
pub enum DpiError {
    /// No device is bound, or the device has been detached.
    #[error("DPI device not attached")]
    DeviceNotAttached,

    /// An operation is already in flight on the accelerator.
    #[error("DPI device busy")]
    DeviceBusy,

    /// A previous result retrieval timed out; the filter table must be reset
    /// before the device accepts another payload.
    #[error("DPI device requires a filter table reset after a timeout")]
    ResetRequired,

    /// There is no result to fetch (nothing submitted, or already consumed).
    #[error("no filter result available")]
    NoResult,

    /// The payload could not be made visible to the DMA engine.
    #[error("DMA mapping failed: {0}")]
    MappingFailure(String),

    /// Payload exceeds the configured transfer limit.
    #[error("payload too large: {len} bytes, limit {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// Invalid argument provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Result was not ready within the retrieval bound.
    #[error("timed out waiting for filter result: status={status:#010x}")]
    Timeout { status: u32 },

    /// The accelerator or the DMA channel reported an error.
    #[error("DPI hardware error: status={status:#010x}")]
    HardwareError { status: u32 },

    /// A resource needed at attach time could not be acquired.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// I/O error from system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DpiError {
    /// Negative result code for callers that speak the integer contract
    /// ("negative means no usable result").
    pub fn code(&self) -> i32 {
        match self {
            Self::DeviceNotAttached => -19,     // ENODEV
            Self::DeviceBusy => -16,            // EBUSY
            Self::ResetRequired => -125,        // ECANCELED
            Self::NoResult => -61,              // ENODATA
            Self::MappingFailure(_) => -12,     // ENOMEM
            Self::PayloadTooLarge { .. } => -7, // E2BIG
            Self::InvalidArgument(_) => -22,    // EINVAL
            Self::Timeout { .. } => -110,       // ETIMEDOUT
            Self::HardwareError { .. } => -5,   // EIO
            Self::ResourceUnavailable(_) => -6, // ENXIO
            Self::Io(e) => e
                .raw_os_error()
                .filter(|errno| *errno != 0)
                .map_or(-5, |errno| -errno.abs()),
        }
    }
}

/// Result type alias for DPI operations.
pub type DpiResult<T> = Result<T, DpiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_negative() {
        let errors = [
            DpiError::DeviceNotAttached,
            DpiError::DeviceBusy,
            DpiError::ResetRequired,
            DpiError::NoResult,
            DpiError::MappingFailure("bounce buffer in use".into()),
            DpiError::PayloadTooLarge { len: 70000, max: 65535 },
            DpiError::InvalidArgument("empty payload".into()),
            DpiError::Timeout { status: 0x80 },
            DpiError::HardwareError { status: 0x50 },
            DpiError::ResourceUnavailable("irq".into()),
            DpiError::Io(std::io::Error::from_raw_os_error(13)),
        ];
        for e in &errors {
            assert!(e.code() < 0, "{e} mapped to {}", e.code());
        }
    }

    #[test]
    fn test_display_carries_status() {
        let e = DpiError::Timeout { status: 0x80 };
        assert_eq!(
            e.to_string(),
            "timed out waiting for filter result: status=0x00000080"
        );
    }
}

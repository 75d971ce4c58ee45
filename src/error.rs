//! Error types for EchoMIDI.
//!
//! Two layers:
//! - [`DeviceError`]: what a device subsystem call reports (coarse kind, message, cause)
//! - [`EchoError`]: what echo units and the registry surface to their callers

use std::error::Error as StdError;
use std::fmt;

use crate::device::{DeviceId, PortKind};

/// Coarse classification of a device subsystem failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// The id is outside the currently valid range.
    InvalidId,
    /// The device is already opened by another owner.
    Busy,
    /// Any other backend failure.
    Other,
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceErrorKind::InvalidId => write!(f, "invalid id"),
            DeviceErrorKind::Busy => write!(f, "busy"),
            DeviceErrorKind::Other => write!(f, "backend error"),
        }
    }
}

/// Failure reported by a [`DeviceSubsystem`](crate::device::DeviceSubsystem) primitive.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl DeviceError {
    pub fn new(kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn invalid_id(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorKind::InvalidId, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorKind::Busy, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorKind::Other, message)
    }

    /// Attach the underlying backend error.
    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

/// Errors surfaced by echo units and the device registry.
#[derive(Debug, thiserror::Error)]
pub enum EchoError {
    /// The id passed does not name a currently attached device.
    #[error("invalid {kind} device id {id}")]
    InvalidDevice {
        kind: PortKind,
        id: DeviceId,
        #[source]
        source: DeviceError,
    },

    /// The device is held by another process or unit.
    #[error("{kind} device {id} is already in use")]
    DeviceBusy {
        kind: PortKind,
        id: DeviceId,
        #[source]
        source: DeviceError,
    },

    /// A subsystem call failed for any other reason.
    #[error("{operation} failed on {kind} device {id}")]
    Transport {
        kind: PortKind,
        id: DeviceId,
        operation: &'static str,
        #[source]
        source: DeviceError,
    },

    /// A caller broke an API contract (close while echoing, unknown target, ...).
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),
}

impl EchoError {
    /// Classify a subsystem failure by its kind.
    pub fn from_device(
        kind: PortKind,
        id: DeviceId,
        operation: &'static str,
        err: DeviceError,
    ) -> Self {
        match err.kind {
            DeviceErrorKind::InvalidId => EchoError::InvalidDevice {
                kind,
                id,
                source: err,
            },
            DeviceErrorKind::Busy => EchoError::DeviceBusy {
                kind,
                id,
                source: err,
            },
            DeviceErrorKind::Other => EchoError::Transport {
                kind,
                id,
                operation,
                source: err,
            },
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        EchoError::PreconditionViolation(message.into())
    }

    /// True for errors caused by hardware state rather than API misuse.
    pub fn is_device_fault(&self) -> bool {
        !matches!(self, EchoError::PreconditionViolation(_))
    }
}

/// Render an error followed by its `source()` chain, one cause per line.
pub fn format_error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = format!("[0] {}", err);
    let mut level = 1;
    let mut current = err.source();
    while let Some(cause) = current {
        out.push_str(&format!("\n[{}] {}", level, cause));
        level += 1;
        current = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_device_classification() {
        let err = EchoError::from_device(
            PortKind::Input,
            3,
            "open",
            DeviceError::busy("allocated"),
        );
        assert!(matches!(err, EchoError::DeviceBusy { id: 3, .. }));

        let err = EchoError::from_device(
            PortKind::Output,
            9,
            "open",
            DeviceError::invalid_id("no port 9"),
        );
        assert!(matches!(err, EchoError::InvalidDevice { id: 9, .. }));

        let err = EchoError::from_device(PortKind::Output, 1, "send", DeviceError::other("x"));
        assert!(matches!(
            err,
            EchoError::Transport {
                operation: "send",
                ..
            }
        ));
    }

    #[test]
    fn test_error_display() {
        let err = EchoError::from_device(
            PortKind::Input,
            2,
            "open",
            DeviceError::busy("device allocated"),
        );
        assert_eq!(err.to_string(), "input device 2 is already in use");
    }

    #[test]
    fn test_error_chain_includes_causes() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "driver gone");
        let err = EchoError::from_device(
            PortKind::Output,
            1,
            "send",
            DeviceError::other("send failed").with_cause(io),
        );
        let chain = format_error_chain(&err);
        assert_eq!(
            chain,
            "[0] send failed on output device 1\n[1] backend error: send failed\n[2] driver gone"
        );
    }

    #[test]
    fn test_precondition_is_not_device_fault() {
        assert!(!EchoError::precondition("close while echoing").is_device_fault());
        assert!(EchoError::from_device(PortKind::Input, 0, "start", DeviceError::other("x"))
            .is_device_fault());
    }
}

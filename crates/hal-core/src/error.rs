//! Status taxonomy for HAL operations.
//!
//! Every fallible operation in the HAL returns [`HalResult`]. The variants
//! mirror the status codes the camera framework understands, and
//! [`HalError::status_code`] gives the negative POSIX-style value expected at
//! the framework boundary.
//!
//! ## Categories
//!
//! - **Caller errors** (`BadValue`): malformed requests, bad stream references,
//!   buffer counts out of range. The single operation is rejected and pipeline
//!   state is rolled back.
//! - **Resource errors** (`NoMemory`): pool exhaustion or metadata allocation
//!   failure. Per-request failures fail only that request.
//! - **Backpressure** (`WouldBlock`): the pipeline is full. The caller retries.
//! - **Internal errors** (`UnknownError`): conditions upstream admission control
//!   should have made impossible. Logged loudly, the operation is aborted and
//!   the worker loop keeps running.
//! - **Hardware errors** (`Hardware`): video-node calls that failed. Fatal during
//!   configuration, best effort during streaming.

use thiserror::Error;

/// POSIX errno values used by the video-node boundary.
pub mod errno {
    pub const EIO: i32 = 5;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EEXIST: i32 = 17;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const EPIPE: i32 = 32;
    pub const ETIMEDOUT: i32 = 110;
}

/// Android `UNKNOWN_ERROR` status.
pub const UNKNOWN_ERROR_STATUS: i32 = i32::MIN;

/// Convenience alias for results using the HAL error type.
pub type HalResult<T> = std::result::Result<T, HalError>;

/// Primary error type for the camera HAL.
#[derive(Error, Debug)]
pub enum HalError {
    /// Out-of-contract caller input.
    ///
    /// Raised synchronously by request initialisation and stream
    /// configuration; never deferred into the asynchronous pipeline.
    #[error("Bad value: {0}")]
    BadValue(String),

    /// A pool or metadata allocation could not be satisfied.
    #[error("No memory: {0}")]
    NoMemory(String),

    /// Admission control rejected the request because the pipeline is full.
    ///
    /// Not a failure: the caller is expected to hold the request and retry
    /// once an in-flight request completes.
    #[error("Operation would block")]
    WouldBlock,

    /// A condition that correct upstream admission control should prevent.
    ///
    /// Typical cause is failing to acquire a control-state object. The
    /// message is aborted and the worker loop continues.
    #[error("Unknown error: {0}")]
    UnknownError(String),

    /// The object was used before initialisation completed.
    #[error("Not initialized")]
    NoInit,

    /// A registration that already exists was attempted again.
    #[error("Already exists")]
    AlreadyExists,

    /// The device stopped responding, e.g. a flush that never drained.
    #[error("No device: {0}")]
    NoDevice(String),

    /// A video-node call failed.
    ///
    /// **Recovery Strategy**: propagate during `init`/`configure` (the camera
    /// fails to start); during streaming log, skip the buffer and continue.
    #[error("Hardware error on '{node}' during {op}: errno {errno}")]
    Hardware {
        /// Video node name
        node: String,
        /// Operation that failed (e.g. "dequeue")
        op: &'static str,
        /// Positive errno value
        errno: i32,
    },

    /// Capability file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Capability values parsed but are semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O failure (dump output, capability file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for HalError {
    fn from(err: figment::Error) -> Self {
        HalError::Config(Box::new(err))
    }
}

impl HalError {
    /// Translate a POSIX errno reported by a video node into the taxonomy.
    ///
    /// Accepts both the positive errno and the negated return-code form.
    pub fn from_errno(node: impl Into<String>, op: &'static str, code: i32) -> Self {
        let code = code.abs();
        let node = node.into();
        match code {
            errno::EINVAL => HalError::BadValue(format!("{node}: {op} rejected arguments")),
            errno::ENOMEM => HalError::NoMemory(format!("{node}: {op} out of memory")),
            errno::EAGAIN => HalError::WouldBlock,
            errno::ENODEV => HalError::NoDevice(format!("{node}: {op}")),
            _ => HalError::Hardware {
                node,
                op,
                errno: code,
            },
        }
    }

    /// Negative status code reported at the framework boundary.
    #[must_use]
    pub fn status_code(&self) -> i32 {
        match self {
            HalError::BadValue(_) | HalError::Config(_) | HalError::Configuration(_) => {
                -errno::EINVAL
            }
            HalError::NoMemory(_) => -errno::ENOMEM,
            HalError::WouldBlock => -errno::EAGAIN,
            HalError::UnknownError(_) => UNKNOWN_ERROR_STATUS,
            HalError::NoInit | HalError::NoDevice(_) => -errno::ENODEV,
            HalError::AlreadyExists => -errno::EEXIST,
            HalError::Hardware { errno, .. } => -errno,
            HalError::Io(e) => -e.raw_os_error().unwrap_or(errno::EIO),
        }
    }

    /// Whether the caller should hold the request and retry later.
    #[must_use]
    pub fn is_would_block(&self) -> bool {
        matches!(self, HalError::WouldBlock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_errno_maps_known_codes() {
        assert!(matches!(
            HalError::from_errno("isp-main", "queue", -errno::EINVAL),
            HalError::BadValue(_)
        ));
        assert!(matches!(
            HalError::from_errno("isp-main", "queue", errno::ENOMEM),
            HalError::NoMemory(_)
        ));
        assert!(HalError::from_errno("isp-main", "dequeue", errno::EAGAIN).is_would_block());
        assert!(matches!(
            HalError::from_errno("isp-main", "dequeue", -errno::EIO),
            HalError::Hardware { errno: 5, .. }
        ));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(HalError::BadValue("x".into()).status_code(), -22);
        assert_eq!(HalError::WouldBlock.status_code(), -11);
        assert_eq!(HalError::NoMemory("x".into()).status_code(), -12);
        assert_eq!(
            HalError::UnknownError("x".into()).status_code(),
            UNKNOWN_ERROR_STATUS
        );
        let hw = HalError::Hardware {
            node: "sensor".into(),
            op: "stream_on",
            errno: errno::EPIPE,
        };
        assert_eq!(hw.status_code(), -32);
        assert!(hw.to_string().contains("stream_on"));
    }
}

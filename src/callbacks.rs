//! Framework-facing result delivery.
//!
//! [`FrameworkCallbacks`] is the camera3 `callback_ops` seam: notifications
//! (shutter, errors) and capture results. The result processor is its only
//! caller.

use crate::buffer::CameraBuffer;
use hal_core::CameraMetadata;
use std::sync::Arc;

/// Error classes reported through `notify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Fatal, the device must be closed
    Device,
    /// The whole request failed; no result metadata follows
    Request,
    /// Result metadata for the request is lost
    Result,
    /// One output buffer is lost
    Buffer,
}

/// Asynchronous notification sent ahead of or instead of results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyMessage {
    /// Exposure of a request started.
    Shutter {
        /// Framework frame number
        frame_number: u32,
        /// Start of exposure
        timestamp_ns: i64,
    },
    /// Something about a request, or the device, failed.
    Error {
        /// Framework frame number
        frame_number: u32,
        /// What was lost
        code: ErrorCode,
    },
}

/// One `process_capture_result` call.
#[derive(Debug, Clone, Default)]
pub struct CaptureResult {
    /// Frame number of the request the result belongs to.
    pub frame_number: u32,
    /// Partial result payload, absent for buffer-only results
    pub metadata: Option<CameraMetadata>,
    /// Output buffers completed by this call.
    pub output_buffers: Vec<CameraBuffer>,
    /// Reprocessing input, returned with the last result.
    pub input_buffer: Option<CameraBuffer>,
    /// 1-based partial result index; 0 for buffer-only results
    pub partial_result: u32,
}

/// Consumer of notifications and results, the framework side of the HAL.
pub trait FrameworkCallbacks: Send + Sync {
    /// Shutter and error notifications.
    fn notify(&self, message: NotifyMessage);
    /// Partial metadata and completed buffers.
    fn process_capture_result(&self, result: CaptureResult);
}

/// Callbacks that only log. Used by the simulator when no consumer is
/// attached.
#[derive(Debug, Default)]
pub struct LoggingCallbacks;

impl FrameworkCallbacks for LoggingCallbacks {
    fn notify(&self, message: NotifyMessage) {
        tracing::debug!(?message, "notify");
    }

    fn process_capture_result(&self, result: CaptureResult) {
        tracing::debug!(
            frame_number = result.frame_number,
            buffers = result.output_buffers.len(),
            partial = result.partial_result,
            "capture result"
        );
    }
}

/// Callbacks shared across the pipeline actors.
pub type SharedCallbacks = Arc<dyn FrameworkCallbacks>;

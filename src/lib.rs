//! # Camera HAL request pipeline
//!
//! Request lifecycle for an HAL3-style camera device: the framework submits
//! capture requests, the HAL stages their buffers on the sensor, correlates
//! 3A statistics with the requests they belong to and delivers shutter
//! notifications, buffers and result metadata back in order.
//!
//! ## Crate Structure
//!
//! - **`request_thread`**: [`CameraDevice`], the framework entry point.
//!   Stream configuration, request admission and back-pressure.
//! - **`request`** / **`stream`** / **`buffer`**: per-request state, stream
//!   bookkeeping and buffer wrappers.
//! - **`camera_hw`**: the [`CameraHw`] boundary and its IPU implementation.
//! - **`capture_unit`** / **`control_unit`**: the two pipeline actors. The
//!   capture unit drives the video nodes; the control unit runs 3A and
//!   completes requests.
//! - **`result_processor`**: orders results for the framework.
//! - **`poller`**, **`events`**, **`hw`**: device polling, capture event
//!   fan-out and the video node abstraction with a simulated sensor.
//! - **`three_a`**, **`jpeg`**: AE loop and JPEG blob encoding.
//!
//! Error handling, metadata, configuration and logging live in `hal-core`;
//! the fixed-capacity pool lives in `hal-pool`.

pub mod actor;
pub mod buffer;
pub mod callbacks;
pub mod camera_hw;
pub mod capture_unit;
pub mod control_unit;
pub mod events;
pub mod hw;
pub mod jpeg;
pub mod poller;
pub mod request;
pub mod request_thread;
pub mod result_processor;
pub mod stream;
pub mod three_a;

pub use buffer::{BufferStatus, CameraBuffer, PixelFormat, StreamBuffer};
pub use callbacks::{CaptureResult, ErrorCode, FrameworkCallbacks, NotifyMessage};
pub use camera_hw::{CameraHw, IpuCameraHw, RequestTemplate};
pub use hal_core::{
    CameraCapabilities, CameraMetadata, HalError, HalResult, PlatformConfig, SensorTiming,
};
pub use request::{Camera3Request, CaptureRequest, SharedRequest};
pub use request_thread::CameraDevice;
pub use stream::{Camera3Stream, CameraStream, StreamType};

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the unit tests.

    use crate::buffer::{BufferStatus, CameraBuffer, PixelFormat, StreamBuffer};
    use crate::callbacks::{CaptureResult, FrameworkCallbacks, NotifyMessage};
    use crate::request::{request_pool, CaptureRequest, RequestCallback, SharedRequest};
    use crate::stream::{Camera3Stream, CameraStream};
    use hal_core::{CameraCapabilities, CameraMetadata, HalResult};
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Output descriptor already bound to an internal stream.
    pub fn bound_output_stream(
        seq_no: u32,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> (Arc<Camera3Stream>, Arc<CameraStream>) {
        let desc = Camera3Stream::output(width, height, format);
        let stream = CameraStream::new(seq_no, &desc, 4);
        desc.bind(Some(Arc::clone(&stream)));
        stream.activate();
        (desc, stream)
    }

    pub struct NoopCallback;

    impl RequestCallback for NoopCallback {
        fn shutter_done(&self, _: &SharedRequest, _: i64) -> HalResult<()> {
            Ok(())
        }
        fn metadata_done(&self, _: &SharedRequest, _: usize) -> HalResult<()> {
            Ok(())
        }
        fn buffer_done(&self, _: &SharedRequest, _: &CameraBuffer) -> HalResult<()> {
            Ok(())
        }
        fn request_error(&self, _: &SharedRequest) -> HalResult<()> {
            Ok(())
        }
    }

    /// Initialised request with one 64x48 NV12 output buffer.
    pub fn single_stream_request(
        frame_number: u32,
        callback: Arc<dyn RequestCallback>,
    ) -> SharedRequest {
        let (desc, _stream) = bound_output_stream(0, 64, 48, PixelFormat::Ycbcr420);
        let raw = CaptureRequest {
            frame_number,
            settings: None,
            input_buffer: None,
            output_buffers: vec![StreamBuffer::allocate(&desc)],
        };
        let pool = request_pool(1);
        let mut slot = pool.try_acquire().unwrap();
        slot.init(&raw, Some(callback), CameraMetadata::new(), &CameraCapabilities::default())
            .unwrap();
        SharedRequest::new(slot)
    }

    /// Framework callbacks that record a one-line summary per event.
    #[derive(Default)]
    pub struct RecordingCallbacks {
        events: Mutex<Vec<String>>,
    }

    impl RecordingCallbacks {
        pub fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl FrameworkCallbacks for RecordingCallbacks {
        fn notify(&self, message: NotifyMessage) {
            let line = match message {
                NotifyMessage::Shutter {
                    frame_number,
                    timestamp_ns,
                } => format!("shutter {frame_number} {timestamp_ns}"),
                NotifyMessage::Error { frame_number, code } => {
                    format!("error {frame_number} {code:?}")
                }
            };
            self.events.lock().push(line);
        }

        fn process_capture_result(&self, result: CaptureResult) {
            let mut events = self.events.lock();
            for buffer in &result.output_buffers {
                let line = match buffer.status() {
                    BufferStatus::Error => format!("buffer {} error", result.frame_number),
                    _ => format!("buffer {}", result.frame_number),
                };
                events.push(line);
            }
            if result.metadata.is_some() {
                events.push(format!(
                    "result {} partial {}",
                    result.frame_number, result.partial_result
                ));
            }
        }
    }
}

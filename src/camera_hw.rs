//! The camera hardware boundary seen by the request thread, and the IPU
//! implementation wiring the capture unit, control unit, 3A and JPEG
//! together.

use crate::actor;
use crate::capture_unit::CaptureUnit;
use crate::control_unit::ControlUnit;
use crate::hw::SensorBackend;
use crate::jpeg::{ImageJpegMaker, JpegMaker, DEFAULT_JPEG_QUALITY};
use crate::request::SharedRequest;
use crate::stream::CameraStream;
use crate::three_a::{AaaControl, DefaultAe};
use async_trait::async_trait;
use hal_core::config::CameraCapabilities;
use hal_core::metadata::tags::{self, ae_mode, af_mode, awb_mode, capture_intent, control_mode};
use hal_core::{CameraMetadata, HalError, HalResult};
use std::sync::Arc;
use tracing::{debug, info};

/// camera3 request templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestTemplate {
    /// Viewfinder.
    Preview,
    /// Still capture.
    StillCapture,
    /// Video recording.
    VideoRecord,
    /// Still capture while recording.
    VideoSnapshot,
    /// Still capture from the ring of recent frames.
    ZeroShutterLag,
    /// Application-controlled exposure.
    Manual,
}

impl TryFrom<i32> for RequestTemplate {
    type Error = HalError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Preview),
            2 => Ok(Self::StillCapture),
            3 => Ok(Self::VideoRecord),
            4 => Ok(Self::VideoSnapshot),
            5 => Ok(Self::ZeroShutterLag),
            6 => Ok(Self::Manual),
            other => Err(HalError::BadValue(format!("unknown request template {other}"))),
        }
    }
}

impl RequestTemplate {
    fn capture_intent(self) -> u8 {
        match self {
            Self::Preview => capture_intent::PREVIEW,
            Self::StillCapture => capture_intent::STILL_CAPTURE,
            Self::VideoRecord => capture_intent::VIDEO_RECORD,
            Self::VideoSnapshot => capture_intent::VIDEO_SNAPSHOT,
            Self::ZeroShutterLag => capture_intent::ZERO_SHUTTER_LAG,
            Self::Manual => capture_intent::MANUAL,
        }
    }
}

/// Platform-specific half of the HAL.
#[async_trait]
pub trait CameraHw: Send + Sync {
    /// Open the sensor.
    async fn init(&self) -> HalResult<()>;

    /// Settings for `template`.
    fn default_request_settings(&self, template: RequestTemplate) -> HalResult<CameraMetadata>;

    /// Admit `request`. Returns `WouldBlock` when `in_flight` requests
    /// already fill the pipeline.
    async fn process_request(&self, request: SharedRequest, in_flight: usize) -> HalResult<()>;

    /// Fail an admitted request that never got all its buffers staged.
    async fn abort_request(&self, request_id: i64) -> HalResult<()>;

    /// Fail queued work and return in-flight buffers as soon as possible.
    async fn flush(&self) -> HalResult<()>;

    /// Attach the producers of the configured streams.
    async fn bind_streams(&self, streams: &[Arc<CameraStream>]) -> HalResult<()>;

    /// Bind video nodes to the active output streams.
    async fn config_streams(&self, streams: &[Arc<CameraStream>]) -> HalResult<()>;

    /// Human-readable state of the pipeline.
    async fn dump(&self) -> HalResult<String>;

    /// Requests the pipeline holds at once.
    fn pipeline_depth(&self) -> usize;

    /// Whether input buffers are accepted.
    fn supports_reprocessing(&self) -> bool {
        false
    }

    /// Stop every actor of the pipeline.
    async fn shutdown(&self) -> HalResult<()>;
}

/// Capture and control units running over a [`SensorBackend`].
pub struct IpuCameraHw {
    caps: Arc<CameraCapabilities>,
    capture: CaptureUnit,
    control: ControlUnit,
}

impl IpuCameraHw {
    /// Build with the default AE loop and the `image` JPEG encoder.
    pub fn new(
        caps: Arc<CameraCapabilities>,
        backend: Arc<dyn SensorBackend>,
        queue_depth: usize,
    ) -> HalResult<Self> {
        Self::with_parts(
            caps,
            backend,
            Box::new(DefaultAe::default()),
            Arc::new(ImageJpegMaker::new()),
            queue_depth,
        )
    }

    /// Build with a caller-supplied 3A loop and JPEG encoder.
    pub fn with_parts(
        caps: Arc<CameraCapabilities>,
        backend: Arc<dyn SensorBackend>,
        aaa: Box<dyn AaaControl>,
        jpeg: Arc<dyn JpegMaker>,
        queue_depth: usize,
    ) -> HalResult<Self> {
        let queue_depth = actor::queue_depth_for(&caps, queue_depth);
        let capture = CaptureUnit::spawn(Arc::clone(&caps), backend, queue_depth)?;
        let control = ControlUnit::spawn(Arc::clone(&caps), capture.clone(), aaa, jpeg, queue_depth)?;
        Ok(Self {
            caps,
            capture,
            control,
        })
    }

    /// Capture unit, for stream producers and diagnostics.
    pub fn capture_unit(&self) -> &CaptureUnit {
        &self.capture
    }
}

fn output_streams(streams: &[Arc<CameraStream>]) -> Vec<Arc<CameraStream>> {
    streams
        .iter()
        .filter(|s| s.stream_type() != crate::stream::StreamType::Input)
        .cloned()
        .collect()
}

#[async_trait]
impl CameraHw for IpuCameraHw {
    async fn init(&self) -> HalResult<()> {
        self.capture.init().await?;
        info!(
            camera_id = self.caps.id,
            depth = self.caps.pipeline_depth(),
            "camera hw ready"
        );
        Ok(())
    }

    fn default_request_settings(&self, template: RequestTemplate) -> HalResult<CameraMetadata> {
        let mut meta = CameraMetadata::new();
        let manual = template == RequestTemplate::Manual;
        meta.update(tags::CONTROL_CAPTURE_INTENT, template.capture_intent());
        meta.update(
            tags::CONTROL_MODE,
            if manual { control_mode::OFF } else { control_mode::AUTO },
        );
        meta.update(tags::CONTROL_AE_MODE, if manual { ae_mode::OFF } else { ae_mode::ON });
        meta.update(tags::CONTROL_AE_LOCK, 0_u8);
        meta.update(tags::CONTROL_AE_EXPOSURE_COMPENSATION, 0_i32);
        meta.update(tags::CONTROL_AE_ANTIBANDING_MODE, 3_u8);
        meta.update(tags::CONTROL_AE_PRECAPTURE_TRIGGER, tags::ae_precapture_trigger::IDLE);
        let fps = match template {
            RequestTemplate::VideoRecord | RequestTemplate::VideoSnapshot => vec![30, 30],
            _ => vec![15, 30],
        };
        meta.update(tags::CONTROL_AE_TARGET_FPS_RANGE, fps);
        let af = match template {
            RequestTemplate::Preview | RequestTemplate::ZeroShutterLag => af_mode::CONTINUOUS_PICTURE,
            RequestTemplate::VideoRecord | RequestTemplate::VideoSnapshot => af_mode::CONTINUOUS_VIDEO,
            RequestTemplate::StillCapture => af_mode::AUTO,
            RequestTemplate::Manual => af_mode::OFF,
        };
        meta.update(tags::CONTROL_AF_MODE, af);
        meta.update(tags::CONTROL_AF_TRIGGER, 0_u8);
        meta.update(tags::CONTROL_AWB_MODE, if manual { awb_mode::OFF } else { awb_mode::AUTO });
        meta.update(tags::COLOR_CORRECTION_MODE, tags::color_correction_mode::FAST);
        meta.update(tags::FLASH_MODE, 0_u8);
        meta.update(tags::STATISTICS_FACE_DETECT_MODE, 0_u8);
        meta.update(tags::JPEG_QUALITY, DEFAULT_JPEG_QUALITY);
        meta.update(tags::JPEG_ORIENTATION, 0_i32);
        meta.update(tags::REQUEST_ID, 0_i32);
        if manual {
            let sensor = &self.caps.sensor;
            meta.update(tags::SENSOR_EXPOSURE_TIME, i64::from(sensor.max_exposure_us / 2) * 1000);
            meta.update(tags::SENSOR_SENSITIVITY, sensor.min_sensitivity);
        }
        Ok(meta)
    }

    async fn process_request(&self, request: SharedRequest, in_flight: usize) -> HalResult<()> {
        let depth = self.caps.pipeline_depth();
        if in_flight >= depth {
            debug!(request_id = request.id(), in_flight, depth, "pipeline full");
            return Err(HalError::WouldBlock);
        }
        self.control.process_request(request)
    }

    async fn abort_request(&self, request_id: i64) -> HalResult<()> {
        self.capture.abort_request(request_id)
    }

    async fn flush(&self) -> HalResult<()> {
        self.capture.flush().await?;
        self.control.flush().await
    }

    async fn bind_streams(&self, streams: &[Arc<CameraStream>]) -> HalResult<()> {
        for stream in output_streams(streams) {
            stream.bind_producer(Some(self.capture.producer()));
            stream.activate();
        }
        Ok(())
    }

    async fn config_streams(&self, streams: &[Arc<CameraStream>]) -> HalResult<()> {
        self.capture.configure(output_streams(streams)).await?;
        self.control.config_streams_done(true).await
    }

    async fn dump(&self) -> HalResult<String> {
        let mut out = self.capture.dump().await?;
        out.push_str(&self.control.dump().await?);
        Ok(out)
    }

    fn pipeline_depth(&self) -> usize {
        self.caps.pipeline_depth()
    }

    async fn shutdown(&self) -> HalResult<()> {
        self.control.shutdown().await?;
        self.capture.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_from_index() {
        assert_eq!(RequestTemplate::try_from(1).unwrap(), RequestTemplate::Preview);
        assert_eq!(RequestTemplate::try_from(6).unwrap(), RequestTemplate::Manual);
        assert!(matches!(RequestTemplate::try_from(0), Err(HalError::BadValue(_))));
        assert!(matches!(RequestTemplate::try_from(7), Err(HalError::BadValue(_))));
    }

    #[test]
    fn test_capture_intent_per_template() {
        assert_eq!(
            RequestTemplate::StillCapture.capture_intent(),
            capture_intent::STILL_CAPTURE
        );
        assert_eq!(RequestTemplate::VideoRecord.capture_intent(), capture_intent::VIDEO_RECORD);
    }
}

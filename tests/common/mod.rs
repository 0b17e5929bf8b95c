//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use camera_hal::buffer::BufferStatus;
use camera_hal::callbacks::{CaptureResult, FrameworkCallbacks, NotifyMessage};
use camera_hal::camera_hw::{CameraHw, IpuCameraHw};
use camera_hal::hw::{FrameTiming, SimulatedBackend};
use camera_hal::jpeg::{ImageJpegMaker, JpegMaker};
use camera_hal::three_a::DefaultAe;
use camera_hal::{
    Camera3Stream, CameraBuffer, CameraCapabilities, CameraDevice, CameraMetadata, CaptureRequest,
    HalResult, RequestTemplate, StreamBuffer,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub const QUEUE_DEPTH: usize = 64;

/// Framework callbacks writing one line per event into a shared log.
#[derive(Default)]
pub struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.log)
    }

    pub fn events(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn count(&self, line: &str) -> usize {
        self.log.lock().iter().filter(|l| l.as_str() == line).count()
    }

    pub fn position(&self, line: &str) -> Option<usize> {
        self.log.lock().iter().position(|l| l == line)
    }

    /// Frame numbers in the order their shutters were reported.
    pub fn shutter_order(&self) -> Vec<u32> {
        self.log
            .lock()
            .iter()
            .filter_map(|l| l.strip_prefix("shutter "))
            .filter_map(|n| n.parse().ok())
            .collect()
    }
}

impl FrameworkCallbacks for Recorder {
    fn notify(&self, message: NotifyMessage) {
        let line = match message {
            NotifyMessage::Shutter { frame_number, .. } => format!("shutter {frame_number}"),
            NotifyMessage::Error { frame_number, code } => format!("error {frame_number} {code:?}"),
        };
        self.log.lock().push(line);
    }

    fn process_capture_result(&self, result: CaptureResult) {
        let mut log = self.log.lock();
        for buffer in &result.output_buffers {
            log.push(match buffer.status() {
                BufferStatus::Error => format!("buffer {} error", result.frame_number),
                BufferStatus::Ok => format!("buffer {}", result.frame_number),
            });
        }
        if result.metadata.is_some() {
            log.push(format!(
                "result {} partial {}",
                result.frame_number, result.partial_result
            ));
        }
    }
}

/// JPEG encoder that notes every call in the recorder's log first.
pub struct TracingJpeg {
    log: Arc<Mutex<Vec<String>>>,
    inner: ImageJpegMaker,
}

impl TracingJpeg {
    pub fn new(log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            log,
            inner: ImageJpegMaker::new(),
        }
    }
}

impl JpegMaker for TracingJpeg {
    fn handle_jpeg(&self, settings: &CameraMetadata, buffer: &CameraBuffer) -> HalResult<usize> {
        let id = buffer.request_id().unwrap_or(-1);
        self.log.lock().push(format!("jpeg {id}"));
        self.inner.handle_jpeg(settings, buffer)
    }
}

pub struct Harness {
    pub caps: Arc<CameraCapabilities>,
    pub backend: Arc<SimulatedBackend>,
    pub hw: Arc<IpuCameraHw>,
    pub device: CameraDevice,
    pub recorder: Arc<Recorder>,
}

impl Harness {
    pub async fn open(timing: FrameTiming) -> Self {
        Self::open_with(CameraCapabilities::default(), timing, false).await
    }

    pub async fn open_with(caps: CameraCapabilities, timing: FrameTiming, trace_jpeg: bool) -> Self {
        Self::build(caps, timing, trace_jpeg, QUEUE_DEPTH).await
    }

    /// Default camera with every actor mailbox sized `queue_depth`.
    pub async fn open_with_queue_depth(timing: FrameTiming, queue_depth: usize) -> Self {
        Self::build(CameraCapabilities::default(), timing, false, queue_depth).await
    }

    async fn build(
        caps: CameraCapabilities,
        timing: FrameTiming,
        trace_jpeg: bool,
        queue_depth: usize,
    ) -> Self {
        let caps = Arc::new(caps);
        let recorder = Arc::new(Recorder::default());
        let backend = SimulatedBackend::new(&caps, timing);
        let jpeg: Arc<dyn JpegMaker> = if trace_jpeg {
            Arc::new(TracingJpeg::new(recorder.log()))
        } else {
            Arc::new(ImageJpegMaker::new())
        };
        let hw = Arc::new(
            IpuCameraHw::with_parts(
                Arc::clone(&caps),
                backend.clone(),
                Box::new(DefaultAe::default()),
                jpeg,
                queue_depth,
            )
            .unwrap(),
        );
        let device = CameraDevice::open(
            Arc::clone(&caps),
            hw.clone() as Arc<dyn CameraHw>,
            recorder.clone(),
            queue_depth,
        )
        .await
        .unwrap();
        Self {
            caps,
            backend,
            hw,
            device,
            recorder,
        }
    }

    pub async fn preview_settings(&self) -> CameraMetadata {
        self.device
            .construct_default_request_settings(RequestTemplate::Preview)
            .await
            .unwrap()
    }

    /// Submit a request with one buffer per stream.
    pub async fn submit(
        &self,
        frame_number: u32,
        streams: &[Arc<Camera3Stream>],
        settings: Option<CameraMetadata>,
    ) -> HalResult<()> {
        self.device
            .process_capture_request(request(frame_number, streams, settings))
            .await
    }

    pub async fn control_dump(&self) -> String {
        self.hw.dump().await.unwrap()
    }
}

pub fn request(
    frame_number: u32,
    streams: &[Arc<Camera3Stream>],
    settings: Option<CameraMetadata>,
) -> CaptureRequest {
    CaptureRequest {
        frame_number,
        settings,
        input_buffer: None,
        output_buffers: streams.iter().map(StreamBuffer::allocate).collect(),
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Async variant of [`eventually`] for conditions that need a round trip.
pub async fn eventually_async<F, Fut>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

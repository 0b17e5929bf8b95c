//! Simulated sensor and ISP.
//!
//! Every node keeps the buffers queued to it in order and completes them one
//! at a time, either immediately (as soon as it is streaming), on a fixed
//! interval from a background thread, or only when a test calls
//! [`SimulatedBackend::complete_next`]. Completed frames get a test pattern
//! and AE statistics derived from the exposure that was programmed
//! `sensor_setting_delay` captures earlier.

use super::{DequeuedFrame, FrameFormat, PollWaker, SensorBackend, VideoNode};
use crate::buffer::{CameraBuffer, PixelFormat};
use crate::three_a::{AaaStatistics, CaptureSettings, SensorDescriptor};
use hal_core::config::CameraCapabilities;
use hal_core::error::errno;
use hal_core::{HalError, HalResult};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// When queued buffers complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTiming {
    /// As soon as the node is streaming
    Immediate,
    /// One frame per node every interval
    Interval(Duration),
    /// Only on `complete_next` / `complete_all`
    Manual,
}

/// Injected failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimFault {
    /// `open` on the named node fails with ENODEV
    Open(String),
    /// `stream_on` on the named node fails with EIO
    StreamOn(String),
    /// `set_format` on the named node fails with EINVAL
    SetFormat(String),
    /// The next dequeue on the named node fails with EIO
    Dequeue(String),
    /// The next frame on the named node is flagged corrupt
    CorruptFrame(String),
    /// Opening the sensor fails
    Sensor,
}

#[derive(Debug, Default)]
struct Faults {
    active: Vec<SimFault>,
}

impl Faults {
    fn has(&self, fault: &SimFault) -> bool {
        self.active.contains(fault)
    }

    fn take(&mut self, fault: &SimFault) -> bool {
        match self.active.iter().position(|f| f == fault) {
            Some(pos) => {
                self.active.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Sensor response: brightness follows the settings applied `delay`
/// captures before the frame.
#[derive(Debug)]
struct SensorModel {
    delay: usize,
    scene_luma_per_us: f32,
    history: VecDeque<(u32, f32)>,
}

impl SensorModel {
    fn new(delay: usize) -> Self {
        Self {
            delay,
            scene_luma_per_us: 0.004,
            history: VecDeque::new(),
        }
    }

    fn apply(&mut self, exposure_us: u32, gain: f32) {
        self.history.push_back((exposure_us, gain));
        while self.history.len() > self.delay + 1 {
            self.history.pop_front();
        }
    }

    /// Settings in effect for the frame being read out now.
    fn effective(&self) -> (u32, f32) {
        if self.history.len() > self.delay {
            self.history.front().copied().unwrap_or((10_000, 1.0))
        } else {
            (10_000, 1.0)
        }
    }

    fn stats(&self, sequence: i64, timestamp_ns: i64) -> AaaStatistics {
        let (exposure_us, analog_gain) = self.effective();
        let mean_luma =
            (exposure_us as f32 * analog_gain * self.scene_luma_per_us * 3.0).clamp(0.0, 255.0);
        AaaStatistics {
            frame_sequence: sequence,
            mean_luma,
            exposure_us,
            analog_gain,
            timestamp_ns,
        }
    }
}

#[derive(Debug)]
struct Queued {
    index: usize,
    buffer: CameraBuffer,
}

#[derive(Debug)]
struct NodeState {
    opened: bool,
    streaming: bool,
    format: Option<FrameFormat>,
    buffer_count: usize,
    queued: VecDeque<Queued>,
    done: VecDeque<DequeuedFrame>,
    sequence: u64,
}

struct NodeShared {
    name: String,
    state: Mutex<NodeState>,
    waker: Arc<PollWaker>,
    faults: Arc<Mutex<Faults>>,
    model: Arc<Mutex<SensorModel>>,
    epoch: Instant,
    timing: FrameTiming,
}

impl NodeShared {
    /// Complete the oldest queued buffer. Returns false when nothing is queued.
    fn complete_one(&self) -> bool {
        let completed = {
            let mut st = self.state.lock();
            if !st.streaming {
                return false;
            }
            let Some(q) = st.queued.pop_front() else {
                return false;
            };
            let sequence = st.sequence;
            st.sequence += 1;
            let timestamp_ns = i64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(i64::MAX);
            let error = self
                .faults
                .lock()
                .take(&SimFault::CorruptFrame(self.name.clone()));
            let bytes_used = fill_pattern(&q.buffer, sequence);
            let statistics = Some(self.model.lock().stats(sequence as i64, timestamp_ns));
            trace!(node = %self.name, index = q.index, sequence, "frame complete");
            st.done.push_back(DequeuedFrame {
                index: q.index,
                sequence,
                timestamp_ns,
                bytes_used,
                statistics,
                error,
            });
            true
        };
        if completed {
            self.waker.wake();
        }
        completed
    }

    fn complete_all(&self) -> usize {
        let mut n = 0;
        while self.complete_one() {
            n += 1;
        }
        n
    }
}

fn interval_loop(shared: Weak<NodeShared>, period: Duration) {
    loop {
        std::thread::sleep(period);
        let Some(node) = shared.upgrade() else {
            return;
        };
        if !node.state.lock().streaming {
            return;
        }
        node.complete_one();
    }
}

/// Gradient test pattern; BLOB buffers are filled as RGB888 for the encoder.
fn fill_pattern(buffer: &CameraBuffer, frame: u64) -> usize {
    let (w, h) = (buffer.width() as usize, buffer.height() as usize);
    let mut data = buffer.lock_data();
    let bpp = match buffer.format() {
        PixelFormat::Blob => 3,
        PixelFormat::Rgba8888 => 4,
        PixelFormat::RawSensor => 2,
        PixelFormat::Ycbcr420 | PixelFormat::ImplementationDefined => 1,
    };
    let luma_len = (w * h * bpp).min(data.len());
    let shift = (frame % 256) as usize;
    for (i, px) in data[..luma_len].iter_mut().enumerate() {
        let pixel = i / bpp;
        let (x, y) = (pixel % w.max(1), pixel / w.max(1));
        *px = ((x + y + shift) * 255 / (w + h).max(1)) as u8;
    }
    match buffer.format() {
        PixelFormat::Ycbcr420 | PixelFormat::ImplementationDefined => {
            let chroma_end = buffer.format().frame_size(w as u32, h as u32).min(data.len());
            data[luma_len..chroma_end].fill(128);
            chroma_end
        }
        _ => luma_len,
    }
}

/// Simulated ISP output node.
pub struct SimulatedNode {
    shared: Arc<NodeShared>,
}

impl SimulatedNode {
    fn hw_error(&self, op: &'static str, code: i32) -> HalError {
        HalError::from_errno(self.shared.name.clone(), op, code)
    }
}

impl VideoNode for SimulatedNode {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn open(&mut self) -> HalResult<()> {
        if self.shared.faults.lock().has(&SimFault::Open(self.shared.name.clone())) {
            return Err(self.hw_error("open", errno::ENODEV));
        }
        self.shared.state.lock().opened = true;
        Ok(())
    }

    fn close(&mut self) -> HalResult<()> {
        let mut st = self.shared.state.lock();
        st.streaming = false;
        st.opened = false;
        st.queued.clear();
        st.done.clear();
        st.buffer_count = 0;
        Ok(())
    }

    fn set_format(&mut self, format: &FrameFormat) -> HalResult<()> {
        if self
            .shared
            .faults
            .lock()
            .has(&SimFault::SetFormat(self.shared.name.clone()))
        {
            return Err(self.hw_error("set_format", errno::EINVAL));
        }
        let mut st = self.shared.state.lock();
        if !st.opened {
            return Err(self.hw_error("set_format", errno::EIO));
        }
        if st.streaming {
            return Err(self.hw_error("set_format", errno::EAGAIN));
        }
        if format.width == 0 || format.height == 0 {
            return Err(self.hw_error("set_format", errno::EINVAL));
        }
        st.format = Some(*format);
        Ok(())
    }

    fn request_buffers(&mut self, count: usize) -> HalResult<usize> {
        let mut st = self.shared.state.lock();
        if st.format.is_none() {
            return Err(self.hw_error("request_buffers", errno::EINVAL));
        }
        st.buffer_count = count;
        st.queued.clear();
        st.done.clear();
        Ok(count)
    }

    fn stream_on(&mut self) -> HalResult<()> {
        if self
            .shared
            .faults
            .lock()
            .has(&SimFault::StreamOn(self.shared.name.clone()))
        {
            return Err(self.hw_error("stream_on", errno::EIO));
        }
        {
            let mut st = self.shared.state.lock();
            if st.buffer_count == 0 {
                return Err(self.hw_error("stream_on", errno::EINVAL));
            }
            if st.streaming {
                return Ok(());
            }
            st.streaming = true;
            st.sequence = 0;
        }
        debug!(node = %self.shared.name, "stream on");
        match self.shared.timing {
            FrameTiming::Immediate => {
                self.shared.complete_all();
            }
            FrameTiming::Interval(period) => {
                let weak = Arc::downgrade(&self.shared);
                std::thread::Builder::new()
                    .name(format!("sim-{}", self.shared.name))
                    .spawn(move || interval_loop(weak, period))
                    .map_err(HalError::Io)?;
            }
            FrameTiming::Manual => {}
        }
        Ok(())
    }

    fn stream_off(&mut self) -> HalResult<()> {
        let mut st = self.shared.state.lock();
        st.streaming = false;
        st.queued.clear();
        st.done.clear();
        debug!(node = %self.shared.name, "stream off");
        Ok(())
    }

    fn queue_buffer(&mut self, index: usize, buffer: &CameraBuffer) -> HalResult<()> {
        let streaming = {
            let mut st = self.shared.state.lock();
            if index >= st.buffer_count {
                return Err(self.hw_error("queue_buffer", errno::EINVAL));
            }
            let needed = st.format.map_or(0, |f| f.size_image());
            if buffer.size() < needed {
                warn!(node = %self.shared.name, size = buffer.size(), needed, "buffer too small");
                return Err(self.hw_error("queue_buffer", errno::EINVAL));
            }
            st.queued.push_back(Queued {
                index,
                buffer: buffer.clone(),
            });
            st.streaming
        };
        if streaming && self.shared.timing == FrameTiming::Immediate {
            self.shared.complete_one();
        }
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> HalResult<DequeuedFrame> {
        if self
            .shared
            .faults
            .lock()
            .take(&SimFault::Dequeue(self.shared.name.clone()))
        {
            // The frame is lost to the failed ioctl
            self.shared.state.lock().done.pop_front();
            return Err(self.hw_error("dequeue_buffer", errno::EIO));
        }
        self.shared
            .state
            .lock()
            .done
            .pop_front()
            .ok_or_else(|| self.hw_error("dequeue_buffer", errno::EAGAIN))
    }

    fn is_ready(&self) -> bool {
        !self.shared.state.lock().done.is_empty()
    }

    fn queued_count(&self) -> usize {
        let st = self.shared.state.lock();
        st.queued.len() + st.done.len()
    }

    fn is_streaming(&self) -> bool {
        self.shared.state.lock().streaming
    }
}

/// Sensor backend producing frames in software.
pub struct SimulatedBackend {
    sensor: SensorDescriptor,
    timing: FrameTiming,
    waker: Arc<PollWaker>,
    faults: Arc<Mutex<Faults>>,
    model: Arc<Mutex<SensorModel>>,
    nodes: Mutex<HashMap<String, Arc<NodeShared>>>,
    applied: Mutex<Vec<CaptureSettings>>,
    epoch: Instant,
}

impl SimulatedBackend {
    /// Backend for the camera described by `caps`.
    pub fn new(caps: &CameraCapabilities, timing: FrameTiming) -> Arc<Self> {
        Arc::new(Self {
            sensor: SensorDescriptor::from_timing(&caps.sensor),
            timing,
            waker: PollWaker::new(),
            faults: Arc::new(Mutex::new(Faults::default())),
            model: Arc::new(Mutex::new(SensorModel::new(
                caps.sensor_setting_delay() as usize,
            ))),
            nodes: Mutex::new(HashMap::new()),
            applied: Mutex::new(Vec::new()),
            epoch: Instant::now(),
        })
    }

    /// Arm `fault`. Frame faults fire once, the others hold until
    /// [`clear_faults`](Self::clear_faults).
    pub fn inject(&self, fault: SimFault) {
        self.faults.lock().active.push(fault);
    }

    /// Disarm every pending fault.
    pub fn clear_faults(&self) {
        self.faults.lock().active.clear();
    }

    /// Complete the oldest buffer queued on `node`.
    pub fn complete_next(&self, node: &str) -> bool {
        let shared = self.nodes.lock().get(node).cloned();
        shared.is_some_and(|n| n.complete_one())
    }

    /// Complete everything queued on every node.
    pub fn complete_all(&self) -> usize {
        let nodes: Vec<_> = self.nodes.lock().values().cloned().collect();
        nodes.iter().map(|n| n.complete_all()).sum()
    }

    /// Buffers queued on `node` that have not completed yet.
    pub fn pending_on(&self, node: &str) -> usize {
        self.nodes
            .lock()
            .get(node)
            .map_or(0, |n| n.state.lock().queued.len())
    }

    /// Whether `node` was opened and not closed since.
    pub fn is_node_open(&self, node: &str) -> bool {
        self.nodes
            .lock()
            .get(node)
            .is_some_and(|n| n.state.lock().opened)
    }

    /// Capture settings programmed so far, in order.
    pub fn applied_settings(&self) -> Vec<CaptureSettings> {
        self.applied.lock().clone()
    }
}

impl SensorBackend for SimulatedBackend {
    fn open_sensor(&self) -> HalResult<SensorDescriptor> {
        if self.faults.lock().has(&SimFault::Sensor) {
            return Err(HalError::from_errno("sensor", "open", errno::ENODEV));
        }
        Ok(self.sensor.clone())
    }

    fn open_node(&self, name: &str) -> HalResult<Box<dyn VideoNode>> {
        let shared = Arc::new(NodeShared {
            name: name.to_string(),
            state: Mutex::new(NodeState {
                opened: false,
                streaming: false,
                format: None,
                buffer_count: 0,
                queued: VecDeque::new(),
                done: VecDeque::new(),
                sequence: 0,
            }),
            waker: Arc::clone(&self.waker),
            faults: Arc::clone(&self.faults),
            model: Arc::clone(&self.model),
            epoch: self.epoch,
            timing: self.timing,
        });
        self.nodes.lock().insert(name.to_string(), Arc::clone(&shared));
        let mut node = SimulatedNode { shared };
        node.open()?;
        Ok(Box::new(node))
    }

    fn apply_sensor_settings(&self, settings: &CaptureSettings) -> HalResult<()> {
        self.model
            .lock()
            .apply(settings.exposure_time_us, settings.analog_gain);
        self.applied.lock().push(settings.clone());
        Ok(())
    }

    fn waker(&self) -> Arc<PollWaker> {
        Arc::clone(&self.waker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(backend: &SimulatedBackend, name: &str, format: PixelFormat) -> Box<dyn VideoNode> {
        let mut node = backend.open_node(name).unwrap();
        node.set_format(&FrameFormat {
            width: 8,
            height: 8,
            format,
        })
        .unwrap();
        node.request_buffers(4).unwrap();
        node
    }

    #[test]
    fn test_manual_timing() {
        let backend = SimulatedBackend::new(&CameraCapabilities::default(), FrameTiming::Manual);
        let mut n = node(&backend, "main", PixelFormat::Ycbcr420);
        let buf = CameraBuffer::allocate_internal(8, 8, PixelFormat::Ycbcr420);

        n.queue_buffer(2, &buf).unwrap();
        n.stream_on().unwrap();
        assert!(!n.is_ready());
        assert_eq!(n.queued_count(), 1);

        assert!(backend.complete_next("main"));
        assert!(n.is_ready());
        let frame = n.dequeue_buffer().unwrap();
        assert_eq!(frame.index, 2);
        assert_eq!(frame.sequence, 0);
        assert_eq!(frame.bytes_used, PixelFormat::Ycbcr420.frame_size(8, 8));
        assert!(frame.statistics.is_some());
        assert!(!backend.complete_next("main"));
    }

    #[test]
    fn test_immediate_timing_completes_on_queue() {
        let backend = SimulatedBackend::new(&CameraCapabilities::default(), FrameTiming::Immediate);
        let mut n = node(&backend, "main", PixelFormat::RawSensor);
        n.stream_on().unwrap();
        let buf = CameraBuffer::allocate_internal(8, 8, PixelFormat::RawSensor);
        n.queue_buffer(0, &buf).unwrap();
        assert!(n.is_ready());
        assert!(matches!(n.dequeue_buffer(), Ok(f) if f.index == 0));
        assert!(matches!(n.dequeue_buffer(), Err(HalError::WouldBlock)));
    }

    #[test]
    fn test_fault_injection() {
        let backend = SimulatedBackend::new(&CameraCapabilities::default(), FrameTiming::Manual);
        backend.inject(SimFault::Open("bad".into()));
        assert!(matches!(backend.open_node("bad"), Err(HalError::NoDevice(_))));

        let mut n = node(&backend, "main", PixelFormat::Ycbcr420);
        let buf = CameraBuffer::allocate_internal(8, 8, PixelFormat::Ycbcr420);
        n.queue_buffer(0, &buf).unwrap();
        n.queue_buffer(1, &buf).unwrap();
        n.stream_on().unwrap();
        backend.complete_all();

        backend.inject(SimFault::Dequeue("main".into()));
        assert!(matches!(n.dequeue_buffer(), Err(HalError::Hardware { errno: 5, .. })));
        assert_eq!(n.dequeue_buffer().unwrap().index, 1);

        backend.inject(SimFault::SetFormat("fmt".into()));
        let mut bad = backend.open_node("fmt").unwrap();
        assert!(backend.is_node_open("fmt"));
        let format = FrameFormat {
            width: 8,
            height: 8,
            format: PixelFormat::Ycbcr420,
        };
        assert!(matches!(bad.set_format(&format), Err(HalError::BadValue(_))));
        bad.close().unwrap();
        assert!(!backend.is_node_open("fmt"));
    }

    #[test]
    fn test_small_buffer_rejected() {
        let backend = SimulatedBackend::new(&CameraCapabilities::default(), FrameTiming::Manual);
        let mut n = node(&backend, "main", PixelFormat::Rgba8888);
        let small = CameraBuffer::allocate_internal(2, 2, PixelFormat::Rgba8888);
        assert!(matches!(n.queue_buffer(0, &small), Err(HalError::BadValue(_))));
    }

    #[test]
    fn test_sensor_model_delay() {
        let mut model = SensorModel::new(2);
        model.apply(20_000, 2.0);
        assert_eq!(model.effective(), (10_000, 1.0));
        model.apply(5_000, 1.0);
        model.apply(5_000, 1.0);
        assert_eq!(model.effective(), (20_000, 2.0));
        let bright = model.stats(0, 0).mean_luma;
        model.apply(5_000, 1.0);
        assert!(model.stats(1, 0).mean_luma < bright);
    }
}

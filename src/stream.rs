//! Stream descriptors and per-stream buffer bookkeeping.
//!
//! [`Camera3Stream`] is what the framework negotiates at configuration time.
//! Each configured framework stream is bound to one internal [`CameraStream`],
//! which owns the pending-request FIFO and forwards buffers to the hardware
//! producer it is bound to.

use crate::buffer::{CameraBuffer, PixelFormat};
use crate::request::SharedRequest;
use hal_core::{HalError, HalResult};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Direction of a framework stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamType {
    /// The HAL fills buffers.
    Output,
    /// The framework supplies buffers for reprocessing.
    Input,
    /// Both directions.
    Bidirectional,
}

/// Framework-side stream descriptor.
pub struct Camera3Stream {
    /// Direction.
    pub stream_type: StreamType,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel format as requested by the framework.
    pub format: PixelFormat,
    /// Gralloc usage flags.
    pub usage: u32,
    max_buffers: AtomicU32,
    binding: RwLock<Option<Arc<CameraStream>>>,
}

impl std::fmt::Debug for Camera3Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Camera3Stream")
            .field("type", &self.stream_type)
            .field("size", &(self.width, self.height))
            .field("format", &self.format)
            .field("bound", &self.bound().map(|s| s.seq_no()))
            .finish()
    }
}

impl Camera3Stream {
    /// Descriptor with no binding yet.
    pub fn new(
        stream_type: StreamType,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            stream_type,
            width,
            height,
            format,
            usage,
            max_buffers: AtomicU32::new(0),
            binding: RwLock::new(None),
        })
    }

    /// Convenience constructor for an output stream.
    pub fn output(width: u32, height: u32, format: PixelFormat) -> Arc<Self> {
        Self::new(StreamType::Output, width, height, format, 0)
    }

    /// Internal stream this descriptor is bound to, if configured.
    pub fn bound(&self) -> Option<Arc<CameraStream>> {
        self.binding.read().clone()
    }

    pub(crate) fn bind(&self, stream: Option<Arc<CameraStream>>) {
        *self.binding.write() = stream;
    }

    /// Maximum buffers the HAL may hold, filled in at configuration.
    pub fn max_buffers(&self) -> u32 {
        self.max_buffers.load(Ordering::Acquire)
    }

    pub(crate) fn set_max_buffers(&self, count: u32) {
        self.max_buffers.store(count, Ordering::Release);
    }

    /// Whether the HAL writes into this stream.
    pub fn is_output(&self) -> bool {
        matches!(
            self.stream_type,
            StreamType::Output | StreamType::Bidirectional
        )
    }

    /// Whether the framework feeds this stream.
    pub fn is_input(&self) -> bool {
        matches!(
            self.stream_type,
            StreamType::Input | StreamType::Bidirectional
        )
    }
}

/// Hardware-side consumer of stream buffers.
///
/// Implemented by the capture unit. `queue_buffer` must not block: it hands
/// the buffer over and returns.
pub trait StreamProducer: Send + Sync {
    /// Take `buffer` of `request` for capture.
    fn queue_buffer(&self, buffer: CameraBuffer, request: SharedRequest) -> HalResult<()>;
    /// Name used in logs.
    fn producer_name(&self) -> &str;
}

/// Internal stream state bound to one framework stream.
pub struct CameraStream {
    seq_no: u32,
    stream_type: StreamType,
    width: u32,
    height: u32,
    format: PixelFormat,
    usage: u32,
    max_buffers: u32,
    active: AtomicBool,
    buffers_in_hal: AtomicUsize,
    producer: RwLock<Option<Arc<dyn StreamProducer>>>,
    pending: Mutex<VecDeque<SharedRequest>>,
}

impl std::fmt::Debug for CameraStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraStream")
            .field("seq_no", &self.seq_no)
            .field("size", &(self.width, self.height))
            .field("format", &self.format)
            .field("active", &self.is_active())
            .field("buffers_in_hal", &self.buffers_in_hal())
            .finish()
    }
}

impl CameraStream {
    /// Create the internal stream for a framework descriptor.
    ///
    /// Implementation-defined formats are resolved to NV12.
    pub fn new(seq_no: u32, descriptor: &Camera3Stream, max_buffers: u32) -> Arc<Self> {
        let format = match descriptor.format {
            PixelFormat::ImplementationDefined => PixelFormat::Ycbcr420,
            other => other,
        };
        Arc::new(Self {
            seq_no,
            stream_type: descriptor.stream_type,
            width: descriptor.width,
            height: descriptor.height,
            format,
            usage: descriptor.usage,
            max_buffers,
            active: AtomicBool::new(false),
            buffers_in_hal: AtomicUsize::new(0),
            producer: RwLock::new(None),
            pending: Mutex::new(VecDeque::new()),
        })
    }

    /// Order in which the stream was created.
    pub fn seq_no(&self) -> u32 {
        self.seq_no
    }

    /// Direction of the framework stream.
    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixels per frame.
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Resolved pixel format.
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Gralloc usage flags.
    pub fn usage(&self) -> u32 {
        self.usage
    }

    /// Maximum buffers the HAL may hold.
    pub fn max_buffers(&self) -> u32 {
        self.max_buffers
    }

    /// Mark the stream part of the current configuration.
    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Drop out of the current configuration.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Whether the stream is in the current configuration.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Bind to a hardware producer, replacing any previous one.
    pub fn bind_producer(&self, producer: Option<Arc<dyn StreamProducer>>) {
        let mut slot = self.producer.write();
        if let Some(p) = producer.as_ref() {
            debug!(stream = self.seq_no, producer = p.producer_name(), "stream bound");
        }
        *slot = producer;
    }

    /// Whether a producer is bound.
    pub fn has_producer(&self) -> bool {
        self.producer.read().is_some()
    }

    /// Buffers of this stream currently held by the HAL.
    pub fn buffers_in_hal(&self) -> usize {
        self.buffers_in_hal.load(Ordering::Acquire)
    }

    pub(crate) fn inc_buffers_in_hal(&self) {
        self.buffers_in_hal.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_buffers_in_hal(&self) {
        let result =
            self.buffers_in_hal
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if result.is_err() {
            error!(stream = self.seq_no, "buffer counter underflow");
        }
    }

    /// Requests whose buffer for this stream has not completed yet.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Queue this stream's buffer of `request` to the bound producer.
    pub fn process_request(&self, request: &SharedRequest) -> HalResult<()> {
        let Some(buffer) = request.find_buffer(self) else {
            error!(
                stream = self.seq_no,
                request_id = request.id(),
                "no buffer for stream in request"
            );
            return Err(HalError::NoMemory(format!(
                "request {} has no buffer for stream {}",
                request.id(),
                self.seq_no
            )));
        };

        let producer = self.producer.read().clone();
        let Some(producer) = producer else {
            error!(stream = self.seq_no, "stream has no producer");
            return Err(HalError::NoInit);
        };

        self.pending.lock().push_back(request.clone());

        if let Err(e) = producer.queue_buffer(buffer, request.clone()) {
            let mut pending = self.pending.lock();
            if let Some(pos) = pending.iter().rposition(|r| r.id() == request.id()) {
                pending.remove(pos);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Complete `buffer` of `request` and hand it to the request's callback.
    ///
    /// Completion is expected in FIFO order. An out-of-order completion is
    /// logged and the matching entry is removed instead of the head.
    pub fn capture_done(&self, buffer: &CameraBuffer, request: &SharedRequest) -> HalResult<()> {
        let id = request.id();
        {
            let mut pending = self.pending.lock();
            match pending.front() {
                Some(front) if front.id() == id => {
                    pending.pop_front();
                }
                Some(front) => {
                    error!(
                        stream = self.seq_no,
                        expected = front.id(),
                        got = id,
                        "out of order completion"
                    );
                    match pending.iter().position(|r| r.id() == id) {
                        Some(pos) => {
                            pending.remove(pos);
                        }
                        None => warn!(stream = self.seq_no, request_id = id, "request not pending"),
                    }
                }
                None => warn!(stream = self.seq_no, request_id = id, "completion on idle stream"),
            }
        }

        self.dec_buffers_in_hal();

        match request.callback() {
            Some(cb) => cb.buffer_done(request, buffer),
            None => {
                error!(request_id = id, "request has no callback");
                Err(HalError::NoInit)
            }
        }
    }

    /// Drop pending requests; used when a configuration is torn down.
    pub(crate) fn clear_pending(&self) -> usize {
        let mut pending = self.pending.lock();
        let n = pending.len();
        pending.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_implementation_defined_resolves_to_nv12() {
        let desc = Camera3Stream::output(640, 480, PixelFormat::ImplementationDefined);
        let stream = CameraStream::new(3, &desc, 4);
        assert_eq!(stream.format(), PixelFormat::Ycbcr420);
        assert_eq!(stream.seq_no(), 3);
        assert_eq!(stream.area(), 640 * 480);
    }

    #[test]
    fn test_activation_and_binding() {
        let desc = Camera3Stream::output(320, 240, PixelFormat::Ycbcr420);
        assert!(desc.bound().is_none());
        let stream = CameraStream::new(0, &desc, 4);
        desc.bind(Some(Arc::clone(&stream)));
        assert_eq!(desc.bound().map(|s| s.seq_no()), Some(0));

        assert!(!stream.is_active());
        stream.activate();
        assert!(stream.is_active());
        stream.deactivate();
        assert!(!stream.is_active());
        assert!(!stream.has_producer());
    }

    #[test]
    fn test_counter_does_not_underflow() {
        let desc = Camera3Stream::output(16, 16, PixelFormat::RawSensor);
        let stream = CameraStream::new(0, &desc, 2);
        stream.inc_buffers_in_hal();
        stream.dec_buffers_in_hal();
        stream.dec_buffers_in_hal();
        assert_eq!(stream.buffers_in_hal(), 0);
    }
}

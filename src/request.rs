//! Per-request state container.
//!
//! A [`Camera3Request`] is recycled through a fixed pool owned by the camera
//! device. `init` validates a framework [`CaptureRequest`] and snapshots its
//! buffers and settings; once initialised the buffer and stream lists are
//! immutable and read without locking. Settings are shared between pipeline
//! stages and guarded by a reader/writer lock exposed through scoped guards.
//!
//! Partial-result metadata buffers are allocated once and cleared between
//! requests. If a writer grew a buffer past its recorded capacity, the next
//! `init` reallocates it at the new capacity and remembers that size.

use crate::buffer::{CameraBuffer, StreamBuffer};
use crate::stream::CameraStream;
use hal_core::config::CameraCapabilities;
use hal_core::{CameraMetadata, HalError, HalResult};
use hal_pool::{ItemPool, Loaned};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Maximum output buffers in one request.
pub const MAX_NUMBER_OUTPUT_STREAMS: usize = 8;
/// Initial entry capacity of a partial-result buffer.
pub const RESULT_ENTRY_CAP: usize = 256;
/// Initial data capacity (bytes) of a partial-result buffer.
pub const RESULT_DATA_CAP: usize = 4096;

/// Capture request as submitted by the framework.
#[derive(Debug, Clone, Default)]
pub struct CaptureRequest {
    /// Framework frame number, increasing across requests.
    pub frame_number: u32,
    /// `None` means "same settings as the previous request".
    pub settings: Option<CameraMetadata>,
    /// Reprocessing input.
    pub input_buffer: Option<StreamBuffer>,
    /// One buffer per output stream at most.
    pub output_buffers: Vec<StreamBuffer>,
}

/// Completion callbacks a request reports to as it moves through the
/// pipeline. The result processor implements this.
pub trait RequestCallback: Send + Sync {
    /// Exposure started at `timestamp_ns`.
    fn shutter_done(&self, request: &SharedRequest, timestamp_ns: i64) -> HalResult<()>;
    /// Partial result `partial_index` is filled in.
    fn metadata_done(&self, request: &SharedRequest, partial_index: usize) -> HalResult<()>;
    /// `buffer` is complete, possibly with error status.
    fn buffer_done(&self, request: &SharedRequest, buffer: &CameraBuffer) -> HalResult<()>;
    /// The request failed as a whole.
    fn request_error(&self, request: &SharedRequest) -> HalResult<()>;
}

struct PartialResult {
    meta: Mutex<CameraMetadata>,
    entry_capacity: usize,
    data_capacity: usize,
}

impl PartialResult {
    fn new() -> Self {
        Self {
            meta: Mutex::new(CameraMetadata::with_capacity(
                RESULT_ENTRY_CAP,
                RESULT_DATA_CAP,
            )),
            entry_capacity: RESULT_ENTRY_CAP,
            data_capacity: RESULT_DATA_CAP,
        }
    }
}

/// One capture request travelling through the pipeline.
#[derive(Default)]
pub struct Camera3Request {
    initialized: bool,
    id: i64,
    camera_id: i32,
    callback: Option<Arc<dyn RequestCallback>>,
    output_buffers: Vec<CameraBuffer>,
    input_buffer: Option<CameraBuffer>,
    output_streams: Vec<Arc<CameraStream>>,
    input_streams: Vec<Arc<CameraStream>>,
    settings: RwLock<CameraMetadata>,
    partial_results: Vec<PartialResult>,
}

impl std::fmt::Debug for Camera3Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Camera3Request")
            .field("id", &self.id())
            .field("camera_id", &self.camera_id)
            .field("outputs", &self.output_buffers.len())
            .field("has_input", &self.input_buffer.is_some())
            .finish()
    }
}

impl Camera3Request {
    /// Empty, uninitialised request.
    pub fn new() -> Self {
        Self {
            id: -1,
            ..Default::default()
        }
    }

    /// Validate `raw` and take a snapshot of it.
    ///
    /// On error the request is left de-initialised.
    pub fn init(
        &mut self,
        raw: &CaptureRequest,
        callback: Option<Arc<dyn RequestCallback>>,
        settings: CameraMetadata,
        caps: &CameraCapabilities,
    ) -> HalResult<()> {
        trace!(
            frame_number = raw.frame_number,
            outputs = raw.output_buffers.len(),
            has_input = raw.input_buffer.is_some(),
            "init request"
        );
        let Some(callback) = callback else {
            error!(frame_number = raw.frame_number, "invalid callback object");
            return Err(HalError::BadValue("request callback missing".into()));
        };

        self.de_init();

        if let Err(e) = self.init_partial_result_buffers(caps.partial_result_count) {
            error!(frame_number = raw.frame_number, "failed to initialize partial results");
            return Err(e);
        }

        if raw.output_buffers.len() > MAX_NUMBER_OUTPUT_STREAMS {
            error!(
                count = raw.output_buffers.len(),
                max = MAX_NUMBER_OUTPUT_STREAMS,
                "too many output buffers"
            );
            return Err(HalError::BadValue(format!(
                "{} output buffers, max is {MAX_NUMBER_OUTPUT_STREAMS}",
                raw.output_buffers.len()
            )));
        }

        self.output_buffers = raw
            .output_buffers
            .iter()
            .map(|sb| CameraBuffer::from_stream_buffer(sb, sb.stream.bound()))
            .collect();
        self.input_buffer = raw
            .input_buffer
            .as_ref()
            .map(|sb| CameraBuffer::from_stream_buffer(sb, sb.stream.bound()));

        let checked = self
            .check_input_streams(raw)
            .and_then(|()| self.check_output_streams());
        if let Err(e) = checked {
            error!(frame_number = raw.frame_number, error = %e, "error with the request's buffers");
            self.de_init();
            return Err(e);
        }

        for buffer in &self.output_buffers {
            if let Some(owner) = buffer.owner() {
                owner.inc_buffers_in_hal();
            }
        }

        self.id = i64::from(raw.frame_number);
        self.camera_id = caps.id;
        self.callback = Some(callback);
        *self.settings.get_mut() = settings;
        self.initialized = true;
        debug!(request_id = self.id, "request initialized");
        Ok(())
    }

    /// Clear all per-request state. Partial-result buffers are kept.
    pub fn de_init(&mut self) {
        self.output_buffers.clear();
        self.input_buffer = None;
        self.output_streams.clear();
        self.input_streams.clear();
        self.callback = None;
        self.settings.get_mut().clear();
        self.initialized = false;
        self.id = -1;
    }

    fn check_input_streams(&mut self, raw: &CaptureRequest) -> HalResult<()> {
        let Some(input) = raw.input_buffer.as_ref() else {
            return Ok(());
        };
        if !input.stream.is_input() {
            error!(frame_number = raw.frame_number, "input buffer not from input stream");
            return Err(HalError::BadValue("input buffer on output stream".into()));
        }
        let Some(stream) = input.stream.bound() else {
            error!("input stream not configured");
            return Err(HalError::BadValue("input stream not configured".into()));
        };
        self.input_streams.push(stream);
        Ok(())
    }

    /// Build the active output stream list: largest area first, ties broken
    /// by ascending sequence number, each stream once.
    fn check_output_streams(&mut self) -> HalResult<()> {
        if self.output_buffers.is_empty() {
            error!("request has no output buffers");
            return Err(HalError::BadValue("no output buffers".into()));
        }

        let mut streams: Vec<Arc<CameraStream>> = Vec::with_capacity(self.output_buffers.len());
        for buffer in &self.output_buffers {
            let Some(stream) = buffer.owner() else {
                error!("output stream not configured");
                return Err(HalError::BadValue("output stream not configured".into()));
            };
            if streams.iter().any(|s| Arc::ptr_eq(s, stream)) {
                continue;
            }
            let key = (std::cmp::Reverse(stream.area()), stream.seq_no());
            let pos = streams
                .iter()
                .position(|s| (std::cmp::Reverse(s.area()), s.seq_no()) > key)
                .unwrap_or(streams.len());
            streams.insert(pos, Arc::clone(stream));
        }
        self.output_streams = streams;
        Ok(())
    }

    /// Allocate or recycle the partial-result buffers.
    pub fn init_partial_result_buffers(&mut self, count: usize) -> HalResult<()> {
        if count == 0 {
            return Err(HalError::NoMemory("zero partial result buffers".into()));
        }
        self.partial_results.truncate(count);
        while self.partial_results.len() < count {
            self.partial_results.push(PartialResult::new());
        }

        for (index, partial) in self.partial_results.iter_mut().enumerate() {
            let meta = partial.meta.get_mut();
            if meta.entry_capacity() != partial.entry_capacity
                || meta.data_capacity() != partial.data_capacity
            {
                warn!(
                    index,
                    entries = meta.entry_capacity(),
                    data = meta.data_capacity(),
                    "partial result buffer resized, reallocating"
                );
                partial.entry_capacity = meta.entry_capacity();
                partial.data_capacity = meta.data_capacity();
                *meta = CameraMetadata::with_capacity(partial.entry_capacity, partial.data_capacity);
            }
            meta.clear();
        }
        Ok(())
    }

    /// Metadata buffer for one algorithmic stage.
    pub fn partial_result_buffer(&self, index: usize) -> Option<MutexGuard<'_, CameraMetadata>> {
        match self.partial_results.get(index) {
            Some(partial) => Some(partial.meta.lock()),
            None => {
                error!(index, "requesting a partial buffer that does not exist");
                None
            }
        }
    }

    /// Number of partial results the request carries.
    pub fn partial_result_count(&self) -> usize {
        self.partial_results.len()
    }

    /// Buffer of this request owned by `stream`.
    pub fn find_buffer(&self, stream: &CameraStream) -> Option<CameraBuffer> {
        if let Some(buffer) = self.output_buffers.iter().find(|b| b.is_owned_by(stream)) {
            return Some(buffer.clone());
        }
        if let Some(input) = self.input_buffer.as_ref().filter(|b| b.is_owned_by(stream)) {
            return Some(input.clone());
        }
        warn!(stream = stream.seq_no(), "could not find requested buffer, invalid stream?");
        None
    }

    /// Whether `buffer` is this request's input.
    pub fn is_input_buffer(&self, buffer: &CameraBuffer) -> bool {
        self.input_buffer.as_ref().is_some_and(|b| b.same_as(buffer))
    }

    /// Frame number, or -1 when not initialised.
    pub fn id(&self) -> i64 {
        if self.initialized {
            self.id
        } else {
            -1
        }
    }

    /// Camera the request was submitted to.
    pub fn camera_id(&self) -> i32 {
        self.camera_id
    }

    /// Whether `init` succeeded and the request is live.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Receiver of this request's completion events.
    pub fn callback(&self) -> Option<&Arc<dyn RequestCallback>> {
        self.callback.as_ref()
    }

    /// Output buffer count; 0 when not initialised.
    pub fn number_output_bufs(&self) -> usize {
        if self.initialized {
            self.output_buffers.len()
        } else {
            0
        }
    }

    /// 1 with an input buffer, else 0.
    pub fn number_input_bufs(&self) -> usize {
        usize::from(self.initialized && self.input_buffer.is_some())
    }

    /// Whether the request reprocesses an input buffer.
    pub fn has_input_buf(&self) -> bool {
        self.number_input_bufs() > 0
    }

    /// Give back the buffer accounting of a request the pipeline never
    /// accepted.
    pub(crate) fn release_unadmitted(&self) {
        for buffer in &self.output_buffers {
            if let Some(owner) = buffer.owner() {
                owner.dec_buffers_in_hal();
            }
        }
    }

    /// Output buffers, in submission order.
    pub fn output_buffers(&self) -> &[CameraBuffer] {
        &self.output_buffers
    }

    /// Reprocessing input, if any.
    pub fn input_buffer(&self) -> Option<&CameraBuffer> {
        self.input_buffer.as_ref()
    }

    /// Streams of the output buffers, largest first.
    pub fn output_streams(&self) -> &[Arc<CameraStream>] {
        &self.output_streams
    }

    /// Streams of the input buffer.
    pub fn input_streams(&self) -> &[Arc<CameraStream>] {
        &self.input_streams
    }

    /// Shared read access to the settings for the guard's lifetime.
    pub fn settings(&self) -> RwLockReadGuard<'_, CameraMetadata> {
        self.settings.read()
    }

    /// Exclusive access to the settings for the guard's lifetime.
    pub fn settings_mut(&self) -> RwLockWriteGuard<'_, CameraMetadata> {
        self.settings.write()
    }
}

/// Pool of recyclable requests. Returning a slot de-initialises it.
pub type RequestPool = ItemPool<Camera3Request>;

/// Pool of `capacity` requests.
pub fn request_pool(capacity: usize) -> Arc<RequestPool> {
    ItemPool::new_with_reset(capacity, Camera3Request::new, Camera3Request::de_init)
}

/// Reference-counted handle to an initialised pooled request.
///
/// The request goes back to its pool when the last handle is dropped.
#[derive(Clone)]
pub struct SharedRequest(Arc<Loaned<Camera3Request>>);

impl SharedRequest {
    /// Take ownership of a pooled request.
    pub fn new(request: Loaned<Camera3Request>) -> Self {
        Self(Arc::new(request))
    }

    /// Whether both handles point at the same request.
    pub fn ptr_eq(&self, other: &SharedRequest) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for SharedRequest {
    type Target = Camera3Request;

    fn deref(&self) -> &Self::Target {
        self.0.get()
    }
}

impl std::fmt::Debug for SharedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.get().fmt(f)
    }
}

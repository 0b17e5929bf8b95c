//! Image buffer handles.
//!
//! The framework owns output memory; the HAL wraps it without copying.
//! [`GraphicBuffer`] is the framework-side allocation, [`CameraBuffer`] is the
//! HAL wrapper created when a request is initialised. It remembers which
//! internal stream owns it, the completion status, and the request id tag set
//! when the hardware returns it.

use crate::stream::{Camera3Stream, CameraStream};
use bytes::BytesMut;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Size of the trailer appended to BLOB buffers (`jpeg_blob_id`, padding, `jpeg_size`).
pub const JPEG_BLOB_TRAILER_SIZE: usize = 8;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Pixel formats negotiated at stream configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PixelFormat {
    /// Compressed JPEG output; the hardware writes RGB888 that is encoded in place.
    Blob,
    /// 4:2:0 YCbCr (NV12 layout)
    Ycbcr420,
    /// 32-bit RGBA
    Rgba8888,
    /// 16-bit Bayer
    RawSensor,
    /// Resolved to NV12 at configuration
    ImplementationDefined,
}

impl PixelFormat {
    /// Bytes needed for a `width`×`height` frame in this format.
    #[must_use]
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Blob => pixels * 3 + JPEG_BLOB_TRAILER_SIZE,
            PixelFormat::Ycbcr420 | PixelFormat::ImplementationDefined => pixels * 3 / 2,
            PixelFormat::Rgba8888 => pixels * 4,
            PixelFormat::RawSensor => pixels * 2,
        }
    }
}

/// Completion status reported with a returned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BufferStatus {
    /// Filled and valid.
    Ok,
    /// Contents must not be used.
    Error,
}

/// Framework-owned image memory.
#[derive(Debug, Clone)]
pub struct GraphicBuffer {
    id: u64,
    data: Arc<Mutex<BytesMut>>,
}

impl GraphicBuffer {
    /// Allocate zeroed memory of `size` bytes.
    #[must_use]
    pub fn allocate(size: usize) -> Self {
        Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            data: Arc::new(Mutex::new(BytesMut::zeroed(size))),
        }
    }

    /// Allocate memory sized for a frame of the given geometry.
    #[must_use]
    pub fn for_frame(width: u32, height: u32, format: PixelFormat) -> Self {
        Self::allocate(format.frame_size(width, height))
    }

    /// Process-unique id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// Whether nothing was allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock the memory for reading or writing.
    pub fn lock(&self) -> MutexGuard<'_, BytesMut> {
        self.data.lock()
    }
}

/// One buffer handed over by the framework inside a capture request.
#[derive(Debug, Clone)]
pub struct StreamBuffer {
    /// Stream the buffer is for.
    pub stream: Arc<Camera3Stream>,
    /// Memory the HAL fills.
    pub buffer: GraphicBuffer,
}

impl StreamBuffer {
    /// Allocate a buffer matching the stream geometry.
    #[must_use]
    pub fn allocate(stream: &Arc<Camera3Stream>) -> Self {
        Self {
            stream: Arc::clone(stream),
            buffer: GraphicBuffer::for_frame(stream.width, stream.height, stream.format),
        }
    }
}

#[derive(Debug)]
struct BufferState {
    status: BufferStatus,
    timestamp_ns: i64,
    request_id: Option<i64>,
    bytes_used: usize,
}

struct CameraBufferInner {
    memory: GraphicBuffer,
    framework_stream: Option<Arc<Camera3Stream>>,
    owner: Option<Arc<CameraStream>>,
    width: u32,
    height: u32,
    format: PixelFormat,
    state: Mutex<BufferState>,
}

/// HAL wrapper around a framework or internal image buffer.
///
/// Cloning shares the same underlying wrapper.
#[derive(Clone)]
pub struct CameraBuffer {
    inner: Arc<CameraBufferInner>,
}

impl std::fmt::Debug for CameraBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraBuffer")
            .field("memory", &self.inner.memory.id())
            .field("owner", &self.inner.owner.as_ref().map(|s| s.seq_no()))
            .field("format", &self.inner.format)
            .field("size", &(self.inner.width, self.inner.height))
            .finish()
    }
}

impl CameraBuffer {
    /// Wrap a framework buffer owned by `owner`.
    #[must_use]
    pub fn from_stream_buffer(buffer: &StreamBuffer, owner: Option<Arc<CameraStream>>) -> Self {
        let stream = &buffer.stream;
        Self::new(
            buffer.buffer.clone(),
            Some(Arc::clone(stream)),
            owner,
            stream.width,
            stream.height,
            stream.format,
        )
    }

    /// HAL-allocated buffer with no framework counterpart (skip frames).
    #[must_use]
    pub fn allocate_internal(width: u32, height: u32, format: PixelFormat) -> Self {
        Self::new(
            GraphicBuffer::for_frame(width, height, format),
            None,
            None,
            width,
            height,
            format,
        )
    }

    fn new(
        memory: GraphicBuffer,
        framework_stream: Option<Arc<Camera3Stream>>,
        owner: Option<Arc<CameraStream>>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Self {
        Self {
            inner: Arc::new(CameraBufferInner {
                memory,
                framework_stream,
                owner,
                width,
                height,
                format,
                state: Mutex::new(BufferState {
                    status: BufferStatus::Ok,
                    timestamp_ns: 0,
                    request_id: None,
                    bytes_used: 0,
                }),
            }),
        }
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.inner.width
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.inner.height
    }

    /// Pixel format of the stream.
    #[must_use]
    pub fn format(&self) -> PixelFormat {
        self.inner.format
    }

    /// Internal stream that owns this buffer; `None` for internal buffers.
    #[must_use]
    pub fn owner(&self) -> Option<&Arc<CameraStream>> {
        self.inner.owner.as_ref()
    }

    /// Whether this buffer belongs to `stream`.
    #[must_use]
    pub fn is_owned_by(&self, stream: &CameraStream) -> bool {
        self.inner
            .owner
            .as_ref()
            .is_some_and(|owner| std::ptr::eq(Arc::as_ptr(owner), stream))
    }

    /// Framework stream of the buffer; `None` for internal buffers.
    #[must_use]
    pub fn framework_stream(&self) -> Option<&Arc<Camera3Stream>> {
        self.inner.framework_stream.as_ref()
    }

    /// Underlying memory.
    #[must_use]
    pub fn graphic_buffer(&self) -> &GraphicBuffer {
        &self.inner.memory
    }

    /// Whether the HAL allocated this buffer for itself.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.inner.framework_stream.is_none()
    }

    /// Two handles refer to the same wrapper.
    #[must_use]
    pub fn same_as(&self, other: &CameraBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Lock the memory for reading or writing.
    pub fn lock_data(&self) -> MutexGuard<'_, BytesMut> {
        self.inner.memory.lock()
    }

    /// Size of the memory in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.memory.len()
    }

    /// Completion status.
    #[must_use]
    pub fn status(&self) -> BufferStatus {
        self.inner.state.lock().status
    }

    /// Set the completion status.
    pub fn set_status(&self, status: BufferStatus) {
        self.inner.state.lock().status = status;
    }

    /// Start of exposure of the frame in the buffer.
    #[must_use]
    pub fn timestamp_ns(&self) -> i64 {
        self.inner.state.lock().timestamp_ns
    }

    /// Set the exposure timestamp.
    pub fn set_timestamp_ns(&self, timestamp_ns: i64) {
        self.inner.state.lock().timestamp_ns = timestamp_ns;
    }

    /// Request id tag set when the hardware returned this buffer.
    #[must_use]
    pub fn request_id(&self) -> Option<i64> {
        self.inner.state.lock().request_id
    }

    /// Tag the buffer with the request the frame belongs to.
    pub fn set_request_id(&self, request_id: Option<i64>) {
        self.inner.state.lock().request_id = request_id;
    }

    /// Payload written by the hardware.
    #[must_use]
    pub fn bytes_used(&self) -> usize {
        self.inner.state.lock().bytes_used
    }

    /// Record the payload size.
    pub fn set_bytes_used(&self, bytes_used: usize) {
        self.inner.state.lock().bytes_used = bytes_used;
    }
}

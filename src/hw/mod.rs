//! Hardware boundary: video nodes, the sensor backend and the readiness waker.
//!
//! The shapes follow V4L2 (`S_FMT`, `REQBUFS`, `QBUF`/`DQBUF`,
//! `STREAMON`/`STREAMOFF`) without binding to the kernel ABI. Node errors
//! carry a POSIX errno and are mapped through [`HalError::from_errno`].

pub mod simulated;

use crate::buffer::{CameraBuffer, PixelFormat};
use crate::three_a::{AaaStatistics, CaptureSettings, SensorDescriptor};
use hal_core::HalResult;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use simulated::{FrameTiming, SimFault, SimulatedBackend};

/// Format negotiated on a video node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel layout.
    pub format: PixelFormat,
}

impl FrameFormat {
    /// Bytes needed for one frame.
    pub fn size_image(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }
}

/// Result of one dequeue.
#[derive(Debug, Clone)]
pub struct DequeuedFrame {
    /// Hardware buffer index given at queue time
    pub index: usize,
    /// Sequence counter of the node since stream on
    pub sequence: u64,
    /// Start of exposure.
    pub timestamp_ns: i64,
    /// Payload size.
    pub bytes_used: usize,
    /// Statistics the ISP produced for this frame, if any
    pub statistics: Option<AaaStatistics>,
    /// The driver flagged the frame as corrupt
    pub error: bool,
}

/// One ISP output video node.
pub trait VideoNode: Send {
    /// Node name, as listed in the camera capabilities.
    fn name(&self) -> &str;
    /// Open the device.
    fn open(&mut self) -> HalResult<()>;
    /// Close the device, releasing its buffers.
    fn close(&mut self) -> HalResult<()>;
    /// Negotiate the frame format; only valid while not streaming.
    fn set_format(&mut self, format: &FrameFormat) -> HalResult<()>;
    /// Returns the number of buffers the driver accepted.
    fn request_buffers(&mut self, count: usize) -> HalResult<usize>;
    /// Start streaming the queued buffers.
    fn stream_on(&mut self) -> HalResult<()>;
    /// Stop streaming and drop every queued buffer.
    fn stream_off(&mut self) -> HalResult<()>;
    /// Hand `buffer` to the driver under hardware index `index`.
    fn queue_buffer(&mut self, index: usize, buffer: &CameraBuffer) -> HalResult<()>;
    /// Take the oldest completed buffer.
    fn dequeue_buffer(&mut self) -> HalResult<DequeuedFrame>;
    /// A completed buffer is waiting to be dequeued.
    fn is_ready(&self) -> bool;
    /// Buffers queued and not yet dequeued.
    fn queued_count(&self) -> usize;
    /// Whether `stream_on` is in effect.
    fn is_streaming(&self) -> bool;
}

/// Node shared between the capture unit and the poller thread.
pub type SharedNode = Arc<Mutex<Box<dyn VideoNode>>>;

/// Wrap a node for sharing with the poller.
pub fn share_node(node: Box<dyn VideoNode>) -> SharedNode {
    Arc::new(Mutex::new(node))
}

/// Sensor plus ISP as seen by the capture unit.
pub trait SensorBackend: Send + Sync {
    /// Power up the sensor and describe its mode.
    fn open_sensor(&self) -> HalResult<SensorDescriptor>;
    /// Open the video node called `name`.
    fn open_node(&self, name: &str) -> HalResult<Box<dyn VideoNode>>;
    /// Program exposure and gain for the next capture.
    fn apply_sensor_settings(&self, settings: &CaptureSettings) -> HalResult<()>;
    /// Waker nodes signal when a frame completes.
    fn waker(&self) -> Arc<PollWaker>;
}

/// How a wait on the [`PollWaker`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A device became ready.
    Ready,
    /// `interrupt` was called.
    Interrupted,
    /// The deadline passed first.
    Timeout,
}

#[derive(Debug, Default)]
struct WakerState {
    generation: u64,
    interrupted: bool,
}

/// Readiness notification plus an interrupt, the equivalent of `poll()` on
/// device fds together with a self-pipe.
#[derive(Debug, Default)]
pub struct PollWaker {
    state: Mutex<WakerState>,
    cond: Condvar,
}

impl PollWaker {
    /// Fresh waker with nothing pending.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A device changed state.
    pub fn wake(&self) {
        self.state.lock().generation += 1;
        self.cond.notify_all();
    }

    /// Abort the current (or next) wait.
    pub fn interrupt(&self) {
        self.state.lock().interrupted = true;
        self.cond.notify_all();
    }

    /// Drop a pending interrupt that no wait consumed.
    pub fn clear_interrupt(&self) {
        self.state.lock().interrupted = false;
    }

    /// Block until `ready` returns true, an interrupt arrives or `timeout`
    /// passes. `ready` is evaluated without the waker lock held.
    pub fn wait_until(&self, timeout: Duration, mut ready: impl FnMut() -> bool) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = {
                let mut st = self.state.lock();
                if st.interrupted {
                    st.interrupted = false;
                    return WaitOutcome::Interrupted;
                }
                st.generation
            };

            if ready() {
                return WaitOutcome::Ready;
            }

            let mut st = self.state.lock();
            if st.interrupted {
                st.interrupted = false;
                return WaitOutcome::Interrupted;
            }
            if st.generation != seen {
                continue;
            }
            if self.cond.wait_until(&mut st, deadline).timed_out() {
                if st.interrupted {
                    st.interrupted = false;
                    return WaitOutcome::Interrupted;
                }
                drop(st);
                return if ready() {
                    WaitOutcome::Ready
                } else {
                    WaitOutcome::Timeout
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_wait_times_out() {
        let waker = PollWaker::new();
        let outcome = waker.wait_until(Duration::from_millis(20), || false);
        assert_eq!(outcome, WaitOutcome::Timeout);
    }

    #[test]
    fn test_wake_releases_waiter() {
        let waker = PollWaker::new();
        let flag = Arc::new(AtomicBool::new(false));
        let (w, f) = (Arc::clone(&waker), Arc::clone(&flag));
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            f.store(true, Ordering::SeqCst);
            w.wake();
        });
        let outcome = waker.wait_until(Duration::from_secs(5), || flag.load(Ordering::SeqCst));
        assert_eq!(outcome, WaitOutcome::Ready);
        handle.join().unwrap();
    }

    #[test]
    fn test_interrupt_releases_waiter_once() {
        let waker = PollWaker::new();
        let w = Arc::clone(&waker);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            w.interrupt();
        });
        let outcome = waker.wait_until(Duration::from_secs(5), || false);
        assert_eq!(outcome, WaitOutcome::Interrupted);
        handle.join().unwrap();

        assert_eq!(
            waker.wait_until(Duration::from_millis(10), || false),
            WaitOutcome::Timeout
        );
    }
}

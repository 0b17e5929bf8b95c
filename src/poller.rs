//! Poller thread: the only place the pipeline blocks on hardware.
//!
//! The capture unit posts a poll request after queueing buffers. The poller
//! waits (bounded by the request's timeout) until one of its devices has a
//! completed buffer and reports which ones are ready. `flush` discards queued
//! poll requests and interrupts a wait in progress, which then reports
//! [`PollEventKind::Interrupted`] with no active devices.

use crate::actor::{self, respond, Reply};
use crate::hw::{PollWaker, SharedNode, WaitOutcome};
use hal_core::{HalError, HalResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// How a poll request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEventKind {
    /// At least one device has a buffer to dequeue
    Ready,
    /// Nothing became ready before the timeout.
    Timeout,
    /// The wait was cut short by `flush`
    Interrupted,
    /// Nothing to poll
    Error,
}

/// Outcome of one poll request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollEvent {
    /// Request the poll was issued for.
    pub request_id: i64,
    /// How the poll ended.
    pub kind: PollEventKind,
    /// Indices (into the `init` device list) of devices with data
    pub active_devices: Vec<usize>,
    /// Devices that were polled.
    pub polled_devices: usize,
}

/// Receives the outcome of every poll request.
pub trait PollEventListener: Send + Sync {
    /// Called on the poller thread once per poll.
    fn notify_poll_event(&self, event: PollEvent) -> HalResult<()>;
}

enum PollerMsg {
    Init {
        devices: Vec<SharedNode>,
        listener: Arc<dyn PollEventListener>,
        reply: Reply<()>,
    },
    Poll {
        request_id: i64,
        timeout: Duration,
        epoch: u64,
    },
    Flush {
        reply: Option<Reply<()>>,
    },
    Exit,
}

/// Handle to a dedicated polling thread.
pub struct PollerThread {
    name: String,
    tx: mpsc::Sender<PollerMsg>,
    waker: Arc<PollWaker>,
    epoch: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PollerThread {
    /// Start the polling thread; requests are queued up to `queue_depth`.
    pub fn spawn(name: &str, waker: Arc<PollWaker>, queue_depth: usize) -> HalResult<Self> {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let epoch = Arc::new(AtomicU64::new(0));
        let worker = PollerWorker {
            waker: Arc::clone(&waker),
            epoch: Arc::clone(&epoch),
            devices: Vec::new(),
            listener: None,
        };
        let handle = std::thread::Builder::new()
            .name(format!("poller-{name}"))
            .spawn(move || worker.run(rx))?;
        Ok(Self {
            name: name.to_string(),
            tx,
            waker,
            epoch,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Set the devices to poll and where to report.
    pub async fn init(
        &self,
        devices: Vec<SharedNode>,
        listener: Arc<dyn PollEventListener>,
    ) -> HalResult<()> {
        actor::call(&self.tx, "poller", |reply| PollerMsg::Init {
            devices,
            listener,
            reply,
        })
        .await
    }

    /// Queue a poll on all devices. Never blocks the caller.
    pub fn poll_request(&self, request_id: i64, timeout: Duration) -> HalResult<()> {
        let epoch = self.epoch.load(Ordering::Acquire);
        actor::post(
            &self.tx,
            "poller",
            PollerMsg::Poll {
                request_id,
                timeout,
                epoch,
            },
        )
    }

    /// Discard queued polls and interrupt the current one.
    ///
    /// With `sync` the call returns once the poller thread has acknowledged.
    pub async fn flush(&self, sync: bool) -> HalResult<()> {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.waker.interrupt();
        debug!(poller = %self.name, sync, "flush");
        if sync {
            actor::call(&self.tx, "poller", |reply| PollerMsg::Flush { reply: Some(reply) }).await
        } else {
            actor::post(&self.tx, "poller", PollerMsg::Flush { reply: None })
        }
    }

    /// Stop the thread and wait for it to exit.
    pub async fn shutdown(&self) -> HalResult<()> {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(PollerMsg::Exit).await.is_err() {
            debug!(poller = %self.name, "poller already stopped");
        }
        self.waker.interrupt();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|e| HalError::UnknownError(format!("poller join: {e}")))?
                .map_err(|_| HalError::UnknownError("poller thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for PollerThread {
    fn drop(&mut self) {
        if self.handle.lock().is_some() {
            let _ = self.tx.try_send(PollerMsg::Exit);
            self.waker.interrupt();
        }
    }
}

struct PollerWorker {
    waker: Arc<PollWaker>,
    epoch: Arc<AtomicU64>,
    devices: Vec<SharedNode>,
    listener: Option<Arc<dyn PollEventListener>>,
}

impl PollerWorker {
    fn run(mut self, mut rx: mpsc::Receiver<PollerMsg>) {
        while let Some(msg) = rx.blocking_recv() {
            match msg {
                PollerMsg::Init {
                    devices,
                    listener,
                    reply,
                } => {
                    trace!(devices = devices.len(), "poller init");
                    self.devices = devices;
                    self.listener = Some(listener);
                    respond(reply, Ok(()));
                }
                PollerMsg::Poll {
                    request_id,
                    timeout,
                    epoch,
                } => {
                    if epoch != self.epoch.load(Ordering::Acquire) {
                        trace!(request_id, "discarding flushed poll request");
                        continue;
                    }
                    self.poll(request_id, timeout);
                }
                PollerMsg::Flush { reply } => {
                    self.waker.clear_interrupt();
                    if let Some(reply) = reply {
                        respond(reply, Ok(()));
                    }
                }
                PollerMsg::Exit => break,
            }
        }
        debug!("poller thread exiting");
    }

    fn ready_devices(&self) -> Vec<usize> {
        self.devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.lock().is_ready())
            .map(|(i, _)| i)
            .collect()
    }

    fn poll(&self, request_id: i64, timeout: Duration) {
        let Some(listener) = self.listener.as_ref() else {
            warn!(request_id, "poll request before init");
            return;
        };

        let (kind, active_devices) = if self.devices.is_empty() {
            error!(request_id, "no devices to poll");
            (PollEventKind::Error, Vec::new())
        } else {
            match self.waker.wait_until(timeout, || !self.ready_devices().is_empty()) {
                WaitOutcome::Ready => (PollEventKind::Ready, self.ready_devices()),
                WaitOutcome::Interrupted => (PollEventKind::Interrupted, Vec::new()),
                WaitOutcome::Timeout => (PollEventKind::Timeout, Vec::new()),
            }
        };

        let event = PollEvent {
            request_id,
            kind,
            active_devices,
            polled_devices: self.devices.len(),
        };
        if let Err(e) = listener.notify_poll_event(event) {
            warn!(request_id, error = %e, "poll listener failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{CameraBuffer, PixelFormat};
    use crate::hw::{share_node, FrameFormat, FrameTiming, SensorBackend, SimulatedBackend};
    use hal_core::config::CameraCapabilities;

    struct Forward(mpsc::UnboundedSender<PollEvent>);

    impl PollEventListener for Forward {
        fn notify_poll_event(&self, event: PollEvent) -> HalResult<()> {
            self.0
                .send(event)
                .map_err(|_| HalError::UnknownError("test receiver gone".into()))
        }
    }

    fn streaming_node(backend: &SimulatedBackend) -> SharedNode {
        let mut node = backend.open_node("main").unwrap();
        node.set_format(&FrameFormat {
            width: 4,
            height: 4,
            format: PixelFormat::RawSensor,
        })
        .unwrap();
        node.request_buffers(2).unwrap();
        node.queue_buffer(0, &CameraBuffer::allocate_internal(4, 4, PixelFormat::RawSensor))
            .unwrap();
        node.stream_on().unwrap();
        share_node(node)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ready_and_timeout() {
        let backend = SimulatedBackend::new(&CameraCapabilities::default(), FrameTiming::Manual);
        let poller = PollerThread::spawn("test", backend.waker(), 8).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        poller
            .init(vec![streaming_node(&backend)], Arc::new(Forward(tx)))
            .await
            .unwrap();

        poller.poll_request(1, Duration::from_millis(20)).unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, PollEventKind::Timeout);

        poller.poll_request(2, Duration::from_secs(5)).unwrap();
        backend.complete_next("main");
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, PollEventKind::Ready);
        assert_eq!(event.request_id, 2);
        assert_eq!(event.active_devices, vec![0]);

        poller.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flush_interrupts_blocked_poll() {
        let backend = SimulatedBackend::new(&CameraCapabilities::default(), FrameTiming::Manual);
        let poller = PollerThread::spawn("test", backend.waker(), 8).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        poller
            .init(vec![streaming_node(&backend)], Arc::new(Forward(tx)))
            .await
            .unwrap();

        poller.poll_request(7, Duration::from_secs(30)).unwrap();
        poller.poll_request(8, Duration::from_secs(30)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        poller.flush(true).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.request_id, 7);
        assert_eq!(event.kind, PollEventKind::Interrupted);
        assert!(event.active_devices.is_empty());
        // The queued request 8 was discarded.
        assert!(rx.try_recv().is_err());

        // Polling works again after the flush.
        poller.poll_request(9, Duration::from_secs(5)).unwrap();
        backend.complete_next("main");
        let event = rx.recv().await.unwrap();
        assert_eq!((event.request_id, event.kind), (9, PollEventKind::Ready));

        poller.shutdown().await.unwrap();
    }
}

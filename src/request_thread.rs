//! Camera device front end: stream configuration and request admission.
//!
//! [`CameraDevice`] is what the framework talks to. One actor serialises
//! configuration, request submission and request recycling. A request the
//! hardware cannot take yet (`WouldBlock`) is held together with the caller's
//! reply and retried each time a request completes, so the caller stays
//! blocked exactly as long as the pipeline is full.

use crate::actor::{self, respond, Reply};
use crate::callbacks::SharedCallbacks;
use crate::camera_hw::{CameraHw, RequestTemplate};
use crate::request::{request_pool, CaptureRequest, RequestCallback, RequestPool, SharedRequest};
use crate::result_processor::{RequestRecycler, ResultProcessor};
use crate::stream::{Camera3Stream, CameraStream, StreamType};
use hal_core::config::CameraCapabilities;
use hal_core::{CameraMetadata, HalError, HalResult};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const ACTOR: &str = "request_thread";

/// Requests that may be inside the HAL at once, blocked one included.
pub const MAX_REQUEST_IN_PROCESS_NUM: usize = 10;

/// Upper bound on how long `flush` waits for in-flight requests.
pub const FLUSH_TIMEOUT: Duration = Duration::from_millis(1000);

enum DeviceMsg {
    ConfigureStreams {
        streams: Vec<Arc<Camera3Stream>>,
        reply: Reply<()>,
    },
    DefaultSettings {
        template: RequestTemplate,
        reply: Reply<CameraMetadata>,
    },
    ProcessCaptureRequest {
        raw: CaptureRequest,
        reply: Reply<()>,
    },
    RequestDone {
        request: SharedRequest,
    },
    Flush {
        reply: Reply<()>,
    },
    Dump {
        reply: Reply<String>,
    },
    Close {
        reply: Reply<()>,
    },
}

struct RecycleForwarder {
    tx: mpsc::Sender<DeviceMsg>,
}

impl RequestRecycler for RecycleForwarder {
    fn request_done(&self, request: SharedRequest) {
        let id = request.id();
        if let Err(e) = actor::post(&self.tx, ACTOR, DeviceMsg::RequestDone { request }) {
            error!(request_id = id, error = %e, "request lost on the way back");
        }
    }
}

/// Handle to an open camera.
#[derive(Clone)]
pub struct CameraDevice {
    camera_id: i32,
    tx: mpsc::Sender<DeviceMsg>,
    outstanding: watch::Receiver<usize>,
}

impl CameraDevice {
    /// Open the camera: initialise the hardware and start the request and
    /// result actors.
    pub async fn open(
        caps: Arc<CameraCapabilities>,
        hw: Arc<dyn CameraHw>,
        callbacks: SharedCallbacks,
        queue_depth: usize,
    ) -> HalResult<Self> {
        hw.init().await?;

        let queue_depth = actor::queue_depth_for(&caps, queue_depth);
        let (tx, rx) = mpsc::channel(queue_depth);
        let recycler = Arc::new(RecycleForwarder { tx: tx.clone() });
        let results = ResultProcessor::spawn(caps.id, callbacks, recycler, queue_depth);
        let (outstanding_tx, outstanding) = watch::channel(0);

        let actor = RequestThread {
            camera_id: caps.id,
            caps: Arc::clone(&caps),
            hw,
            results,
            pool: request_pool(MAX_REQUEST_IN_PROCESS_NUM),
            streams: Vec::new(),
            next_stream_seq: 0,
            last_settings: None,
            last_frame_number: None,
            in_flight: 0,
            blocked: None,
            outstanding: outstanding_tx,
        };
        actor::spawn_actor(ACTOR, caps.id, actor.run(rx));
        info!(camera_id = caps.id, "camera device open");
        Ok(Self {
            camera_id: caps.id,
            tx,
            outstanding,
        })
    }

    /// Id of the camera this device drives.
    pub fn camera_id(&self) -> i32 {
        self.camera_id
    }

    /// Replace the stream configuration. Fails while requests are in flight.
    pub async fn configure_streams(&self, streams: Vec<Arc<Camera3Stream>>) -> HalResult<()> {
        actor::call(&self.tx, ACTOR, |reply| DeviceMsg::ConfigureStreams { streams, reply }).await
    }

    /// Default settings for `template`.
    pub async fn construct_default_request_settings(
        &self,
        template: RequestTemplate,
    ) -> HalResult<CameraMetadata> {
        actor::call(&self.tx, ACTOR, |reply| DeviceMsg::DefaultSettings { template, reply }).await
    }

    /// Submit a request. Returns once the pipeline accepted it, which may
    /// take until an earlier request completes.
    pub async fn process_capture_request(&self, raw: CaptureRequest) -> HalResult<()> {
        actor::call(&self.tx, ACTOR, |reply| DeviceMsg::ProcessCaptureRequest { raw, reply }).await
    }

    /// Flush the pipeline and wait for every accepted request to come back.
    pub async fn flush(&self) -> HalResult<()> {
        actor::call(&self.tx, ACTOR, |reply| DeviceMsg::Flush { reply }).await?;
        let mut outstanding = self.outstanding.clone();
        let drained = tokio::time::timeout(FLUSH_TIMEOUT, outstanding.wait_for(|n| *n == 0))
            .await
            .map(|r| r.map(|_| ()));
        match drained {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(HalError::NoInit),
            Err(_) => {
                let left = *self.outstanding.borrow();
                error!(camera_id = self.camera_id, left, "flush did not drain in time");
                Err(HalError::NoDevice(format!("{left} requests still in flight after flush")))
            }
        }
    }

    /// Requests accepted (or blocked) and not yet returned.
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Human-readable state of the whole pipeline.
    pub async fn dump(&self) -> HalResult<String> {
        actor::call(&self.tx, ACTOR, |reply| DeviceMsg::Dump { reply }).await
    }

    /// Shut the hardware down and stop the device actor.
    pub async fn close(&self) -> HalResult<()> {
        actor::call(&self.tx, ACTOR, |reply| DeviceMsg::Close { reply }).await
    }
}

struct BlockedRequest {
    request: SharedRequest,
    reply: Reply<()>,
}

struct RequestThread {
    camera_id: i32,
    caps: Arc<CameraCapabilities>,
    hw: Arc<dyn CameraHw>,
    results: ResultProcessor,
    pool: Arc<RequestPool>,
    /// Active internal streams, in configuration order
    streams: Vec<Arc<CameraStream>>,
    next_stream_seq: u32,
    last_settings: Option<CameraMetadata>,
    last_frame_number: Option<u32>,
    in_flight: usize,
    blocked: Option<BlockedRequest>,
    outstanding: watch::Sender<usize>,
}

impl RequestThread {
    async fn run(mut self, mut rx: mpsc::Receiver<DeviceMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                DeviceMsg::ConfigureStreams { streams, reply } => {
                    let result = self.handle_configure_streams(streams).await;
                    respond(reply, result);
                }
                DeviceMsg::DefaultSettings { template, reply } => {
                    respond(reply, self.hw.default_request_settings(template));
                }
                DeviceMsg::ProcessCaptureRequest { raw, reply } => {
                    self.handle_process_capture_request(raw, reply).await;
                }
                DeviceMsg::RequestDone { request } => self.handle_request_done(request).await,
                DeviceMsg::Flush { reply } => {
                    let result = self.hw.flush().await;
                    respond(reply, result);
                }
                DeviceMsg::Dump { reply } => {
                    let result = self.dump().await;
                    respond(reply, result);
                }
                DeviceMsg::Close { reply } => {
                    if let Some(blocked) = self.blocked.take() {
                        respond(blocked.reply, Err(HalError::NoInit));
                    }
                    let mut result = self.hw.shutdown().await;
                    if let Err(e) = self.results.shutdown().await {
                        warn!(error = %e, "result processor shutdown failed");
                        result = result.and(Err(e));
                    }
                    for stream in self.streams.drain(..) {
                        stream.bind_producer(None);
                    }
                    respond(reply, result);
                    break;
                }
            }
        }
        debug!(camera_id = self.camera_id, "request thread stopped");
    }

    fn publish_outstanding(&self) {
        let n = self.in_flight + usize::from(self.blocked.is_some());
        self.outstanding.send_replace(n);
    }

    async fn handle_configure_streams(&mut self, streams: Vec<Arc<Camera3Stream>>) -> HalResult<()> {
        if self.in_flight > 0 || self.blocked.is_some() {
            error!(in_flight = self.in_flight, "configure streams with requests in flight");
            return Err(HalError::BadValue("requests still in flight".into()));
        }
        validate_stream_list(&streams)?;

        for stream in &self.streams {
            stream.deactivate();
        }

        let mut active = Vec::with_capacity(streams.len());
        for descriptor in &streams {
            descriptor.set_max_buffers(MAX_REQUEST_IN_PROCESS_NUM as u32);
            let stream = match descriptor.bound() {
                Some(existing) if self.streams.iter().any(|s| Arc::ptr_eq(s, &existing)) => existing,
                _ => {
                    let stream = CameraStream::new(
                        self.next_stream_seq,
                        descriptor,
                        MAX_REQUEST_IN_PROCESS_NUM as u32,
                    );
                    self.next_stream_seq += 1;
                    descriptor.bind(Some(Arc::clone(&stream)));
                    stream
                }
            };
            stream.activate();
            if stream.buffers_in_hal() != 0 {
                error!(stream = stream.seq_no(), count = stream.buffers_in_hal(), "buffers still in HAL");
            }
            active.push(stream);
        }

        for old in &self.streams {
            if !old.is_active() {
                debug!(stream = old.seq_no(), "dropping unused stream");
                old.bind_producer(None);
                old.clear_pending();
            }
        }
        self.streams = active;

        self.hw.config_streams(&self.streams).await?;
        self.hw.bind_streams(&self.streams).await?;
        info!(
            camera_id = self.camera_id,
            streams = self.streams.len(),
            "streams configured"
        );
        Ok(())
    }

    async fn handle_process_capture_request(&mut self, raw: CaptureRequest, reply: Reply<()>) {
        if self.blocked.is_some() {
            error!(
                frame_number = raw.frame_number,
                "request while another one is blocked, this should never happen"
            );
            respond(reply, Err(HalError::WouldBlock));
            return;
        }
        let request = match self.prepare_request(&raw) {
            Ok(r) => r,
            Err(e) => {
                respond(reply, Err(e));
                return;
            }
        };
        self.last_frame_number = Some(raw.frame_number);

        if let Err(e) = self.results.register_request(&request) {
            error!(request_id = request.id(), error = %e, "failed to register request");
            request.release_unadmitted();
            respond(reply, Err(e));
            return;
        }

        match self.capture_request(&request).await {
            Ok(()) => respond(reply, Ok(())),
            Err(HalError::WouldBlock) => {
                debug!(request_id = request.id(), "pipeline full, blocking caller");
                self.blocked = Some(BlockedRequest { request, reply });
                self.publish_outstanding();
            }
            Err(e) => {
                error!(request_id = request.id(), error = %e, "request not admitted");
                self.reject(&request);
                respond(reply, Err(e));
            }
        }
    }

    /// Undo the registration and buffer accounting of a request the
    /// hardware refused. The pool slot frees once the result processor
    /// drops its handle.
    fn reject(&self, request: &SharedRequest) {
        if let Err(e) = self.results.unregister_request(request) {
            error!(request_id = request.id(), error = %e, "failed to unregister request");
        }
        request.release_unadmitted();
    }

    fn prepare_request(&mut self, raw: &CaptureRequest) -> HalResult<SharedRequest> {
        if let Some(last) = self.last_frame_number {
            if raw.frame_number <= last {
                error!(
                    frame_number = raw.frame_number,
                    last, "frame number did not increase"
                );
                return Err(HalError::BadValue(format!(
                    "frame number {} after {last}",
                    raw.frame_number
                )));
            }
        }
        if raw.input_buffer.is_some() && !self.hw.supports_reprocessing() {
            return Err(HalError::BadValue("reprocessing is not supported".into()));
        }
        for (i, a) in raw.output_buffers.iter().enumerate() {
            if raw.output_buffers[i + 1..].iter().any(|b| Arc::ptr_eq(&a.stream, &b.stream)) {
                return Err(HalError::BadValue("two buffers for one stream".into()));
            }
        }

        let settings = match (&raw.settings, &self.last_settings) {
            (Some(s), _) => s.clone(),
            (None, Some(last)) => last.clone(),
            (None, None) => {
                error!(frame_number = raw.frame_number, "no settings for the first request");
                return Err(HalError::BadValue("first request has no settings".into()));
            }
        };

        let Some(mut request) = self.pool.try_acquire() else {
            error!(frame_number = raw.frame_number, "request pool exhausted");
            return Err(HalError::NoMemory("request pool exhausted".into()));
        };
        let callback: Arc<dyn RequestCallback> = Arc::new(self.results.clone());
        request.init(raw, Some(callback), settings.clone(), &self.caps)?;
        self.last_settings = Some(settings);
        Ok(SharedRequest::new(request))
    }

    /// Admit into the hardware, then stage buffers on the streams.
    ///
    /// A buffer that cannot be staged aborts the request; it then completes
    /// through the error path like any other failed request.
    async fn capture_request(&mut self, request: &SharedRequest) -> HalResult<()> {
        self.hw.process_request(request.clone(), self.in_flight).await?;
        self.in_flight += 1;
        self.publish_outstanding();
        for stream in request.output_streams() {
            if let Err(e) = stream.process_request(request) {
                error!(
                    request_id = request.id(),
                    stream = stream.seq_no(),
                    error = %e,
                    "failed to stage buffer, aborting request"
                );
                if let Err(e) = self.hw.abort_request(request.id()).await {
                    error!(request_id = request.id(), error = %e, "abort not delivered");
                }
                break;
            }
        }
        Ok(())
    }

    async fn handle_request_done(&mut self, request: SharedRequest) {
        let id = request.id();
        drop(request);
        self.in_flight = self.in_flight.saturating_sub(1);
        debug!(request_id = id, in_flight = self.in_flight, "request done");

        if let Some(blocked) = self.blocked.take() {
            match self.capture_request(&blocked.request).await {
                Ok(()) => respond(blocked.reply, Ok(())),
                Err(HalError::WouldBlock) => self.blocked = Some(blocked),
                Err(e) => {
                    error!(request_id = blocked.request.id(), error = %e, "blocked request failed");
                    self.reject(&blocked.request);
                    respond(blocked.reply, Err(e));
                }
            }
        }
        self.publish_outstanding();
    }

    async fn dump(&self) -> HalResult<String> {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "RequestThread camera {}: requests in hal {}, blocked {}, pool {}/{}",
            self.camera_id,
            self.in_flight,
            usize::from(self.blocked.is_some()),
            self.pool.in_use(),
            self.pool.capacity()
        );
        for stream in &self.streams {
            let _ = writeln!(
                out,
                "  stream {} {}x{} {:?} in hal {}",
                stream.seq_no(),
                stream.width(),
                stream.height(),
                stream.format(),
                stream.buffers_in_hal()
            );
        }
        out.push_str(&self.hw.dump().await?);
        Ok(out)
    }
}

/// At most one input stream, at least one output stream.
fn validate_stream_list(streams: &[Arc<Camera3Stream>]) -> HalResult<()> {
    if streams.is_empty() {
        return Err(HalError::BadValue("empty stream list".into()));
    }
    let inputs = streams
        .iter()
        .filter(|s| matches!(s.stream_type, StreamType::Input | StreamType::Bidirectional))
        .count();
    let outputs = streams
        .iter()
        .filter(|s| matches!(s.stream_type, StreamType::Output | StreamType::Bidirectional))
        .count();
    if inputs > 1 {
        error!(inputs, "too many input streams");
        return Err(HalError::BadValue(format!("{inputs} input streams")));
    }
    if outputs == 0 {
        error!("no output streams");
        return Err(HalError::BadValue("no output stream".into()));
    }
    for s in streams {
        if s.width == 0 || s.height == 0 {
            return Err(HalError::BadValue(format!(
                "stream of size {}x{}",
                s.width, s.height
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PixelFormat;

    #[test]
    fn test_stream_list_validation() {
        let out = Camera3Stream::output(640, 480, PixelFormat::Ycbcr420);
        let input = Camera3Stream::new(StreamType::Input, 640, 480, PixelFormat::Ycbcr420, 0);
        let input2 = Camera3Stream::new(StreamType::Input, 320, 240, PixelFormat::Ycbcr420, 0);

        assert!(validate_stream_list(&[]).is_err());
        assert!(validate_stream_list(&[Arc::clone(&out)]).is_ok());
        assert!(validate_stream_list(&[Arc::clone(&out), Arc::clone(&input)]).is_ok());
        assert!(validate_stream_list(&[Arc::clone(&input)]).is_err());
        assert!(validate_stream_list(&[out, input, input2]).is_err());
    }
}

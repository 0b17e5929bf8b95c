//! Capture unit: owns the sensor and ISP video nodes and pipelines captures
//! through them.
//!
//! A single actor task owns all hardware state. Callers post messages; the
//! configuration-style operations (`init`, `configure`, `flush`, `dump`,
//! `shutdown`) wait for a reply. Blocking waits on the nodes happen on the
//! [`PollerThread`], which posts poll events back into the mailbox.
//!
//! # Capture flow
//!
//! 1. Each request buffer arrives through [`StreamProducer::queue_buffer`]
//!    and is staged.
//! 2. The control unit posts `do_capture` once 3A ran. The capture is parked
//!    until every output buffer of the request is staged, then dispatched in
//!    FIFO order.
//! 3. On the first dispatch after configuration the unit queues
//!    `sensor_setting_delay` skip captures on the primary node, tagged with
//!    the ids just before the first request, and turns streaming on.
//! 4. Dequeued buffers are tagged with their request id and published as
//!    `Shutter` (first buffer of a request), `NewStatistics` and `NewFrame`.
//!
//! Statistics are tagged with the request id of the frame they were measured
//! on; skip frames carry the ids `first - D .. first`. Each request publishes
//! them once, from the highest priority node it has a buffer on. A frame
//! lost to a failed dequeue comes back as an error buffer and its statistics
//! are reported as `StatisticsLost`.

use crate::actor::{self, respond, Reply};
use crate::buffer::{BufferStatus, CameraBuffer};
use crate::events::{CaptureEvent, CaptureEventKind, CaptureListener, EventBus};
use crate::hw::{share_node, DequeuedFrame, FrameFormat, SensorBackend, SharedNode, VideoNode};
use crate::poller::{PollEvent, PollEventKind, PollEventListener, PollerThread};
use crate::request::SharedRequest;
use crate::stream::{CameraStream, StreamProducer};
use crate::three_a::{CaptureSettings, SensorDescriptor};
use hal_core::config::CameraCapabilities;
use hal_core::{HalError, HalResult};
use hal_pool::{ItemPool, Loaned};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

const ACTOR: &str = "capture_unit";

/// Fixed mapping between request ids and the hardware capture sequence for
/// one configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSequence {
    /// Id of the first request captured after configuration
    pub base: i64,
    /// Sensor setting delay (number of skip captures)
    pub delay: i64,
}

impl CaptureSequence {
    /// Sequence for a configuration whose first request is `first_request_id`.
    pub fn new(first_request_id: i64, delay: u32) -> Self {
        Self {
            base: first_request_id,
            delay: i64::from(delay),
        }
    }

    /// Hardware sequence of the capture for `request_id`.
    pub fn to_internal(&self, request_id: i64) -> i64 {
        request_id - self.base + self.delay
    }

    /// Request id of hardware sequence `sequence`.
    pub fn to_request(&self, sequence: i64) -> i64 {
        sequence + self.base - self.delay
    }

    /// Request ids used to tag the skip captures, in queue order.
    pub fn skip_ids(&self) -> impl Iterator<Item = i64> {
        let (base, delay) = (self.base, self.delay);
        (0..delay).map(move |i| base - delay + i)
    }
}

/// Pooled record of one hardware buffer slot. The slot index is the
/// hardware buffer index.
#[derive(Debug, Default)]
pub struct CaptureBuffer {
    /// Buffer queued in the slot
    pub buffer: Option<CameraBuffer>,
    /// Request (or skip id) the slot was queued for
    pub request_id: Option<i64>,
}

impl CaptureBuffer {
    fn reset(&mut self) {
        self.buffer = None;
        self.request_id = None;
    }
}

/// A request buffer returned by the hardware.
///
/// Holds the capture slot; the slot goes back to the pool when the last
/// reference to the frame is dropped.
pub struct CapturedFrame {
    /// Request the buffer belongs to
    pub request: SharedRequest,
    /// The framework buffer, status already set
    pub buffer: CameraBuffer,
    /// Stream that owns the buffer
    pub stream: Arc<CameraStream>,
    /// Video node the buffer was captured on
    pub node: String,
    /// Hardware capture sequence
    pub sequence: i64,
    /// Start of exposure, 0 for a lost frame
    pub timestamp_ns: i64,
    slot: Loaned<CaptureBuffer>,
}

impl CapturedFrame {
    /// Id of the owning request.
    pub fn request_id(&self) -> i64 {
        self.request.id()
    }

    /// Hardware buffer index the frame occupied.
    pub fn slot_index(&self) -> usize {
        self.slot.slot_index()
    }
}

impl std::fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedFrame")
            .field("request_id", &self.request.id())
            .field("stream", &self.stream.seq_no())
            .field("node", &self.node)
            .field("sequence", &self.sequence)
            .field("slot", &self.slot.slot_index())
            .finish()
    }
}

/// Lifecycle of the capture unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// No nodes bound
    Unconfigured,
    /// Nodes bound, not streaming
    Configured,
    /// Skip frames queued and streams on
    Streaming,
}

enum CaptureMsg {
    Init {
        reply: Reply<()>,
    },
    Configure {
        streams: Vec<Arc<CameraStream>>,
        reply: Reply<()>,
    },
    StageBuffer {
        buffer: CameraBuffer,
        request: SharedRequest,
    },
    Capture {
        request: SharedRequest,
        settings: CaptureSettings,
        epoch: u64,
    },
    CancelRequest {
        request_id: i64,
    },
    AbortRequest {
        request_id: i64,
    },
    Poll {
        event: PollEvent,
        generation: u64,
    },
    Flush {
        reply: Reply<()>,
    },
    Dump {
        reply: Reply<String>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

struct Shared {
    tx: mpsc::Sender<CaptureMsg>,
    bus: Arc<EventBus>,
    flush_epoch: AtomicU64,
    delay: u32,
}

/// Handle to the capture unit actor.
#[derive(Clone)]
pub struct CaptureUnit {
    shared: Arc<Shared>,
}

impl CaptureUnit {
    /// Create the actor and its poller thread. Must be called inside a
    /// tokio runtime.
    pub fn spawn(
        caps: Arc<CameraCapabilities>,
        backend: Arc<dyn SensorBackend>,
        queue_depth: usize,
    ) -> HalResult<Self> {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let bus = Arc::new(EventBus::new());
        let delay = caps.sensor_setting_delay();
        let poller = PollerThread::spawn(&format!("cam{}", caps.id), backend.waker(), queue_depth)?;
        let shared = Arc::new(Shared {
            tx: tx.clone(),
            bus: Arc::clone(&bus),
            flush_epoch: AtomicU64::new(0),
            delay,
        });
        let actor = CaptureUnitActor {
            camera_id: caps.id,
            depth: caps.pipeline_depth(),
            delay,
            caps,
            backend,
            bus,
            poller,
            tx,
            shared: Arc::clone(&shared),
            state: CaptureState::Unconfigured,
            sensor: None,
            nodes: Vec::new(),
            skip_buffers: Vec::new(),
            generation: 0,
            staged: HashMap::new(),
            parked: VecDeque::new(),
            in_flight: BTreeMap::new(),
            aborted: BTreeSet::new(),
            sequence: None,
            poll_armed: false,
        };
        let camera_id = actor.camera_id;
        actor::spawn_actor(ACTOR, camera_id, actor.run(rx));
        Ok(Self { shared })
    }

    /// Open the sensor. Failures are fatal for the camera.
    pub async fn init(&self) -> HalResult<()> {
        actor::call(&self.shared.tx, ACTOR, |reply| CaptureMsg::Init { reply }).await
    }

    /// Bind one video node per stream and allocate the capture pools.
    pub async fn configure(&self, streams: Vec<Arc<CameraStream>>) -> HalResult<()> {
        actor::call(&self.shared.tx, ACTOR, |reply| CaptureMsg::Configure {
            streams,
            reply,
        })
        .await
    }

    /// Request a capture with the 3A-derived settings. Does not block.
    pub fn do_capture(&self, request: SharedRequest, settings: CaptureSettings) -> HalResult<()> {
        let epoch = self.shared.flush_epoch.load(Ordering::Acquire);
        actor::post(
            &self.shared.tx,
            ACTOR,
            CaptureMsg::Capture {
                request,
                settings,
                epoch,
            },
        )
    }

    /// Forget staged buffers and parked captures of a failed request.
    pub fn cancel_request(&self, request_id: i64) -> HalResult<()> {
        actor::post(&self.shared.tx, ACTOR, CaptureMsg::CancelRequest { request_id })
    }

    /// Give up on a request whose buffers could not all be staged. The
    /// failure is published as `RequestError`.
    pub fn abort_request(&self, request_id: i64) -> HalResult<()> {
        actor::post(&self.shared.tx, ACTOR, CaptureMsg::AbortRequest { request_id })
    }

    /// Drop captures not yet sent to hardware and interrupt the poller.
    /// Buffers already queued to hardware complete normally.
    pub async fn flush(&self) -> HalResult<()> {
        self.shared.flush_epoch.fetch_add(1, Ordering::AcqRel);
        actor::call(&self.shared.tx, ACTOR, |reply| CaptureMsg::Flush { reply }).await
    }

    /// Human-readable state of the unit.
    pub async fn dump(&self) -> HalResult<String> {
        actor::call(&self.shared.tx, ACTOR, |reply| CaptureMsg::Dump { reply }).await
    }

    /// Release the nodes and stop the poller thread.
    pub async fn shutdown(&self) -> HalResult<()> {
        actor::call(&self.shared.tx, ACTOR, |reply| CaptureMsg::Shutdown { reply }).await
    }

    /// Frames between programming exposure/gain and seeing the effect.
    pub fn sensor_setting_delay(&self) -> u32 {
        self.shared.delay
    }

    /// Subscribe to one event kind.
    pub fn attach_listener(
        &self,
        kind: CaptureEventKind,
        listener: Arc<dyn CaptureListener>,
    ) -> HalResult<()> {
        self.shared.bus.attach(kind, listener)
    }

    /// Unsubscribe from one event kind.
    pub fn detach_listener(
        &self,
        kind: CaptureEventKind,
        listener: &Arc<dyn CaptureListener>,
    ) -> HalResult<()> {
        self.shared.bus.detach(kind, listener)
    }

    /// This unit as the producer streams are bound to.
    pub fn producer(&self) -> Arc<dyn StreamProducer> {
        Arc::new(self.clone())
    }
}

impl StreamProducer for CaptureUnit {
    fn queue_buffer(&self, buffer: CameraBuffer, request: SharedRequest) -> HalResult<()> {
        actor::post(&self.shared.tx, ACTOR, CaptureMsg::StageBuffer { buffer, request })
    }

    fn producer_name(&self) -> &str {
        ACTOR
    }
}

struct PollForwarder {
    tx: mpsc::Sender<CaptureMsg>,
    generation: u64,
}

impl PollEventListener for PollForwarder {
    fn notify_poll_event(&self, event: PollEvent) -> HalResult<()> {
        actor::post(
            &self.tx,
            ACTOR,
            CaptureMsg::Poll {
                event,
                generation: self.generation,
            },
        )
    }
}

struct InFlightBuffer {
    slot: Loaned<CaptureBuffer>,
    request: Option<SharedRequest>,
    buffer: CameraBuffer,
    request_id: i64,
}

struct NodeBinding {
    name: String,
    node: SharedNode,
    stream: Arc<CameraStream>,
    pool: Arc<ItemPool<CaptureBuffer>>,
    in_hw: HashMap<usize, InFlightBuffer>,
}

struct PendingCapture {
    request: SharedRequest,
    settings: CaptureSettings,
}

#[derive(Debug)]
struct RequestProgress {
    remaining: usize,
    shutter_sent: bool,
    /// Node whose frame carries the request's statistics
    stats_node: usize,
    stats_sent: bool,
}

impl RequestProgress {
    /// Whether the frame from `node_index` is the one to publish statistics
    /// for. Marks them sent.
    fn take_stats_turn(&mut self, node_index: usize) -> bool {
        let turn = node_index == self.stats_node && !self.stats_sent;
        self.stats_sent |= turn;
        turn
    }
}

struct CaptureUnitActor {
    camera_id: i32,
    caps: Arc<CameraCapabilities>,
    depth: usize,
    delay: u32,
    backend: Arc<dyn SensorBackend>,
    bus: Arc<EventBus>,
    poller: PollerThread,
    tx: mpsc::Sender<CaptureMsg>,
    shared: Arc<Shared>,
    state: CaptureState,
    sensor: Option<SensorDescriptor>,
    /// Bound nodes, primary first
    nodes: Vec<NodeBinding>,
    skip_buffers: Vec<CameraBuffer>,
    /// Bumped on every configuration; stale poll events are ignored
    generation: u64,
    staged: HashMap<i64, Vec<CameraBuffer>>,
    parked: VecDeque<PendingCapture>,
    in_flight: BTreeMap<i64, RequestProgress>,
    /// Aborted requests whose capture may still be on its way
    aborted: BTreeSet<i64>,
    sequence: Option<CaptureSequence>,
    poll_armed: bool,
}

impl CaptureUnitActor {
    async fn run(mut self, mut rx: mpsc::Receiver<CaptureMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                CaptureMsg::Init { reply } => respond(reply, self.handle_init()),
                CaptureMsg::Configure { streams, reply } => {
                    let result = self.handle_configure(streams).await;
                    respond(reply, result);
                }
                CaptureMsg::StageBuffer { buffer, request } => {
                    self.handle_stage_buffer(buffer, request);
                }
                CaptureMsg::Capture {
                    request,
                    settings,
                    epoch,
                } => self.handle_capture(request, settings, epoch),
                CaptureMsg::CancelRequest { request_id } => self.handle_cancel(request_id),
                CaptureMsg::AbortRequest { request_id } => self.handle_abort(request_id),
                CaptureMsg::Poll { event, generation } => self.handle_poll_event(event, generation),
                CaptureMsg::Flush { reply } => {
                    let result = self.handle_flush().await;
                    respond(reply, result);
                }
                CaptureMsg::Dump { reply } => respond(reply, Ok(self.dump())),
                CaptureMsg::Shutdown { reply } => {
                    let result = self.handle_shutdown().await;
                    respond(reply, result);
                    break;
                }
            }
        }
        debug!(camera_id = self.camera_id, "capture unit stopped");
    }

    fn handle_init(&mut self) -> HalResult<()> {
        let sensor = self.backend.open_sensor().map_err(|e| {
            error!(camera_id = self.camera_id, error = %e, "failed to open sensor");
            e
        })?;
        info!(
            camera_id = self.camera_id,
            sensor = %self.caps.sensor_name,
            delay = self.delay,
            "sensor opened"
        );
        self.bus
            .notify(&CaptureEvent::NewSensorDescriptor(Arc::new(sensor.clone())));
        self.sensor = Some(sensor);
        Ok(())
    }

    fn stop_streaming(&mut self) {
        for binding in &self.nodes {
            if let Err(e) = binding.node.lock().stream_off() {
                warn!(node = %binding.name, error = %e, "stream off failed");
            }
        }
        if self.state == CaptureState::Streaming {
            self.state = CaptureState::Configured;
        }
    }

    fn release_nodes(&mut self) {
        self.stop_streaming();
        for binding in self.nodes.drain(..) {
            if let Err(e) = binding.node.lock().close() {
                warn!(node = %binding.name, error = %e, "close failed");
            }
        }
        self.skip_buffers.clear();
        self.staged.clear();
        self.parked.clear();
        self.in_flight.clear();
        self.aborted.clear();
        self.sequence = None;
        self.poll_armed = false;
        self.state = CaptureState::Unconfigured;
    }

    async fn handle_configure(&mut self, mut streams: Vec<Arc<CameraStream>>) -> HalResult<()> {
        if self.sensor.is_none() {
            error!(camera_id = self.camera_id, "configure before init");
            return Err(HalError::NoInit);
        }
        self.generation += 1;
        self.release_nodes();

        if streams.is_empty() {
            return Ok(());
        }
        if streams.len() > self.caps.max_output_nodes() {
            error!(
                streams = streams.len(),
                nodes = self.caps.max_output_nodes(),
                "more streams than video nodes"
            );
            return Err(HalError::BadValue(format!(
                "{} streams but only {} video nodes",
                streams.len(),
                self.caps.max_output_nodes()
            )));
        }

        streams.sort_by_key(|s| (std::cmp::Reverse(s.area()), s.seq_no()));
        let slots = self.depth + self.delay as usize;

        if let Err(e) = self.bind_nodes(&streams, slots) {
            self.release_nodes();
            return Err(e);
        }

        let primary = &self.nodes[0].stream;
        self.skip_buffers = (0..self.delay)
            .map(|_| CameraBuffer::allocate_internal(primary.width(), primary.height(), primary.format()))
            .collect();

        let devices = self.nodes.iter().map(|b| Arc::clone(&b.node)).collect();
        let listener = Arc::new(PollForwarder {
            tx: self.tx.clone(),
            generation: self.generation,
        });
        if let Err(e) = self.poller.init(devices, listener).await {
            self.release_nodes();
            return Err(e);
        }

        self.state = CaptureState::Configured;
        info!(
            camera_id = self.camera_id,
            nodes = self.nodes.len(),
            slots,
            primary = %self.nodes[0].name,
            "capture unit configured"
        );
        Ok(())
    }

    fn bind_nodes(&mut self, streams: &[Arc<CameraStream>], slots: usize) -> HalResult<()> {
        for (stream, name) in streams.iter().zip(self.caps.video_nodes.iter()) {
            let mut node = self.backend.open_node(name)?;
            if let Err(e) = setup_node(node.as_mut(), stream, slots) {
                error!(node = %name, error = %e, "node setup failed");
                if let Err(close_err) = node.close() {
                    warn!(node = %name, error = %close_err, "close failed");
                }
                return Err(e);
            }
            debug!(node = %name, stream = stream.seq_no(), slots, "node bound");
            self.nodes.push(NodeBinding {
                name: name.clone(),
                node: share_node(node),
                stream: Arc::clone(stream),
                pool: ItemPool::new_with_reset(slots, CaptureBuffer::default, CaptureBuffer::reset),
                in_hw: HashMap::new(),
            });
        }
        Ok(())
    }

    fn handle_stage_buffer(&mut self, buffer: CameraBuffer, request: SharedRequest) {
        let id = request.id();
        trace!(request_id = id, stream = ?buffer.owner().map(|s| s.seq_no()), "buffer staged");
        self.staged.entry(id).or_default().push(buffer);
        self.dispatch_ready();
    }

    fn fail_request(&self, request_id: i64) {
        self.bus.notify(&CaptureEvent::RequestError { request_id });
    }

    fn handle_capture(&mut self, request: SharedRequest, settings: CaptureSettings, epoch: u64) {
        let id = request.id();
        if self.aborted.remove(&id) {
            debug!(request_id = id, "dropping capture of aborted request");
            self.staged.remove(&id);
            return;
        }
        if epoch != self.shared.flush_epoch.load(Ordering::Acquire) {
            debug!(request_id = id, "dropping capture queued before flush");
            self.staged.remove(&id);
            self.fail_request(id);
            return;
        }
        if self.state == CaptureState::Unconfigured {
            error!(request_id = id, "capture while unconfigured");
            self.staged.remove(&id);
            self.fail_request(id);
            return;
        }
        self.parked.push_back(PendingCapture { request, settings });
        self.dispatch_ready();
    }

    fn handle_cancel(&mut self, request_id: i64) {
        self.staged.remove(&request_id);
        self.parked.retain(|p| p.request.id() != request_id);
    }

    fn handle_abort(&mut self, request_id: i64) {
        warn!(request_id, "request aborted before dispatch");
        let was_parked = self.parked.iter().any(|p| p.request.id() == request_id);
        self.handle_cancel(request_id);
        if !was_parked {
            self.aborted.insert(request_id);
        }
        self.fail_request(request_id);
        self.dispatch_ready();
    }

    /// Dispatch parked captures, in order, while the head has all its
    /// buffers staged.
    fn dispatch_ready(&mut self) {
        while let Some(head) = self.parked.front() {
            let id = head.request.id();
            let staged = self.staged.get(&id).map_or(0, Vec::len);
            if staged < head.request.number_output_bufs() {
                break;
            }
            let Some(pending) = self.parked.pop_front() else {
                break;
            };
            let buffers = self.staged.remove(&id).unwrap_or_default();
            if let Err(e) = self.dispatch(&pending, buffers) {
                error!(request_id = id, error = %e, "capture failed");
                self.fail_request(id);
            }
        }
    }

    fn binding_index(&self, buffer: &CameraBuffer) -> Option<usize> {
        let owner = buffer.owner()?;
        self.nodes.iter().position(|b| Arc::ptr_eq(&b.stream, owner))
    }

    fn start_streaming(&mut self, first_request_id: i64) -> HalResult<()> {
        let sequence = CaptureSequence::new(first_request_id, self.delay);
        let primary = self
            .nodes
            .first_mut()
            .ok_or_else(|| HalError::NoInit)?;
        for (skip_id, buffer) in sequence.skip_ids().zip(self.skip_buffers.iter()) {
            let Some(mut slot) = primary.pool.try_acquire() else {
                return Err(HalError::NoMemory("no capture slot for skip frame".into()));
            };
            slot.buffer = Some(buffer.clone());
            slot.request_id = Some(skip_id);
            let index = slot.slot_index();
            primary.node.lock().queue_buffer(index, buffer)?;
            trace!(request_id = skip_id, index, "skip capture queued");
            primary.in_hw.insert(
                index,
                InFlightBuffer {
                    slot,
                    request: None,
                    buffer: buffer.clone(),
                    request_id: skip_id,
                },
            );
        }
        for binding in &self.nodes {
            binding.node.lock().stream_on()?;
        }
        self.sequence = Some(sequence);
        self.state = CaptureState::Streaming;
        info!(
            camera_id = self.camera_id,
            first_request_id,
            skip = self.delay,
            "streaming started"
        );
        Ok(())
    }

    fn dispatch(&mut self, pending: &PendingCapture, buffers: Vec<CameraBuffer>) -> HalResult<()> {
        let request = &pending.request;
        let id = request.id();

        let mut targets = Vec::with_capacity(buffers.len());
        for buffer in buffers {
            let Some(index) = self.binding_index(&buffer) else {
                return Err(HalError::BadValue(format!(
                    "request {id} buffer has no bound video node"
                )));
            };
            targets.push((index, buffer));
        }
        for (index, _) in &targets {
            let binding = &self.nodes[*index];
            let needed = targets.iter().filter(|(i, _)| i == index).count();
            if binding.pool.available() < needed {
                error!(
                    request_id = id,
                    node = %binding.name,
                    "capture buffer pool exhausted"
                );
                return Err(HalError::UnknownError("capture buffer pool exhausted".into()));
            }
        }

        if self.state != CaptureState::Streaming {
            if let Err(e) = self.start_streaming(id) {
                error!(camera_id = self.camera_id, error = %e, "failed to start streaming");
                self.stop_streaming();
                return Err(e);
            }
        }

        if let Err(e) = self.backend.apply_sensor_settings(&pending.settings) {
            warn!(request_id = id, error = %e, "failed to apply sensor settings");
        }

        let stats_node = targets.iter().map(|(index, _)| *index).min().unwrap_or(0);
        self.in_flight.insert(
            id,
            RequestProgress {
                remaining: targets.len(),
                shutter_sent: false,
                stats_node,
                stats_sent: false,
            },
        );

        for (index, buffer) in targets {
            let binding = &mut self.nodes[index];
            let Some(mut slot) = binding.pool.try_acquire() else {
                self.in_flight.remove(&id);
                return Err(HalError::UnknownError("capture buffer pool exhausted".into()));
            };
            slot.buffer = Some(buffer.clone());
            slot.request_id = Some(id);
            let hw_index = slot.slot_index();
            if let Err(e) = binding.node.lock().queue_buffer(hw_index, &buffer) {
                error!(request_id = id, node = %binding.name, error = %e, "queue buffer failed");
                self.in_flight.remove(&id);
                return Err(e);
            }
            binding.in_hw.insert(
                hw_index,
                InFlightBuffer {
                    slot,
                    request: Some(request.clone()),
                    buffer,
                    request_id: id,
                },
            );
        }
        debug!(
            request_id = id,
            sequence = self.sequence.map(|s| s.to_internal(id)),
            exposure_us = pending.settings.exposure_time_us,
            "capture dispatched"
        );
        self.arm_poll(id);
        Ok(())
    }

    fn buffers_in_hw(&self) -> usize {
        self.nodes.iter().map(|b| b.in_hw.len()).sum()
    }

    fn arm_poll(&mut self, request_id: i64) {
        if self.poll_armed {
            return;
        }
        let timeout = Duration::from_millis(self.caps.poll_timeout_ms);
        match self.poller.poll_request(request_id, timeout) {
            Ok(()) => self.poll_armed = true,
            Err(e) => error!(request_id, error = %e, "failed to arm poller"),
        }
    }

    fn oldest_in_hw(&self) -> Option<i64> {
        self.nodes
            .iter()
            .flat_map(|b| b.in_hw.values().map(|f| f.request_id))
            .min()
    }

    fn handle_poll_event(&mut self, event: PollEvent, generation: u64) {
        if generation != self.generation {
            debug!(request_id = event.request_id, "ignoring poll event from old configuration");
            return;
        }
        self.poll_armed = false;
        match event.kind {
            PollEventKind::Ready => {
                for index in &event.active_devices {
                    self.drain_node(*index);
                }
            }
            PollEventKind::Timeout => {
                warn!(
                    request_id = event.request_id,
                    in_hw = self.buffers_in_hw(),
                    "poll timed out"
                );
            }
            PollEventKind::Interrupted => {
                debug!(request_id = event.request_id, "poll interrupted");
            }
            PollEventKind::Error => {
                error!(request_id = event.request_id, "poll error");
            }
        }
        if let Some(oldest) = self.oldest_in_hw() {
            self.arm_poll(oldest);
        }
    }

    fn drain_node(&mut self, index: usize) {
        let Some(binding) = self.nodes.get(index) else {
            error!(index, "poll event for unknown device");
            return;
        };
        let node = Arc::clone(&binding.node);
        loop {
            let frame = {
                let mut guard = node.lock();
                if !guard.is_ready() {
                    break;
                }
                guard.dequeue_buffer()
            };
            match frame {
                Ok(frame) => self.handle_frame(index, frame),
                Err(e) => {
                    error!(node = %self.nodes[index].name, error = %e, "dequeue failed");
                    self.handle_lost_frame(index);
                }
            }
        }
    }

    /// Publish statistics for a frame if it is the designated source.
    /// Skip frames always come from the primary node.
    fn publish_statistics(
        &mut self,
        node_index: usize,
        request_id: i64,
        is_skip: bool,
        statistics: Option<crate::three_a::AaaStatistics>,
    ) {
        let turn = if is_skip {
            node_index == 0
        } else {
            self.in_flight
                .get_mut(&request_id)
                .is_some_and(|p| p.take_stats_turn(node_index))
        };
        if !turn {
            return;
        }
        match statistics {
            Some(mut stats) => {
                stats.frame_sequence = request_id;
                self.bus.notify(&CaptureEvent::NewStatistics(Arc::new(stats)));
            }
            None => {
                debug!(request_id, "frame carried no statistics");
                self.bus.notify(&CaptureEvent::StatisticsLost {
                    sequence: request_id,
                });
            }
        }
    }

    fn handle_frame(&mut self, node_index: usize, frame: DequeuedFrame) {
        let binding = &mut self.nodes[node_index];
        let Some(in_flight) = binding.in_hw.remove(&frame.index) else {
            error!(node = %binding.name, index = frame.index, "dequeued unknown buffer index");
            return;
        };
        let request_id = in_flight.request_id;
        let is_skip = in_flight.request.is_none();

        if !is_skip {
            if let Some(progress) = self.in_flight.get_mut(&request_id) {
                if !progress.shutter_sent {
                    progress.shutter_sent = true;
                    self.bus.notify(&CaptureEvent::Shutter {
                        request_id,
                        timestamp_ns: frame.timestamp_ns,
                    });
                }
            }
        }
        self.publish_statistics(node_index, request_id, is_skip, frame.statistics);

        if frame.error {
            warn!(request_id, node = %self.nodes[node_index].name, "frame flagged corrupt");
        }
        self.return_frame(node_index, in_flight, frame.timestamp_ns, frame.bytes_used, frame.error);
    }

    /// A dequeue failed and took the oldest buffer of the node with it.
    /// Hand that buffer back as an error so its request still completes.
    fn handle_lost_frame(&mut self, node_index: usize) {
        let binding = &mut self.nodes[node_index];
        let oldest = binding
            .in_hw
            .iter()
            .min_by_key(|(_, f)| f.request_id)
            .map(|(index, _)| *index);
        let Some(lost) = oldest.and_then(|index| binding.in_hw.remove(&index)) else {
            warn!(node = %binding.name, "dequeue failed with nothing in hardware");
            return;
        };
        let request_id = lost.request_id;
        warn!(request_id, node = %binding.name, "frame lost");
        let is_skip = lost.request.is_none();
        self.publish_statistics(node_index, request_id, is_skip, None);
        self.return_frame(node_index, lost, 0, 0, true);
    }

    /// Return a dequeued (or lost) request buffer and retire the request
    /// once all its buffers are back. Skip frames just free their slot.
    fn return_frame(
        &mut self,
        node_index: usize,
        in_flight: InFlightBuffer,
        timestamp_ns: i64,
        bytes_used: usize,
        failed: bool,
    ) {
        let request_id = in_flight.request_id;
        let sequence = self
            .sequence
            .map_or(request_id, |s| s.to_internal(request_id));
        let Some(request) = in_flight.request else {
            trace!(request_id, sequence, "skip frame done");
            return;
        };
        let binding = &self.nodes[node_index];
        let buffer = in_flight.buffer;
        buffer.set_timestamp_ns(timestamp_ns);
        buffer.set_bytes_used(bytes_used);
        buffer.set_request_id(Some(request_id));
        if failed {
            buffer.set_status(BufferStatus::Error);
        }

        trace!(request_id, sequence, node = %binding.name, "frame done");
        let captured = CapturedFrame {
            request,
            buffer,
            stream: Arc::clone(&binding.stream),
            node: binding.name.clone(),
            sequence,
            timestamp_ns,
            slot: in_flight.slot,
        };
        self.bus.notify(&CaptureEvent::NewFrame(Arc::new(captured)));

        if let Some(progress) = self.in_flight.get_mut(&request_id) {
            progress.remaining = progress.remaining.saturating_sub(1);
            if progress.remaining == 0 {
                self.in_flight.remove(&request_id);
            }
        }
    }

    async fn handle_flush(&mut self) -> HalResult<()> {
        let dropped: Vec<i64> = self.parked.drain(..).map(|p| p.request.id()).collect();
        for id in &dropped {
            self.staged.remove(id);
            self.fail_request(*id);
        }
        debug!(
            camera_id = self.camera_id,
            dropped = dropped.len(),
            in_hw = self.buffers_in_hw(),
            "capture unit flush"
        );
        self.poller.flush(true).await?;
        self.poll_armed = false;
        if let Some(oldest) = self.oldest_in_hw() {
            self.arm_poll(oldest);
        }
        Ok(())
    }

    async fn handle_shutdown(&mut self) -> HalResult<()> {
        self.release_nodes();
        self.poller.shutdown().await
    }

    fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "CaptureUnit camera {}: state {:?}, delay {}, depth {}",
            self.camera_id, self.state, self.delay, self.depth
        );
        if let Some(seq) = self.sequence {
            let _ = writeln!(out, "  first request {}, skip {}", seq.base, seq.delay);
        }
        for binding in &self.nodes {
            let _ = writeln!(
                out,
                "  node {} stream {} in hw {} pool {}/{}",
                binding.name,
                binding.stream.seq_no(),
                binding.in_hw.len(),
                binding.pool.available(),
                binding.pool.capacity()
            );
        }
        let _ = writeln!(
            out,
            "  parked {}, staged {}, in flight {}",
            self.parked.len(),
            self.staged.len(),
            self.in_flight.len()
        );
        out
    }
}

/// Negotiate format and buffer count on a freshly opened node.
fn setup_node(node: &mut dyn VideoNode, stream: &CameraStream, slots: usize) -> HalResult<()> {
    node.set_format(&FrameFormat {
        width: stream.width(),
        height: stream.height(),
        format: stream.format(),
    })?;
    let granted = node.request_buffers(slots)?;
    if granted < slots {
        return Err(HalError::NoMemory(format!(
            "{}: driver granted {granted} of {slots} buffers",
            node.name()
        )));
    }
    Ok(())
}

//! HTTP/2 connection multiplexer.
//!
//! A [`Connection`] owns every stream of one HTTP/2 connection and performs no
//! I/O itself:
//!
//! - [`recv`](Connection::recv) feeds bytes read from the transport,
//! - [`poll_event`](Connection::poll_event) yields what happened,
//! - [`take_pending_send`](Connection::take_pending_send) returns bytes to write.
//!
//! Application calls (`send_headers`, `send_data`, `ping`, ...) only queue
//! work. The flush inside `take_pending_send` is the single write path: it
//! emits control frames first, then serves streams from the priority buckets
//! in round robin, compressing HEADERS at the moment they hit the wire so the
//! HPACK tables on both ends stay in step.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use log::{debug, error, trace, warn};
use rand::Rng;

use crate::config::{Config, Role};
use crate::error::{ErrorCode, H2Error};
use crate::flow::{FlowControl, Push};
use crate::frame::{
    header_block_frames, push_promise_frames, AltService, Frame, FrameDecoder, FrameKind, PrioritySpec,
    CONNECTION_PREFACE, MAX_STREAM_ID,
};
use crate::hpack::{Compressor, Decompressor, Header};
use crate::settings::{Setting, Settings, DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE};
use crate::stream::{
    priority_from_weight, transition, CloseInfo, Direction, Outbound, Stream, StreamKey, StreamState,
    MAX_PRIORITY,
};

/// Something the application should know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The peer opened a stream. Always precedes its first `Headers`.
    StreamOpened { stream: StreamKey, stream_id: u32 },
    /// A complete header block (request, response or trailers)
    Headers {
        stream: StreamKey,
        headers: Vec<Header>,
        end_stream: bool,
    },
    /// DATA payload; zero-length frames are delivered too
    Data {
        stream: StreamKey,
        data: Vec<u8>,
        end_stream: bool,
    },
    /// The peer reset the stream
    Reset { stream: StreamKey, error_code: ErrorCode },
    /// The peer promised a pushed stream
    PushPromise {
        parent: StreamKey,
        promised: StreamKey,
        headers: Vec<Header>,
    },
    /// A stream error was detected; RST_STREAM has been queued
    StreamError { stream: StreamKey, error_code: ErrorCode },
    /// Queued DATA drained below the per-stream buffer limit
    StreamWritable { stream: StreamKey },
    /// The peer's SETTINGS, already applied and acknowledged
    Settings(Vec<Setting>),
    /// The peer acknowledged our oldest outstanding SETTINGS
    SettingsAcknowledged,
    PingAck([u8; 8]),
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Vec<u8>,
    },
    /// The peer shut down with an error code other than NO_ERROR
    PeerError(ErrorCode),
    AltSvc {
        stream_id: u32,
        origin: String,
        field_value: String,
    },
    Origin(Vec<String>),
}

/// Header block being reassembled from HEADERS/PUSH_PROMISE + CONTINUATION.
#[derive(Debug)]
struct PendingBlock {
    stream_id: u32,
    promised_stream_id: Option<u32>,
    end_stream: bool,
    priority: Option<PrioritySpec>,
    block: Vec<u8>,
}

/// Where an inbound frame's stream id points.
#[derive(Debug, Clone, Copy)]
enum Target {
    Known(StreamKey),
    /// Remembered as closed, or one of our own ids that is no longer live
    Closed(CloseInfo),
    /// Peer-initiated id above anything seen so far
    New,
    /// Peer-initiated id at or below the highest seen, never opened or no
    /// longer remembered
    Stale,
    /// Our parity, never opened
    Idle,
}

#[derive(Debug)]
pub struct Connection {
    config: Config,
    /// Our settings, as last acknowledged
    local: Settings,
    /// The peer's settings
    remote: Settings,

    decoder: FrameDecoder,
    compressor: Compressor,
    decompressor: Decompressor,

    streams: HashMap<StreamKey, Stream>,
    by_id: HashMap<u32, StreamKey>,
    /// Priority buckets; lower values are served first
    buckets: BTreeMap<u32, Vec<StreamKey>>,
    next_key: u64,
    next_stream_id: u32,
    last_incoming_id: u32,
    closed: VecDeque<(u32, CloseInfo)>,

    /// Active streams we initiated (bounded by the peer's limit)
    active_local: u32,
    /// Active streams the peer initiated (bounded by ours)
    active_remote: u32,

    /// Connection-level window
    flow: FlowControl,

    control: VecDeque<Frame>,
    pending_acks: VecDeque<Vec<Setting>>,
    pings: HashSet<[u8; 8]>,
    pending_block: Option<PendingBlock>,
    settings_received: bool,

    events: VecDeque<Event>,
    out: Vec<u8>,

    goaway_sent: bool,
    goaway_received: bool,
    failed: bool,
}

impl Connection {
    /// Set up a connection. The client preface (for clients) and our SETTINGS
    /// are queued right away.
    pub fn new(config: Config) -> Self {
        let local = config.settings.clone();

        let mut decoder = FrameDecoder::new(config.role);
        decoder.set_max_frame_size(local.max_frame_size);
        let mut decompressor = Decompressor::new(DEFAULT_HEADER_TABLE_SIZE as usize);
        decompressor.set_max_table_size(local.header_table_size.max(DEFAULT_HEADER_TABLE_SIZE) as usize);

        let mut conn = Self {
            next_stream_id: config.role.first_stream_id(),
            local,
            remote: Settings::default(),
            decoder,
            compressor: Compressor::default(),
            decompressor,
            streams: HashMap::new(),
            by_id: HashMap::new(),
            buckets: BTreeMap::new(),
            next_key: 0,
            last_incoming_id: 0,
            closed: VecDeque::new(),
            active_local: 0,
            active_remote: 0,
            flow: FlowControl::new(DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_INITIAL_WINDOW_SIZE),
            control: VecDeque::new(),
            pending_acks: VecDeque::new(),
            pings: HashSet::new(),
            pending_block: None,
            settings_received: false,
            events: VecDeque::new(),
            out: Vec::new(),
            goaway_sent: false,
            goaway_received: false,
            failed: false,
            config,
        };

        if conn.config.role == Role::Client {
            conn.out.extend_from_slice(CONNECTION_PREFACE);
        }
        let mut initial = conn.local.diff_from_default();
        if conn.config.role == Role::Server {
            // ENABLE_PUSH is a client-only setting
            initial.retain(|s| !matches!(s, Setting::EnablePush(_)));
        }
        conn.send_settings(initial);
        conn
    }

    pub fn client() -> Self {
        Self::new(Config::client())
    }

    pub fn server() -> Self {
        Self::new(Config::server())
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn local_settings(&self) -> &Settings {
        &self.local
    }

    pub fn remote_settings(&self) -> &Settings {
        &self.remote
    }

    // ========================================================================
    // Driving
    // ========================================================================

    /// Feed bytes read from the transport.
    ///
    /// A connection error queues GOAWAY with the error's code and is returned;
    /// the connection accepts no further input afterwards.
    pub fn recv(&mut self, data: &[u8]) -> Result<(), H2Error> {
        if self.failed {
            return Err(H2Error::Closed);
        }
        if self.goaway_received {
            trace!("ignoring {} bytes received after GOAWAY", data.len());
            return Ok(());
        }

        self.decoder.push(data);
        loop {
            let frame = match self.decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => return Err(self.fail(e)),
            };
            if let Err(e) = self.on_frame(frame) {
                return Err(self.fail(e));
            }
            if self.goaway_received {
                break;
            }
        }
        self.reap_closed();
        Ok(())
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Run the flush and return the bytes to write. Returns an empty vector
    /// when there is nothing to send. Output is produced in slices of about
    /// `Config::max_send_buffer`; call again until it comes back empty.
    pub fn take_pending_send(&mut self) -> Vec<u8> {
        self.flush();
        std::mem::take(&mut self.out)
    }

    /// Gracefully shut down: queue GOAWAY and stop sending stream frames.
    /// Calling it again has no effect.
    pub fn close(&mut self, code: ErrorCode) {
        if self.goaway_sent {
            return;
        }
        debug!("closing connection with {} (last stream {})", code, self.last_incoming_id);
        self.goaway_sent = true;
        self.control.push_back(Frame::GoAway {
            last_stream_id: self.last_incoming_id,
            error_code: code,
            debug_data: Vec::new(),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.goaway_sent || self.goaway_received || self.failed
    }

    fn fail(&mut self, err: H2Error) -> H2Error {
        error!("connection error: {}", err);
        self.close(err.code());
        self.failed = true;
        self.pending_block = None;
        err
    }

    // ========================================================================
    // Application API
    // ========================================================================

    /// Create a local stream. Its id is assigned when its first frame is sent.
    pub fn open_stream(&mut self) -> Result<StreamKey, H2Error> {
        if self.is_closed() {
            return Err(H2Error::Closed);
        }
        Ok(self.insert_stream(None))
    }

    pub fn send_headers(&mut self, key: StreamKey, headers: Vec<Header>, end_stream: bool) -> Result<(), H2Error> {
        let stream = self.writable_stream(key)?;
        stream.enqueue(Outbound::Headers { headers, end_stream });
        if end_stream {
            stream.end_queued = true;
        }
        Ok(())
    }

    /// Queue DATA. Returns `false` once the stream's queued DATA reaches
    /// `Config::stream_send_buffer`; an `Event::StreamWritable` follows when it
    /// drains.
    pub fn send_data(&mut self, key: StreamKey, data: Vec<u8>, end_stream: bool) -> Result<bool, H2Error> {
        let limit = self.config.stream_send_buffer;
        let stream = self.writable_stream(key)?;
        stream.enqueue(Outbound::Data { data, end_stream });
        if end_stream {
            stream.end_queued = true;
        }
        let writable = stream.queued_data < limit;
        if !writable {
            stream.wants_writable = true;
        }
        Ok(writable)
    }

    /// End our side of the stream.
    pub fn finish(&mut self, key: StreamKey) -> Result<(), H2Error> {
        if self.goaway_sent || self.failed {
            return Err(H2Error::Closed);
        }
        let stream = self.stream_mut(key)?;
        if stream.state() == StreamState::Closed {
            return Err(H2Error::Internal(format!("stream {:?} is closed", key)));
        }
        stream.finish();
        Ok(())
    }

    /// Cancel a stream with RST_STREAM, discarding its queued frames.
    pub fn reset_stream(&mut self, key: StreamKey, code: ErrorCode) -> Result<(), H2Error> {
        let stream = self.stream_mut(key)?;
        let promised: Vec<StreamKey> = stream
            .queue
            .iter()
            .filter_map(|item| match item {
                Outbound::PushPromise { promised, .. } => Some(*promised),
                _ => None,
            })
            .collect();
        debug!("resetting stream {:?} with {}", stream.id(), code);
        stream.reset(code);
        for key in promised {
            if let Some(stream) = self.streams.get_mut(&key) {
                stream.abandon();
            }
        }
        Ok(())
    }

    /// Send PRIORITY and pin the stream's scheduling priority.
    pub fn set_priority(&mut self, key: StreamKey, spec: PrioritySpec) -> Result<(), H2Error> {
        let stream = self.stream_mut(key)?;
        let old = stream.priority;
        stream.priority = priority_from_weight(spec.effective_weight());
        stream.priority_set_locally = true;
        stream.enqueue(Outbound::Priority(spec));
        let new = stream.priority;
        self.move_bucket(key, old, new);
        Ok(())
    }

    /// Promise a pushed response on `parent` (server only). Returns the
    /// reserved stream, on which the response headers and body are then sent.
    pub fn push_promise(&mut self, parent: StreamKey, headers: Vec<Header>) -> Result<StreamKey, H2Error> {
        if self.config.role != Role::Server {
            return Err(H2Error::Internal("only servers can push".into()));
        }
        if !self.remote.enable_push {
            return Err(H2Error::Internal("peer has disabled server push".into()));
        }
        let parent_priority = self.writable_stream(parent)?.priority;

        let promised = self.insert_stream(None);
        let priority = parent_priority.saturating_add(1).min(MAX_PRIORITY);
        if let Some(stream) = self.streams.get_mut(&promised) {
            stream.awaiting_promise = true;
            stream.priority = priority;
        }
        self.move_bucket(promised, crate::stream::DEFAULT_PRIORITY, priority);

        if let Some(stream) = self.streams.get_mut(&parent) {
            stream.enqueue(Outbound::PushPromise { promised, headers });
        }
        Ok(promised)
    }

    /// Announce new local settings. They take effect locally once acknowledged.
    pub fn update_settings(&mut self, settings: Vec<Setting>) -> Result<(), H2Error> {
        if self.goaway_sent || self.failed {
            return Err(H2Error::Closed);
        }
        if self.config.role == Role::Server && settings.iter().any(|s| matches!(s, Setting::EnablePush(_))) {
            return Err(H2Error::Internal("servers must not send SETTINGS_ENABLE_PUSH".into()));
        }
        self.send_settings(settings);
        Ok(())
    }

    /// Send a PING and return its opaque payload, echoed by `Event::PingAck`.
    pub fn ping(&mut self) -> [u8; 8] {
        let data = rand::rng().random::<u64>().to_be_bytes();
        debug!("sending PING {:02x?}", data);
        self.pings.insert(data);
        self.control.push_back(Frame::Ping { ack: false, data });
        data
    }

    /// Advertise an alternative service for `origin` (server only).
    pub fn send_altsvc(&mut self, origin: &str, service: &AltService) -> Result<(), H2Error> {
        if self.config.role != Role::Server {
            return Err(H2Error::Internal("only servers send ALTSVC".into()));
        }
        if origin.is_empty() {
            return Err(H2Error::Internal("ALTSVC on stream 0 needs an origin".into()));
        }
        self.control.push_back(Frame::AltSvc {
            stream_id: 0,
            origin: origin.to_string(),
            field_value: service.to_field_value(),
        });
        Ok(())
    }

    /// Announce the origins this connection is authoritative for (server only).
    pub fn send_origin(&mut self, origins: Vec<String>) -> Result<(), H2Error> {
        if self.config.role != Role::Server {
            return Err(H2Error::Internal("only servers send ORIGIN".into()));
        }
        self.control.push_back(Frame::Origin { origins });
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn stream_id(&self, key: StreamKey) -> Option<u32> {
        self.streams.get(&key).and_then(|s| s.id())
    }

    /// State of a stream. Streams already cleaned up report `Closed`.
    pub fn stream_state(&self, key: StreamKey) -> Option<StreamState> {
        match self.streams.get(&key) {
            Some(stream) => Some(stream.state()),
            None if key.0 < self.next_key => Some(StreamState::Closed),
            None => None,
        }
    }

    /// Key of the live stream with wire id `stream_id`.
    pub fn stream_key(&self, stream_id: u32) -> Option<StreamKey> {
        self.by_id.get(&stream_id).copied()
    }

    /// Connection-level send window.
    pub fn send_window(&self) -> i64 {
        self.flow.window()
    }

    pub fn stream_send_window(&self, key: StreamKey) -> Option<i64> {
        self.streams.get(&key).map(|s| s.flow.window())
    }

    /// Active streams we initiated.
    pub fn active_streams(&self) -> u32 {
        self.active_local
    }

    // ========================================================================
    // Stream table
    // ========================================================================

    fn insert_stream(&mut self, id: Option<u32>) -> StreamKey {
        let key = StreamKey(self.next_key);
        self.next_key += 1;
        let flow = FlowControl::new(self.remote.initial_window_size, self.local.initial_window_size);
        let stream = Stream::new(key, id, flow);
        if let Some(id) = id {
            self.by_id.insert(id, key);
        }
        self.buckets.entry(stream.priority()).or_default().push(key);
        self.streams.insert(key, stream);
        key
    }

    fn stream_mut(&mut self, key: StreamKey) -> Result<&mut Stream, H2Error> {
        self.streams
            .get_mut(&key)
            .ok_or_else(|| H2Error::Internal(format!("unknown stream {:?}", key)))
    }

    fn writable_stream(&mut self, key: StreamKey) -> Result<&mut Stream, H2Error> {
        if self.goaway_sent || self.failed {
            return Err(H2Error::Closed);
        }
        let stream = self.stream_mut(key)?;
        if !stream.is_writable() {
            return Err(H2Error::Internal(format!("stream {:?} is closed for sending", key)));
        }
        Ok(stream)
    }

    fn move_bucket(&mut self, key: StreamKey, old: u32, new: u32) {
        if old == new {
            return;
        }
        if let Some(bucket) = self.buckets.get_mut(&old) {
            bucket.retain(|k| *k != key);
            if bucket.is_empty() {
                self.buckets.remove(&old);
            }
        }
        self.buckets.entry(new).or_default().push(key);
    }

    fn is_peer_initiated(&self, stream_id: u32) -> bool {
        stream_id % 2 != self.config.role.first_stream_id() % 2
    }

    fn classify(&self, stream_id: u32) -> Target {
        if let Some(key) = self.by_id.get(&stream_id) {
            return Target::Known(*key);
        }
        if let Some((_, info)) = self.closed.iter().find(|(id, _)| *id == stream_id) {
            return Target::Closed(*info);
        }
        if self.is_peer_initiated(stream_id) {
            if stream_id > self.last_incoming_id {
                Target::New
            } else {
                Target::Stale
            }
        } else if stream_id >= self.next_stream_id {
            Target::Idle
        } else {
            Target::Closed(CloseInfo::default())
        }
    }

    /// Reset a peer stream before it was ever opened.
    fn refuse_stream(&mut self, stream_id: u32, code: ErrorCode) {
        self.remember_closed(
            stream_id,
            CloseInfo {
                closed_by_us: true,
                closed_with_rst: true,
            },
        );
        self.control.push_back(Frame::RstStream {
            stream_id,
            error_code: code,
        });
    }

    fn remember_closed(&mut self, stream_id: u32, info: CloseInfo) {
        self.closed.push_back((stream_id, info));
        while self.closed.len() > self.config.closed_stream_memory {
            self.closed.pop_front();
        }
    }

    /// Drop streams that are closed and have nothing left to send.
    fn reap_closed(&mut self) {
        let finished: Vec<StreamKey> = self
            .streams
            .values()
            .filter(|s| s.is_finished())
            .map(|s| s.key())
            .collect();
        for key in finished {
            if let Some(stream) = self.streams.remove(&key) {
                trace!("removing closed stream {:?}", stream.id());
                if let Some(id) = stream.id() {
                    self.by_id.remove(&id);
                    self.remember_closed(id, stream.close);
                }
                if let Some(bucket) = self.buckets.get_mut(&stream.priority()) {
                    bucket.retain(|k| *k != key);
                    if bucket.is_empty() {
                        self.buckets.remove(&stream.priority());
                    }
                }
            }
        }
    }

    fn track_active(&mut self, initiated_locally: bool, delta: i32, was_active: bool, is_active: bool) {
        if initiated_locally {
            self.active_local = self.active_local.saturating_add_signed(delta);
        } else {
            let delta = is_active as i32 - was_active as i32;
            self.active_remote = self.active_remote.saturating_add_signed(delta);
        }
    }

    fn slots_free(&self) -> u32 {
        match self.remote.max_concurrent_streams {
            Some(limit) => limit.saturating_sub(self.active_local),
            None => u32::MAX,
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    fn send_settings(&mut self, settings: Vec<Setting>) {
        debug!("sending SETTINGS {:?}", settings);
        self.control.push_back(Frame::Settings {
            ack: false,
            settings: settings.clone(),
        });
        self.pending_acks.push_back(settings);
    }

    fn flush(&mut self) {
        if let Some(increment) = self.flow.take_window_update() {
            self.control.push_back(Frame::WindowUpdate { stream_id: 0, increment });
        }
        for stream in self.streams.values_mut() {
            if let Some(stream_id) = stream.id() {
                if let Some(increment) = stream.flow.take_window_update() {
                    self.control.push_back(Frame::WindowUpdate { stream_id, increment });
                }
            }
        }

        while let Some(frame) = self.control.pop_front() {
            trace!("sending {:?} frame on stream {}", frame.kind(), frame.stream_id());
            frame.encode(&mut self.out);
        }

        if !self.goaway_sent {
            self.flush_streams();
        }
        self.reap_closed();
    }

    /// Serve the lowest-valued bucket that can make progress, one item per
    /// stream per round, until nothing moves or the output slice is full.
    fn flush_streams(&mut self) {
        loop {
            let mut progressed = false;
            let priorities: Vec<u32> = self.buckets.keys().copied().collect();
            for priority in priorities {
                let keys = match self.buckets.get(&priority) {
                    Some(keys) => keys.clone(),
                    None => continue,
                };
                for key in keys {
                    if self.out.len() >= self.config.max_send_buffer {
                        return;
                    }
                    progressed |= self.send_next(key);
                }
                if progressed {
                    break;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Send the next queued item of one stream. Returns whether the queue moved.
    fn send_next(&mut self, key: StreamKey) -> bool {
        let slots_free = self.slots_free();
        let conn_window = self.flow.available();
        let max_frame_size = self.remote.max_frame_size as usize;
        let stream_send_buffer = self.config.stream_send_buffer;

        let Some(stream) = self.streams.get_mut(&key) else {
            return false;
        };
        if stream.awaiting_promise {
            return false;
        }
        let Some(front) = stream.queue.front() else {
            return false;
        };

        let change = stream.count_change(front);
        if change > 0 && slots_free < change as u32 {
            trace!("deferring stream {:?}: no free stream slots", key);
            return false;
        }

        if stream.id().is_none() && matches!(front, Outbound::Reset(_)) {
            // Never reached the wire, so there is nobody to tell
            stream.dequeue();
            stream.abandon();
            return true;
        }

        let stream_id = match stream.id() {
            Some(id) => id,
            None => match allocate_id(&mut self.next_stream_id) {
                Some(id) => {
                    debug!("assigning stream id {} to {:?}", id, key);
                    stream.id = Some(id);
                    self.by_id.insert(id, key);
                    id
                }
                None => {
                    error!("stream ids exhausted");
                    stream.abandon();
                    self.events.push_back(Event::Reset {
                        stream: key,
                        error_code: ErrorCode::RefusedStream,
                    });
                    return false;
                }
            },
        };

        let Some(item) = stream.dequeue() else {
            return false;
        };

        if let Outbound::PushPromise { promised, headers } = item {
            return self.send_push_promise(key, stream_id, promised, headers);
        }

        // DATA is cut to fit both windows before the state change is recorded
        let (data_frame, item) = match item {
            Outbound::Data { data, end_stream } => {
                let frame = Frame::data(stream_id, data, end_stream);
                match stream.flow.push(frame, max_frame_size.min(conn_window)) {
                    Push::Forward(frame) => (Some(frame), None),
                    Push::Split { forward, rest } => {
                        if let Frame::Data { data, end_stream, .. } = rest {
                            stream.requeue_front(Outbound::Data { data, end_stream });
                        }
                        (Some(forward), None)
                    }
                    Push::Blocked(frame) => {
                        if let Frame::Data { data, end_stream, .. } = frame {
                            stream.requeue_front(Outbound::Data { data, end_stream });
                        }
                        trace!("stream {} blocked by flow control", stream_id);
                        return false;
                    }
                }
            }
            other => (None, Some(other)),
        };

        let (kind, end_stream) = match (&data_frame, &item) {
            (Some(frame), _) => (FrameKind::Data, frame.is_end_stream()),
            (None, Some(item)) => (item.kind(), item.end_stream()),
            (None, None) => return false,
        };

        let was_active = stream.state().is_active();
        let delta = match stream.on_send(kind, end_stream) {
            Ok(delta) => delta,
            // Already logged; the item is dropped
            Err(_) => return true,
        };
        let initiated_locally = stream.initiated_locally;
        let is_active = stream.state().is_active();

        if stream.wants_writable && stream.queued_data < stream_send_buffer {
            stream.wants_writable = false;
            self.events.push_back(Event::StreamWritable { stream: key });
        }

        let frames = match (data_frame, item) {
            (Some(frame), _) => {
                self.flow.consume(frame.flow_controlled_len());
                vec![frame]
            }
            (None, Some(Outbound::Headers { headers, end_stream })) => {
                let block = self.compressor.compress(&headers);
                header_block_frames(stream_id, block, end_stream, None, max_frame_size)
            }
            (None, Some(Outbound::Priority(priority))) => vec![Frame::Priority { stream_id, priority }],
            (None, Some(Outbound::Reset(error_code))) => {
                if let Some(stream) = self.streams.get_mut(&key) {
                    stream.inbound_ended = true;
                    stream.flow.mark_ended();
                }
                vec![Frame::RstStream { stream_id, error_code }]
            }
            (None, _) => Vec::new(),
        };

        self.track_active(initiated_locally, delta, was_active, is_active);
        for frame in frames {
            trace!("sending {:?} frame on stream {}", frame.kind(), stream_id);
            frame.encode(&mut self.out);
        }
        true
    }

    fn send_push_promise(
        &mut self,
        parent: StreamKey,
        parent_id: u32,
        promised: StreamKey,
        headers: Vec<Header>,
    ) -> bool {
        let max_frame_size = self.remote.max_frame_size as usize;

        match self.streams.get_mut(&parent) {
            Some(stream) => {
                if stream.on_send(FrameKind::PushPromise, false).is_err() {
                    return true;
                }
            }
            None => return true,
        }
        let Some(promised_stream) = self.streams.get_mut(&promised) else {
            return true;
        };
        let Some(promised_id) = allocate_id(&mut self.next_stream_id) else {
            error!("stream ids exhausted");
            promised_stream.abandon();
            return true;
        };
        promised_stream.id = Some(promised_id);
        promised_stream.awaiting_promise = false;
        promised_stream.reserve(Direction::Sending);
        self.by_id.insert(promised_id, promised);
        debug!("promising stream {} on stream {}", promised_id, parent_id);

        let block = self.compressor.compress(&headers);
        for frame in push_promise_frames(parent_id, promised_id, block, max_frame_size) {
            frame.encode(&mut self.out);
        }
        true
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    fn on_frame(&mut self, frame: Frame) -> Result<(), H2Error> {
        let kind = frame.kind();
        let stream_id = frame.stream_id();
        trace!("received {:?} frame on stream {}", kind, stream_id);

        if !self.settings_received {
            if !matches!(frame, Frame::Settings { ack: false, .. }) {
                return Err(H2Error::protocol(format!("first frame was {:?}, expected SETTINGS", kind)));
            }
            self.settings_received = true;
        }

        if let Some(pending) = &self.pending_block {
            if kind != FrameKind::Continuation || stream_id != pending.stream_id {
                return Err(H2Error::protocol(format!(
                    "expected CONTINUATION for stream {}, got {:?} on stream {}",
                    pending.stream_id, kind, stream_id
                )));
            }
        }

        if kind.is_connection_only() && stream_id != 0 {
            return Err(H2Error::protocol(format!("{:?} frame on stream {}", kind, stream_id)));
        }
        if kind.is_stream_only() && stream_id == 0 {
            return Err(H2Error::protocol(format!("{:?} frame on stream 0", kind)));
        }

        let result = match frame {
            Frame::Settings { ack, settings } => self.on_settings(ack, settings),
            Frame::Ping { ack, data } => {
                self.on_ping(ack, data);
                Ok(())
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                self.on_goaway(last_stream_id, error_code, debug_data);
                Ok(())
            }
            Frame::WindowUpdate { stream_id: 0, increment } => self.flow.increase(increment),
            Frame::AltSvc {
                stream_id,
                origin,
                field_value,
            } => {
                self.on_altsvc(stream_id, origin, field_value);
                Ok(())
            }
            Frame::Origin { origins } => {
                self.on_origin(origins);
                Ok(())
            }
            Frame::Headers {
                stream_id,
                header_block,
                end_stream,
                end_headers,
                priority,
                ..
            } => self.on_block_start(
                PendingBlock {
                    stream_id,
                    promised_stream_id: None,
                    end_stream,
                    priority,
                    block: header_block,
                },
                end_headers,
            ),
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                header_block,
                end_headers,
                ..
            } => self.on_block_start(
                PendingBlock {
                    stream_id,
                    promised_stream_id: Some(promised_stream_id),
                    end_stream: false,
                    priority: None,
                    block: header_block,
                },
                end_headers,
            ),
            Frame::Continuation {
                stream_id,
                header_block,
                end_headers,
            } => self.on_continuation(stream_id, header_block, end_headers),
            Frame::Data {
                stream_id,
                data,
                end_stream,
                pad_len,
            } => {
                let len = data.len() + pad_len.map(|p| p as usize + 1).unwrap_or(0);
                self.on_data(stream_id, data, end_stream, len)
            }
            Frame::Priority { stream_id, priority } => self.on_priority(stream_id, priority),
            Frame::RstStream { stream_id, error_code } => self.on_rst_stream(stream_id, error_code),
            Frame::WindowUpdate { stream_id, increment } => self.on_window_update(stream_id, increment),
        };

        match result {
            Err(H2Error::Stream { stream_id, code }) => {
                self.stream_error(stream_id, code);
                Ok(())
            }
            other => other,
        }
    }

    fn stream_error(&mut self, stream_id: u32, code: ErrorCode) {
        debug!("stream {} error {}", stream_id, code);
        match self.by_id.get(&stream_id).copied() {
            Some(key) => {
                if let Some(stream) = self.streams.get_mut(&key) {
                    if stream.state() == StreamState::Closed {
                        self.control.push_back(Frame::RstStream {
                            stream_id,
                            error_code: code,
                        });
                    } else {
                        stream.reset(code);
                    }
                }
                self.events.push_back(Event::StreamError {
                    stream: key,
                    error_code: code,
                });
            }
            None => self.control.push_back(Frame::RstStream {
                stream_id,
                error_code: code,
            }),
        }
    }

    /// Check a frame for a stream without a live `Stream` against the CLOSED
    /// rules, or reject it on an idle stream.
    fn check_untracked(&self, stream_id: u32, target: Target, kind: FrameKind) -> Result<(), H2Error> {
        match target {
            Target::Stale if kind == FrameKind::Headers => Err(H2Error::protocol(format!(
                "HEADERS on stream {} at or below last peer stream {}",
                stream_id, self.last_incoming_id
            ))),
            Target::Stale => self.check_untracked(stream_id, Target::Closed(CloseInfo::default()), kind),
            Target::Closed(info) => {
                match transition(StreamState::Closed, info, Direction::Receiving, kind, false) {
                    Ok(_) => {
                        trace!("ignoring {:?} on closed stream {}", kind, stream_id);
                        Ok(())
                    }
                    // Never answer RST_STREAM with RST_STREAM
                    Err(_) if kind == FrameKind::RstStream => Ok(()),
                    Err(code) => Err(H2Error::Stream { stream_id, code }),
                }
            }
            Target::New | Target::Idle => match kind {
                FrameKind::Priority => Ok(()),
                _ => Err(H2Error::protocol(format!("{:?} frame on idle stream {}", kind, stream_id))),
            },
            Target::Known(_) => Ok(()),
        }
    }

    fn on_settings(&mut self, ack: bool, settings: Vec<Setting>) -> Result<(), H2Error> {
        if ack {
            match self.pending_acks.pop_front() {
                Some(applied) => {
                    debug!("SETTINGS acknowledged: {:?}", applied);
                    for setting in applied {
                        self.apply_local(setting);
                    }
                    self.events.push_back(Event::SettingsAcknowledged);
                }
                None => warn!("ignoring unsolicited SETTINGS ACK"),
            }
            return Ok(());
        }

        debug!("received SETTINGS {:?}", settings);
        self.control.push_back(Frame::Settings {
            ack: true,
            settings: Vec::new(),
        });
        for setting in &settings {
            self.apply_remote(*setting)?;
        }
        self.events.push_back(Event::Settings(settings));
        Ok(())
    }

    fn apply_local(&mut self, setting: Setting) {
        self.local.apply(setting);
        match setting {
            Setting::HeaderTableSize(size) => self.decompressor.set_max_table_size(size as usize),
            Setting::InitialWindowSize(size) => {
                for stream in self.streams.values_mut() {
                    stream.flow.set_recv_initial_window(size);
                }
            }
            Setting::MaxFrameSize(size) => self.decoder.set_max_frame_size(size),
            _ => {}
        }
    }

    fn apply_remote(&mut self, setting: Setting) -> Result<(), H2Error> {
        self.remote.apply(setting);
        match setting {
            Setting::HeaderTableSize(size) => self.compressor.set_table_size_limit(size as usize),
            Setting::InitialWindowSize(size) => {
                for stream in self.streams.values_mut() {
                    stream.flow.set_initial_window(size)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn on_ping(&mut self, ack: bool, data: [u8; 8]) {
        if !ack {
            self.control.push_back(Frame::Ping { ack: true, data });
            return;
        }
        if self.pings.remove(&data) {
            debug!("PING {:02x?} acknowledged", data);
            self.events.push_back(Event::PingAck(data));
        } else {
            warn!("ignoring unsolicited PING ACK {:02x?}", data);
        }
    }

    fn on_goaway(&mut self, last_stream_id: u32, error_code: ErrorCode, debug_data: Vec<u8>) {
        debug!("received GOAWAY (last stream {}, {})", last_stream_id, error_code);
        self.goaway_received = true;
        self.events.push_back(Event::GoAway {
            last_stream_id,
            error_code,
            debug_data,
        });
        if error_code != ErrorCode::NoError {
            self.events.push_back(Event::PeerError(error_code));
        }
    }

    fn on_altsvc(&mut self, stream_id: u32, origin: String, field_value: String) {
        // RFC 7838 Section 4: origin present exactly when on stream 0
        if (stream_id == 0) == origin.is_empty() {
            warn!("ignoring malformed ALTSVC on stream {}", stream_id);
            return;
        }
        self.events.push_back(Event::AltSvc {
            stream_id,
            origin,
            field_value,
        });
    }

    fn on_origin(&mut self, origins: Vec<String>) {
        if self.config.role == Role::Server {
            debug!("ignoring ORIGIN sent by a client");
            return;
        }
        self.events.push_back(Event::Origin(origins));
    }

    fn on_block_start(&mut self, pending: PendingBlock, end_headers: bool) -> Result<(), H2Error> {
        if end_headers {
            return self.on_header_block(pending);
        }
        self.check_block_size(pending.block.len())?;
        self.pending_block = Some(pending);
        Ok(())
    }

    fn on_continuation(&mut self, stream_id: u32, fragment: Vec<u8>, end_headers: bool) -> Result<(), H2Error> {
        let mut pending = self
            .pending_block
            .take()
            .ok_or_else(|| H2Error::protocol(format!("unexpected CONTINUATION frame for stream {}", stream_id)))?;
        self.check_block_size(pending.block.len() + fragment.len())?;
        pending.block.extend_from_slice(&fragment);
        if end_headers {
            self.on_header_block(pending)
        } else {
            self.pending_block = Some(pending);
            Ok(())
        }
    }

    fn check_block_size(&self, size: usize) -> Result<(), H2Error> {
        if size > self.config.max_header_block_size {
            return Err(H2Error::connection(
                ErrorCode::EnhanceYourCalm,
                format!(
                    "header block too large ({} bytes, max {})",
                    size, self.config.max_header_block_size
                ),
            ));
        }
        Ok(())
    }

    fn on_header_block(&mut self, pending: PendingBlock) -> Result<(), H2Error> {
        // Always decode, even for streams about to be refused
        let headers = self.decompressor.decompress(&pending.block)?;
        match pending.promised_stream_id {
            Some(promised_id) => self.on_push_promise(pending.stream_id, promised_id, headers),
            None => self.on_headers(pending.stream_id, headers, pending.end_stream, pending.priority),
        }
    }

    fn on_headers(
        &mut self,
        stream_id: u32,
        headers: Vec<Header>,
        end_stream: bool,
        priority: Option<PrioritySpec>,
    ) -> Result<(), H2Error> {
        if let Some(spec) = &priority {
            if spec.dependency == stream_id {
                return Err(H2Error::Stream {
                    stream_id,
                    code: ErrorCode::ProtocolError,
                });
            }
        }

        let list_size: usize = headers.iter().map(Header::size).sum();
        let oversized = self
            .local
            .max_header_list_size
            .is_some_and(|max| list_size > max as usize);

        let target = self.classify(stream_id);
        let key = match target {
            Target::Known(_) if oversized => {
                debug!("header list of {} bytes on stream {} exceeds our limit", list_size, stream_id);
                return Err(H2Error::Stream {
                    stream_id,
                    code: ErrorCode::ProtocolError,
                });
            }
            Target::Known(key) => key,
            Target::New => {
                self.last_incoming_id = stream_id;
                if oversized {
                    debug!("refusing stream {}: header list of {} bytes", stream_id, list_size);
                    self.refuse_stream(stream_id, ErrorCode::ProtocolError);
                    return Ok(());
                }
                if let Some(limit) = self.local.max_concurrent_streams {
                    if self.active_remote >= limit {
                        debug!("refusing stream {}: concurrency limit {} reached", stream_id, limit);
                        self.refuse_stream(stream_id, ErrorCode::RefusedStream);
                        return Ok(());
                    }
                }
                let key = self.insert_stream(Some(stream_id));
                debug!("peer opened stream {}", stream_id);
                self.events.push_back(Event::StreamOpened { stream: key, stream_id });
                key
            }
            other => return self.check_untracked(stream_id, other, FrameKind::Headers),
        };

        let stream = self.stream_mut(key)?;
        let reprioritize = match &priority {
            Some(spec) => {
                let old = stream.priority;
                stream.set_priority_from_peer(spec).then_some((old, stream.priority))
            }
            None => None,
        };
        let was_active = stream.state().is_active();
        let delta = stream.on_receive(FrameKind::Headers, end_stream)?;
        let (initiated_locally, is_active, deliver) =
            (stream.initiated_locally, stream.state().is_active(), !stream.reset_queued);

        self.track_active(initiated_locally, delta, was_active, is_active);
        if let Some((old, new)) = reprioritize {
            self.move_bucket(key, old, new);
        }
        if deliver {
            self.events.push_back(Event::Headers {
                stream: key,
                headers,
                end_stream,
            });
        }
        Ok(())
    }

    fn on_push_promise(&mut self, parent_id: u32, promised_id: u32, headers: Vec<Header>) -> Result<(), H2Error> {
        if self.config.role == Role::Server {
            return Err(H2Error::protocol("client sent PUSH_PROMISE"));
        }
        if !self.local.enable_push {
            return Err(H2Error::protocol("PUSH_PROMISE received with push disabled"));
        }
        if !self.is_peer_initiated(promised_id) || promised_id <= self.last_incoming_id {
            return Err(H2Error::protocol(format!("invalid promised stream id {}", promised_id)));
        }
        self.last_incoming_id = promised_id;

        let parent = match self.classify(parent_id) {
            Target::Known(key) => key,
            other => {
                self.remember_closed(promised_id, CloseInfo::default());
                return self.check_untracked(parent_id, other, FrameKind::PushPromise);
            }
        };
        let parent_stream = self.stream_mut(parent)?;
        parent_stream.on_receive(FrameKind::PushPromise, false)?;
        let parent_priority = parent_stream.priority;

        let promised = self.insert_stream(Some(promised_id));
        let priority = parent_priority.saturating_add(1).min(MAX_PRIORITY);
        if let Some(stream) = self.streams.get_mut(&promised) {
            stream.reserve(Direction::Receiving);
            stream.priority = priority;
        }
        self.move_bucket(promised, crate::stream::DEFAULT_PRIORITY, priority);

        debug!("stream {} promised on stream {}", promised_id, parent_id);
        self.events.push_back(Event::PushPromise {
            parent,
            promised,
            headers,
        });
        Ok(())
    }

    fn on_data(&mut self, stream_id: u32, data: Vec<u8>, end_stream: bool, len: usize) -> Result<(), H2Error> {
        self.flow.receive(len)?;

        let key = match self.classify(stream_id) {
            Target::Known(key) => key,
            other => return self.check_untracked(stream_id, other, FrameKind::Data),
        };
        let stream = self.stream_mut(key)?;
        if stream.flow.receive(len).is_err() {
            return Err(H2Error::Stream {
                stream_id,
                code: ErrorCode::FlowControlError,
            });
        }
        let was_active = stream.state().is_active();
        let delta = stream.on_receive(FrameKind::Data, end_stream)?;
        let (initiated_locally, is_active, deliver) =
            (stream.initiated_locally, stream.state().is_active(), !stream.reset_queued);

        self.track_active(initiated_locally, delta, was_active, is_active);
        if deliver {
            self.events.push_back(Event::Data {
                stream: key,
                data,
                end_stream,
            });
        }
        Ok(())
    }

    fn on_priority(&mut self, stream_id: u32, spec: PrioritySpec) -> Result<(), H2Error> {
        if spec.dependency == stream_id {
            return Err(H2Error::Stream {
                stream_id,
                code: ErrorCode::ProtocolError,
            });
        }
        let key = match self.classify(stream_id) {
            Target::Known(key) => key,
            other => return self.check_untracked(stream_id, other, FrameKind::Priority),
        };
        let stream = self.stream_mut(key)?;
        stream.on_receive(FrameKind::Priority, false)?;
        let old = stream.priority;
        if stream.set_priority_from_peer(&spec) {
            let new = stream.priority;
            self.move_bucket(key, old, new);
        }
        Ok(())
    }

    fn on_rst_stream(&mut self, stream_id: u32, error_code: ErrorCode) -> Result<(), H2Error> {
        let key = match self.classify(stream_id) {
            Target::Known(key) => key,
            other => return self.check_untracked(stream_id, other, FrameKind::RstStream),
        };
        let stream = self.stream_mut(key)?;
        let was_active = stream.state().is_active();
        let delta = stream.on_receive(FrameKind::RstStream, false)?;
        stream.queue.clear();
        stream.queued_data = 0;
        let (initiated_locally, is_active) = (stream.initiated_locally, stream.state().is_active());

        debug!("stream {} reset by peer: {}", stream_id, error_code);
        self.track_active(initiated_locally, delta, was_active, is_active);
        self.events.push_back(Event::Reset {
            stream: key,
            error_code,
        });
        Ok(())
    }

    fn on_window_update(&mut self, stream_id: u32, increment: u32) -> Result<(), H2Error> {
        let key = match self.classify(stream_id) {
            Target::Known(key) => key,
            other => return self.check_untracked(stream_id, other, FrameKind::WindowUpdate),
        };
        let stream = self.stream_mut(key)?;
        stream.on_receive(FrameKind::WindowUpdate, false)?;
        if stream.flow.increase(increment).is_err() {
            return Err(H2Error::Stream {
                stream_id,
                code: ErrorCode::FlowControlError,
            });
        }
        Ok(())
    }
}

fn allocate_id(next: &mut u32) -> Option<u32> {
    let id = *next;
    if id > MAX_STREAM_ID {
        return None;
    }
    *next += 2;
    Some(id)
}

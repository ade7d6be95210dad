//! Stream lifecycle (RFC 7540 Section 5.1)
//!
//! [`transition`] is the pure state function. [`Stream`] wraps it with the
//! per-stream bookkeeping the connection needs: the outbound queue, flow
//! control windows, priority and close flags.

use std::collections::VecDeque;

use log::{debug, error};

use crate::error::{ErrorCode, H2Error};
use crate::flow::FlowControl;
use crate::frame::{FrameKind, PrioritySpec};
use crate::hpack::Header;

/// Default priority bucket (2^30). Lower values are served first.
pub const DEFAULT_PRIORITY: u32 = 1 << 30;
/// Lowest possible priority (2^31 - 1).
pub const MAX_PRIORITY: u32 = (1 << 31) - 1;

/// Local handle for a stream. Stays valid before the wire id is assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    /// OPEN and both half-closed states count toward MAX_CONCURRENT_STREAMS.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            StreamState::Open | StreamState::HalfClosedLocal | StreamState::HalfClosedRemote
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sending,
    Receiving,
}

/// How a stream reached CLOSED. Decides which late frames are tolerated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseInfo {
    pub closed_by_us: bool,
    pub closed_with_rst: bool,
}

/// Next state after `kind` is sent or received in `state`.
///
/// On failure the error code tells the severity: `STREAM_CLOSED` is a stream
/// error, anything else is a connection error.
pub fn transition(
    state: StreamState,
    close: CloseInfo,
    direction: Direction,
    kind: FrameKind,
    end_stream: bool,
) -> Result<StreamState, ErrorCode> {
    use FrameKind::*;
    use StreamState::*;

    let sending = direction == Direction::Sending;
    let receiving = !sending;

    let next = match state {
        Idle => match kind {
            Headers if end_stream && sending => HalfClosedLocal,
            Headers if end_stream => HalfClosedRemote,
            Headers => Open,
            RstStream if sending => Closed,
            Priority => Idle,
            _ => return Err(ErrorCode::ProtocolError),
        },
        ReservedLocal => match kind {
            Headers if sending && end_stream => Closed,
            Headers if sending => HalfClosedRemote,
            RstStream => Closed,
            Priority => ReservedLocal,
            _ => return Err(ErrorCode::ProtocolError),
        },
        ReservedRemote => match kind {
            RstStream => Closed,
            Headers if receiving && end_stream => Closed,
            Headers if receiving => HalfClosedLocal,
            Priority | Origin => ReservedRemote,
            _ => return Err(ErrorCode::ProtocolError),
        },
        Open => {
            if end_stream {
                if sending {
                    HalfClosedLocal
                } else {
                    HalfClosedRemote
                }
            } else if kind == RstStream {
                Closed
            } else {
                Open
            }
        }
        HalfClosedLocal => {
            if kind == RstStream || (receiving && end_stream) {
                Closed
            } else if matches!(kind, Origin | AltSvc | Priority)
                || receiving
                || (sending && kind == WindowUpdate)
            {
                HalfClosedLocal
            } else {
                return Err(ErrorCode::ProtocolError);
            }
        }
        HalfClosedRemote => {
            if kind == RstStream || (sending && end_stream) {
                Closed
            } else if matches!(kind, Origin | AltSvc | Priority)
                || sending
                || (receiving && kind == WindowUpdate)
            {
                HalfClosedRemote
            } else {
                return Err(ErrorCode::ProtocolError);
            }
        }
        Closed => {
            let tolerated = kind == Priority
                || (sending && kind == RstStream)
                || (receiving && kind == WindowUpdate)
                || (receiving
                    && close.closed_by_us
                    && (close.closed_with_rst || matches!(kind, RstStream | AltSvc | Origin)));
            if !tolerated {
                return Err(ErrorCode::StreamClosed);
            }
            Closed
        }
    };
    Ok(next)
}

/// Work queued on a stream, turned into frames at flush time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Compressed when it is actually sent, so HPACK state follows wire order
    Headers {
        headers: Vec<Header>,
        end_stream: bool,
    },
    Data {
        data: Vec<u8>,
        end_stream: bool,
    },
    Priority(PrioritySpec),
    Reset(ErrorCode),
    PushPromise {
        promised: StreamKey,
        headers: Vec<Header>,
    },
}

impl Outbound {
    pub fn kind(&self) -> FrameKind {
        match self {
            Outbound::Headers { .. } => FrameKind::Headers,
            Outbound::Data { .. } => FrameKind::Data,
            Outbound::Priority(_) => FrameKind::Priority,
            Outbound::Reset(_) => FrameKind::RstStream,
            Outbound::PushPromise { .. } => FrameKind::PushPromise,
        }
    }

    pub fn end_stream(&self) -> bool {
        match self {
            Outbound::Headers { end_stream, .. } | Outbound::Data { end_stream, .. } => *end_stream,
            _ => false,
        }
    }
}

/// Map a PRIORITY weight (1..=256) to a scheduling bucket; weight 16 gives
/// the default priority.
pub fn priority_from_weight(weight: u32) -> u32 {
    let weight = weight.max(1) as u64;
    ((1u64 << 34) / weight).min(MAX_PRIORITY as u64) as u32
}

#[derive(Debug)]
pub struct Stream {
    pub(crate) key: StreamKey,
    pub(crate) id: Option<u32>,
    pub(crate) state: StreamState,
    pub(crate) close: CloseInfo,
    /// We sent the first HEADERS or PUSH_PROMISE for it
    pub(crate) initiated_locally: bool,

    pub(crate) priority: u32,
    pub(crate) priority_set_locally: bool,

    pub(crate) queue: VecDeque<Outbound>,
    /// DATA bytes sitting in `queue`
    pub(crate) queued_data: usize,
    /// `send_data` reported backpressure and a StreamWritable is owed
    pub(crate) wants_writable: bool,
    /// Waiting for its PUSH_PROMISE to go out on the parent
    pub(crate) awaiting_promise: bool,

    pub(crate) flow: FlowControl,

    pub(crate) headers_received: bool,
    pub(crate) end_queued: bool,
    pub(crate) reset_queued: bool,
    pub(crate) inbound_ended: bool,
}

impl Stream {
    pub fn new(key: StreamKey, id: Option<u32>, flow: FlowControl) -> Self {
        Self {
            key,
            id,
            state: StreamState::Idle,
            close: CloseInfo::default(),
            initiated_locally: false,
            priority: DEFAULT_PRIORITY,
            priority_set_locally: false,
            queue: VecDeque::new(),
            queued_data: 0,
            wants_writable: false,
            awaiting_promise: false,
            flow,
            headers_received: false,
            end_queued: false,
            reset_queued: false,
            inbound_ended: false,
        }
    }

    pub fn key(&self) -> StreamKey {
        self.key
    }

    pub fn id(&self) -> Option<u32> {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Whether the stream may accept more application writes.
    pub fn is_writable(&self) -> bool {
        !self.end_queued && !self.reset_queued && self.state != StreamState::Closed
    }

    /// Change in the active-stream count if `item` were sent now. Only streams
    /// we initiated count toward the peer's concurrency limit.
    pub fn count_change(&self, item: &Outbound) -> i32 {
        let initiated = self.initiated_locally || (self.state == StreamState::Idle && item.kind() == FrameKind::Headers);
        if !initiated {
            return 0;
        }
        match transition(self.state, self.close, Direction::Sending, item.kind(), item.end_stream()) {
            Ok(next) => next.is_active() as i32 - self.state.is_active() as i32,
            Err(_) => 0,
        }
    }

    /// Record a frame going out. Returns the active-count delta for streams we
    /// initiated.
    pub fn on_send(&mut self, kind: FrameKind, end_stream: bool) -> Result<i32, H2Error> {
        if self.state == StreamState::Idle && kind == FrameKind::Headers {
            self.initiated_locally = true;
        }
        match transition(self.state, self.close, Direction::Sending, kind, end_stream) {
            Ok(next) => Ok(self.apply(next, Direction::Sending, kind)),
            Err(code) => {
                error!(
                    "sending illegal frame {:?} in state {:?} on stream {:?} ({})",
                    kind, self.state, self.id, code
                );
                Err(H2Error::Internal(format!(
                    "sending illegal frame ({:?}) in {:?} state",
                    kind, self.state
                )))
            }
        }
    }

    /// Record a received frame. Returns the active-count delta for streams we
    /// initiated, or the stream/connection error the frame causes.
    pub fn on_receive(&mut self, kind: FrameKind, end_stream: bool) -> Result<i32, H2Error> {
        let stream_id = self.id.unwrap_or(0);
        let next = transition(self.state, self.close, Direction::Receiving, kind, end_stream).map_err(|code| {
            if code == ErrorCode::StreamClosed {
                H2Error::Stream { stream_id, code }
            } else {
                H2Error::connection(
                    code,
                    format!("received {:?} in {:?} state on stream {}", kind, self.state, stream_id),
                )
            }
        })?;

        if kind == FrameKind::Headers {
            if self.headers_received && !end_stream {
                return Err(H2Error::Stream {
                    stream_id,
                    code: ErrorCode::ProtocolError,
                });
            }
            self.headers_received = true;
        }
        if end_stream || kind == FrameKind::RstStream {
            self.inbound_ended = true;
            self.flow.mark_ended();
        }
        Ok(self.apply(next, Direction::Receiving, kind))
    }

    fn apply(&mut self, next: StreamState, direction: Direction, kind: FrameKind) -> i32 {
        let previous = self.state;
        if next == previous {
            return 0;
        }
        debug!("stream {:?}: {:?} -> {:?}", self.id, previous, next);
        self.state = next;
        if next == StreamState::Closed {
            self.close = CloseInfo {
                closed_by_us: direction == Direction::Sending,
                closed_with_rst: kind == FrameKind::RstStream,
            };
        }
        if self.initiated_locally {
            next.is_active() as i32 - previous.is_active() as i32
        } else {
            0
        }
    }

    /// Promised stream reserved by a PUSH_PROMISE.
    pub fn reserve(&mut self, direction: Direction) {
        debug!("stream {:?}: reserved ({:?})", self.id, direction);
        self.state = match direction {
            Direction::Sending => StreamState::ReservedLocal,
            Direction::Receiving => StreamState::ReservedRemote,
        };
        self.initiated_locally = direction == Direction::Sending;
    }

    pub fn enqueue(&mut self, item: Outbound) {
        if let Outbound::Data { data, .. } = &item {
            self.queued_data += data.len();
        }
        self.queue.push_back(item);
    }

    /// Put back the unsent remainder of an item at the head of the queue.
    pub fn requeue_front(&mut self, item: Outbound) {
        if let Outbound::Data { data, .. } = &item {
            self.queued_data += data.len();
        }
        self.queue.push_front(item);
    }

    pub fn dequeue(&mut self) -> Option<Outbound> {
        let item = self.queue.pop_front()?;
        if let Outbound::Data { data, .. } = &item {
            self.queued_data -= data.len();
        }
        Some(item)
    }

    /// End the outbound side: mark the last queued DATA or HEADERS with
    /// END_STREAM, or queue an empty END_STREAM DATA frame.
    pub fn finish(&mut self) {
        if self.end_queued {
            debug!("stream {:?}: already ended, not ending again", self.id);
            return;
        }
        self.end_queued = true;
        match self.queue.back_mut() {
            Some(Outbound::Data { end_stream, .. }) | Some(Outbound::Headers { end_stream, .. }) => {
                *end_stream = true;
            }
            _ => self.enqueue(Outbound::Data {
                data: Vec::new(),
                end_stream: true,
            }),
        }
    }

    /// Cancel the stream: drop queued work and send RST_STREAM once.
    pub fn reset(&mut self, code: ErrorCode) {
        if self.reset_queued || self.state == StreamState::Closed {
            return;
        }
        self.reset_queued = true;
        self.queue.clear();
        self.queued_data = 0;
        self.enqueue(Outbound::Reset(code));
    }

    /// Drop the stream without a frame; used for streams that never reached
    /// the wire.
    pub fn abandon(&mut self) {
        self.queue.clear();
        self.queued_data = 0;
        self.awaiting_promise = false;
        self.state = StreamState::Closed;
    }

    /// Apply a peer PRIORITY unless the application chose a priority itself.
    pub fn set_priority_from_peer(&mut self, spec: &PrioritySpec) -> bool {
        if self.priority_set_locally {
            return false;
        }
        self.priority = priority_from_weight(spec.effective_weight());
        true
    }

    /// Closed and nothing left to send.
    pub fn is_finished(&self) -> bool {
        self.state == StreamState::Closed && self.queue.is_empty()
    }
}

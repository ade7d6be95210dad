//! HTTP/2 frame codec.
//!
//! Encodes [`Frame`] values to bytes and decodes bytes back into frames with a
//! stateful, incremental [`FrameDecoder`]. The decoder alternates between two
//! phases, accumulating the fixed 9-byte header and then the payload whose
//! length the header announced, so a frame may arrive split across any number
//! of reads.
//!
//! Reference: RFC 7540 Sections 4 and 6, RFC 7838 (ALTSVC), RFC 8336 (ORIGIN).

use log::{debug, trace};

use crate::config::Role;
use crate::error::{ErrorCode, H2Error};
use crate::settings::{settings_id, Setting, DEFAULT_MAX_FRAME_SIZE};

/// HTTP/2 frame types
pub mod frame_type {
    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const PRIORITY: u8 = 0x2;
    pub const RST_STREAM: u8 = 0x3;
    pub const SETTINGS: u8 = 0x4;
    pub const PUSH_PROMISE: u8 = 0x5;
    pub const PING: u8 = 0x6;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;
    pub const CONTINUATION: u8 = 0x9;
    pub const ALTSVC: u8 = 0xa;
    pub const ORIGIN: u8 = 0xc;
}

/// HTTP/2 frame flags. Bit meaning depends on the frame type.
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

pub const FRAME_HEADER_LEN: usize = 9;

/// Largest stream identifier (31 bits).
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

/// The HTTP/2 connection preface (24 bytes)
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Check if data starts with the HTTP/2 connection preface
pub fn is_preface(data: &[u8]) -> bool {
    data.len() >= CONNECTION_PREFACE.len() && &data[..CONNECTION_PREFACE.len()] == CONNECTION_PREFACE
}

/// The twelve frame kinds this codec understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    AltSvc,
    Origin,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            frame_type::DATA => Self::Data,
            frame_type::HEADERS => Self::Headers,
            frame_type::PRIORITY => Self::Priority,
            frame_type::RST_STREAM => Self::RstStream,
            frame_type::SETTINGS => Self::Settings,
            frame_type::PUSH_PROMISE => Self::PushPromise,
            frame_type::PING => Self::Ping,
            frame_type::GOAWAY => Self::GoAway,
            frame_type::WINDOW_UPDATE => Self::WindowUpdate,
            frame_type::CONTINUATION => Self::Continuation,
            frame_type::ALTSVC => Self::AltSvc,
            frame_type::ORIGIN => Self::Origin,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Data => frame_type::DATA,
            Self::Headers => frame_type::HEADERS,
            Self::Priority => frame_type::PRIORITY,
            Self::RstStream => frame_type::RST_STREAM,
            Self::Settings => frame_type::SETTINGS,
            Self::PushPromise => frame_type::PUSH_PROMISE,
            Self::Ping => frame_type::PING,
            Self::GoAway => frame_type::GOAWAY,
            Self::WindowUpdate => frame_type::WINDOW_UPDATE,
            Self::Continuation => frame_type::CONTINUATION,
            Self::AltSvc => frame_type::ALTSVC,
            Self::Origin => frame_type::ORIGIN,
        }
    }

    /// Kinds that are only valid on stream 0.
    pub fn is_connection_only(self) -> bool {
        matches!(self, Self::Settings | Self::Ping | Self::GoAway | Self::Origin)
    }

    /// Kinds that are never valid on stream 0.
    pub fn is_stream_only(self) -> bool {
        matches!(
            self,
            Self::Data
                | Self::Headers
                | Self::Priority
                | Self::RstStream
                | Self::PushPromise
                | Self::Continuation
        )
    }
}

/// A parsed HTTP/2 frame header (9 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,      // 24 bits
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,   // 31 bits (high bit reserved)
}

impl FrameHeader {
    /// Parse a 9-byte frame header
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < FRAME_HEADER_LEN {
            return None;
        }

        let length = ((data[0] as u32) << 16) | ((data[1] as u32) << 8) | (data[2] as u32);
        let stream_id = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) & MAX_STREAM_ID;

        Some(Self {
            length,
            frame_type: data[3],
            flags: data[4],
            stream_id,
        })
    }

    /// Write the header into `out`, which must hold at least 9 bytes.
    pub fn write_to(&self, out: &mut [u8]) {
        out[0] = (self.length >> 16) as u8;
        out[1] = (self.length >> 8) as u8;
        out[2] = self.length as u8;
        out[3] = self.frame_type;
        out[4] = self.flags;
        out[5..9].copy_from_slice(&(self.stream_id & MAX_STREAM_ID).to_be_bytes());
    }

    /// Total frame size including header
    pub fn total_size(&self) -> usize {
        FRAME_HEADER_LEN + self.length as usize
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Stream dependency and weight carried by PRIORITY and prioritized HEADERS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    pub dependency: u32,
    pub exclusive: bool,
    /// Wire value; the effective weight is `weight + 1` (1..=256).
    pub weight: u8,
}

impl Default for PrioritySpec {
    fn default() -> Self {
        Self {
            dependency: 0,
            exclusive: false,
            weight: 15,
        }
    }
}

impl PrioritySpec {
    fn parse(data: &[u8]) -> Self {
        let raw = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        Self {
            dependency: raw & MAX_STREAM_ID,
            exclusive: raw & 0x8000_0000 != 0,
            weight: data[4],
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        let mut raw = self.dependency & MAX_STREAM_ID;
        if self.exclusive {
            raw |= 0x8000_0000;
        }
        out.extend_from_slice(&raw.to_be_bytes());
        out.push(self.weight);
    }

    pub fn effective_weight(&self) -> u32 {
        self.weight as u32 + 1
    }
}

/// A decoded HTTP/2 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        data: Vec<u8>,
        end_stream: bool,
        /// Padding length when the PADDED flag is present.
        pad_len: Option<u8>,
    },
    Headers {
        stream_id: u32,
        header_block: Vec<u8>, // HPACK-encoded headers (fragment)
        end_stream: bool,
        end_headers: bool,
        priority: Option<PrioritySpec>,
        pad_len: Option<u8>,
    },
    Priority {
        stream_id: u32,
        priority: PrioritySpec,
    },
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    Settings {
        ack: bool,
        settings: Vec<Setting>,
    },
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        header_block: Vec<u8>,
        end_headers: bool,
        pad_len: Option<u8>,
    },
    Ping {
        ack: bool,
        data: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Vec<u8>,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        header_block: Vec<u8>,
        end_headers: bool,
    },
    AltSvc {
        stream_id: u32,
        origin: String,
        field_value: String,
    },
    Origin {
        origins: Vec<String>,
    },
}

impl Frame {
    /// A plain DATA frame without padding.
    pub fn data(stream_id: u32, data: Vec<u8>, end_stream: bool) -> Self {
        Frame::Data {
            stream_id,
            data,
            end_stream,
            pad_len: None,
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Data { .. } => FrameKind::Data,
            Frame::Headers { .. } => FrameKind::Headers,
            Frame::Priority { .. } => FrameKind::Priority,
            Frame::RstStream { .. } => FrameKind::RstStream,
            Frame::Settings { .. } => FrameKind::Settings,
            Frame::PushPromise { .. } => FrameKind::PushPromise,
            Frame::Ping { .. } => FrameKind::Ping,
            Frame::GoAway { .. } => FrameKind::GoAway,
            Frame::WindowUpdate { .. } => FrameKind::WindowUpdate,
            Frame::Continuation { .. } => FrameKind::Continuation,
            Frame::AltSvc { .. } => FrameKind::AltSvc,
            Frame::Origin { .. } => FrameKind::Origin,
        }
    }

    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Priority { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::PushPromise { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Continuation { stream_id, .. }
            | Frame::AltSvc { stream_id, .. } => *stream_id,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } | Frame::Origin { .. } => 0,
        }
    }

    pub fn is_end_stream(&self) -> bool {
        match self {
            Frame::Data { end_stream, .. } | Frame::Headers { end_stream, .. } => *end_stream,
            _ => false,
        }
    }

    /// Bytes of this frame that count against flow control (DATA only).
    pub fn flow_controlled_len(&self) -> usize {
        match self {
            Frame::Data { data, pad_len, .. } => {
                data.len() + pad_len.map(|p| p as usize + 1).unwrap_or(0)
            }
            _ => 0,
        }
    }

    fn flags(&self) -> u8 {
        let mut f = 0;
        match self {
            Frame::Data {
                end_stream, pad_len, ..
            } => {
                if *end_stream {
                    f |= flags::END_STREAM;
                }
                if pad_len.is_some() {
                    f |= flags::PADDED;
                }
            }
            Frame::Headers {
                end_stream,
                end_headers,
                priority,
                pad_len,
                ..
            } => {
                if *end_stream {
                    f |= flags::END_STREAM;
                }
                if *end_headers {
                    f |= flags::END_HEADERS;
                }
                if pad_len.is_some() {
                    f |= flags::PADDED;
                }
                if priority.is_some() {
                    f |= flags::PRIORITY;
                }
            }
            Frame::PushPromise {
                end_headers, pad_len, ..
            } => {
                if *end_headers {
                    f |= flags::END_HEADERS;
                }
                if pad_len.is_some() {
                    f |= flags::PADDED;
                }
            }
            Frame::Continuation { end_headers, .. } => {
                if *end_headers {
                    f |= flags::END_HEADERS;
                }
            }
            Frame::Settings { ack, .. } | Frame::Ping { ack, .. } => {
                if *ack {
                    f |= flags::ACK;
                }
            }
            _ => {}
        }
        f
    }

    /// Append the wire encoding of this frame to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&[0; FRAME_HEADER_LEN]);
        self.encode_payload(out);
        let header = FrameHeader {
            length: (out.len() - start - FRAME_HEADER_LEN) as u32,
            frame_type: self.kind().as_u8(),
            flags: self.flags(),
            stream_id: self.stream_id(),
        };
        header.write_to(&mut out[start..start + FRAME_HEADER_LEN]);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Frame::Data { data, pad_len, .. } => {
                write_padded(out, *pad_len, |out| out.extend_from_slice(data));
            }
            Frame::Headers {
                header_block,
                priority,
                pad_len,
                ..
            } => {
                write_padded(out, *pad_len, |out| {
                    if let Some(priority) = priority {
                        priority.write(out);
                    }
                    out.extend_from_slice(header_block);
                });
            }
            Frame::Priority { priority, .. } => priority.write(out),
            Frame::RstStream { error_code, .. } => {
                out.extend_from_slice(&error_code.as_u32().to_be_bytes());
            }
            Frame::Settings { settings, .. } => {
                for setting in settings {
                    out.extend_from_slice(&setting.id().to_be_bytes());
                    out.extend_from_slice(&setting.value().to_be_bytes());
                }
            }
            Frame::PushPromise {
                promised_stream_id,
                header_block,
                pad_len,
                ..
            } => {
                write_padded(out, *pad_len, |out| {
                    out.extend_from_slice(&(promised_stream_id & MAX_STREAM_ID).to_be_bytes());
                    out.extend_from_slice(header_block);
                });
            }
            Frame::Ping { data, .. } => out.extend_from_slice(data),
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                out.extend_from_slice(&(last_stream_id & MAX_STREAM_ID).to_be_bytes());
                out.extend_from_slice(&error_code.as_u32().to_be_bytes());
                out.extend_from_slice(debug_data);
            }
            Frame::WindowUpdate { increment, .. } => {
                out.extend_from_slice(&(increment & MAX_STREAM_ID).to_be_bytes());
            }
            Frame::Continuation { header_block, .. } => out.extend_from_slice(header_block),
            Frame::AltSvc {
                origin, field_value, ..
            } => {
                out.extend_from_slice(&(origin.len() as u16).to_be_bytes());
                out.extend_from_slice(origin.as_bytes());
                out.extend_from_slice(field_value.as_bytes());
            }
            Frame::Origin { origins } => {
                for origin in origins {
                    out.extend_from_slice(&(origin.len() as u16).to_be_bytes());
                    out.extend_from_slice(origin.as_bytes());
                }
            }
        }
    }
}

fn write_padded(out: &mut Vec<u8>, pad_len: Option<u8>, body: impl FnOnce(&mut Vec<u8>)) {
    if let Some(pad) = pad_len {
        out.push(pad);
        body(out);
        out.resize(out.len() + pad as usize, 0);
    } else {
        body(out);
    }
}

/// Cut an encoded header block into one HEADERS frame followed by as many
/// CONTINUATION frames as `max_frame_size` requires.
pub fn header_block_frames(
    stream_id: u32,
    mut block: Vec<u8>,
    end_stream: bool,
    priority: Option<PrioritySpec>,
    max_frame_size: usize,
) -> Vec<Frame> {
    let first_len = max_frame_size - if priority.is_some() { 5 } else { 0 };
    let rest = split_tail(&mut block, first_len);
    let mut frames = vec![Frame::Headers {
        stream_id,
        header_block: block,
        end_stream,
        end_headers: rest.is_empty(),
        priority,
        pad_len: None,
    }];
    push_continuations(&mut frames, stream_id, rest, max_frame_size);
    frames
}

/// Like [`header_block_frames`] for PUSH_PROMISE, whose first frame also
/// carries the 4-byte promised stream id.
pub fn push_promise_frames(
    stream_id: u32,
    promised_stream_id: u32,
    mut block: Vec<u8>,
    max_frame_size: usize,
) -> Vec<Frame> {
    let rest = split_tail(&mut block, max_frame_size - 4);
    let mut frames = vec![Frame::PushPromise {
        stream_id,
        promised_stream_id,
        header_block: block,
        end_headers: rest.is_empty(),
        pad_len: None,
    }];
    push_continuations(&mut frames, stream_id, rest, max_frame_size);
    frames
}

fn split_tail(block: &mut Vec<u8>, first_len: usize) -> Vec<u8> {
    if block.len() > first_len {
        block.split_off(first_len)
    } else {
        Vec::new()
    }
}

fn push_continuations(frames: &mut Vec<Frame>, stream_id: u32, rest: Vec<u8>, max_frame_size: usize) {
    let mut chunks = rest.chunks(max_frame_size).peekable();
    while let Some(chunk) = chunks.next() {
        frames.push(Frame::Continuation {
            stream_id,
            header_block: chunk.to_vec(),
            end_headers: chunks.peek().is_none(),
        });
    }
}

/// One alternative service advertised in an ALTSVC field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltService {
    pub protocol_id: String,
    pub host: String,
    pub port: u16,
    pub max_age: u32,
}

impl AltService {
    pub const DEFAULT_MAX_AGE: u32 = 86_400;

    /// Parse the first alternative of an Alt-Svc field value such as
    /// `h2="alt.example.com:443"; ma=600`. Returns `None` when malformed.
    pub fn parse(field_value: &str) -> Option<Self> {
        let first = split_unquoted(field_value, ',').into_iter().next()?;
        let mut params = split_unquoted(first, ';').into_iter();

        let (name, value) = params.next()?.split_once('=')?;
        let authority = value.trim().trim_matches('"');
        let (host, port) = authority.rsplit_once(':')?;
        let mut service = AltService {
            protocol_id: percent_unescape(name.trim()),
            host: host.to_string(),
            port: port.parse().ok()?,
            max_age: Self::DEFAULT_MAX_AGE,
        };

        for param in params {
            if let Some((key, value)) = param.split_once('=') {
                if key.trim() == "ma" {
                    if let Ok(max_age) = value.trim().trim_matches('"').parse() {
                        service.max_age = max_age;
                    }
                }
            }
        }
        Some(service)
    }

    pub fn to_field_value(&self) -> String {
        format!(
            "{}=\"{}:{}\"; ma={}",
            self.protocol_id, self.host, self.port, self.max_age
        )
    }
}

/// Split on `sep` outside double quotes, dropping empty pieces.
fn split_unquoted(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        if c == '"' {
            in_quotes = !in_quotes;
        } else if c == sep && !in_quotes {
            parts.push(s[start..i].trim());
            start = i + 1;
        }
    }
    parts.push(s[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}

fn percent_unescape(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Preface,
    Header,
    Payload(FrameHeader),
}

/// Incremental HTTP/2 frame decoder.
///
/// Feed raw bytes with [`push`](Self::push) and pull frames with
/// [`next_frame`](Self::next_frame), or do both with [`decode`](Self::decode).
/// Frames of unknown type are consumed and dropped. Malformed frames yield a
/// connection error naming the HTTP/2 error code.
#[derive(Debug)]
pub struct FrameDecoder {
    role: Role,
    max_frame_size: u32,
    phase: Phase,
    /// Bytes not yet consumed by the current phase
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// A decoder for the given local role. Servers first expect the client
    /// connection preface.
    pub fn new(role: Role) -> Self {
        let phase = match role {
            Role::Server => Phase::Preface,
            Role::Client => Phase::Header,
        };
        Self {
            role,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            phase,
            buffer: Vec::new(),
        }
    }

    /// Skip the preface check (e.g. when the preface was consumed elsewhere).
    pub fn skip_preface(&mut self) {
        if let Phase::Preface = self.phase {
            self.phase = Phase::Header;
        }
    }

    /// Largest payload accepted, normally our SETTINGS_MAX_FRAME_SIZE.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Number of buffered bytes that do not yet form a complete unit.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Feed bytes and return every frame they complete.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Frame>, H2Error> {
        self.push(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Return the next complete frame, or `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, H2Error> {
        loop {
            match self.phase {
                Phase::Preface => {
                    let n = CONNECTION_PREFACE.len();
                    let have = self.buffer.len().min(n);
                    if self.buffer[..have] != CONNECTION_PREFACE[..have] {
                        return Err(H2Error::protocol("invalid connection preface"));
                    }
                    if have < n {
                        return Ok(None);
                    }
                    self.buffer.drain(..n);
                    self.phase = Phase::Header;
                }
                Phase::Header => {
                    let header = match FrameHeader::parse(&self.buffer) {
                        Some(h) => h,
                        None => return Ok(None),
                    };
                    if header.length > self.max_frame_size {
                        return Err(H2Error::frame_size(format!(
                            "frame of {} bytes exceeds max frame size {}",
                            header.length, self.max_frame_size
                        )));
                    }
                    self.buffer.drain(..FRAME_HEADER_LEN);
                    self.phase = Phase::Payload(header);
                }
                Phase::Payload(header) => {
                    let len = header.length as usize;
                    if self.buffer.len() < len {
                        return Ok(None);
                    }
                    // Split buffer to avoid double copy: the payload keeps [0..len]
                    let remainder = self.buffer.split_off(len);
                    let payload = std::mem::replace(&mut self.buffer, remainder);
                    self.phase = Phase::Header;

                    match FrameKind::from_u8(header.frame_type) {
                        Some(kind) => {
                            let frame = self.parse_payload(&header, kind, payload)?;
                            trace!("decoded {:?} frame on stream {}", kind, header.stream_id);
                            return Ok(Some(frame));
                        }
                        None => {
                            debug!(
                                "dropping frame of unknown type {:#x} on stream {}",
                                header.frame_type, header.stream_id
                            );
                        }
                    }
                }
            }
        }
    }

    fn parse_payload(&self, header: &FrameHeader, kind: FrameKind, payload: Vec<u8>) -> Result<Frame, H2Error> {
        let stream_id = header.stream_id;
        match kind {
            FrameKind::Data => {
                let (data, pad_len) = strip_padding(header, payload)?;
                Ok(Frame::Data {
                    stream_id,
                    data,
                    end_stream: header.has_flag(flags::END_STREAM),
                    pad_len,
                })
            }
            FrameKind::Headers => {
                let (mut block, pad_len) = strip_padding(header, payload)?;
                let priority = if header.has_flag(flags::PRIORITY) {
                    if block.len() < 5 {
                        return Err(H2Error::frame_size("PRIORITY HEADERS frame with insufficient data"));
                    }
                    let spec = PrioritySpec::parse(&block[..5]);
                    block.drain(..5);
                    Some(spec)
                } else {
                    None
                };
                Ok(Frame::Headers {
                    stream_id,
                    header_block: block,
                    end_stream: header.has_flag(flags::END_STREAM),
                    end_headers: header.has_flag(flags::END_HEADERS),
                    priority,
                    pad_len,
                })
            }
            FrameKind::Priority => {
                expect_len(&payload, 5, "PRIORITY")?;
                Ok(Frame::Priority {
                    stream_id,
                    priority: PrioritySpec::parse(&payload),
                })
            }
            FrameKind::RstStream => {
                expect_len(&payload, 4, "RST_STREAM")?;
                Ok(Frame::RstStream {
                    stream_id,
                    error_code: ErrorCode::from_u32(read_u32(&payload[..4])),
                })
            }
            FrameKind::Settings => self.parse_settings(header, &payload),
            FrameKind::PushPromise => {
                let (mut block, pad_len) = strip_padding(header, payload)?;
                if block.len() < 4 {
                    return Err(H2Error::frame_size("PUSH_PROMISE frame too short"));
                }
                let promised_stream_id = read_u32(&block[..4]) & MAX_STREAM_ID;
                block.drain(..4);
                Ok(Frame::PushPromise {
                    stream_id,
                    promised_stream_id,
                    header_block: block,
                    end_headers: header.has_flag(flags::END_HEADERS),
                    pad_len,
                })
            }
            FrameKind::Ping => {
                expect_len(&payload, 8, "PING")?;
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload);
                Ok(Frame::Ping {
                    ack: header.has_flag(flags::ACK),
                    data,
                })
            }
            FrameKind::GoAway => {
                if payload.len() < 8 {
                    return Err(H2Error::frame_size("GOAWAY frame too short"));
                }
                Ok(Frame::GoAway {
                    last_stream_id: read_u32(&payload[..4]) & MAX_STREAM_ID,
                    error_code: ErrorCode::from_u32(read_u32(&payload[4..8])),
                    debug_data: payload[8..].to_vec(),
                })
            }
            FrameKind::WindowUpdate => {
                expect_len(&payload, 4, "WINDOW_UPDATE")?;
                let increment = read_u32(&payload) & MAX_STREAM_ID;
                if increment == 0 {
                    return Err(H2Error::protocol(format!(
                        "WINDOW_UPDATE with zero increment on stream {}",
                        stream_id
                    )));
                }
                Ok(Frame::WindowUpdate { stream_id, increment })
            }
            FrameKind::Continuation => Ok(Frame::Continuation {
                stream_id,
                header_block: payload,
                end_headers: header.has_flag(flags::END_HEADERS),
            }),
            FrameKind::AltSvc => {
                if payload.len() < 2 {
                    return Err(H2Error::frame_size("ALTSVC frame too short"));
                }
                let origin_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
                if payload.len() - 2 < origin_len {
                    return Err(H2Error::frame_size("ALTSVC origin length exceeds payload"));
                }
                Ok(Frame::AltSvc {
                    stream_id,
                    origin: String::from_utf8_lossy(&payload[2..2 + origin_len]).into_owned(),
                    field_value: String::from_utf8_lossy(&payload[2 + origin_len..]).into_owned(),
                })
            }
            FrameKind::Origin => {
                let mut origins = Vec::new();
                let mut pos = 0;
                while pos < payload.len() {
                    if payload.len() - pos < 2 {
                        return Err(H2Error::frame_size("truncated ORIGIN entry"));
                    }
                    let len = u16::from_be_bytes([payload[pos], payload[pos + 1]]) as usize;
                    pos += 2;
                    if payload.len() - pos < len {
                        return Err(H2Error::frame_size("truncated ORIGIN entry"));
                    }
                    origins.push(String::from_utf8_lossy(&payload[pos..pos + len]).into_owned());
                    pos += len;
                }
                Ok(Frame::Origin { origins })
            }
        }
    }

    fn parse_settings(&self, header: &FrameHeader, payload: &[u8]) -> Result<Frame, H2Error> {
        let ack = header.has_flag(flags::ACK);
        if ack {
            if !payload.is_empty() {
                return Err(H2Error::frame_size("SETTINGS ACK with a payload"));
            }
            return Ok(Frame::Settings {
                ack,
                settings: Vec::new(),
            });
        }
        if payload.len() % 6 != 0 {
            return Err(H2Error::protocol(format!(
                "SETTINGS payload of {} bytes is not a multiple of 6",
                payload.len()
            )));
        }

        let mut settings = Vec::with_capacity(payload.len() / 6);
        // Each setting is 6 bytes: u16 id + u32 value
        for entry in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = read_u32(&entry[2..6]);
            if id == settings_id::ENABLE_PUSH && self.role.is_client() {
                return Err(H2Error::protocol("server sent SETTINGS_ENABLE_PUSH"));
            }
            match Setting::from_wire(id, value)? {
                Some(setting) => settings.push(setting),
                None => trace!("ignoring unknown setting {:#x}", id),
            }
        }
        Ok(Frame::Settings { ack, settings })
    }
}

fn read_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

fn expect_len(payload: &[u8], len: usize, name: &str) -> Result<(), H2Error> {
    if payload.len() != len {
        return Err(H2Error::frame_size(format!(
            "{} frame has length {} (expected {})",
            name,
            payload.len(),
            len
        )));
    }
    Ok(())
}

/// Remove the pad-length byte and trailing padding when PADDED is set.
/// Takes ownership of the payload Vec to avoid re-copying.
fn strip_padding(header: &FrameHeader, mut payload: Vec<u8>) -> Result<(Vec<u8>, Option<u8>), H2Error> {
    if !header.has_flag(flags::PADDED) {
        return Ok((payload, None));
    }
    if payload.is_empty() {
        return Err(H2Error::frame_size("PADDED frame with no payload"));
    }
    let pad_length = payload[0];
    if pad_length as usize >= payload.len() {
        return Err(H2Error::protocol("padding length exceeds frame payload"));
    }
    // Remove padding from end, then remove pad_length byte from start
    payload.truncate(payload.len() - pad_length as usize);
    payload.remove(0);
    Ok((payload, Some(pad_length)))
}

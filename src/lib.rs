//! h2-rpc-core: a sans-I/O HTTP/2 transport core with a gRPC-style RPC binding
//!
//! This crate implements the HTTP/2 protocol machinery (RFC 7540) and HPACK
//! header compression (RFC 7541) as plain synchronous state machines. You feed
//! it bytes and it tells you what happened and what to write back; sockets,
//! TLS and threads stay on your side.
//!
//! # Features
//!
//! - **Sans-I/O Design**: No async runtime, no sockets inside the core
//! - **Complete Frame Codec**: All twelve frame types including ALTSVC and
//!   ORIGIN, incremental decoding across arbitrary read boundaries
//! - **Own HPACK**: Static/dynamic table, Huffman coding, never-indexed fields
//! - **Flow Control**: Per-stream and per-connection windows, DATA splitting,
//!   automatic WINDOW_UPDATE
//! - **Stream Multiplexing**: RFC 7540 stream states, concurrency limits,
//!   priority buckets served round robin
//! - **RPC Binding**: Length-prefixed messages, status trailers, a service
//!   registry and a blocking client
//!
//! # Quick Start
//!
//! ```rust
//! use h2_rpc_core::{Connection, Event, Header};
//!
//! let mut client = Connection::client();
//! let mut server = Connection::server();
//!
//! let stream = client.open_stream().unwrap();
//! client
//!     .send_headers(
//!         stream,
//!         vec![
//!             Header::new(":method", "GET"),
//!             Header::new(":scheme", "http"),
//!             Header::new(":path", "/"),
//!             Header::new(":authority", "example.com"),
//!         ],
//!         true,
//!     )
//!     .unwrap();
//!
//! // Shuttle bytes until both sides are quiet
//! loop {
//!     let to_server = client.take_pending_send();
//!     let to_client = server.take_pending_send();
//!     if to_server.is_empty() && to_client.is_empty() {
//!         break;
//!     }
//!     server.recv(&to_server).unwrap();
//!     client.recv(&to_client).unwrap();
//! }
//!
//! while let Some(event) = server.poll_event() {
//!     if let Event::Headers { headers, .. } = event {
//!         println!("request: {:?}", headers);
//!     }
//! }
//! ```
//!
//! # Architecture
//!
//! Leaves first:
//! - [`frame`]: wire format (bytes ↔ [`Frame`])
//! - [`hpack`] and [`huffman`]: header compression
//! - [`flow`]: window accounting
//! - [`stream`]: per-stream state machine and outbound queue
//! - [`connection`]: the multiplexer that ties them together
//! - [`grpc`]: RPC calls on top of a connection
//!
//! It does NOT provide:
//! - TCP listeners or dialing (you provide the bytes)
//! - TLS (use rustls or similar)
//! - Timeouts (a silent peer stalls only the affected stream)

pub mod config;
pub mod connection;
pub mod error;
pub mod flow;
pub mod frame;
pub mod grpc;
pub mod hpack;
pub mod huffman;
pub mod settings;
pub mod stream;

pub use config::{Config, Role};
pub use connection::{Connection, Event};
pub use error::{ErrorCode, H2Error};
pub use frame::{AltService, Frame, FrameDecoder, FrameHeader, FrameKind, PrioritySpec, CONNECTION_PREFACE};
pub use hpack::{Compressor, Decompressor, Header, HeaderTable};
pub use settings::{Setting, Settings};
pub use stream::{StreamKey, StreamState};

//! gRPC-style RPC binding on top of [`Connection`](crate::Connection).
//!
//! Calls are mapped onto streams: the request path names the method
//! (`/<package.Service>/<Method>`), messages travel length-prefixed in DATA
//! frames and the outcome arrives as `grpc-status` / `grpc-message` trailers.
//! Message encoding is left to the [`Message`] trait, so any protobuf library
//! (or hand-written codec) can be plugged in.

pub mod client;
pub mod message;
pub mod server;
pub mod status;

pub use client::{ClientOptions, GrpcClient};
pub use message::{encode_message, MessageDecoder};
pub use server::{GrpcServer, ServerConnection, ServerOptions, Service, ServiceBuilder};
pub use status::{Code, Status};

use crate::error::H2Error;

pub const CONTENT_TYPE: &str = "application/grpc";
pub const CONTENT_TYPE_PROTO: &str = "application/grpc+proto";

/// Errors surfaced by the RPC layer.
#[derive(Debug, thiserror::Error)]
pub enum GrpcError {
    #[error("transport error: {0}")]
    Transport(#[from] H2Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The call completed with a non-OK status
    #[error("{0}")]
    Status(#[from] Status),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// An encodable request or response type.
pub trait Message: Sized {
    fn encode(&self) -> Vec<u8>;
    fn decode(buf: &[u8]) -> Result<Self, Status>;
}

/// Raw bytes, for callers that do their own encoding.
impl Message for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        self.clone()
    }

    fn decode(buf: &[u8]) -> Result<Self, Status> {
        Ok(buf.to_vec())
    }
}

/// Split `/<service>/<method>` into its two parts.
pub(crate) fn split_path(path: &str) -> Option<(&str, &str)> {
    let (service, method) = path.strip_prefix('/')?.split_once('/')?;
    if service.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some((service, method))
}

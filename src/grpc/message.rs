//! Length-prefixed message framing inside DATA payloads.
//!
//! Every message is a 1-byte compression flag, a 4-byte big-endian length and
//! the encoded message. Only the identity encoding (flag 0) is supported.

use log::trace;

use super::status::{Code, Status};

/// Flag byte plus length.
pub const MESSAGE_HEADER_LEN: usize = 5;

/// Default cap on a single decoded message (4 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Frame one encoded message for the wire.
pub fn encode_message(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(MESSAGE_HEADER_LEN + message.len());
    out.push(0);
    out.extend_from_slice(&(message.len() as u32).to_be_bytes());
    out.extend_from_slice(message);
    out
}

/// Reassembles messages from DATA chunks that may split or join them freely.
#[derive(Debug)]
pub struct MessageDecoder {
    buffer: Vec<u8>,
    max_message_size: usize,
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_size(max_message_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_message_size,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes belonging to a message that is not complete yet.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete message, `None` if more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<Vec<u8>>, Status> {
        if self.buffer.len() < MESSAGE_HEADER_LEN {
            return Ok(None);
        }
        match self.buffer[0] {
            0 => {}
            1 => return Err(Status::unimplemented("compressed messages are not supported")),
            flag => return Err(Status::internal(format!("invalid compression flag {}", flag))),
        }
        let len = u32::from_be_bytes([self.buffer[1], self.buffer[2], self.buffer[3], self.buffer[4]]) as usize;
        if len > self.max_message_size {
            return Err(Status::new(
                Code::ResourceExhausted,
                format!("message of {} bytes exceeds limit of {}", len, self.max_message_size),
            ));
        }
        if self.buffer.len() < MESSAGE_HEADER_LEN + len {
            return Ok(None);
        }

        let rest = self.buffer.split_off(MESSAGE_HEADER_LEN + len);
        let mut message = std::mem::replace(&mut self.buffer, rest);
        message.drain(..MESSAGE_HEADER_LEN);
        trace!("decoded message of {} bytes", len);
        Ok(Some(message))
    }
}

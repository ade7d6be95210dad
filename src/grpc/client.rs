//! Blocking client over any `Read + Write` transport.

use std::io::{Read, Write};

use log::{debug, trace};

use super::message::{encode_message, MessageDecoder, DEFAULT_MAX_MESSAGE_SIZE};
use super::status::Status;
use super::{GrpcError, Message, CONTENT_TYPE};
use crate::config::Config;
use crate::connection::{Connection, Event};
use crate::error::ErrorCode;
use crate::hpack::{get_header, Header};
use crate::settings::Settings;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Value of `:authority`
    pub authority: String,
    pub scheme: String,
    pub settings: Settings,
    pub read_buffer_size: usize,
    pub max_message_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            authority: "localhost".to_string(),
            scheme: "http".to_string(),
            settings: Settings::client(),
            read_buffer_size: 16 * 1024,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// One HTTP/2 connection used for sequential calls.
pub struct GrpcClient<T> {
    io: T,
    conn: Connection,
    options: ClientOptions,
    buf: Vec<u8>,
}

impl<T: Read + Write> GrpcClient<T> {
    pub fn new(io: T) -> Self {
        Self::with_options(io, ClientOptions::default())
    }

    pub fn with_options(io: T, options: ClientOptions) -> Self {
        let conn = Connection::new(Config::client().with_settings(options.settings.clone()));
        Self {
            io,
            conn,
            buf: vec![0u8; options.read_buffer_size],
            options,
        }
    }

    /// Call a method with one request and one response.
    /// `path` has the form `/<package.Service>/<Method>`.
    pub fn unary<Req: Message, Resp: Message>(&mut self, path: &str, request: &Req) -> Result<Resp, GrpcError> {
        let mut responses = self.call(path, request)?;
        if responses.len() != 1 {
            return Err(GrpcError::Protocol(format!(
                "expected one response message, got {}",
                responses.len()
            )));
        }
        let response = responses.remove(0);
        Ok(Resp::decode(&response)?)
    }

    /// Call a method with one request and a stream of responses.
    pub fn server_streaming<Req: Message, Resp: Message>(
        &mut self,
        path: &str,
        request: &Req,
    ) -> Result<Vec<Resp>, GrpcError> {
        self.call(path, request)?
            .iter()
            .map(|response| Resp::decode(response).map_err(GrpcError::from))
            .collect()
    }

    /// Send GOAWAY and flush it.
    pub fn close(&mut self) -> Result<(), GrpcError> {
        self.conn.close(ErrorCode::NoError);
        self.flush()
    }

    pub fn into_inner(self) -> T {
        self.io
    }

    fn request_headers(&self, path: &str) -> Vec<Header> {
        vec![
            Header::new(":method", "POST"),
            Header::new(":scheme", self.options.scheme.as_str()),
            Header::new(":path", path),
            Header::new(":authority", self.options.authority.as_str()),
            Header::new("content-type", CONTENT_TYPE),
            Header::new("te", "trailers"),
        ]
    }

    fn call<Req: Message>(&mut self, path: &str, request: &Req) -> Result<Vec<Vec<u8>>, GrpcError> {
        debug!("calling {}", path);
        let key = self.conn.open_stream()?;
        let headers = self.request_headers(path);
        self.conn.send_headers(key, headers, false)?;
        self.conn.send_data(key, encode_message(&request.encode()), true)?;

        let mut decoder = MessageDecoder::with_max_size(self.options.max_message_size);
        let mut messages = Vec::new();
        loop {
            self.flush()?;

            while let Some(event) = self.conn.poll_event() {
                match event {
                    Event::Headers {
                        stream,
                        headers,
                        end_stream,
                    } if stream == key => {
                        if let Some(code) = get_header(&headers, ":status") {
                            if code != "200" {
                                return Err(GrpcError::Protocol(format!("HTTP status {}", code)));
                            }
                        }
                        if end_stream {
                            let status = Status::from_trailers(&headers);
                            debug!("{} finished: {}", path, status);
                            if !status.is_ok() {
                                return Err(GrpcError::Status(status));
                            }
                            if decoder.buffered() > 0 {
                                return Err(GrpcError::Protocol("truncated response message".into()));
                            }
                            return Ok(messages);
                        }
                    }
                    Event::Data { stream, data, .. } if stream == key => {
                        decoder.push(&data);
                        while let Some(message) = decoder.next_message()? {
                            messages.push(message);
                        }
                    }
                    Event::Reset { stream, error_code } if stream == key => {
                        return Err(GrpcError::Protocol(format!("stream reset by server: {}", error_code)));
                    }
                    Event::GoAway { error_code, .. } => debug!("server sent GOAWAY ({})", error_code),
                    other => trace!("ignoring {:?}", other),
                }
            }

            let n = self.io.read(&mut self.buf)?;
            if n == 0 {
                return Err(GrpcError::Protocol("connection closed before the call completed".into()));
            }
            self.conn.recv(&self.buf[..n])?;
        }
    }

    fn flush(&mut self) -> Result<(), GrpcError> {
        loop {
            let out = self.conn.take_pending_send();
            if out.is_empty() {
                break;
            }
            self.io.write_all(&out)?;
        }
        self.io.flush()?;
        Ok(())
    }
}

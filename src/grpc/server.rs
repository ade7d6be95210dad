//! Service registry and the server side of a connection.

use std::collections::HashMap;
use std::io::{Read, Write};

use log::{debug, warn};

use super::message::{encode_message, MessageDecoder, DEFAULT_MAX_MESSAGE_SIZE};
use super::status::Status;
use super::{split_path, GrpcError, Message, CONTENT_TYPE, CONTENT_TYPE_PROTO};
use crate::config::Config;
use crate::connection::{Connection, Event};
use crate::error::ErrorCode;
use crate::hpack::{get_header, Header};
use crate::settings::Settings;
use crate::stream::StreamKey;

type UnaryHandler = Box<dyn Fn(&[u8]) -> Result<Vec<u8>, Status> + Send + Sync>;
type StreamingHandler = Box<dyn Fn(&[u8]) -> Result<Vec<Vec<u8>>, Status> + Send + Sync>;

enum Handler {
    Unary(UnaryHandler),
    ServerStreaming(StreamingHandler),
}

impl Handler {
    fn call(&self, request: &[u8]) -> Result<Vec<Vec<u8>>, Status> {
        match self {
            Handler::Unary(handler) => handler(request).map(|response| vec![response]),
            Handler::ServerStreaming(handler) => handler(request),
        }
    }
}

/// A named set of methods.
pub struct Service {
    name: String,
    methods: HashMap<String, Handler>,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }
}

pub struct ServiceBuilder {
    service: Service,
}

impl ServiceBuilder {
    /// `name` is the fully qualified service name, e.g. `pkg.Greeter`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            service: Service {
                name: name.into(),
                methods: HashMap::new(),
            },
        }
    }

    /// Register a method with one request and one response.
    pub fn unary<Req, Resp, F>(mut self, method: &str, handler: F) -> Self
    where
        Req: Message,
        Resp: Message,
        F: Fn(Req) -> Result<Resp, Status> + Send + Sync + 'static,
    {
        let handler: UnaryHandler = Box::new(move |bytes| {
            let request = Req::decode(bytes)?;
            handler(request).map(|response| response.encode())
        });
        self.service.methods.insert(method.to_string(), Handler::Unary(handler));
        self
    }

    /// Register a method with one request and any number of responses.
    pub fn server_streaming<Req, Resp, F>(mut self, method: &str, handler: F) -> Self
    where
        Req: Message,
        Resp: Message,
        F: Fn(Req) -> Result<Vec<Resp>, Status> + Send + Sync + 'static,
    {
        let handler: StreamingHandler = Box::new(move |bytes| {
            let request = Req::decode(bytes)?;
            handler(request).map(|responses| responses.iter().map(|r| r.encode()).collect())
        });
        self.service
            .methods
            .insert(method.to_string(), Handler::ServerStreaming(handler));
        self
    }

    pub fn build(self) -> Service {
        self.service
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// SETTINGS announced to every client
    pub settings: Settings,
    pub read_buffer_size: usize,
    pub max_message_size: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            read_buffer_size: 16 * 1024,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Registry of services. One instance can serve any number of connections.
#[derive(Default)]
pub struct GrpcServer {
    services: HashMap<String, Service>,
    options: ServerOptions,
}

impl GrpcServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ServerOptions) -> Self {
        Self {
            services: HashMap::new(),
            options,
        }
    }

    pub fn add_service(mut self, service: Service) -> Self {
        debug!("registering service {}", service.name);
        self.services.insert(service.name.clone(), service);
        self
    }

    /// Find the handler for a `:path`. The service is looked up by its full
    /// name first, then by the last dot-separated segment.
    fn lookup(&self, path: &str) -> Option<&Handler> {
        let (service, method) = split_path(path)?;
        let service = self.services.get(service).or_else(|| {
            let short = service.rsplit('.').next()?;
            self.services.get(short)
        })?;
        service.methods.get(method)
    }

    /// Sans-I/O server state for one connection.
    pub fn connection(&self) -> ServerConnection<'_> {
        ServerConnection::new(self)
    }

    /// Run one connection over a blocking transport until the peer goes away.
    pub fn serve<T: Read + Write>(&self, mut io: T) -> Result<(), GrpcError> {
        let mut conn = self.connection();
        let mut buf = vec![0u8; self.options.read_buffer_size];
        loop {
            write_pending(&mut conn, &mut io)?;
            if conn.is_closed() {
                debug!("connection closed");
                return Ok(());
            }
            let n = io.read(&mut buf)?;
            if n == 0 {
                debug!("peer closed the transport");
                return Ok(());
            }
            if let Err(e) = conn.recv(&buf[..n]) {
                // Best effort: let the peer see our GOAWAY
                if let Err(write_err) = write_pending(&mut conn, &mut io) {
                    debug!("could not send GOAWAY: {}", write_err);
                }
                return Err(e);
            }
        }
    }
}

fn write_pending<T: Write>(conn: &mut ServerConnection<'_>, io: &mut T) -> Result<(), GrpcError> {
    let mut wrote = false;
    loop {
        let out = conn.take_pending_send();
        if out.is_empty() {
            break;
        }
        io.write_all(&out)?;
        wrote = true;
    }
    if wrote {
        io.flush()?;
    }
    Ok(())
}

/// A call whose request is still arriving.
struct Call {
    path: String,
    decoder: MessageDecoder,
}

/// Server side of one connection: feeds requests to the registered handlers
/// and queues the responses.
pub struct ServerConnection<'a> {
    server: &'a GrpcServer,
    conn: Connection,
    calls: HashMap<StreamKey, Call>,
}

impl<'a> ServerConnection<'a> {
    pub fn new(server: &'a GrpcServer) -> Self {
        let config = Config::server().with_settings(server.options.settings.clone());
        Self {
            server,
            conn: Connection::new(config),
            calls: HashMap::new(),
        }
    }

    /// Feed transport bytes; completed requests are answered immediately.
    pub fn recv(&mut self, data: &[u8]) -> Result<(), GrpcError> {
        let result = self.conn.recv(data);
        // Events raised before a connection error are still handled
        self.process_events();
        result.map_err(GrpcError::from)
    }

    pub fn take_pending_send(&mut self) -> Vec<u8> {
        self.conn.take_pending_send()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Gracefully shut the connection down.
    pub fn close(&mut self) {
        self.conn.close(ErrorCode::NoError);
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn process_events(&mut self) {
        while let Some(event) = self.conn.poll_event() {
            match event {
                Event::Headers {
                    stream,
                    headers,
                    end_stream,
                } => {
                    if !self.calls.contains_key(&stream) {
                        self.start_call(stream, &headers);
                    }
                    if end_stream {
                        self.dispatch(stream);
                    }
                }
                Event::Data {
                    stream,
                    data,
                    end_stream,
                } => {
                    if let Some(call) = self.calls.get_mut(&stream) {
                        call.decoder.push(&data);
                    }
                    if end_stream {
                        self.dispatch(stream);
                    }
                }
                Event::Reset { stream, error_code } | Event::StreamError { stream, error_code } => {
                    if let Some(call) = self.calls.remove(&stream) {
                        debug!("call {} abandoned: {}", call.path, error_code);
                    }
                }
                Event::GoAway { error_code, .. } => debug!("client sent GOAWAY ({})", error_code),
                _ => {}
            }
        }
    }

    fn start_call(&mut self, stream: StreamKey, headers: &[Header]) {
        let path = get_header(headers, ":path").unwrap_or_default().to_string();
        match get_header(headers, "content-type") {
            Some(ct) if ct.starts_with(CONTENT_TYPE) => {}
            other => warn!("call {} with content-type {:?}", path, other),
        }
        debug!("call {} started", path);
        self.calls.insert(
            stream,
            Call {
                path,
                decoder: MessageDecoder::with_max_size(self.server.options.max_message_size),
            },
        );
    }

    fn dispatch(&mut self, stream: StreamKey) {
        let Some(call) = self.calls.remove(&stream) else {
            return;
        };
        let server = self.server;
        let path = call.path.clone();
        let result = match server.lookup(&path) {
            Some(handler) => read_request(call).and_then(|request| handler.call(&request)),
            None => Err(Status::unimplemented(format!("Method \"{}\" not implemented", path))),
        };

        let (responses, status) = match result {
            Ok(responses) => (responses, Status::ok()),
            Err(status) => {
                debug!("call {} failed: {}", path, status);
                (Vec::new(), status)
            }
        };
        if let Err(e) = self.respond(stream, responses, &status) {
            warn!("could not answer call {}: {}", path, e);
        }
    }

    fn respond(&mut self, stream: StreamKey, responses: Vec<Vec<u8>>, status: &Status) -> Result<(), GrpcError> {
        self.conn.send_headers(stream, response_headers(), false)?;
        for response in responses {
            self.conn.send_data(stream, encode_message(&response), false)?;
        }
        self.conn.send_headers(stream, status.to_trailers(), true)?;
        Ok(())
    }
}

/// Exactly one request message is expected.
fn read_request(mut call: Call) -> Result<Vec<u8>, Status> {
    let request = call
        .decoder
        .next_message()?
        .ok_or_else(|| Status::internal("missing request message"))?;
    if call.decoder.next_message()?.is_some() {
        return Err(Status::unimplemented("expected a single request message"));
    }
    if call.decoder.buffered() > 0 {
        return Err(Status::internal("truncated request message"));
    }
    Ok(request)
}

fn response_headers() -> Vec<Header> {
    vec![
        Header::new(":status", "200"),
        Header::new("grpc-accept-encoding", "identity"),
        Header::new("grpc-encoding", "identity"),
        Header::new("content-type", CONTENT_TYPE_PROTO),
    ]
}

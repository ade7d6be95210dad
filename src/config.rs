//! Per-connection configuration.

use crate::settings::Settings;

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// Client-initiated streams are odd, server-initiated streams are even.
    pub fn first_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    pub fn is_client(self) -> bool {
        self == Role::Client
    }
}

/// Maximum accumulated header block size (256 KB).
pub const DEFAULT_MAX_HEADER_BLOCK_SIZE: usize = 256 * 1024;

/// Configuration handed to each [`Connection`](crate::Connection).
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    /// Local SETTINGS, announced in the connection header.
    pub settings: Settings,
    /// Cap on a HEADERS/PUSH_PROMISE + CONTINUATION block under reassembly.
    pub max_header_block_size: usize,
    /// Queued DATA bytes per stream before `send_data` reports backpressure.
    pub stream_send_buffer: usize,
    /// Encoded bytes produced by one flush before the scheduler yields.
    pub max_send_buffer: usize,
    /// How many closed stream ids are remembered for late-frame checks.
    pub closed_stream_memory: usize,
}

impl Config {
    pub fn new(role: Role) -> Self {
        let settings = match role {
            Role::Client => Settings::client(),
            Role::Server => Settings::default(),
        };
        Self {
            role,
            settings,
            max_header_block_size: DEFAULT_MAX_HEADER_BLOCK_SIZE,
            stream_send_buffer: 64 * 1024,
            max_send_buffer: 256 * 1024,
            closed_stream_memory: 128,
        }
    }

    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }
}

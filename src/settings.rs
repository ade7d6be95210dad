//! HTTP/2 SETTINGS parameters (RFC 7540 Section 6.5.2)

use crate::error::{ErrorCode, H2Error};

/// SETTINGS identifiers
pub mod settings_id {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
/// Largest value MAX_FRAME_SIZE may announce (2^24 - 1).
pub const MAX_FRAME_SIZE_LIMIT: u32 = (1 << 24) - 1;
/// Largest flow-control window (2^31 - 1).
pub const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

/// One SETTINGS entry with its value decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    HeaderTableSize(u32),
    EnablePush(bool),
    MaxConcurrentStreams(u32),
    InitialWindowSize(u32),
    MaxFrameSize(u32),
    MaxHeaderListSize(u32),
}

impl Setting {
    pub fn id(&self) -> u16 {
        match self {
            Self::HeaderTableSize(_) => settings_id::HEADER_TABLE_SIZE,
            Self::EnablePush(_) => settings_id::ENABLE_PUSH,
            Self::MaxConcurrentStreams(_) => settings_id::MAX_CONCURRENT_STREAMS,
            Self::InitialWindowSize(_) => settings_id::INITIAL_WINDOW_SIZE,
            Self::MaxFrameSize(_) => settings_id::MAX_FRAME_SIZE,
            Self::MaxHeaderListSize(_) => settings_id::MAX_HEADER_LIST_SIZE,
        }
    }

    pub fn value(&self) -> u32 {
        match *self {
            Self::EnablePush(on) => on as u32,
            Self::HeaderTableSize(v)
            | Self::MaxConcurrentStreams(v)
            | Self::InitialWindowSize(v)
            | Self::MaxFrameSize(v)
            | Self::MaxHeaderListSize(v) => v,
        }
    }

    /// Decode a wire (id, value) pair.
    ///
    /// Returns `Ok(None)` for identifiers this implementation does not know,
    /// which must be ignored. Out-of-range values are connection errors.
    pub fn from_wire(id: u16, value: u32) -> Result<Option<Self>, H2Error> {
        let setting = match id {
            settings_id::HEADER_TABLE_SIZE => Self::HeaderTableSize(value),
            settings_id::ENABLE_PUSH => match value {
                0 => Self::EnablePush(false),
                1 => Self::EnablePush(true),
                _ => {
                    return Err(H2Error::protocol(format!(
                        "invalid SETTINGS_ENABLE_PUSH value {}",
                        value
                    )))
                }
            },
            settings_id::MAX_CONCURRENT_STREAMS => Self::MaxConcurrentStreams(value),
            settings_id::INITIAL_WINDOW_SIZE => {
                if value > MAX_WINDOW_SIZE {
                    return Err(H2Error::connection(
                        ErrorCode::FlowControlError,
                        format!("SETTINGS_INITIAL_WINDOW_SIZE {} exceeds 2^31-1", value),
                    ));
                }
                Self::InitialWindowSize(value)
            }
            settings_id::MAX_FRAME_SIZE => {
                if !(DEFAULT_MAX_FRAME_SIZE..=MAX_FRAME_SIZE_LIMIT).contains(&value) {
                    return Err(H2Error::protocol(format!(
                        "invalid SETTINGS_MAX_FRAME_SIZE {}",
                        value
                    )));
                }
                Self::MaxFrameSize(value)
            }
            settings_id::MAX_HEADER_LIST_SIZE => Self::MaxHeaderListSize(value),
            _ => return Ok(None),
        };
        Ok(Some(setting))
    }
}

/// The parameters one endpoint has announced (or will announce).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    /// `None` means no limit was announced.
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    /// Enforced on received header lists; `None` means no limit.
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// Defaults for a client, which does not accept server push.
    pub fn client() -> Self {
        Self {
            enable_push: false,
            ..Self::default()
        }
    }

    pub fn apply(&mut self, setting: Setting) {
        match setting {
            Setting::HeaderTableSize(v) => self.header_table_size = v,
            Setting::EnablePush(v) => self.enable_push = v,
            Setting::MaxConcurrentStreams(v) => self.max_concurrent_streams = Some(v),
            Setting::InitialWindowSize(v) => self.initial_window_size = v,
            Setting::MaxFrameSize(v) => self.max_frame_size = v,
            Setting::MaxHeaderListSize(v) => self.max_header_list_size = Some(v),
        }
    }

    /// Entries that differ from the protocol defaults, in identifier order.
    ///
    /// Sending only these keeps the connection header short while producing the
    /// same effective state on the peer.
    pub fn diff_from_default(&self) -> Vec<Setting> {
        let base = Settings::default();
        let mut out = Vec::new();
        if self.header_table_size != base.header_table_size {
            out.push(Setting::HeaderTableSize(self.header_table_size));
        }
        if self.enable_push != base.enable_push {
            out.push(Setting::EnablePush(self.enable_push));
        }
        if let Some(v) = self.max_concurrent_streams {
            out.push(Setting::MaxConcurrentStreams(v));
        }
        if self.initial_window_size != base.initial_window_size {
            out.push(Setting::InitialWindowSize(self.initial_window_size));
        }
        if self.max_frame_size != base.max_frame_size {
            out.push(Setting::MaxFrameSize(self.max_frame_size));
        }
        if let Some(v) = self.max_header_list_size {
            out.push(Setting::MaxHeaderListSize(v));
        }
        out
    }
}

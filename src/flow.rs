//! Flow control (RFC 7540 Section 5.2 and 6.9)
//!
//! One [`FlowControl`] exists per stream and one for the connection as a
//! whole. The send side gates DATA frames against the peer's window and splits
//! frames that do not fit. The receive side accounts for incoming DATA and
//! hands back the consumed bytes as WINDOW_UPDATE increments.

use log::trace;

use crate::error::H2Error;
use crate::frame::Frame;
use crate::settings::{DEFAULT_INITIAL_WINDOW_SIZE, MAX_WINDOW_SIZE};

/// Outcome of offering a frame to the send window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Push {
    /// The whole frame may go out now.
    Forward(Frame),
    /// Only `forward` fits. `rest` keeps the END_STREAM flag and stays queued.
    Split { forward: Frame, rest: Frame },
    /// Nothing fits; the frame is returned untouched.
    Blocked(Frame),
}

#[derive(Debug, Clone)]
pub struct FlowControl {
    /// Peer's window for our DATA; may go negative after a SETTINGS change
    window: i64,
    /// Set once flow control has been turned off for good
    unlimited: bool,
    initial_window: u32,

    /// Bytes the peer may still send us
    recv_window: i64,
    recv_initial_window: u32,
    /// Received bytes not yet returned with WINDOW_UPDATE
    received: u32,
    /// No more WINDOW_UPDATEs once the inbound side ended
    ended: bool,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_INITIAL_WINDOW_SIZE)
    }
}

impl FlowControl {
    pub fn new(send_window: u32, recv_window: u32) -> Self {
        Self {
            window: send_window as i64,
            unlimited: false,
            initial_window: send_window,
            recv_window: recv_window as i64,
            recv_initial_window: recv_window,
            received: 0,
            ended: false,
        }
    }

    pub fn window(&self) -> i64 {
        self.window
    }

    pub fn is_unlimited(&self) -> bool {
        self.unlimited
    }

    /// Bytes that may be sent right now.
    pub fn available(&self) -> usize {
        if self.unlimited {
            usize::MAX
        } else {
            self.window.max(0) as usize
        }
    }

    /// Offer `frame` to the window. DATA frames are limited to
    /// `min(window, limit)` bytes, where `limit` is normally the peer's max
    /// frame size further capped by the connection window. Other frames and
    /// empty DATA always pass.
    pub fn push(&mut self, frame: Frame, limit: usize) -> Push {
        let len = frame.flow_controlled_len();
        if len == 0 {
            return Push::Forward(frame);
        }

        let cap = self.available().min(limit);
        if len <= cap {
            self.consume(len);
            return Push::Forward(frame);
        }
        if cap == 0 {
            return Push::Blocked(frame);
        }

        match frame {
            Frame::Data {
                stream_id,
                mut data,
                end_stream,
                ..
            } => {
                trace!(
                    "splitting DATA on stream {}: {} of {} bytes forwardable",
                    stream_id,
                    cap,
                    data.len()
                );
                let rest = data.split_off(cap);
                self.consume(cap);
                Push::Split {
                    forward: Frame::data(stream_id, data, false),
                    rest: Frame::data(stream_id, rest, end_stream),
                }
            }
            // Only DATA has a flow-controlled length
            other => Push::Forward(other),
        }
    }

    /// Debit `n` sent bytes.
    pub fn consume(&mut self, n: usize) {
        if !self.unlimited {
            trace!("decreasing send window {} by {}", self.window, n);
            self.window -= n as i64;
        }
    }

    /// Apply a WINDOW_UPDATE from the peer.
    pub fn increase(&mut self, increment: u32) -> Result<(), H2Error> {
        if self.unlimited {
            return Err(H2Error::flow_control(
                "window increase after flow control was turned off",
            ));
        }
        trace!("increasing send window {} by {}", self.window, increment);
        self.window += increment as i64;
        if self.window > MAX_WINDOW_SIZE as i64 {
            return Err(H2Error::flow_control(format!(
                "flow control window grew to {}",
                self.window
            )));
        }
        Ok(())
    }

    /// Turn flow control off permanently.
    ///
    /// [`Connection`](crate::Connection) never calls this: HTTP/2 has no
    /// frame that ends flow control. It is a hook for embedders that drive a
    /// `FlowControl` directly over a transport that negotiates this out of
    /// band. Afterwards any finite increase or initial-window change is a
    /// FLOW_CONTROL_ERROR.
    pub fn end_flow_control(&mut self) {
        self.unlimited = true;
    }

    /// Peer changed SETTINGS_INITIAL_WINDOW_SIZE: shift the window by the delta.
    pub fn set_initial_window(&mut self, initial_window: u32) -> Result<(), H2Error> {
        let delta = initial_window as i64 - self.initial_window as i64;
        self.initial_window = initial_window;
        if delta == 0 {
            return Ok(());
        }
        if self.unlimited {
            return Err(H2Error::flow_control(
                "initial window changed after flow control was turned off",
            ));
        }
        self.window += delta;
        if self.window > MAX_WINDOW_SIZE as i64 {
            return Err(H2Error::flow_control(format!(
                "flow control window grew to {}",
                self.window
            )));
        }
        Ok(())
    }

    pub fn recv_window(&self) -> i64 {
        self.recv_window
    }

    /// Account for `n` received bytes (DATA payload including padding).
    pub fn receive(&mut self, n: usize) -> Result<(), H2Error> {
        if n as i64 > self.recv_window {
            return Err(H2Error::flow_control(format!(
                "received {} bytes with a window of {}",
                n, self.recv_window
            )));
        }
        self.recv_window -= n as i64;
        self.received = self.received.saturating_add(n as u32);
        Ok(())
    }

    /// Our SETTINGS_INITIAL_WINDOW_SIZE was acknowledged.
    pub fn set_recv_initial_window(&mut self, initial_window: u32) {
        self.recv_window += initial_window as i64 - self.recv_initial_window as i64;
        self.recv_initial_window = initial_window;
    }

    /// Increment to return to the peer, if any bytes are owed.
    pub fn take_window_update(&mut self) -> Option<u32> {
        if self.ended || self.received == 0 {
            return None;
        }
        let increment = self.received;
        self.received = 0;
        self.recv_window += increment as i64;
        Some(increment)
    }

    /// The inbound side ended (END_STREAM or RST_STREAM).
    pub fn mark_ended(&mut self) {
        self.ended = true;
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

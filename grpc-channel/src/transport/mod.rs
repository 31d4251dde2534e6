/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! The seam between the channel and the HTTP/2 machinery.
//!
//! The HTTP/2 codec itself lives outside this crate.  A [`Transport`]
//! produces one [`ConnectedSession`] per TCP connection: a stream of
//! connection-level frame events in, a [`SessionControl`] for frames out, and
//! the ability to open multiplexed streams.

pub(crate) mod connection;
pub mod inmemory;
pub(crate) mod lifecycle;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::mpsc;

pub use lifecycle::CloseReason;

/// The URI scheme the connection runs under: `http` for plaintext, `https`
/// when the transport provides TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// User-facing HTTP/2 settings, before clamping.
#[derive(Debug, Clone, Copy)]
pub struct Http2Options {
    /// SETTINGS_INITIAL_WINDOW_SIZE.
    pub initial_window_size: u32,
    /// SETTINGS_MAX_FRAME_SIZE.
    pub max_frame_size: u32,
    /// SETTINGS_MAX_CONCURRENT_STREAMS.
    pub max_concurrent_streams: Option<u32>,
    /// SETTINGS_MAX_HEADER_LIST_SIZE.
    pub max_header_list_size: u32,
}

impl Default for Http2Options {
    fn default() -> Self {
        Self {
            initial_window_size: 65_535,
            max_frame_size: 16_384,
            max_concurrent_streams: None,
            max_header_list_size: 16 * 1024,
        }
    }
}

/// Keepalive configuration per gRFC A8.
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveOptions {
    /// How long to wait between keepalive pings.
    pub interval: Duration,
    /// How long to wait for a ping acknowledgement before declaring the
    /// connection dead.
    pub timeout: Duration,
    /// Whether to ping while no RPCs are in flight.
    pub allow_without_calls: bool,
}

/// The HTTP/2 settings actually handed to a transport, with the protocol
/// clamps applied.  Server push is always disabled.
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_concurrent_streams: Option<u32>,
    pub max_header_list_size: u32,
}

impl TransportOptions {
    const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;
    const MIN_FRAME_SIZE: u32 = 1 << 14;
    const MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

    pub fn new(options: Http2Options) -> Self {
        Self {
            initial_window_size: options.initial_window_size.min(Self::MAX_WINDOW_SIZE),
            max_frame_size: options
                .max_frame_size
                .clamp(Self::MIN_FRAME_SIZE, Self::MAX_FRAME_SIZE),
            max_concurrent_streams: options.max_concurrent_streams,
            max_header_list_size: options.max_header_list_size,
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::new(Http2Options::default())
    }
}

/// Connection-level frame events a session surfaces to the channel.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A SETTINGS frame from the peer.  The first one completes the HTTP/2
    /// preface and makes the connection usable.
    Settings,
    /// An acknowledgement for a previously sent PING.
    PingAck([u8; 8]),
    /// The peer is going away.
    GoAway { error_code: u32, debug_data: Bytes },
    /// The underlying channel became inactive.
    Inactive { error: Option<String> },
}

/// A frame received on one stream.
#[derive(Debug)]
pub enum StreamFrame {
    Headers {
        status: http::StatusCode,
        headers: HeaderMap,
        end_stream: bool,
    },
    Data {
        data: Bytes,
        end_stream: bool,
    },
    Trailers {
        trailers: HeaderMap,
    },
}

/// A write issued on one stream.
#[derive(Debug)]
pub enum StreamWrite {
    Data { data: Bytes, end_stream: bool },
    /// Local cancellation; becomes RST_STREAM on the wire.
    Reset,
}

/// One multiplexed HTTP/2 stream, as raw frame channels.
#[derive(Debug)]
pub struct RawStream {
    pub id: u64,
    pub writes: mpsc::Sender<StreamWrite>,
    pub frames: mpsc::Receiver<StreamFrame>,
}

/// Commands the channel issues on an established session.
pub trait SessionControl: Send + Sync {
    /// Open a new stream with the given request headers.  Implementations
    /// allocate the stream id and write the HEADERS frame asynchronously.
    fn open_stream(&self, request: http::Request<()>) -> Result<RawStream, crate::Error>;

    fn send_ping(&self, payload: [u8; 8]);

    /// Send a GOAWAY with `NO_ERROR` and the given opaque data.
    fn send_go_away(&self, debug_data: Bytes);

    /// Cancel one stream locally; becomes RST_STREAM on the wire.
    fn reset_stream(&self, id: u64);

    fn flush(&self);

    fn close(&self);
}

/// A connected HTTP/2 session: the peer's frame events plus a control handle.
pub struct ConnectedSession {
    pub scheme: Scheme,
    pub events: mpsc::Receiver<SessionEvent>,
    pub control: Arc<dyn SessionControl>,
}

/// Establishes HTTP/2 sessions to addresses.  The in-memory implementation
/// ships with the crate; TCP and TLS transports live outside it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        options: &TransportOptions,
    ) -> Result<ConnectedSession, crate::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_options_clamp_settings() {
        let options = TransportOptions::new(Http2Options {
            initial_window_size: u32::MAX,
            max_frame_size: 1,
            max_concurrent_streams: Some(7),
            max_header_list_size: 16 * 1024,
        });
        assert_eq!(options.initial_window_size, (1 << 31) - 1);
        assert_eq!(options.max_frame_size, 1 << 14);
        assert_eq!(options.max_concurrent_streams, Some(7));

        let options = TransportOptions::new(Http2Options {
            max_frame_size: u32::MAX,
            ..Http2Options::default()
        });
        assert_eq!(options.max_frame_size, (1 << 24) - 1);
    }

    #[test]
    fn default_header_list_size_is_16k() {
        assert_eq!(TransportOptions::default().max_header_list_size, 16 * 1024);
    }
}

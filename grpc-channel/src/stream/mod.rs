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

//! The state machine for one gRPC stream over HTTP/2.
//!
//! The machine tracks the client and server halves independently; each half
//! is idle, open, or closed, and the server can never be ahead of the client,
//! leaving seven reachable states. Each state owns exactly the resources
//! valid in it: the outbound framer while the client half is live, and the
//! inbound deframer once the server's initial metadata has negotiated the
//! response encoding.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue};
use tracing::{debug, warn};

use crate::codec::compression::{self, CompressionEncoding, EnabledCompressionEncodings};
use crate::codec::{Deframer, Framer, OutboundFrame};
use crate::metadata;
use crate::status::http_status_to_grpc_code;
use crate::Status;
use crate::transport::Scheme;

pub(crate) const CONTENT_TYPE: &str = "application/grpc";

const USER_AGENT: &str = concat!("grpc-channel/", env!("CARGO_PKG_VERSION"));

/// Everything needed to run one stream: negotiated compression, size limits,
/// deadline and custom metadata, all merged from channel and call options.
#[derive(Debug, Clone)]
pub(crate) struct StreamConfig {
    pub(crate) scheme: Scheme,
    pub(crate) authority: String,
    pub(crate) outbound_encoding: Option<CompressionEncoding>,
    pub(crate) accept_encodings: EnabledCompressionEncodings,
    pub(crate) max_request_message_bytes: usize,
    pub(crate) max_response_message_bytes: usize,
    pub(crate) timeout: Option<Duration>,
    pub(crate) metadata: HeaderMap,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            scheme: Scheme::Http,
            authority: "localhost".to_string(),
            outbound_encoding: None,
            accept_encodings: EnabledCompressionEncodings::default(),
            max_request_message_bytes: usize::MAX,
            max_response_message_bytes: usize::MAX,
            timeout: None,
            metadata: HeaderMap::new(),
        }
    }
}

/// What an inbound header or data frame meant for the RPC.
#[derive(Debug)]
pub(crate) enum InboundEvent {
    /// An informational (1xx) header block; skipped, await the next one.
    Skipped,
    /// The server's initial metadata; the server half is now open.
    Metadata(HeaderMap),
    /// The server half closed with this final status.
    Closed(Status),
    /// Nothing user-visible happened (data buffered, duplicate close ignored).
    None,
}

enum State {
    // Client idle, server idle.
    Idle {
        config: Box<StreamConfig>,
    },
    // Client open, server idle.  The deframer cannot exist yet: the response
    // encoding is only known once the server's initial metadata arrives.
    Open {
        framer: Framer,
        max_response_message_bytes: usize,
    },
    // Client open, server open.
    OpenOpen {
        framer: Framer,
        deframer: Deframer,
    },
    // Client open, server closed.  Outbound messages are dropped silently.
    OpenClosed {
        inbound: VecDeque<Bytes>,
    },
    // Client closed, server idle.  The framer drains what was buffered.
    ClosedIdle {
        framer: Framer,
        max_response_message_bytes: usize,
    },
    // Client closed, server open.
    ClosedOpen {
        framer: Framer,
        deframer: Deframer,
    },
    // Both halves closed.
    Closed {
        inbound: VecDeque<Bytes>,
    },
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Idle { .. } => "clientIdle/serverIdle",
            State::Open { .. } => "clientOpen/serverIdle",
            State::OpenOpen { .. } => "clientOpen/serverOpen",
            State::OpenClosed { .. } => "clientOpen/serverClosed",
            State::ClosedIdle { .. } => "clientClosed/serverIdle",
            State::ClosedOpen { .. } => "clientClosed/serverOpen",
            State::Closed { .. } => "clientClosed/serverClosed",
        }
    }
}

pub(crate) struct StreamMachine {
    state: State,
}

impl StreamMachine {
    pub(crate) fn new(config: StreamConfig) -> Self {
        Self {
            state: State::Idle {
                config: Box::new(config),
            },
        }
    }

    /// Open the client half: synthesize the request headers for `path`.
    pub(crate) fn send_metadata(&mut self, path: &str) -> Result<http::Request<()>, Status> {
        let state = std::mem::replace(&mut self.state, State::Closed { inbound: VecDeque::new() });
        match state {
            State::Idle { config } => {
                let request = build_request(path, &config)?;
                self.state = State::Open {
                    framer: Framer::new(config.outbound_encoding, config.max_request_message_bytes),
                    max_response_message_bytes: config.max_response_message_bytes,
                };
                Ok(request)
            }
            state => Err(self.invalid("metadata sent", state)),
        }
    }

    /// Buffer one outbound message, optionally closing the client half.
    pub(crate) fn send_message(
        &mut self,
        message: Bytes,
        end_of_stream: bool,
    ) -> Result<(), Status> {
        let state = std::mem::replace(&mut self.state, State::Closed { inbound: VecDeque::new() });
        match state {
            State::Open {
                mut framer,
                max_response_message_bytes,
            } => {
                framer.append(message, end_of_stream)?;
                self.state = if end_of_stream {
                    State::ClosedIdle {
                        framer,
                        max_response_message_bytes,
                    }
                } else {
                    State::Open {
                        framer,
                        max_response_message_bytes,
                    }
                };
                Ok(())
            }
            State::OpenOpen {
                mut framer,
                deframer,
            } => {
                framer.append(message, end_of_stream)?;
                self.state = if end_of_stream {
                    State::ClosedOpen { framer, deframer }
                } else {
                    State::OpenOpen { framer, deframer }
                };
                Ok(())
            }
            State::OpenClosed { inbound } => {
                // The server already closed; there is nobody to deliver to.
                debug!("dropping outbound message, server half already closed");
                self.state = if end_of_stream {
                    State::Closed { inbound }
                } else {
                    State::OpenClosed { inbound }
                };
                Ok(())
            }
            state => Err(self.invalid("message sent", state)),
        }
    }

    /// Close the client half without sending another message.  Idempotent
    /// once the client half is closed.
    pub(crate) fn close_send(&mut self) -> Result<(), Status> {
        let state = std::mem::replace(&mut self.state, State::Closed { inbound: VecDeque::new() });
        match state {
            State::Open {
                mut framer,
                max_response_message_bytes,
            } => {
                framer.end();
                self.state = State::ClosedIdle {
                    framer,
                    max_response_message_bytes,
                };
                Ok(())
            }
            State::OpenOpen {
                mut framer,
                deframer,
            } => {
                framer.end();
                self.state = State::ClosedOpen { framer, deframer };
                Ok(())
            }
            State::OpenClosed { inbound } => {
                self.state = State::Closed { inbound };
                Ok(())
            }
            state @ (State::ClosedIdle { .. }
            | State::ClosedOpen { .. }
            | State::Closed { .. }) => {
                self.state = state;
                Ok(())
            }
            state => Err(self.invalid("stream closed", state)),
        }
    }

    /// Pull the next framed chunk for the wire.
    pub(crate) fn next_outbound_frame(&mut self) -> OutboundFrame {
        match &mut self.state {
            State::Open { framer, .. }
            | State::OpenOpen { framer, .. }
            | State::ClosedIdle { framer, .. }
            | State::ClosedOpen { framer, .. } => framer.next_frame(),
            // With the server closed the outbound direction is abandoned.
            State::OpenClosed { .. } | State::Closed { .. } => OutboundFrame::NoMore,
            State::Idle { .. } => OutboundFrame::AwaitMore,
        }
    }

    /// Process a header block from the server.
    pub(crate) fn receive_headers(
        &mut self,
        status: http::StatusCode,
        headers: &HeaderMap,
        end_stream: bool,
    ) -> Result<InboundEvent, Status> {
        if status.is_informational() {
            return Ok(InboundEvent::Skipped);
        }

        let state = std::mem::replace(&mut self.state, State::Closed { inbound: VecDeque::new() });
        match state {
            State::Open {
                framer,
                max_response_message_bytes,
            } => match self.classify_response(status, headers, end_stream)? {
                ResponseKind::Metadata(encoding) => {
                    self.state = State::OpenOpen {
                        framer,
                        deframer: Deframer::new(encoding, max_response_message_bytes),
                    };
                    Ok(InboundEvent::Metadata(metadata::custom_metadata(headers)))
                }
                ResponseKind::Closed(status) => {
                    self.state = State::OpenClosed {
                        inbound: VecDeque::new(),
                    };
                    Ok(InboundEvent::Closed(status))
                }
            },
            State::ClosedIdle {
                framer,
                max_response_message_bytes,
            } => match self.classify_response(status, headers, end_stream)? {
                ResponseKind::Metadata(encoding) => {
                    self.state = State::ClosedOpen {
                        framer,
                        deframer: Deframer::new(encoding, max_response_message_bytes),
                    };
                    Ok(InboundEvent::Metadata(metadata::custom_metadata(headers)))
                }
                ResponseKind::Closed(status) => {
                    self.state = State::Closed {
                        inbound: VecDeque::new(),
                    };
                    Ok(InboundEvent::Closed(status))
                }
            },
            State::OpenOpen { framer, deframer } => {
                if end_stream {
                    // A HEADERS block ending the stream after data is the
                    // trailers; route it as such.
                    self.state = State::OpenOpen { framer, deframer };
                    return self.receive_trailers(headers);
                }
                // Repeated metadata before trailers is tolerated; only the
                // first block is surfaced.
                warn!("ignoring repeated metadata block from the server");
                self.state = State::OpenOpen { framer, deframer };
                Ok(InboundEvent::None)
            }
            State::ClosedOpen { framer, deframer } => {
                if end_stream {
                    self.state = State::ClosedOpen { framer, deframer };
                    return self.receive_trailers(headers);
                }
                warn!("ignoring repeated metadata block from the server");
                self.state = State::ClosedOpen { framer, deframer };
                Ok(InboundEvent::None)
            }
            state => Err(self.invalid("headers received", state)),
        }
    }

    /// Process a data frame from the server.
    pub(crate) fn receive_data(
        &mut self,
        data: Bytes,
        end_stream: bool,
    ) -> Result<InboundEvent, Status> {
        let state = std::mem::replace(&mut self.state, State::Closed { inbound: VecDeque::new() });
        match state {
            State::OpenOpen {
                framer,
                mut deframer,
            } => {
                deframer.push(data)?;
                if end_stream {
                    // The server half-closed without trailers.
                    let status = close_without_trailers(&deframer)?;
                    self.state = State::OpenClosed {
                        inbound: deframer.into_messages(),
                    };
                    return Ok(InboundEvent::Closed(status));
                }
                self.state = State::OpenOpen { framer, deframer };
                Ok(InboundEvent::None)
            }
            State::ClosedOpen {
                framer,
                mut deframer,
            } => {
                deframer.push(data)?;
                if end_stream {
                    let status = close_without_trailers(&deframer)?;
                    self.state = State::Closed {
                        inbound: deframer.into_messages(),
                    };
                    return Ok(InboundEvent::Closed(status));
                }
                self.state = State::ClosedOpen { framer, deframer };
                Ok(InboundEvent::None)
            }
            // An empty end-of-stream after close carries no information.
            State::OpenClosed { inbound } if data.is_empty() && end_stream => {
                self.state = State::OpenClosed { inbound };
                Ok(InboundEvent::None)
            }
            State::Closed { inbound } if data.is_empty() && end_stream => {
                self.state = State::Closed { inbound };
                Ok(InboundEvent::None)
            }
            state => Err(self.invalid("data received", state)),
        }
    }

    /// Process the trailer block ending the server half.
    pub(crate) fn receive_trailers(&mut self, trailers: &HeaderMap) -> Result<InboundEvent, Status> {
        let state = std::mem::replace(&mut self.state, State::Closed { inbound: VecDeque::new() });
        match state {
            State::OpenOpen { deframer, .. } => {
                if deframer.has_partial_frame() {
                    return Err(Status::internal("unexpected end of stream mid-frame"));
                }
                let status = status_from_trailers(trailers);
                self.state = State::OpenClosed {
                    inbound: deframer.into_messages(),
                };
                Ok(InboundEvent::Closed(status))
            }
            State::ClosedOpen { deframer, .. } => {
                if deframer.has_partial_frame() {
                    return Err(Status::internal("unexpected end of stream mid-frame"));
                }
                let status = status_from_trailers(trailers);
                self.state = State::Closed {
                    inbound: deframer.into_messages(),
                };
                Ok(InboundEvent::Closed(status))
            }
            State::OpenClosed { inbound } if trailers.is_empty() => {
                self.state = State::OpenClosed { inbound };
                Ok(InboundEvent::None)
            }
            State::Closed { inbound } if trailers.is_empty() => {
                self.state = State::Closed { inbound };
                Ok(InboundEvent::None)
            }
            state => Err(self.invalid("trailers received", state)),
        }
    }

    /// Drain the next decoded inbound message, if any.
    pub(crate) fn next_inbound_message(&mut self) -> Option<Bytes> {
        match &mut self.state {
            State::OpenOpen { deframer, .. } | State::ClosedOpen { deframer, .. } => {
                deframer.next_message()
            }
            State::OpenClosed { inbound } | State::Closed { inbound } => inbound.pop_front(),
            _ => None,
        }
    }

    pub(crate) fn is_client_closed(&self) -> bool {
        matches!(
            self.state,
            State::ClosedIdle { .. } | State::ClosedOpen { .. } | State::Closed { .. }
        )
    }

    pub(crate) fn is_server_closed(&self) -> bool {
        matches!(self.state, State::OpenClosed { .. } | State::Closed { .. })
    }

    fn classify_response(
        &self,
        status: http::StatusCode,
        headers: &HeaderMap,
        end_stream: bool,
    ) -> Result<ResponseKind, Status> {
        // A grpc-status anywhere in the block makes it a trailers-only
        // response, whatever the HTTP status says.
        if let Some(grpc_status) = Status::from_trailers(headers) {
            return Ok(ResponseKind::Closed(grpc_status));
        }
        if status != http::StatusCode::OK {
            let code = http_status_to_grpc_code(status);
            return Ok(ResponseKind::Closed(Status::new(
                code,
                format!("unexpected HTTP status code {}", status.as_u16()),
            )));
        }
        if !is_grpc_content_type(headers) {
            return Err(Status::internal(
                "response is missing the gRPC content-type",
            ));
        }
        if end_stream {
            // Trailers-only with a 200 and no grpc-status.
            return Ok(ResponseKind::Closed(Status::unknown(
                "stream closed without grpc-status",
            )));
        }
        let encoding = CompressionEncoding::from_response_encoding_header(headers)?;
        Ok(ResponseKind::Metadata(encoding))
    }

    fn invalid(&mut self, what: &str, state: State) -> Status {
        let message = format!("protocol violation: {} while {}", what, state.name());
        warn!("{}", message);
        // The stream is unusable after a protocol violation.
        self.state = State::Closed {
            inbound: VecDeque::new(),
        };
        Status::internal(message)
    }
}

enum ResponseKind {
    Metadata(Option<CompressionEncoding>),
    Closed(Status),
}

fn status_from_trailers(trailers: &HeaderMap) -> Status {
    Status::from_trailers(trailers)
        .unwrap_or_else(|| Status::unknown("stream closed without grpc-status"))
}

fn close_without_trailers(deframer: &Deframer) -> Result<Status, Status> {
    if deframer.has_partial_frame() {
        return Err(Status::internal("unexpected end of stream mid-frame"));
    }
    Ok(Status::unknown("stream closed without grpc-status"))
}

fn is_grpc_content_type(headers: &HeaderMap) -> bool {
    match headers.get(http::header::CONTENT_TYPE) {
        Some(value) => {
            let bytes = value.as_bytes();
            bytes.starts_with(CONTENT_TYPE.as_bytes())
                && (bytes.len() == CONTENT_TYPE.len()
                    || bytes[CONTENT_TYPE.len()] == b'+'
                    || bytes[CONTENT_TYPE.len()] == b';')
        }
        None => false,
    }
}

fn build_request(path: &str, config: &StreamConfig) -> Result<http::Request<()>, Status> {
    let uri = http::Uri::builder()
        .scheme(config.scheme.as_str())
        .authority(config.authority.as_str())
        .path_and_query(path)
        .build()
        .map_err(|err| Status::internal(format!("invalid request path {path:?}: {err}")))?;

    let mut request = http::Request::builder()
        .method(http::Method::POST)
        .uri(uri)
        .version(http::Version::HTTP_2)
        .body(())
        .map_err(|err| Status::internal(format!("invalid request: {err}")))?;

    let headers = request.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static(CONTENT_TYPE),
    );
    headers.insert(http::header::TE, HeaderValue::from_static("trailers"));
    headers.insert(
        http::header::USER_AGENT,
        HeaderValue::from_static(USER_AGENT),
    );
    if let Some(encoding) = config.outbound_encoding {
        headers.insert(compression::ENCODING_HEADER, encoding.into_header_value());
    }
    if let Some(value) = config.accept_encodings.into_accept_encoding_header_value() {
        headers.insert(compression::ACCEPT_ENCODING_HEADER, value);
    }
    if let Some(timeout) = config.timeout {
        if let Ok(value) = HeaderValue::from_str(&format_timeout(timeout)) {
            headers.insert("grpc-timeout", value);
        }
    }
    for (name, value) in &config.metadata {
        headers.append(name.clone(), value.clone());
    }
    Ok(request)
}

/// Render a deadline in the `grpc-timeout` wire format: at most eight digits
/// and a unit, using the coarsest unit that preserves the value.
fn format_timeout(timeout: Duration) -> String {
    const MAX: u128 = 99_999_999;
    let nanos = timeout.as_nanos();
    if nanos <= MAX {
        return format!("{nanos}n");
    }
    let micros = nanos.div_ceil(1_000);
    if micros <= MAX {
        return format!("{micros}u");
    }
    let millis = micros.div_ceil(1_000);
    if millis <= MAX {
        return format!("{millis}m");
    }
    let secs = millis.div_ceil(1_000);
    if secs <= MAX {
        return format!("{secs}S");
    }
    let minutes = secs.div_ceil(60);
    if minutes <= MAX {
        return format!("{minutes}M");
    }
    format!("{}H", minutes.div_ceil(60).min(MAX))
}

/// How a server rejects a request before the stream machine is involved.
#[derive(Debug)]
pub enum ServerRejection {
    /// Respond with HTTP 415; the request never spoke gRPC.
    UnsupportedContentType,
    /// Respond trailers-only with this status.
    Status(Status),
}

/// Validate the entry conditions a server imposes on request headers.  The
/// client rejects the mirrored conditions on responses.
pub fn validate_server_request(
    request: &http::Request<()>,
    enabled: EnabledCompressionEncodings,
) -> Result<Option<CompressionEncoding>, ServerRejection> {
    if !is_grpc_content_type(request.headers()) {
        return Err(ServerRejection::UnsupportedContentType);
    }
    let path = request.uri().path();
    if path.is_empty() || path == "/" {
        return Err(ServerRejection::Status(Status::unimplemented(
            "request is missing a method path",
        )));
    }
    CompressionEncoding::from_request_encoding_header(request.headers(), enabled)
        .map_err(ServerRejection::Status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;

    fn machine() -> StreamMachine {
        StreamMachine::new(StreamConfig::default())
    }

    fn open_machine() -> StreamMachine {
        let mut m = machine();
        m.send_metadata("/echo.Echo/Get").unwrap();
        m
    }

    fn response_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/grpc"),
        );
        headers
    }

    fn ok_trailers() -> HeaderMap {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        trailers
    }

    #[test]
    fn request_headers_are_synthesized() {
        let mut m = machine();
        let request = m.send_metadata("/echo.Echo/Get").unwrap();
        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(request.uri().path(), "/echo.Echo/Get");
        assert_eq!(request.uri().scheme_str(), Some("http"));
        let headers = request.headers();
        assert_eq!(headers.get("content-type").unwrap(), "application/grpc");
        assert_eq!(headers.get("te").unwrap(), "trailers");
        assert!(headers.get("grpc-encoding").is_none());
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn request_headers_carry_negotiated_compression() {
        let mut accept = EnabledCompressionEncodings::default();
        accept.enable(CompressionEncoding::Gzip);
        let mut m = StreamMachine::new(StreamConfig {
            outbound_encoding: Some(CompressionEncoding::Gzip),
            accept_encodings: accept,
            timeout: Some(Duration::from_secs(5)),
            ..StreamConfig::default()
        });
        let request = m.send_metadata("/echo.Echo/Get").unwrap();
        let headers = request.headers();
        assert_eq!(headers.get("grpc-encoding").unwrap(), "gzip");
        assert_eq!(headers.get("grpc-accept-encoding").unwrap(), "gzip,identity");
        assert_eq!(headers.get("grpc-timeout").unwrap(), "5000000u");
    }

    #[test]
    fn metadata_twice_is_a_protocol_violation() {
        let mut m = open_machine();
        let err = m.send_metadata("/echo.Echo/Get").unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[test]
    fn message_before_metadata_is_a_protocol_violation() {
        let mut m = machine();
        let err = m.send_message(Bytes::from_static(b"hi"), false).unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[test]
    fn unary_happy_path() {
        let mut m = open_machine();

        // Client sends one message and half-closes.
        m.send_message(Bytes::from_static(b"hi"), true).unwrap();
        let OutboundFrame::Send(frame) = m.next_outbound_frame() else {
            panic!("expected a data frame");
        };
        assert_eq!(&frame[..], &[0, 0, 0, 0, 2, b'h', b'i']);
        assert_eq!(m.next_outbound_frame(), OutboundFrame::NoMore);
        assert!(m.is_client_closed());

        // Server opens, replies, closes with OK.
        let event = m
            .receive_headers(http::StatusCode::OK, &response_headers(), false)
            .unwrap();
        assert!(matches!(event, InboundEvent::Metadata(_)));
        m.receive_data(Bytes::from_static(&[0, 0, 0, 0, 2, b'h', b'i']), false)
            .unwrap();
        let event = m.receive_trailers(&ok_trailers()).unwrap();
        let InboundEvent::Closed(status) = event else {
            panic!("expected close");
        };
        assert_eq!(status.code(), Code::Ok);
        assert_eq!(m.next_inbound_message().unwrap(), Bytes::from_static(b"hi"));
        assert!(m.is_server_closed());
    }

    #[test]
    fn trailers_only_with_error_status() {
        let mut m = open_machine();
        let mut headers = HeaderMap::new();
        headers.insert("grpc-status", HeaderValue::from_static("5"));
        headers.insert("grpc-message", HeaderValue::from_static("not found"));
        let event = m
            .receive_headers(http::StatusCode::OK, &headers, true)
            .unwrap();
        let InboundEvent::Closed(status) = event else {
            panic!("expected close");
        };
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "not found");
        assert!(m.is_server_closed());
        assert!(m.next_inbound_message().is_none());
    }

    #[test]
    fn informational_headers_are_skipped() {
        let mut m = open_machine();
        let event = m
            .receive_headers(http::StatusCode::CONTINUE, &HeaderMap::new(), false)
            .unwrap();
        assert!(matches!(event, InboundEvent::Skipped));
        // The real response still lands.
        let event = m
            .receive_headers(http::StatusCode::OK, &response_headers(), false)
            .unwrap();
        assert!(matches!(event, InboundEvent::Metadata(_)));
    }

    #[test]
    fn non_200_without_grpc_status_maps_http_code() {
        for (http_status, code) in [
            (http::StatusCode::NOT_FOUND, Code::Unimplemented),
            (http::StatusCode::SERVICE_UNAVAILABLE, Code::Unavailable),
            (http::StatusCode::UNAUTHORIZED, Code::Unauthenticated),
        ] {
            let mut m = open_machine();
            let event = m
                .receive_headers(http_status, &HeaderMap::new(), false)
                .unwrap();
            let InboundEvent::Closed(status) = event else {
                panic!("expected close");
            };
            assert_eq!(status.code(), code);
        }
    }

    #[test]
    fn grpc_status_in_headers_wins_over_http_status() {
        let mut m = open_machine();
        let mut headers = HeaderMap::new();
        headers.insert("grpc-status", HeaderValue::from_static("7"));
        let event = m
            .receive_headers(http::StatusCode::TOO_MANY_REQUESTS, &headers, true)
            .unwrap();
        let InboundEvent::Closed(status) = event else {
            panic!("expected close");
        };
        assert_eq!(status.code(), Code::PermissionDenied);
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn deframer_is_constructed_from_server_encoding() {
        let mut m = open_machine();
        let mut headers = response_headers();
        headers.insert("grpc-encoding", HeaderValue::from_static("gzip"));
        m.receive_headers(http::StatusCode::OK, &headers, false)
            .unwrap();

        // A compressed message decodes.
        let payload = b"abcabcabcabcabcabc".repeat(10);
        let mut compressed = bytes::BytesMut::new();
        compression::compress(
            CompressionEncoding::Gzip,
            &payload,
            &mut compressed,
            payload.len(),
        )
        .unwrap();
        let mut framed = bytes::BytesMut::new();
        use bytes::BufMut as _;
        framed.put_u8(1);
        framed.put_u32(compressed.len() as u32);
        framed.put(compressed);
        m.receive_data(framed.freeze(), false).unwrap();
        assert_eq!(&m.next_inbound_message().unwrap()[..], &payload[..]);
    }

    #[test]
    fn unknown_server_encoding_is_internal() {
        let mut m = open_machine();
        let mut headers = response_headers();
        headers.insert("grpc-encoding", HeaderValue::from_static("snappy"));
        let err = m
            .receive_headers(http::StatusCode::OK, &headers, false)
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[test]
    fn data_while_server_idle_is_a_protocol_violation() {
        let mut m = open_machine();
        let err = m
            .receive_data(Bytes::from_static(&[0, 0, 0, 0, 0]), false)
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[test]
    fn sends_after_server_close_are_dropped() {
        let mut m = open_machine();
        let mut headers = HeaderMap::new();
        headers.insert("grpc-status", HeaderValue::from_static("0"));
        m.receive_headers(http::StatusCode::OK, &headers, true)
            .unwrap();

        // Dropped silently.
        m.send_message(Bytes::from_static(b"late"), false).unwrap();
        assert_eq!(m.next_outbound_frame(), OutboundFrame::NoMore);
        assert!(!m.is_client_closed());

        // end=true still closes the client half.
        m.send_message(Bytes::from_static(b"end"), true).unwrap();
        assert!(m.is_client_closed());
    }

    #[test]
    fn empty_end_of_stream_after_close_is_ignored() {
        let mut m = open_machine();
        let mut headers = HeaderMap::new();
        headers.insert("grpc-status", HeaderValue::from_static("0"));
        m.receive_headers(http::StatusCode::OK, &headers, true)
            .unwrap();
        let event = m.receive_data(Bytes::new(), true).unwrap();
        assert!(matches!(event, InboundEvent::None));
    }

    #[test]
    fn non_empty_duplicate_close_is_a_protocol_violation() {
        let mut m = open_machine();
        let mut headers = HeaderMap::new();
        headers.insert("grpc-status", HeaderValue::from_static("0"));
        m.receive_headers(http::StatusCode::OK, &headers, true)
            .unwrap();
        let err = m.receive_data(Bytes::from_static(b"x"), true).unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[test]
    fn trailers_without_status_default_to_unknown() {
        let mut m = open_machine();
        m.receive_headers(http::StatusCode::OK, &response_headers(), false)
            .unwrap();
        let event = m.receive_trailers(&HeaderMap::new()).unwrap();
        let InboundEvent::Closed(status) = event else {
            panic!("expected close");
        };
        assert_eq!(status.code(), Code::Unknown);
    }

    #[test]
    fn end_of_stream_mid_frame_is_internal() {
        let mut m = open_machine();
        m.receive_headers(http::StatusCode::OK, &response_headers(), false)
            .unwrap();
        m.receive_data(Bytes::from_static(&[0, 0, 0, 0, 9, b'x']), false)
            .unwrap();
        let err = m.receive_trailers(&ok_trailers()).unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[test]
    fn buffered_messages_survive_trailers() {
        let mut m = open_machine();
        m.receive_headers(http::StatusCode::OK, &response_headers(), false)
            .unwrap();
        m.receive_data(Bytes::from_static(&[0, 0, 0, 0, 1, b'a']), false)
            .unwrap();
        m.receive_trailers(&ok_trailers()).unwrap();
        assert_eq!(m.next_inbound_message().unwrap(), Bytes::from_static(b"a"));
    }

    #[test]
    fn missing_content_type_is_internal() {
        let mut m = open_machine();
        let err = m
            .receive_headers(http::StatusCode::OK, &HeaderMap::new(), false)
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[test]
    fn content_type_with_subtype_is_accepted() {
        let mut m = open_machine();
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/grpc+proto"),
        );
        assert!(
            m.receive_headers(http::StatusCode::OK, &headers, false)
                .is_ok()
        );
    }

    #[test]
    fn timeout_formatting() {
        assert_eq!(format_timeout(Duration::from_nanos(5)), "5n");
        assert_eq!(format_timeout(Duration::from_micros(500)), "500000n");
        assert_eq!(format_timeout(Duration::from_millis(1500)), "1500000u");
        assert_eq!(format_timeout(Duration::from_secs(5)), "5000000u");
        assert_eq!(format_timeout(Duration::from_secs(99_999)), "99999000m");
        assert_eq!(format_timeout(Duration::from_secs(100_000)), "100000S");
    }

    #[test]
    fn server_entry_rejects_bad_content_type() {
        let request = http::Request::builder()
            .uri("http://localhost/a/b")
            .header("content-type", "text/html")
            .body(())
            .unwrap();
        let rejection =
            validate_server_request(&request, EnabledCompressionEncodings::default()).unwrap_err();
        assert!(matches!(rejection, ServerRejection::UnsupportedContentType));
    }

    #[test]
    fn server_entry_requires_path() {
        let request = http::Request::builder()
            .uri("http://localhost/")
            .header("content-type", "application/grpc")
            .body(())
            .unwrap();
        let rejection =
            validate_server_request(&request, EnabledCompressionEncodings::default()).unwrap_err();
        let ServerRejection::Status(status) = rejection else {
            panic!("expected a status rejection");
        };
        assert_eq!(status.code(), Code::Unimplemented);
    }

    #[test]
    fn server_entry_rejects_unknown_encoding() {
        let request = http::Request::builder()
            .uri("http://localhost/a/b")
            .header("content-type", "application/grpc")
            .header("grpc-encoding", "br")
            .body(())
            .unwrap();
        let rejection =
            validate_server_request(&request, EnabledCompressionEncodings::default()).unwrap_err();
        let ServerRejection::Status(status) = rejection else {
            panic!("expected a status rejection");
        };
        assert_eq!(status.code(), Code::Unimplemented);
        assert!(status.metadata().contains_key("grpc-accept-encoding"));
    }
}

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

//! One RPC attempt bound to an HTTP/2 stream.

use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;

use crate::codec::OutboundFrame;
use crate::codec::compression::CompressionEncoding;
use crate::stream::{InboundEvent, StreamMachine};
use crate::transport::connection::ConnectionHandle;
use crate::transport::{RawStream, StreamFrame, StreamWrite};
use crate::{Code, Status};

/// Per-RPC options, merged with the method config from the service config.
/// Explicitly set values win over the service config.
#[derive(Debug, Default, Clone)]
pub struct CallOptions {
    /// An upper bound on the RPC's lifetime, sent as `grpc-timeout`.  The
    /// deadline itself is enforced by the caller; expiry surfaces as a
    /// cancellation.
    pub timeout: Option<Duration>,
    /// Queue rather than fail while the channel has no ready connection.
    pub wait_for_ready: Option<bool>,
    /// Compression for outbound messages on this call.
    pub compression: Option<CompressionEncoding>,
    pub max_request_message_bytes: Option<usize>,
    pub max_response_message_bytes: Option<usize>,
    /// Custom metadata sent with the request headers.  Binary values belong
    /// under `-bin` keys, encoded with [`crate::metadata::encode_bin_value`].
    pub metadata: HeaderMap,
}

/// A bidirectional message stream for one RPC.
///
/// Writes suspend for transport backpressure.  `recv` yields inbound
/// messages until the server closes the stream: `Ok(None)` for an OK status,
/// `Err(status)` otherwise.  Dropping the stream before the server closed it
/// cancels the RPC with RST_STREAM.
pub struct RpcStream {
    machine: StreamMachine,
    writes: tokio::sync::mpsc::Sender<StreamWrite>,
    frames: tokio::sync::mpsc::Receiver<StreamFrame>,
    conn: ConnectionHandle,
    id: u64,
    end_sent: bool,
    closed_reported: bool,
    final_status: Option<Status>,
    initial_metadata: Option<HeaderMap>,
}

impl RpcStream {
    pub(crate) fn new(machine: StreamMachine, raw: RawStream, conn: ConnectionHandle) -> Self {
        Self {
            machine,
            writes: raw.writes,
            frames: raw.frames,
            conn,
            id: raw.id,
            end_sent: false,
            closed_reported: false,
            final_status: None,
            initial_metadata: None,
        }
    }

    /// Send one message.
    pub async fn send(&mut self, message: Bytes) -> Result<(), Status> {
        self.machine.send_message(message, false)?;
        self.flush_outbound().await
    }

    /// Send one message and half-close the request stream.
    pub async fn send_last(&mut self, message: Bytes) -> Result<(), Status> {
        self.machine.send_message(message, true)?;
        self.flush_outbound().await
    }

    /// Half-close the request stream without another message.
    pub async fn finish(&mut self) -> Result<(), Status> {
        self.machine.close_send()?;
        self.flush_outbound().await
    }

    /// Receive the next message from the server.  `Ok(None)` means the
    /// server closed the stream with an OK status.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, Status> {
        loop {
            if let Some(message) = self.machine.next_inbound_message() {
                return Ok(Some(message));
            }
            if let Some(status) = &self.final_status {
                if status.code() == Code::Ok {
                    return Ok(None);
                }
                return Err(status.clone());
            }

            let frame = self.frames.recv().await;
            let result = match frame {
                Some(StreamFrame::Headers {
                    status,
                    headers,
                    end_stream,
                }) => self.machine.receive_headers(status, &headers, end_stream),
                Some(StreamFrame::Data { data, end_stream }) => {
                    self.machine.receive_data(data, end_stream)
                }
                Some(StreamFrame::Trailers { trailers }) => {
                    self.machine.receive_trailers(&trailers)
                }
                None => {
                    self.set_final(Status::unavailable(
                        "connection lost before the RPC completed",
                    ));
                    continue;
                }
            };
            match result {
                Ok(InboundEvent::Metadata(metadata)) => {
                    self.initial_metadata.get_or_insert(metadata);
                }
                Ok(InboundEvent::Closed(status)) => self.set_final(status),
                Ok(InboundEvent::Skipped | InboundEvent::None) => {}
                Err(status) => {
                    // Protocol violation: abort the stream locally.
                    if !self.closed_reported {
                        self.closed_reported = true;
                        self.conn.cancel_stream(self.id);
                    }
                    self.final_status = Some(status.clone());
                    return Err(status);
                }
            }
        }
    }

    /// The server's initial metadata, once it has arrived.
    pub fn initial_metadata(&self) -> Option<&HeaderMap> {
        self.initial_metadata.as_ref()
    }

    fn set_final(&mut self, status: Status) {
        if self.final_status.is_none() {
            self.final_status = Some(status);
        }
        if !self.closed_reported {
            self.closed_reported = true;
            self.conn.stream_closed(self.id);
        }
    }

    async fn flush_outbound(&mut self) -> Result<(), Status> {
        let mut pending: Option<Bytes> = None;
        loop {
            match self.machine.next_outbound_frame() {
                OutboundFrame::Send(bytes) => {
                    if let Some(prev) = pending.take() {
                        self.write(prev, false).await?;
                    }
                    pending = Some(bytes);
                }
                OutboundFrame::AwaitMore => {
                    if let Some(prev) = pending.take() {
                        self.write(prev, false).await?;
                    }
                    return Ok(());
                }
                OutboundFrame::NoMore => {
                    let end_needed = !self.end_sent && self.machine.is_client_closed();
                    if let Some(prev) = pending.take() {
                        if end_needed {
                            self.end_sent = true;
                        }
                        self.write(prev, end_needed).await?;
                    } else if end_needed {
                        self.end_sent = true;
                        self.write(Bytes::new(), true).await?;
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn write(&mut self, data: Bytes, end_stream: bool) -> Result<(), Status> {
        self.writes
            .send(StreamWrite::Data { data, end_stream })
            .await
            .map_err(|_| Status::unavailable("connection closed while sending"))
    }
}

impl Drop for RpcStream {
    fn drop(&mut self) {
        if !self.closed_reported {
            // Local cancellation: RST_STREAM plus stream accounting.
            self.conn.cancel_stream(self.id);
        }
    }
}

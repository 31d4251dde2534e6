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

//! Length-prefixed gRPC message framing.
//!
//! Every message on the wire is `flag:1B | length:4B big-endian | payload`,
//! where `flag = 0x01` marks a payload compressed with the stream's
//! negotiated encoding.

pub mod compression;

use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::Status;
use compression::CompressionEncoding;

/// Size of the gRPC message length prefix: compressed-flag plus length.
pub(crate) const HEADER_SIZE: usize = 1 + 4;

const BUFFER_SIZE: usize = 8 * 1024;

/// The result of pulling the next framed message out of a [`Framer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// A framed message ready for the wire.
    Send(Bytes),
    /// Nothing buffered yet; the sender has not closed its side.
    AwaitMore,
    /// The sender closed its side and everything buffered has been drained.
    NoMore,
}

/// Frames outbound messages, compressing them when an encoding is armed and
/// compression actually shrinks the payload.
pub(crate) struct Framer {
    frames: VecDeque<Bytes>,
    compressor: Option<CompressionEncoding>,
    max_message_size: usize,
    ended: bool,
    finished: bool,
}

impl Framer {
    pub(crate) fn new(compressor: Option<CompressionEncoding>, max_message_size: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            compressor,
            max_message_size,
            ended: false,
            finished: false,
        }
    }

    /// The encoding this framer will apply, if any. `None` once the stream
    /// has fully drained.
    pub(crate) fn compressor(&self) -> Option<CompressionEncoding> {
        self.compressor
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.ended
    }

    /// Buffer one message, optionally marking the end of the stream.
    pub(crate) fn append(&mut self, message: Bytes, end_of_stream: bool) -> Result<(), Status> {
        if self.ended {
            return Err(Status::internal("message appended after end of stream"));
        }
        if message.len() > self.max_message_size {
            return Err(Status::resource_exhausted(format!(
                "outgoing message length {} exceeds the maximum of {} bytes",
                message.len(),
                self.max_message_size,
            )));
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + message.len());
        buf.put_u8(0);
        buf.put_u32(message.len() as u32);
        buf.extend_from_slice(&message);

        if let Some(encoding) = self.compressor {
            let mut compressed = BytesMut::with_capacity(HEADER_SIZE);
            compressed.put_u8(1);
            compressed.put_u32(0);
            compression::compress(encoding, &message, &mut compressed, message.len())
                .map_err(|err| Status::internal(format!("error compressing message: {err}")))?;
            // Compression only pays for itself when the payload shrinks.
            if compressed.len() < buf.len() {
                let len = (compressed.len() - HEADER_SIZE) as u32;
                compressed[1..HEADER_SIZE].copy_from_slice(&len.to_be_bytes());
                buf = compressed;
            }
        }

        self.frames.push_back(buf.freeze());
        if end_of_stream {
            self.ended = true;
        }
        Ok(())
    }

    /// Close the sending side without a final message.
    pub(crate) fn end(&mut self) {
        self.ended = true;
    }

    /// Pull the next framed message. [`OutboundFrame::NoMore`] is terminal;
    /// producing it releases the compressor.
    pub(crate) fn next_frame(&mut self) -> OutboundFrame {
        if let Some(frame) = self.frames.pop_front() {
            return OutboundFrame::Send(frame);
        }
        if self.ended {
            if !self.finished {
                self.finished = true;
                self.compressor = None;
            }
            return OutboundFrame::NoMore;
        }
        OutboundFrame::AwaitMore
    }
}

#[derive(Debug)]
enum DeframeState {
    ReadHeader,
    ReadBody { compressed: bool, len: usize },
}

/// Reassembles length-prefixed messages out of arbitrarily fragmented data
/// buffers and queues them for the reader.
pub(crate) struct Deframer {
    state: DeframeState,
    buf: BytesMut,
    encoding: Option<CompressionEncoding>,
    max_message_size: usize,
    messages: VecDeque<Bytes>,
}

impl Deframer {
    pub(crate) fn new(encoding: Option<CompressionEncoding>, max_message_size: usize) -> Self {
        Self {
            state: DeframeState::ReadHeader,
            buf: BytesMut::with_capacity(BUFFER_SIZE),
            encoding,
            max_message_size,
            messages: VecDeque::new(),
        }
    }

    /// Feed one data buffer from the wire, decoding as many complete messages
    /// as it yields.
    pub(crate) fn push(&mut self, data: Bytes) -> Result<(), Status> {
        self.buf.put(data);
        while self.decode_chunk()? {}
        Ok(())
    }

    /// Drain the next fully decoded message, if any.
    pub(crate) fn next_message(&mut self) -> Option<Bytes> {
        self.messages.pop_front()
    }

    /// Consume the deframer, keeping any decoded-but-undrained messages.
    pub(crate) fn into_messages(self) -> VecDeque<Bytes> {
        self.messages
    }

    /// True when a partial frame is still buffered; an end-of-stream in this
    /// state is a framing error.
    pub(crate) fn has_partial_frame(&self) -> bool {
        !self.buf.is_empty() || matches!(self.state, DeframeState::ReadBody { .. })
    }

    fn decode_chunk(&mut self) -> Result<bool, Status> {
        if let DeframeState::ReadHeader = self.state {
            if self.buf.remaining() < HEADER_SIZE {
                return Ok(false);
            }
            let compressed = match self.buf.get_u8() {
                0 => false,
                1 => {
                    if self.encoding.is_none() {
                        return Err(Status::internal(
                            "protocol error: received message with compressed-flag but \
                             no grpc-encoding was specified",
                        ));
                    }
                    true
                }
                flag => {
                    trace!("unexpected compression flag {}", flag);
                    return Err(Status::internal(format!(
                        "protocol error: received message with invalid compression flag: \
                         {flag} (valid flags are 0 and 1)"
                    )));
                }
            };
            let len = self.buf.get_u32() as usize;
            if !compressed && len > self.max_message_size {
                return Err(Status::resource_exhausted(format!(
                    "incoming message length {len} exceeds the maximum of {} bytes",
                    self.max_message_size,
                )));
            }
            self.buf.reserve(len);
            self.state = DeframeState::ReadBody { compressed, len };
        }

        if let DeframeState::ReadBody { compressed, len } = self.state {
            if self.buf.remaining() < len {
                return Ok(false);
            }
            let message = if compressed {
                let mut out = BytesMut::with_capacity(len.min(BUFFER_SIZE) * 2);
                let encoding = self.encoding.ok_or_else(|| {
                    Status::internal("compressed message on a stream with no encoding")
                })?;
                let written =
                    compression::decompress(encoding, &self.buf, &mut out, len, self.max_message_size)
                        .map_err(|err| {
                            Status::internal(format!("error decompressing message: {err}"))
                        })?;
                if written > self.max_message_size {
                    return Err(Status::resource_exhausted(format!(
                        "incoming message length exceeds the maximum of {} bytes \
                         after decompression",
                        self.max_message_size,
                    )));
                }
                self.buf.advance(len);
                out.freeze()
            } else {
                self.buf.split_to(len).freeze()
            };
            self.messages.push_back(message);
            self.state = DeframeState::ReadHeader;
            return Ok(true);
        }

        Ok(false)
    }
}

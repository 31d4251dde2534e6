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

//! The client channel runtime for gRPC over HTTP/2.
//!
//! This crate is the machinery between an application's RPCs and the HTTP/2
//! transport: it establishes and maintains connections to one or more
//! backends, multiplexes RPC streams over those connections, and drives
//! per-RPC framing and compression through the gRPC wire protocol.
//!
//! The pieces:
//!
//! - [`client::channel::Channel`]: admits RPCs, routes each to a healthy
//!   connection via a load-balancing policy (pick-first or round-robin),
//!   queues attempts while nothing is ready, and reacts to name-resolution
//!   updates.
//! - [`transport`]: the seam to the HTTP/2 machinery, the per-connection
//!   lifecycle (keepalive, idle timeout, GOAWAY handling), and an in-memory
//!   transport for tests.
//! - [`codec`] and the per-stream state machine: gRPC message framing and
//!   compression over HTTP/2 frames.
//!
//! The HTTP/2 codec itself, TLS, message serialization, generated service
//! stubs, and server-side handling all live outside this crate.
//!
//! This version is in progress and not recommended for any production use.
//! All APIs are unstable.  Proceed at your own risk.

pub mod client;
pub mod codec;
pub mod metadata;
pub mod transport;

pub mod stream;

pub(crate) mod rt;

mod error;
mod status;

pub use client::ConnectivityState;
pub use client::call::{CallOptions, RpcStream};
pub use client::channel::{Channel, ChannelOptions};
pub use error::Error;
pub use status::{Code, Status};

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

//! An in-memory transport.
//!
//! Listeners register in a process-global table keyed by address; connecting
//! to a registered address yields a session whose peer half is a scriptable
//! [`ServerConnection`].  The peer never acts on its own, which makes this
//! transport the workhorse of the crate's tests: a test enqueues the exact
//! frame events a server would produce and observes the commands the client
//! issues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;

use super::{
    ConnectedSession, RawStream, Scheme, SessionControl, SessionEvent, StreamFrame, StreamWrite,
    Transport, TransportOptions,
};

static LISTENERS: LazyLock<Mutex<HashMap<String, Arc<Listener>>>> = LazyLock::new(Mutex::default);

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(0);

const STREAM_CHANNEL_CAPACITY: usize = 16;

/// A registered in-memory endpoint.  Dropping the listener unregisters it;
/// connects to its address then fail like a refused TCP connection.
pub struct Listener {
    address: String,
    connections_tx: mpsc::UnboundedSender<ServerConnection>,
    connections_rx: AsyncMutex<mpsc::UnboundedReceiver<ServerConnection>>,
}

impl Listener {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Arc::new(Self {
            address: format!("inmemory-{}", NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed)),
            connections_tx: tx,
            connections_rx: AsyncMutex::new(rx),
        });
        LISTENERS
            .lock()
            .unwrap()
            .insert(listener.address.clone(), listener.clone());
        listener
    }

    /// The address clients connect to.
    pub fn address(&self) -> String {
        self.address.clone()
    }

    /// Wait for the next client connection.
    pub async fn accept(&self) -> Option<ServerConnection> {
        self.connections_rx.lock().await.recv().await
    }

    /// Unregister without dropping; subsequent connects fail.
    pub fn shutdown(&self) {
        LISTENERS.lock().unwrap().remove(&self.address);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        LISTENERS.lock().unwrap().remove(&self.address);
    }
}

/// A command the client issued on its session control.
#[derive(Debug)]
pub enum ClientCommand {
    Ping([u8; 8]),
    GoAway(Bytes),
    ResetStream(u64),
    Close,
}

/// The server half of one in-memory connection, driven by tests.
pub struct ServerConnection {
    events_tx: mpsc::Sender<SessionEvent>,
    commands_rx: mpsc::UnboundedReceiver<ClientCommand>,
    streams_rx: mpsc::UnboundedReceiver<ServerStream>,
}

impl ServerConnection {
    /// Complete the HTTP/2 preface.
    pub fn send_settings(&self) {
        let _ = self.events_tx.try_send(SessionEvent::Settings);
    }

    /// Acknowledge a keepalive ping.
    pub fn ack_ping(&self, payload: [u8; 8]) {
        let _ = self.events_tx.try_send(SessionEvent::PingAck(payload));
    }

    pub fn send_go_away(&self, error_code: u32, debug_data: Bytes) {
        let _ = self.events_tx.try_send(SessionEvent::GoAway {
            error_code,
            debug_data,
        });
    }

    /// Kill the connection, as a dropped TCP session would.
    pub fn close_abruptly(&self, error: Option<String>) {
        let _ = self.events_tx.try_send(SessionEvent::Inactive { error });
    }

    /// Wait for the client to open a stream.
    pub async fn accept_stream(&mut self) -> Option<ServerStream> {
        self.streams_rx.recv().await
    }

    /// Wait for the next control command from the client.
    pub async fn next_command(&mut self) -> Option<ClientCommand> {
        self.commands_rx.recv().await
    }
}

/// One stream as the server sees it.
pub struct ServerStream {
    pub id: u64,
    pub request: http::Request<()>,
    writes_rx: mpsc::Receiver<StreamWrite>,
    frames_tx: mpsc::Sender<StreamFrame>,
}

impl ServerStream {
    /// Wait for the client's next write on this stream.
    pub async fn next_write(&mut self) -> Option<StreamWrite> {
        self.writes_rx.recv().await
    }

    pub async fn send_headers(&self, status: http::StatusCode, headers: HeaderMap, end_stream: bool) {
        let _ = self
            .frames_tx
            .send(StreamFrame::Headers {
                status,
                headers,
                end_stream,
            })
            .await;
    }

    pub async fn send_data(&self, data: Bytes, end_stream: bool) {
        let _ = self
            .frames_tx
            .send(StreamFrame::Data { data, end_stream })
            .await;
    }

    pub async fn send_trailers(&self, trailers: HeaderMap) {
        let _ = self.frames_tx.send(StreamFrame::Trailers { trailers }).await;
    }
}

/// The client-side transport; resolves addresses against the global listener
/// table.
#[derive(Default)]
pub struct InMemoryTransport;

impl InMemoryTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(
        &self,
        address: &str,
        _options: &TransportOptions,
    ) -> Result<ConnectedSession, crate::Error> {
        let listener = LISTENERS
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| format!("connection refused: no listener for address {address}"))?;

        let (events_tx, events_rx) = mpsc::channel(32);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (streams_tx, streams_rx) = mpsc::unbounded_channel();

        let server = ServerConnection {
            events_tx: events_tx.clone(),
            commands_rx,
            streams_rx,
        };
        listener
            .connections_tx
            .send(server)
            .map_err(|_| format!("listener for {address} is gone"))?;

        Ok(ConnectedSession {
            scheme: Scheme::Http,
            events: events_rx,
            control: Arc::new(InMemoryControl {
                next_stream_id: AtomicU64::new(1),
                commands_tx,
                streams_tx,
                events_tx,
            }),
        })
    }
}

struct InMemoryControl {
    next_stream_id: AtomicU64,
    commands_tx: mpsc::UnboundedSender<ClientCommand>,
    streams_tx: mpsc::UnboundedSender<ServerStream>,
    // Held so a local close can surface channel inactivity immediately.
    events_tx: mpsc::Sender<SessionEvent>,
}

impl SessionControl for InMemoryControl {
    fn open_stream(&self, request: http::Request<()>) -> Result<RawStream, crate::Error> {
        // Client-initiated stream ids are odd.
        let id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let (writes_tx, writes_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (frames_tx, frames_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        self.streams_tx
            .send(ServerStream {
                id,
                request,
                writes_rx,
                frames_tx,
            })
            .map_err(|_| "connection is closed")?;
        Ok(RawStream {
            id,
            writes: writes_tx,
            frames: frames_rx,
        })
    }

    fn send_ping(&self, payload: [u8; 8]) {
        let _ = self.commands_tx.send(ClientCommand::Ping(payload));
    }

    fn send_go_away(&self, debug_data: Bytes) {
        let _ = self.commands_tx.send(ClientCommand::GoAway(debug_data));
    }

    fn reset_stream(&self, id: u64) {
        let _ = self.commands_tx.send(ClientCommand::ResetStream(id));
    }

    fn flush(&self) {}

    fn close(&self) {
        let _ = self.commands_tx.send(ClientCommand::Close);
        let _ = self
            .events_tx
            .try_send(SessionEvent::Inactive { error: None });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_refused_without_listener() {
        let transport = InMemoryTransport::new();
        let err = transport
            .connect("nowhere", &TransportOptions::default())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn connect_and_exchange_frames() {
        let listener = Listener::new();
        let transport = InMemoryTransport::new();

        let session = transport
            .connect(&listener.address(), &TransportOptions::default())
            .await
            .unwrap();
        let mut server = listener.accept().await.unwrap();
        server.send_settings();

        let mut events = session.events;
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Settings
        ));

        let request = http::Request::builder()
            .uri("http://localhost/a/b")
            .body(())
            .unwrap();
        let mut raw = session.control.open_stream(request).unwrap();
        let mut stream = server.accept_stream().await.unwrap();
        assert_eq!(stream.request.uri().path(), "/a/b");

        raw.writes
            .send(StreamWrite::Data {
                data: Bytes::from_static(b"ping"),
                end_stream: true,
            })
            .await
            .unwrap();
        let Some(StreamWrite::Data { data, end_stream }) = stream.next_write().await else {
            panic!("expected data");
        };
        assert_eq!(data, Bytes::from_static(b"ping"));
        assert!(end_stream);

        stream
            .send_data(Bytes::from_static(b"pong"), false)
            .await;
        let Some(StreamFrame::Data { data, .. }) = raw.frames.recv().await else {
            panic!("expected data");
        };
        assert_eq!(data, Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn shutdown_unregisters_address() {
        let listener = Listener::new();
        let address = listener.address();
        listener.shutdown();
        let transport = InMemoryTransport::new();
        assert!(
            transport
                .connect(&address, &TransportOptions::default())
                .await
                .is_err()
        );
    }
}

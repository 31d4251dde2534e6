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

//! A one-shot client connection.
//!
//! A `Connection` is never reused across TCP sessions: it dials once, becomes
//! ready when the peer's first SETTINGS frame lands, and dies exactly once
//! with a [`CloseReason`].  All connection state lives on a single task;
//! callers talk to it through a cloneable [`ConnectionHandle`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::Status;
use crate::rt::Timer;

use super::lifecycle::{CloseReason, LifecycleAction, LifecycleEvent, LifecycleMachine};
use super::{
    ConnectedSession, KeepaliveOptions, RawStream, Scheme, SessionControl, SessionEvent, Transport,
    TransportOptions,
};

/// Lifecycle events a connection reports to its owner.
#[derive(Debug, Clone)]
pub(crate) enum ConnectionEvent {
    /// The HTTP/2 preface completed; streams may be opened.
    ConnectSucceeded { scheme: Scheme },
    /// Dialing failed, or the transport died before the peer's SETTINGS.
    ConnectFailed(String),
    /// The peer sent GOAWAY; no new streams will be admitted.
    GoingAway { error_code: u32, message: String },
    /// The connection is gone, with the highest-precedence close reason.
    Closed(CloseReason),
}

#[derive(Debug, Clone)]
pub(crate) struct ConnectionOptions {
    pub(crate) transport: TransportOptions,
    pub(crate) keepalive: Option<KeepaliveOptions>,
    pub(crate) max_idle_time: Option<Duration>,
}

enum Command {
    OpenStream {
        request: http::Request<()>,
        reply: oneshot::Sender<Result<RawStream, Status>>,
    },
    StreamClosed(u64),
    CancelStream(u64),
    Close,
    Lifecycle(LifecycleEvent),
}

/// A handle to a running connection task.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    /// Open a new HTTP/2 stream.  Suspends until the stream exists or the
    /// connection refuses it.
    pub(crate) async fn open_stream(
        &self,
        request: http::Request<()>,
    ) -> Result<RawStream, Status> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::OpenStream { request, reply })
            .map_err(|_| Status::unavailable("connection is closed"))?;
        rx.await
            .map_err(|_| Status::unavailable("connection is closed"))?
    }

    /// Report that a stream finished (all frames exchanged or aborted).
    pub(crate) fn stream_closed(&self, id: u64) {
        let _ = self.cmd_tx.send(Command::StreamClosed(id));
    }

    /// Cancel a stream locally; sends RST_STREAM and releases the id.
    pub(crate) fn cancel_stream(&self, id: u64) {
        let _ = self.cmd_tx.send(Command::CancelStream(id));
    }

    /// Request a graceful close: no new streams, transport closes once all
    /// open streams drain.
    pub(crate) fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }
}

pub(crate) struct Connection;

impl Connection {
    /// Dial `address` and run the connection until it dies.  Events arrive on
    /// `events`; the returned handle is the only way to interact with the
    /// connection.
    pub(crate) fn spawn(
        transport: Arc<dyn Transport>,
        address: String,
        options: ConnectionOptions,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> ConnectionHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            cmd_tx: cmd_tx.clone(),
        };
        tokio::spawn(run(transport, address, options, events, cmd_tx, cmd_rx));
        handle
    }
}

// Essential connection state: the control handle is only reachable while the
// transport is usable.
enum ConnState {
    Connected {
        control: Arc<dyn SessionControl>,
        scheme: Scheme,
    },
    Closing {
        control: Arc<dyn SessionControl>,
    },
    Closed,
}

impl ConnState {
    fn control(&self) -> Option<&Arc<dyn SessionControl>> {
        match self {
            ConnState::Connected { control, .. } | ConnState::Closing { control } => Some(control),
            ConnState::Closed => None,
        }
    }
}

struct Driver {
    machine: LifecycleMachine,
    state: ConnState,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    cmd_tx: mpsc::WeakUnboundedSender<Command>,
    keepalive_timer: Timer,
    keepalive_timeout_timer: Timer,
    idle_timer: Timer,
    ready: bool,
    done: bool,
}

async fn run(
    transport: Arc<dyn Transport>,
    address: String,
    options: ConnectionOptions,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    let session = match transport.connect(&address, &options.transport).await {
        Ok(session) => session,
        Err(err) => {
            let _ = events.send(ConnectionEvent::ConnectFailed(err.to_string()));
            return;
        }
    };
    let ConnectedSession {
        scheme,
        events: mut session_events,
        control,
    } = session;

    let mut driver = Driver {
        machine: LifecycleMachine::new(options.keepalive, options.max_idle_time),
        state: ConnState::Connected { control, scheme },
        events,
        cmd_tx: cmd_tx.downgrade(),
        keepalive_timer: Timer::new(),
        keepalive_timeout_timer: Timer::new(),
        idle_timer: Timer::new(),
        ready: false,
        done: false,
    };
    // Only the handles (and armed timers) keep the command channel open.
    drop(cmd_tx);

    let mut cmd_open = true;
    while !driver.done {
        tokio::select! {
            event = session_events.recv() => match event {
                Some(event) => {
                    // Frames often arrive in batches; process everything
                    // already buffered under one coalesced flush.
                    driver.step(LifecycleEvent::ReadBatchStarted);
                    driver.step(session_event_to_lifecycle(event));
                    while let Ok(event) = session_events.try_recv() {
                        driver.step(session_event_to_lifecycle(event));
                    }
                    driver.step(LifecycleEvent::ReadBatchEnded);
                }
                None => {
                    driver.step(LifecycleEvent::TransportInactive { error: None });
                }
            },
            cmd = cmd_rx.recv(), if cmd_open => match cmd {
                Some(cmd) => driver.command(cmd),
                None => {
                    // Every handle is gone; wind the connection down.
                    cmd_open = false;
                    driver.step(LifecycleEvent::CloseRequested);
                }
            },
        }
    }
}

fn session_event_to_lifecycle(event: SessionEvent) -> LifecycleEvent {
    match event {
        SessionEvent::Settings => LifecycleEvent::SettingsReceived,
        SessionEvent::PingAck(payload) => LifecycleEvent::PingAckReceived(payload),
        SessionEvent::GoAway {
            error_code,
            debug_data,
        } => LifecycleEvent::GoAwayReceived {
            error_code,
            debug_data,
        },
        SessionEvent::Inactive { error } => LifecycleEvent::TransportInactive { error },
    }
}

impl Driver {
    fn command(&mut self, cmd: Command) {
        match cmd {
            Command::OpenStream { request, reply } => {
                let result = self.open_stream(request);
                let _ = reply.send(result);
            }
            Command::StreamClosed(id) => self.step(LifecycleEvent::StreamClosed(id)),
            Command::CancelStream(id) => {
                if let Some(control) = self.state.control() {
                    control.reset_stream(id);
                }
                self.step(LifecycleEvent::StreamClosed(id));
            }
            Command::Close => self.step(LifecycleEvent::CloseRequested),
            Command::Lifecycle(event) => self.step(event),
        }
    }

    fn open_stream(&mut self, request: http::Request<()>) -> Result<RawStream, Status> {
        if !self.machine.can_open_streams() {
            return Err(Status::unavailable("connection is not accepting streams"));
        }
        let Some(control) = self.state.control() else {
            return Err(Status::unavailable("connection is closed"));
        };
        let raw = match control.open_stream(request) {
            Ok(raw) => raw,
            Err(err) => {
                let message = format!("failed to open stream: {err}");
                self.step(LifecycleEvent::ErrorCaught(message.clone()));
                return Err(Status::unavailable(message));
            }
        };
        self.step(LifecycleEvent::StreamOpened(raw.id));
        Ok(raw)
    }

    fn step(&mut self, event: LifecycleEvent) {
        for action in self.machine.on_event(event) {
            self.apply(action);
        }
    }

    fn apply(&mut self, action: LifecycleAction) {
        match action {
            LifecycleAction::Ready => {
                self.ready = true;
                let scheme = match &self.state {
                    ConnState::Connected { scheme, .. } => *scheme,
                    _ => Scheme::Http,
                };
                let _ = self
                    .events
                    .send(ConnectionEvent::ConnectSucceeded { scheme });
            }
            LifecycleAction::GoingAway {
                error_code,
                debug_data,
            } => {
                let _ = self.events.send(ConnectionEvent::GoingAway {
                    error_code,
                    message: String::from_utf8_lossy(&debug_data).into_owned(),
                });
            }
            LifecycleAction::Closing(reason) => {
                debug!("connection closing: {:?}", reason);
            }
            LifecycleAction::Closed(reason) => {
                self.keepalive_timer.cancel();
                self.keepalive_timeout_timer.cancel();
                self.idle_timer.cancel();
                self.state = ConnState::Closed;
                if self.ready {
                    let _ = self.events.send(ConnectionEvent::Closed(reason));
                } else {
                    // Died before the preface: a connect failure, not a close.
                    let _ = self.events.send(ConnectionEvent::ConnectFailed(
                        "connection closed before receiving SETTINGS".to_string(),
                    ));
                }
                self.done = true;
            }
            LifecycleAction::SendPing(payload) => {
                if let Some(control) = self.state.control() {
                    control.send_ping(payload);
                }
            }
            LifecycleAction::SendGoAway(debug_data) => {
                if let Some(control) = self.state.control() {
                    control.send_go_away(debug_data);
                }
            }
            LifecycleAction::CloseTransport => {
                let state = std::mem::replace(&mut self.state, ConnState::Closed);
                if let ConnState::Connected { control, .. } | ConnState::Closing { control } = state
                {
                    control.close();
                    self.state = ConnState::Closing { control };
                }
            }
            LifecycleAction::ArmKeepaliveTimer(delay) => {
                self.arm(TimerKind::Keepalive, delay);
            }
            LifecycleAction::CancelKeepaliveTimer => self.keepalive_timer.cancel(),
            LifecycleAction::ArmKeepaliveTimeoutTimer(delay) => {
                self.arm(TimerKind::KeepaliveTimeout, delay);
            }
            LifecycleAction::CancelKeepaliveTimeoutTimer => self.keepalive_timeout_timer.cancel(),
            LifecycleAction::ArmIdleTimer(delay) => {
                self.arm(TimerKind::Idle, delay);
            }
            LifecycleAction::CancelIdleTimer => self.idle_timer.cancel(),
            LifecycleAction::Flush => {
                if let Some(control) = self.state.control() {
                    control.flush();
                }
            }
        }
    }

    fn arm(&mut self, kind: TimerKind, delay: Duration) {
        let cmd_tx = self.cmd_tx.clone();
        let timer = match kind {
            TimerKind::Keepalive => &mut self.keepalive_timer,
            TimerKind::KeepaliveTimeout => &mut self.keepalive_timeout_timer,
            TimerKind::Idle => &mut self.idle_timer,
        };
        timer.schedule(delay, move || {
            if let Some(cmd_tx) = cmd_tx.upgrade() {
                let event = match kind {
                    TimerKind::Keepalive => LifecycleEvent::KeepaliveTimerFired,
                    TimerKind::KeepaliveTimeout => LifecycleEvent::KeepaliveTimeoutFired,
                    TimerKind::Idle => LifecycleEvent::IdleTimerFired,
                };
                let _ = cmd_tx.send(Command::Lifecycle(event));
            }
        });
    }
}

#[derive(Clone, Copy)]
enum TimerKind {
    Keepalive,
    KeepaliveTimeout,
    Idle,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;
    use crate::transport::inmemory::{ClientCommand, InMemoryTransport, Listener};
    use bytes::Bytes;
    use std::time::Duration;

    const KEEPALIVE: KeepaliveOptions = KeepaliveOptions {
        interval: Duration::from_millis(100),
        timeout: Duration::from_millis(50),
        allow_without_calls: true,
    };

    fn options(
        keepalive: Option<KeepaliveOptions>,
        max_idle_time: Option<Duration>,
    ) -> ConnectionOptions {
        ConnectionOptions {
            transport: TransportOptions::default(),
            keepalive,
            max_idle_time,
        }
    }

    fn spawn_connection(
        address: String,
        options: ConnectionOptions,
    ) -> (
        ConnectionHandle,
        mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = Connection::spawn(
            Arc::new(InMemoryTransport::new()),
            address,
            options,
            events_tx,
        );
        (handle, events_rx)
    }

    fn request() -> http::Request<()> {
        http::Request::builder()
            .uri("http://localhost/svc/method")
            .body(())
            .unwrap()
    }

    #[tokio::test]
    async fn connect_failure_reported() {
        let (_handle, mut events) = spawn_connection("missing".to_string(), options(None, None));
        let Some(ConnectionEvent::ConnectFailed(message)) = events.recv().await else {
            panic!("expected connect failure");
        };
        assert!(message.contains("connection refused"));
    }

    #[tokio::test]
    async fn not_ready_until_settings() {
        let listener = Listener::new();
        let (handle, mut events) = spawn_connection(listener.address(), options(None, None));
        let server = listener.accept().await.unwrap();

        // Opening a stream before the preface is refused.
        let err = handle.open_stream(request()).await.unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);

        server.send_settings();
        let Some(ConnectionEvent::ConnectSucceeded { scheme }) = events.recv().await else {
            panic!("expected readiness");
        };
        assert_eq!(scheme, Scheme::Http);
    }

    #[tokio::test]
    async fn death_before_settings_is_a_connect_failure() {
        let listener = Listener::new();
        let (_handle, mut events) = spawn_connection(listener.address(), options(None, None));
        let server = listener.accept().await.unwrap();
        server.close_abruptly(None);
        let Some(ConnectionEvent::ConnectFailed(message)) = events.recv().await else {
            panic!("expected connect failure");
        };
        assert!(message.contains("before receiving SETTINGS"));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_expiry_closes_connection() {
        let listener = Listener::new();
        let (_handle, mut events) =
            spawn_connection(listener.address(), options(Some(KEEPALIVE), None));
        let mut server = listener.accept().await.unwrap();
        server.send_settings();
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::ConnectSucceeded { .. })
        ));

        // The ping goes out one interval after readiness.
        let Some(ClientCommand::Ping(_)) = server.next_command().await else {
            panic!("expected a keepalive ping");
        };

        // No ack: the timeout expires, GOAWAY goes out, transport closes.
        let Some(ClientCommand::GoAway(data)) = server.next_command().await else {
            panic!("expected a goaway");
        };
        assert_eq!(data, Bytes::from_static(b"keepalive_expired"));
        assert!(matches!(server.next_command().await, Some(ClientCommand::Close)));
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Closed(CloseReason::KeepaliveExpired))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_ack_keeps_connection_alive() {
        let listener = Listener::new();
        let (_handle, mut events) =
            spawn_connection(listener.address(), options(Some(KEEPALIVE), None));
        let mut server = listener.accept().await.unwrap();
        server.send_settings();
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::ConnectSucceeded { .. })
        ));

        for _ in 0..3 {
            let Some(ClientCommand::Ping(payload)) = server.next_command().await else {
                panic!("expected a keepalive ping");
            };
            server.ack_ping(payload);
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_closes_connection() {
        let listener = Listener::new();
        let (_handle, mut events) = spawn_connection(
            listener.address(),
            options(None, Some(Duration::from_millis(200))),
        );
        let mut server = listener.accept().await.unwrap();
        server.send_settings();
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::ConnectSucceeded { .. })
        ));

        let Some(ClientCommand::GoAway(data)) = server.next_command().await else {
            panic!("expected a goaway");
        };
        assert_eq!(data, Bytes::from_static(b"idle"));
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Closed(CloseReason::Idle))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn open_stream_cancels_idle_timer() {
        let listener = Listener::new();
        let (handle, mut events) = spawn_connection(
            listener.address(),
            options(None, Some(Duration::from_millis(200))),
        );
        let mut server = listener.accept().await.unwrap();
        server.send_settings();
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::ConnectSucceeded { .. })
        ));

        let raw = handle.open_stream(request()).await.unwrap();
        let _stream = server.accept_stream().await.unwrap();

        // Well past the idle timeout: still alive because a stream is open.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(events.try_recv().is_err());

        // Stream closes; idle re-arms and fires.
        handle.stream_closed(raw.id);
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Closed(CloseReason::Idle))
        ));
    }

    #[tokio::test]
    async fn goaway_drains_active_streams() {
        let listener = Listener::new();
        let (handle, mut events) = spawn_connection(listener.address(), options(None, None));
        let mut server = listener.accept().await.unwrap();
        server.send_settings();
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::ConnectSucceeded { .. })
        ));

        let raw_a = handle.open_stream(request()).await.unwrap();
        let raw_b = handle.open_stream(request()).await.unwrap();

        server.send_go_away(0, Bytes::from_static(b"drain"));
        let Some(ConnectionEvent::GoingAway { error_code, message }) = events.recv().await else {
            panic!("expected going away");
        };
        assert_eq!(error_code, 0);
        assert_eq!(message, "drain");

        // No new streams.
        let err = handle.open_stream(request()).await.unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);

        // The transport stays up until both streams close.
        assert!(events.try_recv().is_err());
        handle.stream_closed(raw_a.id);
        handle.stream_closed(raw_b.id);
        let Some(ConnectionEvent::Closed(CloseReason::Remote { debug_data, .. })) =
            events.recv().await
        else {
            panic!("expected remote close");
        };
        assert_eq!(debug_data, "drain");
    }

    #[tokio::test]
    async fn local_close_waits_for_streams() {
        let listener = Listener::new();
        let (handle, mut events) = spawn_connection(listener.address(), options(None, None));
        let mut server = listener.accept().await.unwrap();
        server.send_settings();
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::ConnectSucceeded { .. })
        ));

        let raw = handle.open_stream(request()).await.unwrap();
        handle.close();

        assert!(events.try_recv().is_err());
        handle.stream_closed(raw.id);
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Closed(CloseReason::InitiatedLocally))
        ));
    }

    #[tokio::test]
    async fn cancel_stream_sends_reset() {
        let listener = Listener::new();
        let (handle, mut events) = spawn_connection(listener.address(), options(None, None));
        let mut server = listener.accept().await.unwrap();
        server.send_settings();
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::ConnectSucceeded { .. })
        ));

        let raw = handle.open_stream(request()).await.unwrap();
        handle.cancel_stream(raw.id);
        let Some(ClientCommand::ResetStream(id)) = server.next_command().await else {
            panic!("expected reset");
        };
        assert_eq!(id, raw.id);
    }

    #[tokio::test]
    async fn unexpected_death_reports_unexpected_reason() {
        let listener = Listener::new();
        let (handle, mut events) = spawn_connection(listener.address(), options(None, None));
        let mut server = listener.accept().await.unwrap();
        server.send_settings();
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::ConnectSucceeded { .. })
        ));

        let _raw = handle.open_stream(request()).await.unwrap();
        let _stream = server.accept_stream().await.unwrap();
        server.close_abruptly(Some("connection reset by peer".to_string()));

        let Some(ConnectionEvent::Closed(CloseReason::Unexpected { error, was_idle })) =
            events.recv().await
        else {
            panic!("expected unexpected close");
        };
        assert_eq!(error.as_deref(), Some("connection reset by peer"));
        assert!(!was_idle);
    }
}

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

//! A Subchannel represents a method of communicating with a server which may
//! be connected or disconnected many times across its lifetime.
//!
//! - Subchannels start Idle and transition to Connecting when connect() is
//!   called.
//! - Connecting transitions to Ready on success or TransientFailure on error.
//! - Ready transitions to Idle on a graceful connection end, or to
//!   TransientFailure when the connection is lost.
//! - TransientFailure transitions to Idle when the reconnect backoff timer
//!   expires; the owning LB policy decides when to connect again.
//! - Shutdown is terminal.
//!
//! Every connection is one-shot: a subchannel that reconnects always builds a
//! fresh `Connection`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::ConnectivityState;
use crate::client::name_resolution::Address;
use crate::client::name_resolution::backoff::{BackoffConfig, ExponentialBackoff};
use crate::rt;
use crate::transport::connection::{
    Connection, ConnectionEvent, ConnectionHandle, ConnectionOptions,
};
use crate::transport::lifecycle::CloseReason;
use crate::transport::{Scheme, Transport};

/// Everything a subchannel needs to build connections.
#[derive(Clone)]
pub(crate) struct SubchannelOptions {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) connection: ConnectionOptions,
    pub(crate) backoff: BackoffConfig,
    pub(crate) connect_timeout: Duration,
}

/// A connectivity-state change reported to the owning LB policy.
#[derive(Debug, Clone)]
pub(crate) struct SubchannelUpdate {
    pub(crate) id: u64,
    pub(crate) state: ConnectivityState,
    pub(crate) error: Option<String>,
}

pub(crate) struct Subchannel {
    id: u64,
    address: Address,
    events_tx: mpsc::UnboundedSender<MachineEvent>,
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<ConnectivityState>,
    conn: Mutex<Option<(ConnectionHandle, Scheme)>>,
}

impl Subchannel {
    /// Create the subchannel and start its state machine.  State changes are
    /// delivered to `watcher`.
    pub(crate) fn new(
        address: Address,
        options: SubchannelOptions,
        watcher: mpsc::UnboundedSender<SubchannelUpdate>,
    ) -> Arc<Self> {
        let id = rt::next_id();
        let shared = Arc::new(Shared {
            state: Mutex::new(ConnectivityState::Idle),
            conn: Mutex::new(None),
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // The long-running state machine task.  It exits when the subchannel
        // is dropped (the only strong sender goes away) or on Shutdown.
        let machine = Machine {
            id,
            address: address.clone(),
            options,
            watcher,
            shared: shared.clone(),
            self_tx: events_tx.downgrade(),
            generation: 0,
            state: MachineState::Idle,
        };
        tokio::spawn(machine.run(events_rx));

        Arc::new(Self {
            id,
            address,
            events_tx,
            shared,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    pub(crate) fn state(&self) -> ConnectivityState {
        *self.shared.state.lock()
    }

    /// Begins connecting the subchannel asynchronously.  A no-op unless the
    /// subchannel is Idle.
    pub(crate) fn connect(&self) {
        let _ = self.events_tx.send(MachineEvent::ConnectRequested);
    }

    /// Shut the subchannel down.  Terminal; the connection (if any) drains
    /// gracefully.
    pub(crate) fn shutdown(&self) {
        let _ = self.events_tx.send(MachineEvent::Shutdown);
    }

    /// The ready connection, if there is one right now.
    pub(crate) fn connected(&self) -> Option<(ConnectionHandle, Scheme)> {
        self.shared.conn.lock().clone()
    }
}

impl std::fmt::Debug for Subchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subchannel")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}

enum MachineEvent {
    ConnectRequested,
    ConnectSucceeded {
        generation: u64,
        conn: ConnectionHandle,
        scheme: Scheme,
        conn_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    },
    ConnectFailed {
        generation: u64,
        error: String,
    },
    GoingAway {
        generation: u64,
    },
    ConnectionClosed {
        generation: u64,
        reason: CloseReason,
    },
    BackoffExpired,
    Shutdown,
}

enum MachineState {
    Idle,
    Connecting {
        task: tokio::task::JoinHandle<()>,
    },
    Ready {
        conn: ConnectionHandle,
        // Watches connection events; detached when the connection is parked
        // for draining.
        watch_task: tokio::task::JoinHandle<()>,
    },
    TransientFailure {
        backoff_task: tokio::task::JoinHandle<()>,
    },
    Shutdown,
}

struct Machine {
    id: u64,
    address: Address,
    options: SubchannelOptions,
    watcher: mpsc::UnboundedSender<SubchannelUpdate>,
    shared: Arc<Shared>,
    self_tx: mpsc::WeakUnboundedSender<MachineEvent>,
    generation: u64,
    state: MachineState,
}

impl Machine {
    async fn run(mut self, mut events_rx: mpsc::UnboundedReceiver<MachineEvent>) {
        // A fresh subchannel owns its backoff iterator for its whole life.
        let backoff = match ExponentialBackoff::new(self.options.backoff.clone()) {
            Ok(backoff) => backoff,
            Err(err) => {
                debug!("invalid backoff config, using defaults: {}", err);
                ExponentialBackoff::new(BackoffConfig::default())
                    .unwrap_or_else(|_| unreachable!("default backoff config is valid"))
            }
        };

        while let Some(event) = events_rx.recv().await {
            if matches!(self.state, MachineState::Shutdown) {
                break;
            }
            self.on_event(event, &backoff);
        }

        // Dropped or shut down: release the connection gracefully.
        self.enter_shutdown(false);
    }

    fn on_event(&mut self, event: MachineEvent, backoff: &ExponentialBackoff) {
        match event {
            MachineEvent::ConnectRequested => {
                if matches!(self.state, MachineState::Idle) {
                    self.move_to_connecting();
                }
            }
            MachineEvent::ConnectSucceeded {
                generation,
                conn,
                scheme,
                conn_events,
            } => {
                if generation == self.generation
                    && matches!(self.state, MachineState::Connecting { .. })
                {
                    backoff.reset();
                    self.move_to_ready(conn, scheme, conn_events);
                }
            }
            MachineEvent::ConnectFailed { generation, error } => {
                if generation == self.generation
                    && matches!(self.state, MachineState::Connecting { .. })
                {
                    self.move_to_transient_failure(error, backoff);
                }
            }
            MachineEvent::GoingAway { generation } => {
                if generation == self.generation && matches!(self.state, MachineState::Ready { .. })
                {
                    // Park the draining connection and report Idle so the
                    // owner can reconnect; in-flight RPCs keep the old
                    // connection alive until they finish.
                    self.park_connection();
                    self.move_to_idle();
                }
            }
            MachineEvent::ConnectionClosed { generation, reason } => {
                if generation == self.generation && matches!(self.state, MachineState::Ready { .. })
                {
                    self.shared.conn.lock().take();
                    match reason {
                        CloseReason::Unexpected { error, .. } => {
                            let error =
                                error.unwrap_or_else(|| "connection lost".to_string());
                            self.move_to_transient_failure(error, backoff);
                        }
                        CloseReason::KeepaliveExpired => {
                            self.move_to_transient_failure(
                                "keepalive timeout expired".to_string(),
                                backoff,
                            );
                        }
                        _ => self.move_to_idle(),
                    }
                }
            }
            MachineEvent::BackoffExpired => {
                if matches!(self.state, MachineState::TransientFailure { .. }) {
                    self.move_to_idle();
                }
            }
            MachineEvent::Shutdown => {
                self.enter_shutdown(true);
            }
        }
    }

    fn notify(&self, state: ConnectivityState, error: Option<String>) {
        *self.shared.state.lock() = state;
        let _ = self.watcher.send(SubchannelUpdate {
            id: self.id,
            state,
            error,
        });
    }

    fn abort_pending(&mut self) -> MachineState {
        let state = std::mem::replace(&mut self.state, MachineState::Idle);
        match &state {
            MachineState::Connecting { task } => task.abort(),
            MachineState::TransientFailure { backoff_task } => backoff_task.abort(),
            _ => {}
        }
        state
    }

    fn park_connection(&mut self) {
        self.shared.conn.lock().take();
        // Dropping the Ready state detaches the watch task and releases our
        // handle; stream holders keep the connection alive while it drains.
        let _ = std::mem::replace(&mut self.state, MachineState::Idle);
    }

    fn move_to_idle(&mut self) {
        self.abort_pending();
        self.state = MachineState::Idle;
        self.notify(ConnectivityState::Idle, None);
    }

    fn move_to_connecting(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let transport = self.options.transport.clone();
        let address = self.address.address.clone();
        let connection_options = self.options.connection.clone();
        let connect_timeout = self.options.connect_timeout;
        let self_tx = self.self_tx.clone();

        let task = tokio::spawn(async move {
            let (conn_events_tx, mut conn_events) = mpsc::unbounded_channel();
            let conn = Connection::spawn(transport, address, connection_options, conn_events_tx);
            let first = tokio::time::timeout(connect_timeout, conn_events.recv()).await;
            let Some(self_tx) = self_tx.upgrade() else {
                return;
            };
            let event = match first {
                Ok(Some(ConnectionEvent::ConnectSucceeded { scheme })) => {
                    MachineEvent::ConnectSucceeded {
                        generation,
                        conn,
                        scheme,
                        conn_events,
                    }
                }
                Ok(Some(ConnectionEvent::ConnectFailed(error))) => {
                    MachineEvent::ConnectFailed { generation, error }
                }
                Ok(_) => MachineEvent::ConnectFailed {
                    generation,
                    error: "connection ended before becoming ready".to_string(),
                },
                Err(_) => MachineEvent::ConnectFailed {
                    generation,
                    error: "connect timeout expired".to_string(),
                },
            };
            let _ = self_tx.send(event);
        });

        self.state = MachineState::Connecting { task };
        self.notify(ConnectivityState::Connecting, None);
    }

    fn move_to_ready(
        &mut self,
        conn: ConnectionHandle,
        scheme: Scheme,
        mut conn_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        *self.shared.conn.lock() = Some((conn.clone(), scheme));

        let generation = self.generation;
        let self_tx = self.self_tx.clone();
        let watch_task = tokio::spawn(async move {
            loop {
                match conn_events.recv().await {
                    Some(ConnectionEvent::GoingAway { error_code, message }) => {
                        debug!(
                            "connection going away: code={} message={:?}",
                            error_code, message
                        );
                        if let Some(tx) = self_tx.upgrade() {
                            let _ = tx.send(MachineEvent::GoingAway { generation });
                        }
                    }
                    Some(ConnectionEvent::Closed(reason)) => {
                        debug!("connection closed: {:?}", reason);
                        if let Some(tx) = self_tx.upgrade() {
                            let _ = tx.send(MachineEvent::ConnectionClosed { generation, reason });
                        }
                        return;
                    }
                    Some(_) => {}
                    None => {
                        if let Some(tx) = self_tx.upgrade() {
                            let _ = tx.send(MachineEvent::ConnectionClosed {
                                generation,
                                reason: CloseReason::Unexpected {
                                    error: None,
                                    was_idle: true,
                                },
                            });
                        }
                        return;
                    }
                }
            }
        });

        self.state = MachineState::Ready { conn, watch_task };
        self.notify(ConnectivityState::Ready, None);
    }

    fn move_to_transient_failure(&mut self, error: String, backoff: &ExponentialBackoff) {
        self.abort_pending();
        let delay = backoff.backoff_duration();
        let self_tx = self.self_tx.clone();
        let backoff_task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = self_tx.upgrade() {
                let _ = tx.send(MachineEvent::BackoffExpired);
            }
        });
        self.state = MachineState::TransientFailure { backoff_task };
        self.notify(ConnectivityState::TransientFailure, Some(error));
    }

    fn enter_shutdown(&mut self, notify: bool) {
        self.shared.conn.lock().take();
        let state = self.abort_pending();
        if let MachineState::Ready { conn, .. } = state {
            // Graceful: in-flight RPCs run to completion before the
            // transport closes.
            conn.close();
        }
        self.state = MachineState::Shutdown;
        if notify {
            self.notify(ConnectivityState::Shutdown, None);
        } else {
            *self.shared.state.lock() = ConnectivityState::Shutdown;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportOptions;
    use crate::transport::inmemory::{InMemoryTransport, Listener};

    fn options() -> SubchannelOptions {
        SubchannelOptions {
            transport: Arc::new(InMemoryTransport::new()),
            connection: ConnectionOptions {
                transport: TransportOptions::default(),
                keepalive: None,
                max_idle_time: None,
            },
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(100),
                multiplier: 2.0,
                jitter: 0.0,
                max_delay: Duration::from_secs(1),
            },
            connect_timeout: Duration::from_secs(20),
        }
    }

    async fn expect_state(
        rx: &mut mpsc::UnboundedReceiver<SubchannelUpdate>,
        state: ConnectivityState,
    ) -> SubchannelUpdate {
        let update = rx.recv().await.expect("watcher closed");
        assert_eq!(update.state, state, "unexpected state {}", update.state);
        update
    }

    #[tokio::test]
    async fn connects_and_reports_ready() {
        let listener = Listener::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sc = Subchannel::new(Address::new(listener.address()), options(), tx);

        assert_eq!(sc.state(), ConnectivityState::Idle);
        sc.connect();
        expect_state(&mut rx, ConnectivityState::Connecting).await;

        let server = listener.accept().await.unwrap();
        server.send_settings();
        expect_state(&mut rx, ConnectivityState::Ready).await;
        assert!(sc.connected().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_backs_off_to_idle() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sc = Subchannel::new(Address::new("unknown-address"), options(), tx);

        sc.connect();
        expect_state(&mut rx, ConnectivityState::Connecting).await;
        let update = expect_state(&mut rx, ConnectivityState::TransientFailure).await;
        assert!(update.error.unwrap().contains("connection refused"));

        // After the backoff expires the subchannel is connectable again.
        expect_state(&mut rx, ConnectivityState::Idle).await;
        assert_eq!(sc.state(), ConnectivityState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_is_a_failure() {
        // The listener accepts but never sends SETTINGS.
        let listener = Listener::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sc = Subchannel::new(Address::new(listener.address()), options(), tx);

        sc.connect();
        expect_state(&mut rx, ConnectivityState::Connecting).await;
        let _server = listener.accept().await.unwrap();
        let update = expect_state(&mut rx, ConnectivityState::TransientFailure).await;
        assert!(update.error.unwrap().contains("connect timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_is_transient_failure() {
        let listener = Listener::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sc = Subchannel::new(Address::new(listener.address()), options(), tx);

        sc.connect();
        expect_state(&mut rx, ConnectivityState::Connecting).await;
        let server = listener.accept().await.unwrap();
        server.send_settings();
        expect_state(&mut rx, ConnectivityState::Ready).await;

        server.close_abruptly(Some("reset".to_string()));
        let update = expect_state(&mut rx, ConnectivityState::TransientFailure).await;
        assert_eq!(update.error.as_deref(), Some("reset"));
        assert!(sc.connected().is_none());
    }

    #[tokio::test]
    async fn goaway_parks_connection_and_reports_idle() {
        let listener = Listener::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sc = Subchannel::new(Address::new(listener.address()), options(), tx);

        sc.connect();
        expect_state(&mut rx, ConnectivityState::Connecting).await;
        let server = listener.accept().await.unwrap();
        server.send_settings();
        expect_state(&mut rx, ConnectivityState::Ready).await;

        server.send_go_away(0, bytes::Bytes::from_static(b"drain"));
        expect_state(&mut rx, ConnectivityState::Idle).await;
        assert!(sc.connected().is_none());
    }

    #[tokio::test]
    async fn shutdown_is_terminal() {
        let listener = Listener::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sc = Subchannel::new(Address::new(listener.address()), options(), tx);

        sc.connect();
        expect_state(&mut rx, ConnectivityState::Connecting).await;
        sc.shutdown();
        let update = loop {
            let update = rx.recv().await.unwrap();
            if update.state == ConnectivityState::Shutdown {
                break update;
            }
        };
        assert_eq!(update.state, ConnectivityState::Shutdown);

        // connect() after shutdown is ignored.
        sc.connect();
        assert_eq!(sc.state(), ConnectivityState::Shutdown);
    }
}

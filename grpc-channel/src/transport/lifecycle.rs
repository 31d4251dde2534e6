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

//! The per-connection lifecycle machine.
//!
//! A deterministic automaton over connection-level events: preface detection,
//! the keepalive protocol (gRFC A8), the max-idle timer, GOAWAY in both
//! directions, and stream accounting.  It owns no timers and performs no I/O;
//! each event produces the list of actions the surrounding connection task
//! must carry out, which keeps every path unit-testable.

use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use super::KeepaliveOptions;

/// Why a connection closed.  When several termination causes fire on one
/// connection, the highest-precedence reason is the one reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The transport went away without an explanation.
    Unexpected {
        error: Option<String>,
        was_idle: bool,
    },
    /// The peer sent GOAWAY.
    Remote { error_code: u32, debug_data: String },
    /// The max-idle timer fired.
    Idle,
    /// A keepalive ping went unacknowledged.
    KeepaliveExpired,
    /// The local side asked for the connection to close.
    InitiatedLocally,
}

impl CloseReason {
    fn precedence(&self) -> u8 {
        match self {
            CloseReason::Unexpected { .. } => 0,
            CloseReason::Remote { .. } => 1,
            CloseReason::Idle => 2,
            CloseReason::KeepaliveExpired => 3,
            CloseReason::InitiatedLocally => 4,
        }
    }
}

#[derive(Debug)]
pub(crate) enum LifecycleEvent {
    /// A SETTINGS frame arrived; the first one completes the preface.
    SettingsReceived,
    PingAckReceived([u8; 8]),
    GoAwayReceived { error_code: u32, debug_data: Bytes },
    StreamOpened(u64),
    StreamClosed(u64),
    KeepaliveTimerFired,
    KeepaliveTimeoutFired,
    IdleTimerFired,
    /// The local side requested a graceful close.
    CloseRequested,
    /// An error was observed on the channel; latched for diagnosis if the
    /// transport later dies unexpectedly.
    ErrorCaught(String),
    TransportInactive { error: Option<String> },
    FlushRequested,
    ReadBatchStarted,
    ReadBatchEnded,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LifecycleAction {
    /// The preface completed; the connection is usable.
    Ready,
    /// The peer announced it is going away.
    GoingAway { error_code: u32, debug_data: Bytes },
    /// The connection started closing for this reason.
    Closing(CloseReason),
    /// The connection is fully closed; this is the final, highest-precedence
    /// reason.
    Closed(CloseReason),
    SendPing([u8; 8]),
    SendGoAway(Bytes),
    CloseTransport,
    ArmKeepaliveTimer(Duration),
    CancelKeepaliveTimer,
    ArmKeepaliveTimeoutTimer(Duration),
    CancelKeepaliveTimeoutTimer,
    ArmIdleTimer(Duration),
    CancelIdleTimer,
    Flush,
}

enum State {
    Active {
        open_streams: HashSet<u64>,
        received_preface: bool,
        latched_error: Option<String>,
    },
    Closing {
        open_streams: HashSet<u64>,
    },
    Closed,
}

pub(crate) struct LifecycleMachine {
    state: State,
    keepalive: Option<KeepaliveOptions>,
    max_idle: Option<Duration>,
    ping_payload: [u8; 8],
    reason: Option<CloseReason>,
    in_read_loop: bool,
    flush_pending: bool,
}

impl LifecycleMachine {
    pub(crate) fn new(keepalive: Option<KeepaliveOptions>, max_idle: Option<Duration>) -> Self {
        Self {
            state: State::Active {
                open_streams: HashSet::new(),
                received_preface: false,
                latched_error: None,
            },
            keepalive,
            max_idle,
            // Chosen once per connection; acks must echo it.
            ping_payload: rand::random(),
            reason: None,
            in_read_loop: false,
            flush_pending: false,
        }
    }

    pub(crate) fn ping_payload(&self) -> [u8; 8] {
        self.ping_payload
    }

    /// Whether new streams may be opened on this connection.
    pub(crate) fn can_open_streams(&self) -> bool {
        matches!(
            self.state,
            State::Active {
                received_preface: true,
                ..
            }
        )
    }

    fn latch(&mut self, reason: CloseReason) {
        match &self.reason {
            Some(existing) if existing.precedence() >= reason.precedence() => {}
            _ => self.reason = Some(reason),
        }
    }

    fn final_reason(&self) -> CloseReason {
        self.reason.clone().unwrap_or(CloseReason::Unexpected {
            error: None,
            was_idle: true,
        })
    }

    pub(crate) fn on_event(&mut self, event: LifecycleEvent) -> Vec<LifecycleAction> {
        use LifecycleAction as Action;
        use LifecycleEvent as Event;

        match event {
            Event::SettingsReceived => {
                let State::Active {
                    open_streams,
                    received_preface,
                    ..
                } = &mut self.state
                else {
                    return vec![];
                };
                if *received_preface {
                    // Later SETTINGS updates are the codec's business.
                    return vec![];
                }
                *received_preface = true;
                let mut actions = vec![Action::Ready];
                if let Some(keepalive) = self.keepalive {
                    if keepalive.allow_without_calls || !open_streams.is_empty() {
                        actions.push(Action::ArmKeepaliveTimer(keepalive.interval));
                    }
                }
                if let Some(max_idle) = self.max_idle {
                    if open_streams.is_empty() {
                        actions.push(Action::ArmIdleTimer(max_idle));
                    }
                }
                actions
            }

            Event::PingAckReceived(payload) => {
                if !matches!(self.state, State::Active { .. }) {
                    return vec![];
                }
                if payload != self.ping_payload {
                    debug!("ignoring ping ack with unknown payload");
                    return vec![];
                }
                match self.keepalive {
                    Some(keepalive) => vec![
                        Action::CancelKeepaliveTimeoutTimer,
                        Action::ArmKeepaliveTimer(keepalive.interval),
                    ],
                    None => vec![],
                }
            }

            Event::KeepaliveTimerFired => {
                let State::Active { open_streams, .. } = &self.state else {
                    return vec![];
                };
                let Some(keepalive) = self.keepalive else {
                    return vec![];
                };
                if keepalive.allow_without_calls || !open_streams.is_empty() {
                    vec![
                        Action::SendPing(self.ping_payload),
                        Action::ArmKeepaliveTimeoutTimer(keepalive.timeout),
                        Action::Flush,
                    ]
                } else {
                    vec![]
                }
            }

            Event::KeepaliveTimeoutFired => {
                let State::Active { open_streams, .. } = &mut self.state else {
                    return vec![];
                };
                let open_streams = std::mem::take(open_streams);
                self.state = State::Closing { open_streams };
                self.latch(CloseReason::KeepaliveExpired);
                vec![
                    Action::Closing(CloseReason::KeepaliveExpired),
                    Action::SendGoAway(Bytes::from_static(b"keepalive_expired")),
                    Action::CloseTransport,
                ]
            }

            Event::IdleTimerFired => {
                let State::Active { open_streams, .. } = &mut self.state else {
                    return vec![];
                };
                debug_assert!(open_streams.is_empty());
                self.state = State::Closing {
                    open_streams: HashSet::new(),
                };
                self.latch(CloseReason::Idle);
                vec![
                    Action::Closing(CloseReason::Idle),
                    Action::SendGoAway(Bytes::from_static(b"idle")),
                    Action::CloseTransport,
                ]
            }

            Event::GoAwayReceived {
                error_code,
                debug_data,
            } => {
                let open_streams = match &mut self.state {
                    State::Active { open_streams, .. } => std::mem::take(open_streams),
                    State::Closing { .. } | State::Closed => {
                        self.latch(CloseReason::Remote {
                            error_code,
                            debug_data: String::from_utf8_lossy(&debug_data).into_owned(),
                        });
                        return vec![];
                    }
                };
                self.latch(CloseReason::Remote {
                    error_code,
                    debug_data: String::from_utf8_lossy(&debug_data).into_owned(),
                });
                let drained = open_streams.is_empty();
                self.state = State::Closing { open_streams };
                let mut actions = vec![
                    Action::GoingAway {
                        error_code,
                        debug_data,
                    },
                    // Reciprocate so the peer can tear down cleanly.
                    Action::SendGoAway(Bytes::new()),
                ];
                if drained {
                    actions.push(Action::CloseTransport);
                }
                actions
            }

            Event::StreamOpened(id) => {
                let State::Active {
                    open_streams,
                    received_preface,
                    ..
                } = &mut self.state
                else {
                    warn!("stream {} opened while the connection is closing", id);
                    return vec![];
                };
                let was_empty = open_streams.is_empty();
                let inserted = open_streams.insert(id);
                debug_assert!(inserted, "stream id {id} opened twice");
                let mut actions = vec![Action::CancelIdleTimer];
                if let Some(keepalive) = self.keepalive {
                    if was_empty && !keepalive.allow_without_calls && *received_preface {
                        actions.push(Action::ArmKeepaliveTimer(keepalive.interval));
                    }
                }
                actions
            }

            Event::StreamClosed(id) => match &mut self.state {
                State::Active { open_streams, .. } => {
                    if !open_streams.remove(&id) {
                        warn!("stream {} closed but was not open", id);
                    }
                    if !open_streams.is_empty() {
                        return vec![];
                    }
                    let mut actions = vec![];
                    if let Some(max_idle) = self.max_idle {
                        actions.push(Action::ArmIdleTimer(max_idle));
                    }
                    if let Some(keepalive) = self.keepalive {
                        if !keepalive.allow_without_calls {
                            actions.push(Action::CancelKeepaliveTimer);
                            actions.push(Action::CancelKeepaliveTimeoutTimer);
                        }
                    }
                    actions
                }
                State::Closing { open_streams } => {
                    if !open_streams.remove(&id) {
                        warn!("stream {} closed but was not open", id);
                    }
                    if open_streams.is_empty() {
                        vec![Action::CloseTransport]
                    } else {
                        vec![]
                    }
                }
                State::Closed => vec![],
            },

            Event::CloseRequested => match &mut self.state {
                State::Active { open_streams, .. } => {
                    let open_streams = std::mem::take(open_streams);
                    let drained = open_streams.is_empty();
                    self.state = State::Closing { open_streams };
                    self.latch(CloseReason::InitiatedLocally);
                    let mut actions = vec![Action::Closing(CloseReason::InitiatedLocally)];
                    if drained {
                        actions.push(Action::CloseTransport);
                    }
                    actions
                }
                State::Closing { .. } => {
                    self.latch(CloseReason::InitiatedLocally);
                    vec![]
                }
                State::Closed => vec![],
            },

            Event::ErrorCaught(error) => {
                if let State::Active { latched_error, .. } = &mut self.state {
                    latched_error.get_or_insert(error);
                }
                vec![]
            }

            Event::TransportInactive { error } => match std::mem::replace(&mut self.state, State::Closed)
            {
                State::Active {
                    open_streams,
                    latched_error,
                    ..
                } => {
                    self.latch(CloseReason::Unexpected {
                        error: latched_error.or(error),
                        was_idle: open_streams.is_empty(),
                    });
                    vec![Action::Closed(self.final_reason())]
                }
                State::Closing { .. } => vec![Action::Closed(self.final_reason())],
                State::Closed => vec![],
            },

            Event::FlushRequested => {
                if self.in_read_loop {
                    self.flush_pending = true;
                    vec![]
                } else {
                    vec![Action::Flush]
                }
            }

            Event::ReadBatchStarted => {
                self.in_read_loop = true;
                vec![]
            }

            Event::ReadBatchEnded => {
                self.in_read_loop = false;
                if self.flush_pending {
                    self.flush_pending = false;
                    vec![Action::Flush]
                } else {
                    vec![]
                }
            }
        }
    }
}

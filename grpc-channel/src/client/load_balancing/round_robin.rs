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

//! The round-robin load-balancing policy.
//!
//! One subchannel per endpoint; picks rotate through the ready subchannels
//! so every backend sees traffic.  Aggregate state: Ready if any subchannel
//! is ready, else Connecting if any is connecting, else TransientFailure when
//! all have failed, else Idle.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::ConnectivityState;
use crate::client::name_resolution::{Address, Endpoint};
use crate::client::subchannel::{Subchannel, SubchannelUpdate};
use crate::rt;

use super::{LbEvent, LbOptions, LbPolicy, ROUND_ROBIN};

pub(crate) struct RoundRobinPolicy {
    id: u64,
    cmd_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

struct Shared {
    /// Ready subchannels, in member order.
    ready: Mutex<Vec<Arc<Subchannel>>>,
    /// Monotonically incremented pick index, reduced modulo the ready set.
    next: AtomicUsize,
    state: Mutex<ConnectivityState>,
}

enum Command {
    Update(Vec<Endpoint>),
    Close,
}

impl RoundRobinPolicy {
    pub(crate) fn new(options: LbOptions) -> Arc<Self> {
        let id = rt::next_id();
        let shared = Arc::new(Shared {
            ready: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
            state: Mutex::new(ConnectivityState::Idle),
        });
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (sc_tx, sc_rx) = mpsc::unbounded_channel();

        let task = Task {
            id,
            options,
            shared: shared.clone(),
            sc_tx,
            members: Vec::new(),
        };
        tokio::spawn(task.run(cmd_rx, sc_rx));

        Arc::new(Self { id, cmd_tx, shared })
    }
}

impl LbPolicy for RoundRobinPolicy {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &'static str {
        ROUND_ROBIN
    }

    fn pick_subchannel(&self) -> Option<Arc<Subchannel>> {
        let ready = self.shared.ready.lock();
        if ready.is_empty() {
            return None;
        }
        let index = self.shared.next.fetch_add(1, Ordering::Relaxed) % ready.len();
        Some(ready[index].clone())
    }

    fn update(&self, endpoints: Vec<Endpoint>) {
        let _ = self.cmd_tx.send(Command::Update(endpoints));
    }

    fn aggregate_state(&self) -> ConnectivityState {
        *self.shared.state.lock()
    }

    fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }
}

struct Member {
    address: Address,
    subchannel: Arc<Subchannel>,
    state: ConnectivityState,
}

struct Task {
    id: u64,
    options: LbOptions,
    shared: Arc<Shared>,
    sc_tx: mpsc::UnboundedSender<SubchannelUpdate>,
    members: Vec<Member>,
}

impl Task {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut sc_rx: mpsc::UnboundedReceiver<SubchannelUpdate>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Update(endpoints)) => self.on_update(endpoints),
                    Some(Command::Close) | None => break,
                },
                update = sc_rx.recv() => {
                    if let Some(update) = update {
                        self.on_subchannel_update(update);
                    }
                }
            }
        }
        self.shutdown();
    }

    fn on_update(&mut self, endpoints: Vec<Endpoint>) {
        // One subchannel per endpoint, connected to its first address.
        let targets: Vec<Address> = endpoints
            .iter()
            .filter_map(|endpoint| endpoint.addresses.first().cloned())
            .collect();
        if targets.is_empty() {
            debug!("round_robin received no usable addresses");
            self.publish_aggregate();
            return;
        }

        // Retire members whose endpoint disappeared.
        let mut removed = Vec::new();
        self.members.retain(|member| {
            if targets.contains(&member.address) {
                true
            } else {
                removed.push(member.subchannel.clone());
                false
            }
        });
        for subchannel in removed {
            subchannel.shutdown();
        }

        // Add members for new endpoints.
        for address in targets {
            if self.members.iter().any(|m| m.address == address) {
                continue;
            }
            let subchannel = Subchannel::new(
                address.clone(),
                self.options.subchannel_options.clone(),
                self.sc_tx.clone(),
            );
            subchannel.connect();
            self.members.push(Member {
                address,
                subchannel,
                state: ConnectivityState::Idle,
            });
        }

        self.publish_aggregate();
    }

    fn on_subchannel_update(&mut self, update: SubchannelUpdate) {
        let Some(member) = self
            .members
            .iter_mut()
            .find(|m| m.subchannel.id() == update.id)
        else {
            return;
        };
        member.state = update.state;
        match update.state {
            ConnectivityState::Idle => {
                // Reconnect whenever a connection winds down.
                member.subchannel.connect();
            }
            ConnectivityState::TransientFailure => {
                self.request_resolution();
            }
            _ => {}
        }
        self.publish_aggregate();
    }

    fn aggregate(&self) -> ConnectivityState {
        let mut any_connecting = false;
        let mut any_ready = false;
        let mut all_failed = !self.members.is_empty();
        for member in &self.members {
            match member.state {
                ConnectivityState::Ready => any_ready = true,
                ConnectivityState::Connecting => any_connecting = true,
                _ => {}
            }
            if member.state != ConnectivityState::TransientFailure {
                all_failed = false;
            }
        }
        if any_ready {
            ConnectivityState::Ready
        } else if any_connecting {
            ConnectivityState::Connecting
        } else if all_failed {
            ConnectivityState::TransientFailure
        } else {
            ConnectivityState::Idle
        }
    }

    fn publish_aggregate(&mut self) {
        let ready: Vec<Arc<Subchannel>> = self
            .members
            .iter()
            .filter(|m| m.state == ConnectivityState::Ready)
            .map(|m| m.subchannel.clone())
            .collect();
        *self.shared.ready.lock() = ready;

        let state = self.aggregate();
        let changed = {
            let mut current = self.shared.state.lock();
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            let _ = self.options.events.send(LbEvent::StateChanged {
                lb_id: self.id,
                state,
            });
        }
    }

    fn request_resolution(&self) {
        let _ = self
            .options
            .events
            .send(LbEvent::RequiresResolution { lb_id: self.id });
    }

    fn shutdown(&mut self) {
        for member in self.members.drain(..) {
            member.subchannel.shutdown();
        }
        self.shared.ready.lock().clear();
        *self.shared.state.lock() = ConnectivityState::Shutdown;
        let _ = self.options.events.send(LbEvent::StateChanged {
            lb_id: self.id,
            state: ConnectivityState::Shutdown,
        });
    }
}

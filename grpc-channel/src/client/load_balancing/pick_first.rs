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

//! The pick-first load-balancing policy.
//!
//! Operates on a single endpoint (the first): attempts its addresses in
//! order, and once one connects every RPC uses that subchannel.  When a full
//! pass over the address list fails, the policy reports transient failure
//! and retries the cycle after an exponential backoff.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::ConnectivityState;
use crate::client::name_resolution::backoff::{BackoffConfig, ExponentialBackoff};
use crate::client::name_resolution::{Address, Endpoint};
use crate::client::subchannel::{Subchannel, SubchannelUpdate};
use crate::rt;

use super::{LbEvent, LbOptions, LbPolicy, PICK_FIRST};

pub(crate) struct PickFirstPolicy {
    id: u64,
    cmd_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

struct Shared {
    current: Mutex<Option<Arc<Subchannel>>>,
    state: Mutex<ConnectivityState>,
}

enum Command {
    Update(Vec<Endpoint>),
    CycleBackoffExpired { cycle: u64 },
    Close,
}

impl PickFirstPolicy {
    pub(crate) fn new(options: LbOptions) -> Arc<Self> {
        let id = rt::next_id();
        let shared = Arc::new(Shared {
            current: Mutex::new(None),
            state: Mutex::new(ConnectivityState::Idle),
        });
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (sc_tx, sc_rx) = mpsc::unbounded_channel();

        let task = Task {
            id,
            options,
            shared: shared.clone(),
            cmd_tx: cmd_tx.downgrade(),
            sc_tx,
            addresses: Vec::new(),
            index: 0,
            cycle: 0,
            backoff: ExponentialBackoff::new(BackoffConfig::default())
                .unwrap_or_else(|_| unreachable!("default backoff config is valid")),
        };
        tokio::spawn(task.run(cmd_rx, sc_rx));

        Arc::new(Self { id, cmd_tx, shared })
    }
}

impl LbPolicy for PickFirstPolicy {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &'static str {
        PICK_FIRST
    }

    fn pick_subchannel(&self) -> Option<Arc<Subchannel>> {
        if *self.shared.state.lock() != ConnectivityState::Ready {
            return None;
        }
        self.shared
            .current
            .lock()
            .clone()
            .filter(|sc| sc.state() == ConnectivityState::Ready)
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

struct Task {
    id: u64,
    options: LbOptions,
    shared: Arc<Shared>,
    cmd_tx: mpsc::WeakUnboundedSender<Command>,
    sc_tx: mpsc::UnboundedSender<SubchannelUpdate>,
    addresses: Vec<Address>,
    index: usize,
    // Incremented whenever the cycle restarts; stale backoff expiries are
    // ignored.
    cycle: u64,
    backoff: ExponentialBackoff,
}

impl Task {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut sc_rx: mpsc::UnboundedReceiver<SubchannelUpdate>,
    ) {
        // The backoff between address-exhaustion cycles comes from the
        // channel configuration.
        if let Ok(backoff) = ExponentialBackoff::new(self.options.subchannel_options.backoff.clone())
        {
            self.backoff = backoff;
        }

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Update(endpoints)) => self.on_update(endpoints),
                    Some(Command::CycleBackoffExpired { cycle }) => {
                        if cycle == self.cycle && !self.addresses.is_empty() {
                            self.start_cycle();
                        }
                    }
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
        // Pick-first operates on the first endpoint only.
        let addresses = endpoints
            .into_iter()
            .next()
            .map(|endpoint| endpoint.addresses)
            .unwrap_or_default();
        if addresses.is_empty() {
            debug!("pick_first received no usable addresses");
            self.publish(ConnectivityState::TransientFailure);
            return;
        }
        self.addresses = addresses;
        self.cycle += 1;
        self.backoff.reset();
        self.start_cycle();
    }

    fn on_subchannel_update(&mut self, update: SubchannelUpdate) {
        let current_id = self.shared.current.lock().as_ref().map(|sc| sc.id());
        if current_id != Some(update.id) {
            return;
        }
        match update.state {
            ConnectivityState::Ready => {
                self.backoff.reset();
                self.publish(ConnectivityState::Ready);
            }
            ConnectivityState::Connecting => {
                self.publish(ConnectivityState::Connecting);
            }
            ConnectivityState::TransientFailure => {
                self.retire_current();
                self.index += 1;
                if self.index < self.addresses.len() {
                    let address = self.addresses[self.index].clone();
                    self.connect_to(address);
                    self.publish(ConnectivityState::Connecting);
                } else {
                    // Address list exhausted: back off, then start over.
                    self.publish(ConnectivityState::TransientFailure);
                    self.request_resolution();
                    self.cycle += 1;
                    let cycle = self.cycle;
                    let delay = self.backoff.backoff_duration();
                    let cmd_tx = self.cmd_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Some(cmd_tx) = cmd_tx.upgrade() {
                            let _ = cmd_tx.send(Command::CycleBackoffExpired { cycle });
                        }
                    });
                }
            }
            ConnectivityState::Idle => {
                // The ready connection ended; reconnect and ask for fresh
                // addresses.
                if let Some(current) = self.shared.current.lock().as_ref() {
                    current.connect();
                }
                self.publish(ConnectivityState::Connecting);
                self.request_resolution();
            }
            ConnectivityState::Shutdown => {}
        }
    }

    fn start_cycle(&mut self) {
        self.retire_current();
        self.index = 0;
        let address = self.addresses[0].clone();
        self.connect_to(address);
        self.publish(ConnectivityState::Connecting);
    }

    fn connect_to(&mut self, address: Address) {
        let subchannel = Subchannel::new(
            address,
            self.options.subchannel_options.clone(),
            self.sc_tx.clone(),
        );
        subchannel.connect();
        *self.shared.current.lock() = Some(subchannel);
    }

    fn retire_current(&mut self) {
        if let Some(old) = self.shared.current.lock().take() {
            old.shutdown();
        }
    }

    fn publish(&self, state: ConnectivityState) {
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
        self.retire_current();
        let mut state = self.shared.state.lock();
        *state = ConnectivityState::Shutdown;
        drop(state);
        let _ = self.options.events.send(LbEvent::StateChanged {
            lb_id: self.id,
            state: ConnectivityState::Shutdown,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::subchannel::SubchannelOptions;
    use crate::transport::TransportOptions;
    use crate::transport::connection::ConnectionOptions;
    use crate::transport::inmemory::{InMemoryTransport, Listener};
    use std::time::Duration;

    fn options(events: mpsc::UnboundedSender<LbEvent>) -> LbOptions {
        LbOptions {
            events,
            subchannel_options: SubchannelOptions {
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
                connect_timeout: Duration::from_secs(5),
            },
        }
    }

    async fn expect_state(
        rx: &mut mpsc::UnboundedReceiver<LbEvent>,
        expected: ConnectivityState,
    ) {
        loop {
            match rx.recv().await.expect("event stream closed") {
                LbEvent::StateChanged { state, .. } => {
                    assert_eq!(state, expected, "unexpected aggregate state {state}");
                    return;
                }
                LbEvent::RequiresResolution { .. } => continue,
            }
        }
    }

    #[tokio::test]
    async fn connects_to_first_address() {
        let listener = Listener::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let lb = PickFirstPolicy::new(options(events_tx));

        lb.update(vec![Endpoint::from_address(listener.address())]);
        expect_state(&mut events_rx, ConnectivityState::Connecting).await;

        let server = listener.accept().await.unwrap();
        server.send_settings();
        expect_state(&mut events_rx, ConnectivityState::Ready).await;

        let picked = lb.pick_subchannel().unwrap();
        assert_eq!(picked.address().address, listener.address());
        lb.close();
    }

    #[tokio::test(start_paused = true)]
    async fn tries_addresses_in_order() {
        // First address refuses; second accepts.
        let listener = Listener::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let lb = PickFirstPolicy::new(options(events_tx));

        lb.update(vec![Endpoint::new(vec![
            Address::new("black-hole"),
            Address::new(listener.address()),
        ])]);
        expect_state(&mut events_rx, ConnectivityState::Connecting).await;

        let server = listener.accept().await.unwrap();
        server.send_settings();
        expect_state(&mut events_rx, ConnectivityState::Ready).await;
        lb.close();
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_backs_off_then_retries() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let lb = PickFirstPolicy::new(options(events_tx));

        lb.update(vec![Endpoint::new(vec![
            Address::new("black-hole-1"),
            Address::new("black-hole-2"),
        ])]);
        expect_state(&mut events_rx, ConnectivityState::Connecting).await;
        // Both addresses fail: transient failure for the whole cycle.
        expect_state(&mut events_rx, ConnectivityState::TransientFailure).await;
        assert!(lb.pick_subchannel().is_none());

        // After the cycle backoff the policy starts connecting again.
        expect_state(&mut events_rx, ConnectivityState::Connecting).await;
        lb.close();
    }

    #[tokio::test]
    async fn close_reports_shutdown() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let lb = PickFirstPolicy::new(options(events_tx));
        lb.update(vec![Endpoint::from_address("black-hole")]);
        lb.close();
        loop {
            if let LbEvent::StateChanged { state, .. } = events_rx.recv().await.unwrap() {
                if state == ConnectivityState::Shutdown {
                    break;
                }
            }
        }
        assert_eq!(lb.aggregate_state(), ConnectivityState::Shutdown);
    }
}

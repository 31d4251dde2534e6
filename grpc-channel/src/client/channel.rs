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

//! The channel: the top-level supervisor for RPCs.
//!
//! A channel owns the current load balancer, an optional "next" load
//! balancer being warmed up during a policy switch, past load balancers
//! draining to shutdown, and the queue of RPC attempts waiting for a ready
//! connection.  Supervisor state lives behind one mutex held only for state
//! transitions; everything asynchronous flows through a single event stream
//! so transitions are totally ordered.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tracing::{debug, warn};
use url::Url;

use crate::client::ConnectivityState;
use crate::client::call::{CallOptions, RpcStream};
use crate::client::load_balancing::{self, LbEvent, LbOptions, LbPolicy};
use crate::client::name_resolution::backoff::BackoffConfig;
use crate::client::name_resolution::{Resolver, ResolverController, ResolverUpdate};
use crate::client::queue::{QueueEntry, RequestQueue};
use crate::client::service_config::{MethodConfig, RetryThrottle, ServiceConfig};
use crate::client::subchannel::SubchannelOptions;
use crate::codec::compression::{CompressionEncoding, EnabledCompressionEncodings};
use crate::rt;
use crate::stream::{StreamConfig, StreamMachine};
use crate::transport::connection::ConnectionOptions;
use crate::Status;
use crate::transport::{Http2Options, KeepaliveOptions, Transport, TransportOptions};

/// Default limit on inbound message size: 4 MiB, matching the rest of the
/// gRPC ecosystem.  Outbound messages are unlimited by default.
pub const DEFAULT_MAX_RESPONSE_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

const MAX_STREAM_ATTEMPTS: usize = 5;

/// Channel-wide configuration.
#[derive(Clone)]
pub struct ChannelOptions {
    /// HTTP/2 settings, clamped before reaching the transport.
    pub http2: Http2Options,
    /// Keepalive configuration; off when `None`.
    pub keepalive: Option<KeepaliveOptions>,
    /// Close connections that stay idle this long; off when `None`.
    pub max_idle_time: Option<Duration>,
    /// Reconnect backoff parameters.
    pub backoff: BackoffConfig,
    /// How long a single connection attempt may take, including the HTTP/2
    /// preface.
    pub connect_timeout: Duration,
    /// Compression applied to outbound messages by default.
    pub default_compression: Option<CompressionEncoding>,
    /// Inbound encodings advertised via `grpc-accept-encoding`.
    pub accept_compression: EnabledCompressionEncodings,
    /// Used until the resolver provides a service config.
    pub default_service_config: Option<ServiceConfig>,
    pub max_request_message_bytes: usize,
    pub max_response_message_bytes: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            http2: Http2Options::default(),
            keepalive: None,
            max_idle_time: None,
            backoff: BackoffConfig::default(),
            connect_timeout: Duration::from_secs(20),
            default_compression: None,
            accept_compression: EnabledCompressionEncodings::default(),
            default_service_config: None,
            max_request_message_bytes: usize::MAX,
            max_response_message_bytes: DEFAULT_MAX_RESPONSE_MESSAGE_BYTES,
        }
    }
}

/// A virtual, persistent connection to a service.  Cheap to clone; all
/// clones share the same supervisor.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    authority: String,
    options: ChannelOptions,
    transport: Arc<dyn Transport>,
    state: Mutex<SupervisorState>,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SupervisorEvent>>>,
    resolver: Mutex<Option<Box<dyn Resolver>>>,
    resolve_now: Arc<Notify>,
    lb_events_tx: mpsc::UnboundedSender<LbEvent>,
    connectivity: watch::Sender<ConnectivityState>,
}

enum SupervisorState {
    NotRunning { queue: RequestQueue },
    Running(Box<Running>),
    Stopping { past: Vec<Arc<dyn LbPolicy>> },
    Stopped,
}

struct Running {
    connectivity: ConnectivityState,
    service_config: ServiceConfig,
    current: Arc<dyn LbPolicy>,
    next: Option<Arc<dyn LbPolicy>>,
    past: Vec<Arc<dyn LbPolicy>>,
    queue: RequestQueue,
    resolver_task: Option<tokio::task::JoinHandle<()>>,
}

enum SupervisorEvent {
    Lb(LbEvent),
    Resolver(Result<ResolverUpdate, String>),
    Close,
}

enum Admission {
    Use(Arc<dyn LbPolicy>),
    Queue(oneshot::Receiver<Result<Arc<dyn LbPolicy>, Status>>, u64),
    Fail(Status),
}

impl Channel {
    /// Construct a new channel for `target`, resolving addresses with
    /// `resolver` and dialing them with `transport`.  The channel does
    /// nothing until [`Channel::connect`] runs.
    pub fn new(
        target: &str,
        resolver: impl Resolver,
        transport: Arc<dyn Transport>,
        options: ChannelOptions,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (lb_events_tx, mut lb_events_rx) = mpsc::unbounded_channel();
        let (connectivity, _) = watch::channel(ConnectivityState::Idle);

        // LB events merge into the supervisor's input stream so transitions
        // across policies stay totally ordered.
        let forward_tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = lb_events_rx.recv().await {
                if forward_tx.send(SupervisorEvent::Lb(event)).is_err() {
                    return;
                }
            }
        });

        Self {
            inner: Arc::new(ChannelInner {
                authority: authority_from_target(target),
                options,
                transport,
                state: Mutex::new(SupervisorState::NotRunning {
                    queue: RequestQueue::new(),
                }),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                resolver: Mutex::new(Some(Box::new(resolver))),
                resolve_now: Arc::new(Notify::new()),
                lb_events_tx,
                connectivity,
            }),
        }
    }

    /// Run the channel.  Suspends for the channel's entire lifetime and
    /// returns after [`Channel::close`] finishes draining.
    pub async fn connect(&self) -> Result<(), Status> {
        if matches!(
            &*self.inner.state.lock(),
            SupervisorState::Stopping { .. } | SupervisorState::Stopped
        ) {
            return Err(Status::unavailable("channel is closed"));
        }
        let Some(mut events_rx) = self.inner.events_rx.lock().take() else {
            return Err(Status::internal("channel is already running or closed"));
        };
        let Some(mut resolver) = self.inner.resolver.lock().take() else {
            return Err(Status::internal("channel is already running or closed"));
        };

        // Spawn the resolver first so its updates are waiting once the
        // supervisor starts processing events.
        let controller = Box::new(SupervisorController {
            events_tx: self.inner.events_tx.clone(),
        });
        let resolve_now = self.inner.resolve_now.clone();
        let resolver_task =
            tokio::spawn(async move { resolver.run(controller, resolve_now).await });

        self.inner.start_running(resolver_task);

        while let Some(event) = events_rx.recv().await {
            if self.inner.handle_event(event) {
                break;
            }
        }
        Ok(())
    }

    /// Close the channel.  Idempotent.  Queued RPCs fail with `Unavailable`;
    /// in-flight RPCs run to completion while their connections drain.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        match &mut *state {
            SupervisorState::NotRunning { queue } => {
                for entry in queue.remove_all() {
                    let _ = entry
                        .waker
                        .send(Err(Status::unavailable("channel is closed")));
                }
                *state = SupervisorState::Stopped;
                drop(state);
                self.inner
                    .connectivity
                    .send_replace(ConnectivityState::Shutdown);
            }
            SupervisorState::Running(_) => {
                drop(state);
                let _ = self.inner.events_tx.send(SupervisorEvent::Close);
            }
            SupervisorState::Stopping { .. } | SupervisorState::Stopped => {}
        }
    }

    /// Watch the channel's connectivity state.
    pub fn connectivity(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.connectivity.subscribe()
    }

    /// The retry throttle from the current service config, shared with
    /// retrying call sites.
    pub fn retry_throttle(&self) -> Option<Arc<RetryThrottle>> {
        match &*self.inner.state.lock() {
            SupervisorState::Running(running) => running.service_config.retry_throttle.clone(),
            _ => None,
        }
    }

    /// Perform an RPC: obtain a stream to a healthy backend and hand it to
    /// `body`.  Attempts are retried up to five times while no connection is
    /// usable; a cancellation is never retried.
    pub async fn with_stream<T, F, Fut>(
        &self,
        path: &str,
        options: CallOptions,
        body: F,
    ) -> Result<T, Status>
    where
        F: FnOnce(RpcStream) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let merged = self.inner.merged_call_config(path, &options);

        let mut attempt = 0;
        loop {
            attempt += 1;
            if attempt > MAX_STREAM_ATTEMPTS {
                return Err(Status::unavailable(format!(
                    "no usable connection after {MAX_STREAM_ATTEMPTS} attempts"
                )));
            }

            let lb = match self.inner.admit(merged.wait_for_ready) {
                Admission::Use(lb) => lb,
                Admission::Fail(status) => return Err(status),
                Admission::Queue(rx, id) => {
                    let guard = QueueCancelGuard {
                        inner: self.inner.as_ref(),
                        id,
                        armed: true,
                    };
                    let resumed = rx.await;
                    guard.disarm();
                    match resumed {
                        Ok(Ok(lb)) => lb,
                        Ok(Err(status)) => return Err(status),
                        Err(_) => return Err(Status::cancelled("RPC cancelled while queued")),
                    }
                }
            };

            // A pick can fail benignly while connections churn; that is the
            // try-again case.
            let Some(subchannel) = lb.pick_subchannel() else {
                continue;
            };
            let Some((conn, scheme)) = subchannel.connected() else {
                continue;
            };

            let mut machine = StreamMachine::new(StreamConfig {
                scheme,
                authority: self.inner.authority.clone(),
                outbound_encoding: merged.compression,
                accept_encodings: self.inner.options.accept_compression,
                max_request_message_bytes: merged.max_request_message_bytes,
                max_response_message_bytes: merged.max_response_message_bytes,
                timeout: merged.timeout,
                metadata: merged.metadata.clone(),
            });
            let request = machine.send_metadata(path)?;
            let raw = match conn.open_stream(request).await {
                Ok(raw) => raw,
                Err(status) => {
                    debug!("stream attempt {} failed: {}", attempt, status);
                    continue;
                }
            };
            let stream = RpcStream::new(machine, raw, conn);
            return body(stream).await;
        }
    }
}

struct MergedCallConfig {
    timeout: Option<Duration>,
    wait_for_ready: bool,
    compression: Option<CompressionEncoding>,
    max_request_message_bytes: usize,
    max_response_message_bytes: usize,
    metadata: HeaderMap,
}

impl ChannelInner {
    fn lb_options(&self) -> LbOptions {
        LbOptions {
            events: self.lb_events_tx.clone(),
            subchannel_options: SubchannelOptions {
                transport: self.transport.clone(),
                connection: ConnectionOptions {
                    transport: TransportOptions::new(self.options.http2),
                    keepalive: self.options.keepalive,
                    max_idle_time: self.options.max_idle_time,
                },
                backoff: self.options.backoff.clone(),
                connect_timeout: self.options.connect_timeout,
            },
        }
    }

    fn start_running(&self, resolver_task: tokio::task::JoinHandle<()>) {
        let mut state = self.state.lock();
        let queue = match std::mem::replace(&mut *state, SupervisorState::Stopped) {
            SupervisorState::NotRunning { queue } => queue,
            other => {
                *state = other;
                return;
            }
        };

        let service_config = self
            .options
            .default_service_config
            .clone()
            .unwrap_or_default();
        let policy = load_balancing::select_policy(
            service_config.lb_policies().iter().map(String::as_str),
        );
        let current = load_balancing::new_policy(policy, self.lb_options());

        *state = SupervisorState::Running(Box::new(Running {
            connectivity: ConnectivityState::Connecting,
            service_config,
            current,
            next: None,
            past: Vec::new(),
            queue,
            resolver_task: Some(resolver_task),
        }));
        drop(state);
        self.connectivity.send_replace(ConnectivityState::Connecting);
    }

    /// Returns true when the supervisor is finished and `connect` should
    /// return.
    fn handle_event(&self, event: SupervisorEvent) -> bool {
        match event {
            SupervisorEvent::Resolver(update) => {
                self.handle_resolver_update(update);
                false
            }
            SupervisorEvent::Lb(LbEvent::RequiresResolution { .. }) => {
                self.resolve_now.notify_one();
                false
            }
            SupervisorEvent::Lb(LbEvent::StateChanged { lb_id, state }) => {
                self.handle_lb_state(lb_id, state)
            }
            SupervisorEvent::Close => self.do_close(),
        }
    }

    fn handle_resolver_update(&self, update: Result<ResolverUpdate, String>) {
        let update = match update {
            Ok(update) => update,
            Err(error) => {
                warn!("name resolution failed, closing the channel: {}", error);
                self.do_close();
                return;
            }
        };
        if update.endpoints.is_empty() {
            debug!("ignoring resolver update with no endpoints");
            return;
        }

        let mut publish = None;
        {
            let mut state = self.state.lock();
            let SupervisorState::Running(running) = &mut *state else {
                return;
            };

            match update.service_config {
                Some(Ok(service_config)) => running.service_config = service_config,
                Some(Err(error)) => {
                    drop(state);
                    warn!("invalid service config, closing the channel: {}", error);
                    self.do_close();
                    return;
                }
                None => {}
            }

            let policy = load_balancing::select_policy(
                running.service_config.lb_policies().iter().map(String::as_str),
            );

            if running.current.name() == policy {
                // Same policy: update endpoints in place.  A pending switch
                // to some other policy is now obsolete.
                if let Some(next) = running.next.take() {
                    next.close();
                    running.past.push(next);
                }
                running.current.update(update.endpoints);
            } else if running.next.as_ref().is_some_and(|next| next.name() == policy) {
                if let Some(next) = &running.next {
                    next.update(update.endpoints);
                }
            } else {
                let new_lb = load_balancing::new_policy(policy, self.lb_options());
                new_lb.update(update.endpoints);
                if let Some(old_next) = running.next.take() {
                    old_next.close();
                    running.past.push(old_next);
                }
                if running.connectivity == ConnectivityState::Ready {
                    // Warm the new policy in parallel; promote when ready.
                    running.next = Some(new_lb);
                } else {
                    // Nothing to preserve: swap immediately.
                    let old = std::mem::replace(&mut running.current, new_lb);
                    old.close();
                    running.past.push(old);
                    running.connectivity = ConnectivityState::Connecting;
                    publish = Some(ConnectivityState::Connecting);
                }
            }
        }
        if let Some(state) = publish {
            self.connectivity.send_replace(state);
        }
    }

    fn handle_lb_state(&self, lb_id: u64, new_state: ConnectivityState) -> bool {
        let mut publish = None;
        let mut finished = false;
        {
            let mut state = self.state.lock();
            match &mut *state {
                SupervisorState::Running(running) => {
                    if running.current.id() == lb_id {
                        running.connectivity = new_state;
                        publish = Some(new_state);
                        match new_state {
                            ConnectivityState::Ready => {
                                let current = running.current.clone();
                                for entry in running.queue.remove_all() {
                                    let _ = entry.waker.send(Ok(current.clone()));
                                }
                            }
                            ConnectivityState::TransientFailure
                            | ConnectivityState::Shutdown => {
                                for entry in running.queue.remove_fast_failing() {
                                    let _ = entry.waker.send(Err(Status::unavailable(
                                        "no ready connection to the service",
                                    )));
                                }
                            }
                            ConnectivityState::Idle | ConnectivityState::Connecting => {}
                        }
                    } else if running.next.as_ref().is_some_and(|next| next.id() == lb_id) {
                        if new_state == ConnectivityState::Ready {
                            // Promote: the warmed-up policy takes over.
                            let next = running.next.take().unwrap_or_else(|| unreachable!());
                            let old = std::mem::replace(&mut running.current, next);
                            old.close();
                            running.past.push(old);
                            running.connectivity = ConnectivityState::Ready;
                            publish = Some(ConnectivityState::Ready);
                            let current = running.current.clone();
                            for entry in running.queue.remove_all() {
                                let _ = entry.waker.send(Ok(current.clone()));
                            }
                        }
                    } else if new_state == ConnectivityState::Shutdown {
                        running.past.retain(|lb| lb.id() != lb_id);
                    }
                }
                SupervisorState::Stopping { past } => {
                    if new_state == ConnectivityState::Shutdown {
                        past.retain(|lb| lb.id() != lb_id);
                        if past.is_empty() {
                            *state = SupervisorState::Stopped;
                            finished = true;
                        }
                    }
                }
                _ => {}
            }
        }
        if let Some(state) = publish {
            self.connectivity.send_replace(state);
        }
        finished
    }

    fn do_close(&self) -> bool {
        let finished;
        let publish;
        {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, SupervisorState::Stopped) {
                SupervisorState::Running(running) => {
                    let mut running = *running;
                    if let Some(task) = running.resolver_task.take() {
                        task.abort();
                    }
                    for entry in running.queue.remove_all() {
                        let _ = entry
                            .waker
                            .send(Err(Status::unavailable("channel is closed")));
                    }
                    let mut past = running.past;
                    running.current.close();
                    past.push(running.current);
                    if let Some(next) = running.next {
                        next.close();
                        past.push(next);
                    }
                    finished = past.is_empty();
                    *state = if finished {
                        SupervisorState::Stopped
                    } else {
                        SupervisorState::Stopping { past }
                    };
                    publish = true;
                }
                other => {
                    finished = matches!(other, SupervisorState::Stopped);
                    publish = matches!(
                        other,
                        SupervisorState::Stopping { .. } | SupervisorState::Stopped
                    );
                    *state = other;
                }
            }
        }
        if publish {
            self.connectivity.send_replace(ConnectivityState::Shutdown);
        }
        finished
    }

    fn admit(&self, wait_for_ready: bool) -> Admission {
        let mut state = self.state.lock();
        match &mut *state {
            SupervisorState::NotRunning { queue } => Self::join(queue, wait_for_ready),
            SupervisorState::Running(running) => match running.connectivity {
                ConnectivityState::Ready => Admission::Use(running.current.clone()),
                ConnectivityState::Idle | ConnectivityState::Connecting => {
                    Self::join(&mut running.queue, wait_for_ready)
                }
                ConnectivityState::TransientFailure => {
                    if wait_for_ready {
                        Self::join(&mut running.queue, wait_for_ready)
                    } else {
                        Admission::Fail(Status::unavailable(
                            "no ready connection to the service",
                        ))
                    }
                }
                ConnectivityState::Shutdown => {
                    Admission::Fail(Status::unavailable("channel is closed"))
                }
            },
            SupervisorState::Stopping { .. } | SupervisorState::Stopped => {
                Admission::Fail(Status::unavailable("channel is closed"))
            }
        }
    }

    fn join(queue: &mut RequestQueue, wait_for_ready: bool) -> Admission {
        let id = rt::next_id();
        let (waker, rx) = oneshot::channel();
        queue.append(QueueEntry {
            id,
            wait_for_ready,
            waker,
        });
        Admission::Queue(rx, id)
    }

    fn remove_queued(&self, id: u64) {
        let mut state = self.state.lock();
        let queue = match &mut *state {
            SupervisorState::NotRunning { queue } => queue,
            SupervisorState::Running(running) => &mut running.queue,
            _ => return,
        };
        // Tolerates a racing wake: the entry may already be gone.
        queue.remove_entry(id);
    }

    fn merged_call_config(&self, path: &str, options: &CallOptions) -> MergedCallConfig {
        let method: Option<MethodConfig> = {
            let state = self.state.lock();
            let service_config = match &*state {
                SupervisorState::Running(running) => Some(&running.service_config),
                _ => self.options.default_service_config.as_ref(),
            };
            service_config.and_then(|sc| sc.method_config(path).cloned())
        };
        let method = method.unwrap_or_default();

        MergedCallConfig {
            timeout: options.timeout.or(method.timeout),
            wait_for_ready: options
                .wait_for_ready
                .or(method.wait_for_ready)
                .unwrap_or(false),
            compression: options.compression.or(self.options.default_compression),
            max_request_message_bytes: options
                .max_request_message_bytes
                .or(method.max_request_message_bytes)
                .unwrap_or(self.options.max_request_message_bytes),
            max_response_message_bytes: options
                .max_response_message_bytes
                .or(method.max_response_message_bytes)
                .unwrap_or(self.options.max_response_message_bytes),
            metadata: options.metadata.clone(),
        }
    }
}

/// Removes a queued attempt when the awaiting future is dropped, so a
/// cancelled RPC never leaks a queue entry.
struct QueueCancelGuard<'a> {
    inner: &'a ChannelInner,
    id: u64,
    armed: bool,
}

impl QueueCancelGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for QueueCancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.remove_queued(self.id);
        }
    }
}

struct SupervisorController {
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
}

#[async_trait::async_trait]
impl ResolverController for SupervisorController {
    fn parse_config(&self, config: &str) -> Result<ServiceConfig, crate::Error> {
        ServiceConfig::parse_json(config)
    }

    async fn update(&self, update: Result<ResolverUpdate, String>) {
        let _ = self.events_tx.send(SupervisorEvent::Resolver(update));
    }
}

fn authority_from_target(target: &str) -> String {
    match Url::from_str(target) {
        Ok(url) => match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            _ => target.to_string(),
        },
        Err(_) => target.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_parsing() {
        assert_eq!(
            authority_from_target("http://127.0.0.1:50051"),
            "127.0.0.1:50051"
        );
        assert_eq!(authority_from_target("https://example.com"), "example.com");
        assert_eq!(authority_from_target("inmemory-0"), "inmemory-0");
    }

    #[test]
    fn default_options_are_sane() {
        let options = ChannelOptions::default();
        assert_eq!(options.connect_timeout, Duration::from_secs(20));
        assert!(options.keepalive.is_none());
        assert!(options.max_idle_time.is_none());
        assert_eq!(
            options.max_response_message_bytes,
            DEFAULT_MAX_RESPONSE_MESSAGE_BYTES
        );
    }

}

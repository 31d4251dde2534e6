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

//! Name Resolution for gRPC.
//!
//! Name Resolution is the process by which a channel's target is converted
//! into network addresses used by the channel to connect to a service.  The
//! address-discovery mechanism itself lives outside this crate; the channel
//! only consumes resolver updates.

pub mod backoff;

use core::fmt;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::service_config::ServiceConfig;

/// An Address is an identifier that indicates how to connect to a server.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    /// The address itself is passed to the transport in order to create a
    /// connection to it.
    pub address: String,
}

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// An Endpoint is an address or a collection of addresses which reference one
/// logical server.  Multiple addresses may be used if there are multiple ways
/// which the server can be reached, e.g. via IPv4 and IPv6 addresses.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// The ordered list of addresses used to connect to the server.
    pub addresses: Vec<Address>,
}

impl Endpoint {
    pub fn new(addresses: Vec<Address>) -> Self {
        Self { addresses }
    }

    pub fn from_address(address: impl Into<String>) -> Self {
        Self {
            addresses: vec![Address::new(address)],
        }
    }
}

/// Data provided by the name resolver to the channel.
#[derive(Debug, Default)]
pub struct ResolverUpdate {
    /// A list of endpoints which each identify a logical host serving the
    /// service indicated by the target URI.
    pub endpoints: Vec<Endpoint>,
    /// The service config which the client should use for communicating with
    /// the service, when the resolver carries one.
    pub service_config: Option<Result<ServiceConfig, String>>,
}

/// A collection of operations a Resolver may perform on the channel which
/// runs it.
#[async_trait]
pub trait ResolverController: Send + Sync {
    /// Parses the provided JSON service config.
    fn parse_config(&self, config: &str) -> Result<ServiceConfig, crate::Error>;

    /// Notifies the channel about the current state of the name resolver.
    /// An `Err` update is a resolution failure and closes the channel.
    async fn update(&self, update: Result<ResolverUpdate, String>);
}

/// A name resolver instance.
#[async_trait]
pub trait Resolver: Send + 'static {
    /// The entry point of the resolver.  Called once by the channel; should
    /// not return unless the resolver never will need to update its state.
    /// The future is dropped when the channel shuts down.
    ///
    /// `resolve_now` is signalled when the channel wants the resolver to
    /// re-resolve, typically after connection failures.  Push-style resolvers
    /// may ignore it; pull-style resolvers wait on it between updates.
    async fn run(&mut self, controller: Box<dyn ResolverController>, resolve_now: Arc<Notify>);
}

/// A resolver that always reports a fixed set of endpoints, re-announcing
/// them whenever re-resolution is requested.
pub struct StaticResolver {
    endpoints: Vec<Endpoint>,
    service_config: Option<String>,
}

impl StaticResolver {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            service_config: None,
        }
    }

    /// Attach a JSON service config announced with every update.
    pub fn with_service_config(mut self, config_json: impl Into<String>) -> Self {
        self.service_config = Some(config_json.into());
        self
    }

    fn make_update(&self, controller: &dyn ResolverController) -> ResolverUpdate {
        ResolverUpdate {
            endpoints: self.endpoints.clone(),
            service_config: self.service_config.as_ref().map(|json| {
                controller
                    .parse_config(json)
                    .map_err(|err| format!("invalid service config: {err}"))
            }),
        }
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn run(&mut self, controller: Box<dyn ResolverController>, resolve_now: Arc<Notify>) {
        loop {
            let update = self.make_update(&*controller);
            controller.update(Ok(update)).await;
            resolve_now.notified().await;
        }
    }
}

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

//! Load-balancing policies.
//!
//! An LB policy owns a set of subchannels, selects one per RPC, and
//! aggregates their connectivity into one state the channel publishes.  The
//! channel owns at most one serving policy at a time, plus an optional "next"
//! policy being warmed up during a policy switch.

pub(crate) mod pick_first;
pub(crate) mod round_robin;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::client::ConnectivityState;
use crate::client::name_resolution::Endpoint;
use crate::client::subchannel::{Subchannel, SubchannelOptions};

/// Events a policy reports to the channel.  Delivered through one stream so
/// transitions across policies are totally ordered.
#[derive(Debug, Clone)]
pub(crate) enum LbEvent {
    /// The policy's aggregate connectivity state changed.  A `Shutdown`
    /// state is final: the policy has released all of its subchannels.
    StateChanged {
        lb_id: u64,
        state: ConnectivityState,
    },
    /// The policy wants the channel to re-resolve addresses, typically after
    /// connection failures.
    RequiresResolution { lb_id: u64 },
}

/// Everything a policy needs to build and run subchannels.
#[derive(Clone)]
pub(crate) struct LbOptions {
    pub(crate) events: mpsc::UnboundedSender<LbEvent>,
    pub(crate) subchannel_options: SubchannelOptions,
}

/// A load-balancing policy instance.
///
/// Implementations run their own task; these methods only post work to it or
/// read shared snapshots, so none of them block.
pub(crate) trait LbPolicy: Send + Sync {
    fn id(&self) -> u64;

    fn name(&self) -> &'static str;

    /// The subchannel the next RPC should use, or `None` when the policy has
    /// nothing ready (the caller treats that as try-again).
    fn pick_subchannel(&self) -> Option<Arc<Subchannel>>;

    /// Deliver a new endpoint list from the resolver.
    fn update(&self, endpoints: Vec<Endpoint>);

    /// The aggregate connectivity state last computed by the policy.
    fn aggregate_state(&self) -> ConnectivityState;

    /// Release all subchannels.  The policy reports a final `Shutdown` state
    /// once done.
    fn close(&self);
}

pub(crate) const PICK_FIRST: &str = "pick_first";
pub(crate) const ROUND_ROBIN: &str = "round_robin";

pub(crate) fn is_supported(name: &str) -> bool {
    name == PICK_FIRST || name == ROUND_ROBIN
}

/// Pick the first supported policy from a preference-ordered list, falling
/// back to pick-first.
pub(crate) fn select_policy<'a>(mut names: impl Iterator<Item = &'a str>) -> &'static str {
    match names.find(|name| is_supported(name)) {
        Some(ROUND_ROBIN) => ROUND_ROBIN,
        _ => PICK_FIRST,
    }
}

/// Build a policy by name.  Unknown names build pick-first.
pub(crate) fn new_policy(name: &str, options: LbOptions) -> Arc<dyn LbPolicy> {
    match name {
        ROUND_ROBIN => round_robin::RoundRobinPolicy::new(options),
        _ => pick_first::PickFirstPolicy::new(options),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_policy_prefers_first_supported() {
        assert_eq!(
            select_policy(["grpclb", "round_robin", "pick_first"].into_iter()),
            ROUND_ROBIN
        );
        assert_eq!(
            select_policy(["weighted_target", "unknown"].into_iter()),
            PICK_FIRST
        );
        assert_eq!(select_policy([].into_iter()), PICK_FIRST);
    }
}

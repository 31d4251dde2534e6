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

//! The queue of RPC attempts suspended while no load balancer is ready.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::Status;

use super::load_balancing::LbPolicy;

/// What a suspended RPC attempt is resumed with: a ready load balancer to
/// pick from, or a terminal status.
pub(crate) type QueueWaker = oneshot::Sender<Result<Arc<dyn LbPolicy>, Status>>;

pub(crate) struct QueueEntry {
    pub(crate) id: u64,
    pub(crate) wait_for_ready: bool,
    pub(crate) waker: QueueWaker,
}

/// Insertion-ordered set of suspended RPC attempts, with removal by id for
/// cancellation and bulk removal of fast-failing entries.
pub(crate) struct RequestQueue {
    entries: VecDeque<QueueEntry>,
}

impl RequestQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub(crate) fn append(&mut self, entry: QueueEntry) {
        self.entries.push_back(entry);
    }

    /// Remove one entry by id.  Returns `None` if the entry was already
    /// resumed or removed, which a racing cancellation must tolerate.
    pub(crate) fn remove_entry(&mut self, id: u64) -> Option<QueueEntry> {
        let position = self.entries.iter().position(|entry| entry.id == id)?;
        self.entries.remove(position)
    }

    /// Remove every entry that is not wait-for-ready, preserving order.
    pub(crate) fn remove_fast_failing(&mut self) -> Vec<QueueEntry> {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.wait_for_ready {
                kept.push_back(entry);
            } else {
                removed.push(entry);
            }
        }
        self.entries = kept;
        removed
    }

    /// Remove every entry, preserving order.
    pub(crate) fn remove_all(&mut self) -> Vec<QueueEntry> {
        self.entries.drain(..).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

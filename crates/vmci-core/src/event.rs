// Copyright (c) 2023 the Hearth contributors.
// SPDX-License-Identifier: AGPL-3.0-or-later
//
// This file is part of Hearth.
//
// Hearth is free software: you can redistribute it and/or modify it under the
// terms of the GNU Affero General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Hearth is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with Hearth. If not, see <https://www.gnu.org/licenses/>.

//! The process-wide event bus: a per-kind subscriber list with synchronous,
//! in-order delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::{VmciError, VmciResult};
use crate::wire::{EventKind, EventPayload, MAX_EVENT_PAYLOAD};

const SUBSCRIBE_ID_RETRIES: usize = 10;

/// An event handler registered with an [EventBus].
pub type EventCallback = Arc<dyn Fn(&EventPayload) + Send + Sync>;

struct Subscription {
    id: u64,
    kind: EventKind,
    callback: EventCallback,
}

/// Subscribe/publish hub for context- and queue-pair-lifecycle events.
///
/// `EventPayload` is `Copy`, so each callback is handed its own value
/// directly; there is no shared buffer for one subscriber's callback to
/// corrupt for the next.
#[derive(Default)]
pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for every event of `kind`, returning a
    /// subscription id usable with [Self::unsubscribe].
    pub fn subscribe(&self, kind: EventKind, callback: EventCallback) -> VmciResult<u64> {
        let mut subscriptions = self.subscriptions.lock();
        for _ in 0..SUBSCRIBE_ID_RETRIES {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if subscriptions.iter().any(|s| s.id == id) {
                continue;
            }
            subscriptions.push(Subscription { id, kind, callback });
            trace!(id, ?kind, "event subscription added");
            return Ok(id);
        }
        Err(VmciError::NoResources)
    }

    /// Removes a subscription by id, across every event kind.
    pub fn unsubscribe(&self, id: u64) -> VmciResult<()> {
        let mut subscriptions = self.subscriptions.lock();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        if subscriptions.len() == before {
            return Err(VmciError::NotFound);
        }
        trace!(id, "event subscription removed");
        Ok(())
    }

    /// Delivers `payload` to every subscriber of its kind, in registration
    /// order, under the bus lock. A subscriber that panics would poison the
    /// lock for the rest, so callbacks must not re-enter the bus; a failure
    /// reported by one subscriber never aborts delivery to the rest, since
    /// callbacks here have no failure channel beyond what they log
    /// themselves.
    pub fn dispatch(&self, payload: EventPayload) -> VmciResult<()> {
        let encoded_len = serde_json::to_vec(&payload)
            .map_err(|_| VmciError::EventUnknown)?
            .len();
        if encoded_len > MAX_EVENT_PAYLOAD {
            return Err(VmciError::EventUnknown);
        }

        let kind = payload.kind();
        let subscriptions = self.subscriptions.lock();
        let mut delivered = 0usize;
        for sub in subscriptions.iter().filter(|s| s.kind == kind) {
            (sub.callback)(&payload);
            delivered += 1;
        }
        trace!(?kind, delivered, "event dispatched");
        Ok(())
    }
}

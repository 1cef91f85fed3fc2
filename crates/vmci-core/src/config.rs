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

//! Fabric-wide tunables that are implementation choices rather than part of
//! the wire contract.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::datagram::WellKnownAllowPolicy;

/// Runtime-configurable knobs for a [crate::fabric::VmciFabric].
///
/// Wire constants (`MAX_DG_SIZE`, `MAX_DATAGRAM_QUEUE_SIZE`,
/// `MAX_EVENT_PAYLOAD`, `RESERVED_CID_LIMIT`) deliberately aren't here: the
/// spec treats those as part of the wire contract, not as something an
/// embedder tunes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VmciConfig {
    /// Bucket count for the resource table's internal hash table.
    pub resource_table_buckets: usize,
    /// Ceiling below which a well-known id may be reserved at all,
    /// independent of the requester's privilege flags.
    ///
    /// Resolves the `well_known_id_allow_map` open question from spec.md
    /// §9: ids below this ceiling are reserved for fabric-internal
    /// endpoints (discovery sits at id 1), and every id at or above it is
    /// available to ordinary callers.
    pub well_known_id_ceiling: u32,
    /// True for a hosted platform, where the host may create a queue pair
    /// before a page store exists and `QP_PEER_ATTACH` is deferred until
    /// the guest peer binds one. False for a VMKERNEL-style platform, where
    /// a page store must already be bound before any attach is allowed.
    pub hosted_queue_pairs: bool,
}

impl Default for VmciConfig {
    fn default() -> Self {
        Self {
            resource_table_buckets: 256,
            well_known_id_ceiling: 1024,
            hosted_queue_pairs: true,
        }
    }
}

impl VmciConfig {
    /// Builds the allow-policy closure [crate::datagram::DatagramDispatcher]
    /// consults on every `request_well_known_map` call.
    pub fn well_known_allow_policy(&self) -> WellKnownAllowPolicy {
        let ceiling = self.well_known_id_ceiling;
        Arc::new(move |id| id < ceiling)
    }
}

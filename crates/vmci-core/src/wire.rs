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

//! Wire formats: privilege flags, datagrams and event messages.
//!
//! This is a host-only, in-process fabric, so "wire size" is an accounting
//! quantity rather than a literal byte layout: payloads travel as owned
//! `Vec<u8>` and structured event payloads as a plain Rust enum.

use serde::{Deserialize, Serialize};

use crate::handle::Handle;

bitflags::bitflags! {
    /// A context or datagram endpoint's privilege bit set.
    #[derive(Serialize, Deserialize)]
    pub struct PrivilegeFlags: u32 {
        /// Grants bypass of domain isolation in the direction of trust.
        const TRUSTED = 0b01;
        /// Requires the counterpart to be [PrivilegeFlags::TRUSTED] to interact.
        const RESTRICTED = 0b10;
    }
}

impl PrivilegeFlags {
    /// The least-privileged, default-deny flag set.
    pub const LEAST_PRIVILEGE: PrivilegeFlags = PrivilegeFlags::RESTRICTED;

    /// The fully-trusted flag set.
    pub const MAX_PRIVILEGE: PrivilegeFlags = PrivilegeFlags::TRUSTED;

    /// Every flag bit defined by this fabric.
    pub const ALL_FLAGS: PrivilegeFlags =
        PrivilegeFlags::from_bits_truncate(PrivilegeFlags::TRUSTED.bits() | PrivilegeFlags::RESTRICTED.bits());

    /// True if this flag set contains only bits in [Self::ALL_FLAGS].
    pub fn is_valid(self) -> bool {
        Self::ALL_FLAGS.contains(self)
    }

    /// Parses a raw bit pattern, rejecting any bit outside [Self::ALL_FLAGS].
    pub fn from_raw(bits: u32) -> Option<PrivilegeFlags> {
        PrivilegeFlags::from_bits(bits)
    }
}

/// Maximum size in bytes of a single datagram, including its header.
pub const MAX_DG_SIZE: u64 = 68 * 1024;

/// Size in bytes of a [Datagram]'s fixed header (two handles plus a length).
pub const DG_HEADER_SIZE: u64 = 24;

/// Byte ceiling on a single context's pending datagram queue.
pub const MAX_DATAGRAM_QUEUE_SIZE: u64 = 256 * 1024;

/// Upper bound on a single event message's serialized payload.
pub const MAX_EVENT_PAYLOAD: usize = 64;

/// A message routed by the datagram dispatcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    pub src: Handle,
    pub dst: Handle,
    pub payload: Vec<u8>,
}

impl Datagram {
    /// Total accounted wire size: header plus payload bytes.
    pub fn wire_size(&self) -> u64 {
        DG_HEADER_SIZE + self.payload.len() as u64
    }
}

/// The structured payload of a hypervisor-sourced event datagram.
///
/// Event datagrams always have `src = (HYPERVISOR_CONTEXT, CONTEXT_RESOURCE_ID)`
/// and `dst = (target, EVENT_HANDLER_RESOURCE_ID)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    /// A context has been released and fully torn down.
    CtxRemoved { context_id: u32 },
    /// A queue pair gained its peer.
    QpPeerAttach { handle: Handle, peer_id: u32 },
    /// A queue pair's peer detached.
    QpPeerDetach { handle: Handle, peer_id: u32 },
}

impl EventPayload {
    /// The event kind discriminant, used to key subscriber lists.
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::CtxRemoved { .. } => EventKind::CtxRemoved,
            EventPayload::QpPeerAttach { .. } => EventKind::QpPeerAttach,
            EventPayload::QpPeerDetach { .. } => EventKind::QpPeerDetach,
        }
    }
}

/// The discriminant of an [EventPayload], used to index subscriber lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    CtxRemoved,
    QpPeerAttach,
    QpPeerDetach,
}

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

//! The fabric's error taxonomy and return-code surface.

/// The result type returned by every fallible fabric operation.
pub type VmciResult<T> = Result<T, VmciError>;

/// Errors surfaced across the control surface.
///
/// Variants map one-to-one onto the return codes named in the fabric's
/// external interface; the `SUCCESS_*` codes that are not plain success are
/// modeled as `Ok` values carrying an enum rather than as errors, since they
/// are not failures.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum VmciError {
    #[error("invalid argument: {0}")]
    InvalidArgs(&'static str),

    #[error("access denied")]
    NoAccess,

    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("duplicate entry")]
    DuplicateEntry,

    #[error("out of memory")]
    NoMem,

    #[error("no resources available")]
    NoResources,

    #[error("destination unreachable")]
    DstUnreachable,

    #[error("queue pair parameter mismatch")]
    QueuePairMismatch,

    #[error("queue pair page store not set")]
    QueuePairNotSet,

    #[error("caller is not the queue pair owner")]
    QueuePairNotOwner,

    #[error("no more datagrams")]
    NoMoreDatagrams,

    #[error("invalid privilege")]
    InvalidPriv,

    #[error("invalid resource")]
    InvalidResource,

    #[error("unavailable")]
    Unavailable,

    #[error("unknown event kind")]
    EventUnknown,

    #[error("internal error: {0}")]
    Generic(String),
}

impl VmciError {
    /// A small stable integer identifying this error's return-code family,
    /// for wire responses that carry a machine-readable code alongside a
    /// human-readable message. `0` is reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            VmciError::InvalidArgs(_) => -1,
            VmciError::NoAccess => -2,
            VmciError::NotFound => -3,
            VmciError::AlreadyExists => -4,
            VmciError::DuplicateEntry => -5,
            VmciError::NoMem => -6,
            VmciError::NoResources => -7,
            VmciError::DstUnreachable => -8,
            VmciError::QueuePairMismatch => -9,
            VmciError::QueuePairNotSet => -10,
            VmciError::QueuePairNotOwner => -11,
            VmciError::NoMoreDatagrams => -12,
            VmciError::InvalidPriv => -13,
            VmciError::InvalidResource => -14,
            VmciError::Unavailable => -15,
            VmciError::EventUnknown => -16,
            VmciError::Generic(_) => -17,
        }
    }
}

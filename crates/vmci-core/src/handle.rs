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

//! Handle identity and the insertion-ordered [HandleArray].

use serde::{Deserialize, Serialize};

/// Context ids below this value are reserved for the fabric itself.
pub const RESERVED_CID_LIMIT: u32 = 16;

/// The synthetic context id that well-known names are addressed under.
pub const WELL_KNOWN_CONTEXT: u32 = 1;

/// The context id of the hypervisor, the source of all events.
pub const HYPERVISOR_CONTEXT: u32 = 0;

/// The context id of the host process embedding the fabric.
pub const HOST_CONTEXT: u32 = 2;

/// The resource id the hypervisor uses as the source of event datagrams.
pub const CONTEXT_RESOURCE_ID: u32 = 0;

/// The resource id on the host context that the event bus listens on.
pub const EVENT_HANDLER_RESOURCE_ID: u32 = 0;

/// The no-value sentinel used by both halves of a [Handle].
const INVALID_ID: u32 = u32::MAX;

/// Identity `(context, resource)` addressing any object in the fabric.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    pub context: u32,
    pub resource: u32,
}

impl Handle {
    /// The reserved sentinel representing "no handle".
    pub const INVALID: Handle = Handle {
        context: INVALID_ID,
        resource: INVALID_ID,
    };

    /// Builds a new handle from its two halves.
    pub const fn new(context: u32, resource: u32) -> Self {
        Self { context, resource }
    }

    /// True if this handle is the [Handle::INVALID] sentinel.
    pub fn is_invalid(&self) -> bool {
        *self == Self::INVALID
    }
}

/// A dynamic, insertion-ordered sequence of [Handle]s.
///
/// Duplicates are permitted. Removal removes the first match. Not internally
/// synchronized; callers pair this with whatever lock guards the container
/// that owns it (a [crate::context::Context] or a
/// [crate::group::GroupBody]).
#[derive(Clone, Debug, Default)]
pub struct HandleArray {
    handles: Vec<Handle>,
}

impl HandleArray {
    /// Creates a new, empty handle array.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handle to the end of the array.
    pub fn append(&mut self, handle: Handle) {
        self.handles.push(handle);
    }

    /// Removes the first occurrence of `handle`, returning it, or
    /// [Handle::INVALID] if it was not present.
    pub fn remove(&mut self, handle: Handle) -> Handle {
        if let Some(pos) = self.handles.iter().position(|h| *h == handle) {
            self.handles.remove(pos)
        } else {
            Handle::INVALID
        }
    }

    /// Removes and returns the last handle in the array, or
    /// [Handle::INVALID] if the array is empty.
    pub fn remove_tail(&mut self) -> Handle {
        self.handles.pop().unwrap_or(Handle::INVALID)
    }

    /// True if `handle` occurs anywhere in the array.
    pub fn has(&self, handle: Handle) -> bool {
        self.handles.contains(&handle)
    }

    /// Retrieves the handle at `index`, if any.
    pub fn get(&self, index: usize) -> Option<Handle> {
        self.handles.get(index).copied()
    }

    /// The number of handles currently stored.
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// True if the array holds no handles.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Drains every handle out of the array, in insertion order.
    pub fn drain(&mut self) -> Vec<Handle> {
        std::mem::take(&mut self.handles)
    }

    /// Iterates over the handles currently stored, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Handle> {
        self.handles.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_is_invalid() {
        assert!(Handle::INVALID.is_invalid());
        assert!(!Handle::new(0, 0).is_invalid());
    }

    #[test]
    fn append_and_has() {
        let mut arr = HandleArray::new();
        let h = Handle::new(1, 2);
        arr.append(h);
        assert!(arr.has(h));
        assert_eq!(arr.size(), 1);
    }

    #[test]
    fn remove_first_match_only() {
        let mut arr = HandleArray::new();
        let h = Handle::new(1, 2);
        arr.append(h);
        arr.append(Handle::new(3, 4));
        arr.append(h);

        assert_eq!(arr.remove(h), h);
        assert_eq!(arr.size(), 2);
        assert_eq!(arr.get(0), Some(Handle::new(3, 4)));
        assert_eq!(arr.get(1), Some(h));
    }

    #[test]
    fn remove_missing_returns_invalid() {
        let mut arr = HandleArray::new();
        assert_eq!(arr.remove(Handle::new(9, 9)), Handle::INVALID);
    }

    #[test]
    fn remove_tail() {
        let mut arr = HandleArray::new();
        arr.append(Handle::new(1, 1));
        arr.append(Handle::new(2, 2));
        assert_eq!(arr.remove_tail(), Handle::new(2, 2));
        assert_eq!(arr.remove_tail(), Handle::new(1, 1));
        assert_eq!(arr.remove_tail(), Handle::INVALID);
    }
}

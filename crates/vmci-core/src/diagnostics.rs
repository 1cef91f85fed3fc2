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

//! Logging bootstrap for embedders and `vmci-ctl`. The library itself never
//! calls this; it only ever emits [tracing] events.

use tracing::Level;

/// Installs a compact console subscriber at `max_level`.
pub fn init_logging(max_level: Level) {
    tracing_subscriber::fmt()
        .compact()
        .with_max_level(max_level)
        .init();
}

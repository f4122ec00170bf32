// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process spawners - how worker processes are started and signalled.

pub mod mock;
pub mod native;
mod traits;

pub use mock::MockSpawner;
pub use native::NativeSpawner;
pub use traits::*;

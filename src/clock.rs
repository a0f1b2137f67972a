// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Coarse scheduler clock.
//!
//! Timeouts are measured in whole seconds against a cached value that workers
//! refresh once per event-loop tick, so handlers and the timeout sweep read
//! time without a syscall.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Coarse monotonic clock shared by every worker.
#[derive(Debug)]
pub struct Clock {
    start: Instant,
    offset: AtomicU64,
    utime: AtomicU64,
}

impl Clock {
    /// Creates a clock anchored at the current instant, reading zero.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset: AtomicU64::new(0),
            utime: AtomicU64::new(0),
        }
    }

    /// Cached seconds since the clock was created.
    #[inline]
    pub fn now_utime(&self) -> u64 {
        self.utime.load(Ordering::Relaxed)
    }

    /// Recomputes the cached seconds. Invoked once per event-loop tick.
    pub fn refresh(&self) {
        let now = self.start.elapsed().as_secs() + self.offset.load(Ordering::Relaxed);
        self.utime.store(now, Ordering::Relaxed);
    }

    /// Shifts the clock forward without waiting. The shift survives later
    /// refreshes.
    pub fn advance(&self, secs: u64) {
        self.offset.fetch_add(secs, Ordering::Relaxed);
        self.refresh();
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

// SPDX-License-Identifier: MPL-2.0

//! Coarse wall-clock time in whole seconds.
//!
//! Expiry bookkeeping (delayed free, push-result timeouts) only needs
//! second granularity, so everything below deals in `i64` UNIX seconds.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current wall-clock time as UNIX seconds.
pub fn current_secs() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        // Clock before the epoch; clamp instead of failing timers.
        Err(_) => 0,
    }
}

// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::Dump;

/// Totally ordered 192-bit transaction identifier, compared lexicographically
/// on its three words.
///
/// `TransactionId::MIN` (all zeros) is never a real id; it is the sentinel
/// meaning "no transaction / no predecessor". `TransactionId::MAX` is the
/// upper sentinel. Every id actually committed anywhere satisfies
/// `MIN < id < MAX`.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId {
    pub a: u64,
    pub b: u64,
    pub c: u64,
}

impl TransactionId {
    pub const MIN: TransactionId = TransactionId { a: 0, b: 0, c: 0 };
    pub const MAX: TransactionId = TransactionId {
        a: u64::MAX,
        b: u64::MAX,
        c: u64::MAX,
    };

    pub const fn new(a: u64, b: u64, c: u64) -> Self {
        Self { a, b, c }
    }

    /// True for any id that may actually be committed: neither sentinel.
    pub fn is_valid(&self) -> bool {
        *self != Self::MIN && *self != Self::MAX
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:016x}-{:016x}", self.a, self.b, self.c)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Dump for TransactionId {
    fn dump(&self) -> serde_json::Value {
        serde_json::Value::String(format!("{self:?}"))
    }
}

/// Produces strictly increasing transaction ids for the local peer.
///
/// The first word is the wall clock in nanoseconds since the Unix epoch, the
/// remaining words are random, so ids generated by different peers interleave
/// under the lexicographic order. Monotonicity is a property of the generator,
/// not of the clock: concurrent calls, clock ties, and clock regression all
/// fall back to bumping the previous id.
pub struct TransactionIdGenerator {
    last: Mutex<TransactionId>,
}

impl TransactionIdGenerator {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(TransactionId::MIN),
        }
    }

    pub fn generate(&self) -> TransactionId {
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let mut rng = rand::thread_rng();
        let candidate = TransactionId::new(now_nanos, rng.gen(), rng.gen());

        let mut last = self.last.lock();
        let id = if candidate > *last {
            candidate
        } else {
            // The clock stalled or went backwards; stay on the previous
            // id's first word and extend it.
            TransactionId::new(last.a, last.b, last.c.wrapping_add(1))
        };
        *last = id;

        debug_assert!(id.is_valid());
        id
    }
}

impl Default for TransactionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

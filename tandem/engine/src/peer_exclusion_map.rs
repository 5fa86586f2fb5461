// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fmt;

use tandem_types::{Dump, TransactionId};

use crate::interval_set::IntervalSet;
use crate::peers::Peer;

/// Which transactions of which peers have been invalidated.
///
/// A transaction `t` of peer `p` is excluded iff the interval set for `p`
/// contains `t`.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct PeerExclusionMap {
    excluded_ranges: HashMap<Peer, IntervalSet<TransactionId>>,
}

impl PeerExclusionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_excluded_range(
        &mut self,
        peer: Peer,
        start_transaction_id: TransactionId,
        end_transaction_id: TransactionId,
    ) {
        assert!(start_transaction_id.is_valid(), "{start_transaction_id:?}");

        self.excluded_ranges
            .entry(peer)
            .or_default()
            .add_interval(start_transaction_id, end_transaction_id);
    }

    pub fn is_transaction_excluded(&self, peer: &Peer, transaction_id: TransactionId) -> bool {
        self.excluded_ranges
            .get(peer)
            .is_some_and(|ranges| ranges.contains(&transaction_id))
    }

    pub fn excluded_ranges(&self, peer: &Peer) -> Option<&IntervalSet<TransactionId>> {
        self.excluded_ranges.get(peer)
    }
}

impl fmt::Debug for PeerExclusionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (peer, ranges) in &self.excluded_ranges {
            map.entry(&peer.peer_id(), ranges);
        }
        map.finish()
    }
}

impl Dump for PeerExclusionMap {
    fn dump(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (peer, ranges) in &self.excluded_ranges {
            map.insert(peer.peer_id().to_string(), ranges.dump());
        }
        serde_json::Value::Object(map)
    }
}

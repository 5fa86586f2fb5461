// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use tandem_types::{Dump, TransactionId};

use crate::peer_exclusion_map::PeerExclusionMap;
use crate::peers::Peer;
use crate::version_map::MaxVersionMap;

/// A readable snapshot of the distributed execution.
///
/// A transaction `(p, t)` is *visible* at a sequence point iff
/// - the version map covers it (`map[p] >= t`),
/// - it has not been invalidated (`!exclusions.contains(p, t)`), and
/// - it precedes every recorded start-of-rejection for `p`.
///
/// Snapshots are immutable once handed out; the store's current sequence
/// point only grows.
#[derive(Clone, Default, PartialEq)]
pub struct SequencePoint {
    version_map: MaxVersionMap,
    exclusions: PeerExclusionMap,
    rejected_peers: HashMap<Peer, BTreeSet<TransactionId>>,
}

impl SequencePoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version_map(&self) -> &MaxVersionMap {
        &self.version_map
    }

    pub fn exclusions(&self) -> &PeerExclusionMap {
        &self.exclusions
    }

    pub fn rejected_peers(&self) -> &HashMap<Peer, BTreeSet<TransactionId>> {
        &self.rejected_peers
    }

    pub fn has_peer_transaction_id(&self, peer: &Peer, transaction_id: TransactionId) -> bool {
        if !self.version_map.has_peer_transaction_id(peer, transaction_id)
            || self.exclusions.is_transaction_excluded(peer, transaction_id)
        {
            return false;
        }

        match self.rejected_peers.get(peer) {
            Some(rejected_from) => {
                let first = rejected_from
                    .first()
                    .expect("rejected_peers entries are never empty");
                transaction_id < *first
            }
            None => true,
        }
    }

    pub fn add_peer_transaction_id(&mut self, peer: Peer, transaction_id: TransactionId) {
        self.version_map.add_peer_transaction_id(peer, transaction_id);
    }

    /// Invalidates `[start, end)` for `origin_peer`. Rejected-from points
    /// inside the range are subsumed by the exclusion and dropped.
    pub fn add_invalidated_range(
        &mut self,
        origin_peer: Peer,
        start_transaction_id: TransactionId,
        end_transaction_id: TransactionId,
    ) {
        self.exclusions.add_excluded_range(
            origin_peer.clone(),
            start_transaction_id,
            end_transaction_id,
        );

        if let Some(rejected_from) = self.rejected_peers.get_mut(&origin_peer) {
            rejected_from.retain(|id| *id < start_transaction_id || *id >= end_transaction_id);
            if rejected_from.is_empty() {
                self.rejected_peers.remove(&origin_peer);
            }
        }
    }

    /// Records that `origin_peer`'s transactions from `start_transaction_id`
    /// onward are rejected until a covering invalidation arrives.
    pub fn add_rejected_peer(&mut self, origin_peer: Peer, start_transaction_id: TransactionId) {
        self.rejected_peers
            .entry(origin_peer)
            .or_default()
            .insert(start_transaction_id);
    }
}

impl fmt::Debug for SequencePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequencePoint")
            .field("version_map", &self.version_map)
            .field("exclusions", &self.exclusions)
            .field(
                "rejected_peers",
                &self
                    .rejected_peers
                    .iter()
                    .map(|(p, ids)| (p.peer_id().to_string(), ids.len()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Dump for SequencePoint {
    fn dump(&self) -> serde_json::Value {
        let mut rejected = serde_json::Map::new();
        for (peer, ids) in &self.rejected_peers {
            rejected.insert(
                peer.peer_id().to_string(),
                serde_json::Value::Array(ids.iter().map(|id| id.dump()).collect()),
            );
        }
        serde_json::json!({
            "version_map": self.version_map.dump(),
            "peer_exclusion_map": self.exclusions.dump(),
            "rejected_peers": serde_json::Value::Object(rejected),
        })
    }
}

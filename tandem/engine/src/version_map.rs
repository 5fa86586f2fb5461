// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use tandem_types::{Dump, TransactionId};

use crate::peers::Peer;

/// Chooses which of two transaction ids a [`VersionMap`] keeps for a peer.
pub trait IdOrdering {
    /// True when `candidate` should replace `existing`.
    fn supersedes(candidate: &TransactionId, existing: &TransactionId) -> bool;
}

/// Keeps the largest id per peer: the frontier of transactions *seen*.
pub enum KeepMax {}

impl IdOrdering for KeepMax {
    fn supersedes(candidate: &TransactionId, existing: &TransactionId) -> bool {
        candidate > existing
    }
}

/// Keeps the smallest id per peer.
pub enum KeepMin {}

impl IdOrdering for KeepMin {
    fn supersedes(candidate: &TransactionId, existing: &TransactionId) -> bool {
        candidate < existing
    }
}

pub type MaxVersionMap = VersionMap<KeepMax>;
pub type MinVersionMap = VersionMap<KeepMin>;

/// Mapping peer → transaction id under a merge policy.
///
/// Under [`KeepMax`] this describes "everything from peer `p` up to and
/// including id `t`" — the shape used for object version frontiers and
/// sequence points.
pub struct VersionMap<O> {
    entries: HashMap<Peer, TransactionId>,
    _ordering: PhantomData<O>,
}

impl<O: IdOrdering> VersionMap<O> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            _ordering: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Peer, &TransactionId)> {
        self.entries.iter()
    }

    pub fn get(&self, peer: &Peer) -> Option<TransactionId> {
        self.entries.get(peer).copied()
    }

    /// True iff the map has an entry for `peer` that is at least as preferred
    /// as `transaction_id`: under [`KeepMax`], `map[peer] >= transaction_id`.
    pub fn has_peer_transaction_id(&self, peer: &Peer, transaction_id: TransactionId) -> bool {
        match self.entries.get(peer) {
            Some(existing) => !O::supersedes(&transaction_id, existing),
            None => false,
        }
    }

    pub fn add_peer_transaction_id(&mut self, peer: Peer, transaction_id: TransactionId) {
        assert!(transaction_id.is_valid(), "{transaction_id:?}");

        match self.entries.entry(peer) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                if O::supersedes(&transaction_id, entry.get()) {
                    entry.insert(transaction_id);
                }
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(transaction_id);
            }
        }
    }

    /// Drops the entry for `peer` unless the stored id supersedes
    /// `transaction_id`.
    pub fn remove_peer_transaction_id(&mut self, peer: &Peer, transaction_id: TransactionId) {
        assert!(transaction_id.is_valid(), "{transaction_id:?}");

        if let Some(existing) = self.entries.get(peer) {
            if !O::supersedes(existing, &transaction_id) {
                self.entries.remove(peer);
            }
        }
    }

    /// Pointwise merge of both maps, preferring per the ordering.
    pub fn union(a: &Self, b: &Self) -> Self {
        let mut out = a.clone();
        for (peer, transaction_id) in &b.entries {
            out.add_peer_transaction_id(peer.clone(), *transaction_id);
        }
        out
    }

    /// Entries for peers present in both maps, preferring per the ordering.
    pub fn intersection(a: &Self, b: &Self) -> Self {
        let mut out = Self::new();
        for (peer, a_id) in &a.entries {
            if let Some(b_id) = b.entries.get(peer) {
                let preferred = if O::supersedes(a_id, b_id) { a_id } else { b_id };
                out.add_peer_transaction_id(peer.clone(), *preferred);
            }
        }
        out
    }

    /// `a <= b` iff every entry of `a` is covered by an entry of `b` that is
    /// at least as large. (Defined on the raw ids, independent of the merge
    /// policy.)
    pub fn is_le(a: &Self, b: &Self) -> bool {
        a.entries.iter().all(|(peer, a_id)| {
            b.entries.get(peer).is_some_and(|b_id| a_id <= b_id)
        })
    }
}

impl<O: IdOrdering> Default for VersionMap<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> Clone for VersionMap<O> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            _ordering: PhantomData,
        }
    }
}

impl<O> PartialEq for VersionMap<O> {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<O> Eq for VersionMap<O> {}

impl<O> fmt::Debug for VersionMap<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (peer, id) in &self.entries {
            map.entry(&peer.peer_id(), &format_args!("{id:?}"));
        }
        map.finish()
    }
}

impl<O> Dump for VersionMap<O> {
    fn dump(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (peer, id) in &self.entries {
            map.insert(peer.peer_id().to_string(), id.dump());
        }
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::PeerMap;

    fn id(n: u64) -> TransactionId {
        TransactionId::new(n, 0, 0)
    }

    #[test]
    fn max_map_keeps_largest() {
        let peers = PeerMap::new();
        let a = peers.get_peer("a");

        let mut map = MaxVersionMap::new();
        map.add_peer_transaction_id(a.clone(), id(20));
        map.add_peer_transaction_id(a.clone(), id(10));
        assert_eq!(map.get(&a), Some(id(20)));
        map.add_peer_transaction_id(a.clone(), id(30));
        assert_eq!(map.get(&a), Some(id(30)));

        // Adding is idempotent.
        map.add_peer_transaction_id(a.clone(), id(30));
        assert_eq!(map.get(&a), Some(id(30)));
    }

    #[test]
    fn min_map_keeps_smallest() {
        let peers = PeerMap::new();
        let a = peers.get_peer("a");

        let mut map = MinVersionMap::new();
        map.add_peer_transaction_id(a.clone(), id(20));
        map.add_peer_transaction_id(a.clone(), id(10));
        map.add_peer_transaction_id(a.clone(), id(30));
        assert_eq!(map.get(&a), Some(id(10)));
    }

    #[test]
    fn has_peer_transaction_id_is_a_frontier_test() {
        let peers = PeerMap::new();
        let a = peers.get_peer("a");
        let b = peers.get_peer("b");

        let mut map = MaxVersionMap::new();
        map.add_peer_transaction_id(a.clone(), id(20));

        assert!(map.has_peer_transaction_id(&a, id(10)));
        assert!(map.has_peer_transaction_id(&a, id(20)));
        assert!(!map.has_peer_transaction_id(&a, id(21)));
        assert!(!map.has_peer_transaction_id(&b, id(1)));
    }

    #[test]
    fn remove_only_drops_non_superseding_entries() {
        let peers = PeerMap::new();
        let a = peers.get_peer("a");

        let mut map = MaxVersionMap::new();
        map.add_peer_transaction_id(a.clone(), id(20));
        map.remove_peer_transaction_id(&a, id(10));
        assert_eq!(map.get(&a), Some(id(20)));
        map.remove_peer_transaction_id(&a, id(20));
        assert_eq!(map.get(&a), None);
    }

    #[test]
    fn union_laws() {
        let peers = PeerMap::new();
        let a = peers.get_peer("a");
        let b = peers.get_peer("b");
        let c = peers.get_peer("c");

        let mut x = MaxVersionMap::new();
        x.add_peer_transaction_id(a.clone(), id(10));
        x.add_peer_transaction_id(b.clone(), id(5));

        let mut y = MaxVersionMap::new();
        y.add_peer_transaction_id(b.clone(), id(7));
        y.add_peer_transaction_id(c.clone(), id(3));

        let xy = MaxVersionMap::union(&x, &y);
        let yx = MaxVersionMap::union(&y, &x);
        assert_eq!(xy, yx);
        assert_eq!(xy.get(&a), Some(id(10)));
        assert_eq!(xy.get(&b), Some(id(7)));
        assert_eq!(xy.get(&c), Some(id(3)));

        // A <= union(A, B), and the empty map is the identity.
        assert!(MaxVersionMap::is_le(&x, &xy));
        assert!(MaxVersionMap::is_le(&y, &xy));
        assert_eq!(MaxVersionMap::union(&x, &MaxVersionMap::new()), x);

        // Associativity.
        let mut z = MaxVersionMap::new();
        z.add_peer_transaction_id(a.clone(), id(2));
        assert_eq!(
            MaxVersionMap::union(&MaxVersionMap::union(&x, &y), &z),
            MaxVersionMap::union(&x, &MaxVersionMap::union(&y, &z)),
        );
    }

    #[test]
    fn intersection_restricts_to_shared_peers() {
        let peers = PeerMap::new();
        let a = peers.get_peer("a");
        let b = peers.get_peer("b");
        let c = peers.get_peer("c");

        let mut x = MaxVersionMap::new();
        x.add_peer_transaction_id(a.clone(), id(10));
        x.add_peer_transaction_id(b.clone(), id(5));

        let mut y = MaxVersionMap::new();
        y.add_peer_transaction_id(b.clone(), id(7));
        y.add_peer_transaction_id(c.clone(), id(3));

        let meet = MaxVersionMap::intersection(&x, &y);
        assert_eq!(meet.get(&a), None);
        assert_eq!(meet.get(&b), Some(id(7)));
        assert_eq!(meet.get(&c), None);
    }

    #[test]
    fn is_le_is_pointwise() {
        let peers = PeerMap::new();
        let a = peers.get_peer("a");
        let b = peers.get_peer("b");

        let mut small = MaxVersionMap::new();
        small.add_peer_transaction_id(a.clone(), id(10));

        let mut big = MaxVersionMap::new();
        big.add_peer_transaction_id(a.clone(), id(20));
        big.add_peer_transaction_id(b.clone(), id(1));

        assert!(MaxVersionMap::is_le(&small, &big));
        assert!(!MaxVersionMap::is_le(&big, &small));
        assert!(MaxVersionMap::is_le(&MaxVersionMap::new(), &small));
    }
}

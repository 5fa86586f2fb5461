// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;

use tandem_types::{Dump, TransactionId};

use crate::event::SharedObjectTransaction;
use crate::live_object::LiveObject;
use crate::peers::Peer;
use crate::playback::PlaybackContext;
use crate::sequence_point::SequencePoint;
use crate::shared_object::SharedObject;
use crate::store::StoreContext;
use crate::version_map::MaxVersionMap;

/// Per-object store of state. The versioned arm holds the committed
/// transaction history; the unversioned arm is a single immutable live
/// object that rejects any attempt to record transactions on it.
pub(crate) enum ObjectContent {
    Versioned(VersionedContent),
    Unversioned(Arc<LiveObject>),
}

impl Dump for ObjectContent {
    fn dump(&self) -> serde_json::Value {
        match self {
            ObjectContent::Versioned(versioned) => versioned.dump(),
            ObjectContent::Unversioned(live_object) => {
                serde_json::json!({ "unversioned": live_object.dump() })
            }
        }
    }
}

/// The committed transaction history of one shared object, plus the replay
/// bookkeeping built on top of it.
pub(crate) struct VersionedContent {
    committed_versions: BTreeMap<TransactionId, SharedObjectTransaction>,
    /// Upper bound of transaction ids incorporated, per peer.
    version_map: MaxVersionMap,
    /// Peers whose store-level frontier also bounds this object.
    up_to_date_peers: HashSet<Peer>,
    /// Largest id any replay has been requested at. A transaction arriving
    /// at or below this watermark must be replayed immediately so its
    /// conflicts surface.
    max_requested_transaction_id: TransactionId,
    cached_live_object: Option<(Arc<LiveObject>, SequencePoint)>,
}

/// One transaction lifted out of the history for replay outside the content
/// lock.
pub(crate) struct SnapshotTransaction {
    pub transaction_id: TransactionId,
    pub origin_peer: Peer,
    pub events: Vec<crate::event::CommittedEvent>,
}

impl VersionedContent {
    pub fn new() -> Self {
        Self {
            committed_versions: BTreeMap::new(),
            version_map: MaxVersionMap::new(),
            up_to_date_peers: HashSet::new(),
            max_requested_transaction_id: TransactionId::MIN,
            cached_live_object: None,
        }
    }

    pub fn committed_versions(&self) -> &BTreeMap<TransactionId, SharedObjectTransaction> {
        &self.committed_versions
    }

    pub fn version_map(&self) -> &MaxVersionMap {
        &self.version_map
    }

    pub fn max_requested_transaction_id(&self) -> TransactionId {
        self.max_requested_transaction_id
    }

    pub fn raise_max_requested(&mut self, transaction_id: TransactionId) {
        if transaction_id > self.max_requested_transaction_id {
            self.max_requested_transaction_id = transaction_id;
        }
    }

    /// First writer wins: returns true iff the transaction was actually
    /// inserted.
    pub fn insert_if_absent(
        &mut self,
        transaction_id: TransactionId,
        transaction: SharedObjectTransaction,
    ) -> bool {
        match self.committed_versions.entry(transaction_id) {
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(transaction);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn record_peer_transaction(&mut self, origin_peer: Peer, transaction_id: TransactionId) {
        self.version_map
            .add_peer_transaction_id(origin_peer, transaction_id);
    }

    pub fn merge_version_map(&mut self, other: &MaxVersionMap) {
        self.version_map = MaxVersionMap::union(&self.version_map, other);
    }

    pub fn mark_up_to_date(&mut self, peer: Peer) {
        self.up_to_date_peers.insert(peer);
    }

    pub fn set_cached_live_object(
        &mut self,
        live_object: Arc<LiveObject>,
        sequence_point: SequencePoint,
    ) {
        self.cached_live_object = Some((live_object, sequence_point));
    }

    /// The *effective version* of this object: its own version map, plus the
    /// store-level frontier for every peer that is known to be up to date on
    /// this object.
    pub fn effective_version(&self, store_version_map: &MaxVersionMap) -> MaxVersionMap {
        let mut effective = self.version_map.clone();
        for peer in &self.up_to_date_peers {
            if let Some(transaction_id) = store_version_map.get(peer) {
                effective.add_peer_transaction_id(peer.clone(), transaction_id);
            }
        }
        effective
    }

    /// Returns the memoized live object when it is still valid for
    /// `requested`: the cached view must lie at or below the request, every
    /// transaction between the two frontiers must be state-preserving, and
    /// the invalidation state must match exactly.
    pub fn usable_cache(&self, requested: &SequencePoint) -> Option<Arc<LiveObject>> {
        let (cached_live_object, cached_point) = self.cached_live_object.as_ref()?;

        if !MaxVersionMap::is_le(cached_point.version_map(), requested.version_map()) {
            return None;
        }

        for (peer, requested_id) in requested.version_map().entries() {
            let cached_id = cached_point
                .version_map()
                .get(peer)
                .unwrap_or(TransactionId::MIN);

            let range = (Bound::Excluded(cached_id), Bound::Included(*requested_id));
            for transaction in self.committed_versions.range(range).map(|(_, t)| t) {
                if transaction.origin_peer() == peer
                    && transaction.events().iter().any(|e| !e.is_state_preserving())
                {
                    return None;
                }
            }
        }

        if requested.exclusions() != cached_point.exclusions()
            || requested.rejected_peers() != cached_point.rejected_peers()
        {
            return None;
        }

        Some(cached_live_object.clone())
    }

    pub fn snapshot_transactions(&self) -> Vec<SnapshotTransaction> {
        self.committed_versions
            .iter()
            .map(|(transaction_id, transaction)| SnapshotTransaction {
                transaction_id: *transaction_id,
                origin_peer: transaction.origin_peer().clone(),
                events: transaction.events().to_vec(),
            })
            .collect()
    }
}

impl Dump for VersionedContent {
    fn dump(&self) -> serde_json::Value {
        let mut committed = serde_json::Map::new();
        for (transaction_id, transaction) in &self.committed_versions {
            committed.insert(format!("{transaction_id:?}"), transaction.dump());
        }
        let up_to_date: Vec<serde_json::Value> =
            self.up_to_date_peers.iter().map(|peer| peer.dump()).collect();
        serde_json::json!({
            "committed_versions": serde_json::Value::Object(committed),
            "version_map": self.version_map.dump(),
            "up_to_date_peers": up_to_date,
            "max_requested_transaction_id": self.max_requested_transaction_id.dump(),
            "cached_live_object": self
                .cached_live_object
                .as_ref()
                .map(|(live, _)| live.dump())
                .unwrap_or(serde_json::Value::Null),
            "cached_sequence_point": self
                .cached_live_object
                .as_ref()
                .map(|(_, point)| point.dump())
                .unwrap_or(serde_json::Value::Null),
        })
    }
}

/// Replays the visible portion of `snapshot` against a fresh live object.
///
/// Each pass feeds every transaction that `visible` admits and that has not
/// already been marked for rejection. A conflict marks the offending
/// transaction rejected and restarts the pass; the loop terminates because
/// every restart strictly grows `transactions_to_reject`, which is bounded
/// by the number of committed transactions.
pub(crate) fn replay_working_version(
    store: &dyn StoreContext,
    shared_object: &SharedObject,
    snapshot: &[SnapshotTransaction],
    visible: impl Fn(&Peer, TransactionId) -> bool,
    transactions_to_reject: &mut Vec<(Peer, TransactionId)>,
) -> Option<Arc<LiveObject>> {
    loop {
        let mut playback = PlaybackContext::new(store, shared_object);

        for transaction in snapshot {
            if transaction.events.is_empty() {
                continue;
            }
            if !visible(&transaction.origin_peer, transaction.transaction_id) {
                continue;
            }
            if transactions_to_reject
                .iter()
                .any(|(_, rejected)| *rejected == transaction.transaction_id)
            {
                continue;
            }
            playback.queue_transaction(
                &transaction.origin_peer,
                transaction.transaction_id,
                &transaction.events,
            );
        }

        playback.replay();

        match playback.take_conflict() {
            Some((origin_peer, transaction_id)) => {
                tracing::debug!(
                    object = %shared_object.object_id(),
                    transaction = %transaction_id,
                    origin = %origin_peer.peer_id(),
                    "replay conflict, rejecting transaction",
                );
                transactions_to_reject.push((origin_peer, transaction_id));
            }
            None => return playback.into_live_object(),
        }
    }
}

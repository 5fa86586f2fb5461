// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tandem_types::{Dump, ObjectId, ObjectReference, TransactionId};

use crate::event::{CommittedEvent, SharedObjectTransaction};
use crate::live_object::LiveObject;
use crate::object_content::{replay_working_version, ObjectContent, VersionedContent};
use crate::peers::Peer;
use crate::sequence_point::SequencePoint;
use crate::store::StoreContext;
use crate::version_map::MaxVersionMap;

/// The identity of one replicated object: its id, the remote peers known to
/// hold it, the references that name it locally, and its content (the
/// committed transaction history, or a single immutable live object).
///
/// The three locks are independent and are never held across a call into
/// the interpreter.
pub struct SharedObject {
    object_id: ObjectId,
    interested_peers: Mutex<HashSet<Peer>>,
    object_references: Mutex<Vec<ObjectReference>>,
    content: Mutex<Option<ObjectContent>>,
}

impl SharedObject {
    pub fn new(object_id: ObjectId) -> Self {
        Self {
            object_id,
            interested_peers: Mutex::new(HashSet::new()),
            object_references: Mutex::new(Vec::new()),
            content: Mutex::new(None),
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn interested_peers(&self) -> HashSet<Peer> {
        self.interested_peers.lock().clone()
    }

    pub fn add_interested_peer(&self, peer: Peer) {
        self.interested_peers.lock().insert(peer);
    }

    /// True iff `reference` is one of the handles registered as naming this
    /// object. Replay uses this to decide whether a call is a self-call.
    pub fn has_object_reference(&self, reference: &ObjectReference) -> bool {
        self.object_references
            .lock()
            .iter()
            .any(|registered| ObjectReference::same_handle(registered, reference))
    }

    pub fn add_object_reference(&self, reference: ObjectReference) {
        debug_assert_eq!(reference.object_id(), Some(self.object_id));
        let mut references = self.object_references.lock();
        if !references
            .iter()
            .any(|registered| ObjectReference::same_handle(registered, &reference))
        {
            references.push(reference);
        }
    }

    /// The canonical reference for this object, minting and registering one
    /// if none exists yet.
    pub fn get_or_create_object_reference(&self) -> ObjectReference {
        let mut references = self.object_references.lock();
        if let Some(reference) = references.last() {
            return reference.clone();
        }
        let reference = ObjectReference::new_bound(self.object_id);
        references.push(reference.clone());
        reference
    }

    /// Installs a single immutable live object as this object's content.
    /// No-op if content already exists.
    pub fn create_unversioned_content(&self, live_object: Arc<LiveObject>) {
        let mut content = self.content.lock();
        if content.is_none() {
            *content = Some(ObjectContent::Unversioned(live_object));
        }
    }

    /// True iff this object's history contains `transaction_id` and that
    /// transaction begins with the object's creation — i.e. the object was
    /// born in that very transaction.
    pub(crate) fn created_in(&self, transaction_id: TransactionId) -> bool {
        match &*self.content.lock() {
            Some(ObjectContent::Versioned(versioned)) => versioned
                .committed_versions()
                .get(&transaction_id)
                .is_some_and(|transaction| {
                    matches!(
                        transaction.events().first(),
                        Some(CommittedEvent::ObjectCreation { .. })
                    )
                }),
            _ => false,
        }
    }

    /// Reconstructs the object's state as visible at `sequence_point`.
    ///
    /// Returns `None` when the requested view is beyond what is known
    /// locally (or no content exists yet). Transactions whose replay
    /// conflicts are appended to `transactions_to_reject` and excluded on
    /// the automatic retry, so the call converges.
    pub(crate) fn get_working_version(
        &self,
        store: &dyn StoreContext,
        store_version_map: &MaxVersionMap,
        sequence_point: &SequencePoint,
        transactions_to_reject: &mut Vec<(Peer, TransactionId)>,
    ) -> Option<Arc<LiveObject>> {
        let snapshot = {
            let mut content = self.content.lock();
            match content.as_mut() {
                None => return None,
                Some(ObjectContent::Unversioned(live_object)) => {
                    return Some(live_object.clone());
                }
                Some(ObjectContent::Versioned(versioned)) => {
                    let effective_version = versioned.effective_version(store_version_map);
                    if !MaxVersionMap::is_le(sequence_point.version_map(), &effective_version) {
                        tracing::trace!(
                            object = %self.object_id,
                            requested = ?sequence_point.version_map(),
                            effective = ?effective_version,
                            "requested sequence point is beyond the local frontier",
                        );
                        return None;
                    }
                    if let Some(cached) = versioned.usable_cache(sequence_point) {
                        for (_, id) in sequence_point.version_map().entries() {
                            versioned.raise_max_requested(*id);
                        }
                        return Some(cached);
                    }
                    versioned.snapshot_transactions()
                }
            }
        };

        let live_object = replay_working_version(
            store,
            self,
            &snapshot,
            |peer, id| sequence_point.has_peer_transaction_id(peer, id),
            transactions_to_reject,
        );

        if live_object.is_some() {
            let mut content = self.content.lock();
            if let Some(ObjectContent::Versioned(versioned)) = content.as_mut() {
                for (_, id) in sequence_point.version_map().entries() {
                    versioned.raise_max_requested(*id);
                }
            }
        }

        live_object
    }

    /// Snapshot of the committed history plus the effective version, for a
    /// `StoreObject` reply.
    pub(crate) fn get_transactions(
        &self,
        store_version_map: &MaxVersionMap,
    ) -> (BTreeMap<TransactionId, SharedObjectTransaction>, MaxVersionMap) {
        match &*self.content.lock() {
            Some(ObjectContent::Versioned(versioned)) => (
                versioned.committed_versions().clone(),
                versioned.effective_version(store_version_map),
            ),
            _ => (BTreeMap::new(), MaxVersionMap::new()),
        }
    }

    /// Merge-inserts a batch of transactions received from `remote_peer`.
    /// First writer wins on id collisions. If any newly inserted id lies at
    /// or below the largest id a replay has been requested for, the history
    /// is replayed to surface new conflicts.
    pub(crate) fn store_transactions(
        &self,
        store: &dyn StoreContext,
        remote_peer: Peer,
        transactions: BTreeMap<TransactionId, SharedObjectTransaction>,
        version_map: &MaxVersionMap,
        transactions_to_reject: &mut Vec<(Peer, TransactionId)>,
    ) {
        let replay = {
            let mut content = self.content.lock();
            let versioned = Self::versioned_mut(&mut *content, self.object_id);

            let old_version_map = versioned.version_map().clone();
            let mut should_replay = false;

            for (transaction_id, transaction) in transactions {
                assert!(transaction_id.is_valid(), "{transaction_id:?}");
                let origin_peer = transaction.origin_peer().clone();
                if versioned.insert_if_absent(transaction_id, transaction)
                    && transaction_id <= versioned.max_requested_transaction_id()
                {
                    should_replay = true;
                }
                versioned.record_peer_transaction(origin_peer, transaction_id);
            }

            versioned.merge_version_map(version_map);
            versioned.mark_up_to_date(remote_peer);

            should_replay.then(|| (old_version_map, versioned.snapshot_transactions()))
        };

        if let Some((old_version_map, snapshot)) = replay {
            replay_working_version(
                store,
                self,
                &snapshot,
                |peer, id| old_version_map.has_peer_transaction_id(peer, id),
                transactions_to_reject,
            );
        }
    }

    /// Single-transaction insertion. `transaction_is_local` marks
    /// transactions this peer originated, which advance the replay
    /// watermark directly.
    pub(crate) fn insert_transaction(
        &self,
        store: &dyn StoreContext,
        origin_peer: Peer,
        transaction_id: TransactionId,
        events: Vec<CommittedEvent>,
        transaction_is_local: bool,
        transactions_to_reject: &mut Vec<(Peer, TransactionId)>,
    ) {
        assert!(transaction_id.is_valid(), "{transaction_id:?}");

        let replay = {
            let mut content = self.content.lock();
            let versioned = Self::versioned_mut(&mut *content, self.object_id);

            let old_version_map = versioned.version_map().clone();
            let inserted = versioned.insert_if_absent(
                transaction_id,
                SharedObjectTransaction::new(events, origin_peer.clone()),
            );
            versioned.record_peer_transaction(origin_peer.clone(), transaction_id);
            versioned.mark_up_to_date(origin_peer);

            let watermark = versioned.max_requested_transaction_id();
            if transaction_is_local && transaction_id > watermark {
                versioned.raise_max_requested(transaction_id);
            }

            (inserted && transaction_id <= watermark)
                .then(|| (old_version_map, versioned.snapshot_transactions()))
        };

        if let Some((old_version_map, snapshot)) = replay {
            replay_working_version(
                store,
                self,
                &snapshot,
                |peer, id| old_version_map.has_peer_transaction_id(peer, id),
                transactions_to_reject,
            );
        }
    }

    /// Memoizes a terminal state so later reads at (or harmlessly past) the
    /// same sequence point skip the replay.
    pub(crate) fn set_cached_live_object(&self, live_object: Arc<LiveObject>, sequence_point: SequencePoint) {
        let mut content = self.content.lock();
        if let Some(ObjectContent::Versioned(versioned)) = content.as_mut() {
            versioned.set_cached_live_object(live_object, sequence_point);
        }
    }

    fn versioned_mut(
        content: &mut Option<ObjectContent>,
        object_id: ObjectId,
    ) -> &mut VersionedContent {
        match content.get_or_insert_with(|| ObjectContent::Versioned(VersionedContent::new())) {
            ObjectContent::Versioned(versioned) => versioned,
            ObjectContent::Unversioned(_) => {
                panic!("cannot record transactions on unversioned object {object_id}")
            }
        }
    }
}

impl Dump for SharedObject {
    fn dump(&self) -> serde_json::Value {
        let interested: Vec<serde_json::Value> = self
            .interested_peers
            .lock()
            .iter()
            .map(|peer| peer.dump())
            .collect();
        let references: Vec<serde_json::Value> = self
            .object_references
            .lock()
            .iter()
            .map(|reference| reference.dump())
            .collect();
        let content = match &*self.content.lock() {
            None => serde_json::Value::Null,
            Some(content) => content.dump(),
        };
        serde_json::json!({
            "object_id": self.object_id.dump(),
            "interested_peers": interested,
            "object_references": references,
            "object_content": content,
        })
    }
}

impl std::fmt::Debug for SharedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedObject({})", self.object_id)
    }
}

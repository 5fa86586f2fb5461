// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tandem_types::{
    DeserializationContext, Dump, Interpreter, LocalObject, ObjectId, ObjectReference, Payload,
    SerializationContext, TransactionId, Value,
};

use crate::error::EngineError;
use crate::event::{CommittedEvent, SharedObjectTransaction};
use crate::live_object::LiveObject;
use crate::messages::{
    ConnectionHandler, PeerMessage, PeerMessageSender, SendMode, WireEvent, WireObjectTransaction,
    WirePayload, WireTransaction, WireValue,
};
use crate::peers::{Peer, PeerMap};
use crate::pending_event::{project_transaction, PendingEvent, RefKey};
use crate::recording::{RecordingThread, RewindCell};
use crate::sequence_point::SequencePoint;
use crate::sequencer::TransactionSequencer;
use crate::shared_object::SharedObject;
use crate::version_map::MaxVersionMap;

/// Store surface the per-object machinery calls back into during replay.
pub(crate) trait StoreContext: Send + Sync {
    fn find_shared_object(&self, object_id: ObjectId) -> Option<Arc<SharedObject>>;

    /// Promote replay conflicts to panics (debugging aid).
    fn fatal_conflicts(&self) -> bool {
        false
    }
}

/// Where a recording thread stands with respect to a pending rewind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionPhase {
    /// No rewind is pending.
    Normal,
    /// The caller's base transaction is covered by the rewind; unwind.
    Rewind,
    /// A rewind was pending but does not cover the caller; the rewind state
    /// has been cleared and execution may continue.
    Resume,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StoreOptions {
    /// Promote replay conflicts to panics (debugging aid).
    pub fatal_conflicts: bool,
}

struct CurrentSequencePoint {
    point: SequencePoint,
    version_number: u64,
}

/// Owns every shared object on this peer and coordinates the rest of the
/// engine around them: it sequences locally issued transactions, fans them
/// out to interested peers, routes inbound peer messages to per-object
/// insertion, propagates rejections, and signals rewinds to the recording
/// threads.
pub struct TransactionStore {
    local_peer: Peer,
    peer_map: Arc<PeerMap>,
    interpreter: Arc<dyn Interpreter>,
    sequencer: TransactionSequencer,
    options: StoreOptions,

    shared_objects: Mutex<HashMap<ObjectId, Arc<SharedObject>>>,
    named_objects: Mutex<HashSet<ObjectId>>,

    current: Mutex<CurrentSequencePoint>,
    version_changed: Condvar,

    rejected_transaction_id: Mutex<TransactionId>,
    rewinding_cond: Condvar,

    recording_threads: Mutex<Vec<Arc<RewindCell>>>,
}

impl TransactionStore {
    pub fn new(
        local_peer_id: &str,
        peer_map: Arc<PeerMap>,
        sender: Arc<dyn PeerMessageSender>,
        interpreter: Arc<dyn Interpreter>,
        options: StoreOptions,
    ) -> Arc<Self> {
        let local_peer = peer_map.get_peer(local_peer_id);
        let sequencer = TransactionSequencer::new(sender);

        let mut point = SequencePoint::new();
        point.add_peer_transaction_id(local_peer.clone(), sequencer.generate());

        Arc::new(Self {
            local_peer,
            peer_map,
            interpreter,
            sequencer,
            options,
            shared_objects: Mutex::new(HashMap::new()),
            named_objects: Mutex::new(HashSet::new()),
            current: Mutex::new(CurrentSequencePoint {
                point,
                version_number: 1,
            }),
            version_changed: Condvar::new(),
            rejected_transaction_id: Mutex::new(TransactionId::MIN),
            rewinding_cond: Condvar::new(),
            recording_threads: Mutex::new(Vec::new()),
        })
    }

    pub fn local_peer(&self) -> &Peer {
        &self.local_peer
    }

    /// Runs a program to completion on a fresh recording thread. Multiple
    /// programs may run concurrently on the same store, each on its own
    /// thread.
    pub fn run_program(
        self: &Arc<Self>,
        initial: Box<dyn LocalObject>,
        method: &str,
        linger: bool,
    ) -> Value {
        let mut thread = RecordingThread::new(self.clone());
        let cell = thread.rewind_cell();
        self.recording_threads.lock().push(cell.clone());

        let value = thread.run_program(initial, method, linger);

        self.recording_threads
            .lock()
            .retain(|registered| !Arc::ptr_eq(registered, &cell));
        value
    }

    /// Installs a named object whose content is a single immutable live
    /// object. Any attempt to record transactions against it is a fatal
    /// programming error.
    pub fn create_unversioned_object(
        &self,
        name: &str,
        local_object: Box<dyn LocalObject>,
    ) -> ObjectReference {
        let shared_object = self.get_or_create_shared_object(ObjectId::for_name(name));
        shared_object.create_unversioned_content(Arc::new(LiveObject::new(local_object)));
        self.named_objects.lock().insert(shared_object.object_id());
        shared_object.get_or_create_object_reference()
    }

    // ---- surface used by the recording threads ----

    pub(crate) fn get_current_sequence_point(&self) -> SequencePoint {
        self.current.lock().point.clone()
    }

    pub(crate) fn create_unbound_object_reference(&self) -> ObjectReference {
        ObjectReference::new_unbound()
    }

    pub(crate) fn create_bound_object_reference(&self, name: &str) -> ObjectReference {
        if name.is_empty() {
            let shared_object = self.get_or_create_shared_object(ObjectId::random());
            shared_object.get_or_create_object_reference()
        } else {
            let shared_object = self.get_or_create_shared_object(ObjectId::for_name(name));
            self.named_objects.lock().insert(shared_object.object_id());
            shared_object.get_or_create_object_reference()
        }
    }

    /// Reconstructs the state of the referenced object as visible at
    /// `sequence_point`. If the object is not available locally, a
    /// `GetObject` is broadcast; with `wait` the call then blocks until the
    /// replies make the object available. Conflicts discovered along the
    /// way are rejected and propagated before returning.
    pub(crate) fn get_live_object_at_sequence_point(
        &self,
        object_reference: &ObjectReference,
        sequence_point: &SequencePoint,
        wait: bool,
    ) -> Option<Arc<LiveObject>> {
        let object_id = object_reference
            .object_id()
            .expect("only committed objects are fetched, and they are bound");
        let shared_object = self
            .find_shared_object(object_id)
            .expect("bound reference names an existing shared object");

        let mut observed_version = 0u64;
        let mut transactions_to_reject = Vec::new();

        let mut live_object = self.get_working_version_at_current(
            &shared_object,
            sequence_point,
            &mut observed_version,
            &mut transactions_to_reject,
        );

        if live_object.is_none() {
            self.sequencer.broadcast_message(
                &PeerMessage::GetObject { object_id },
                SendMode::Blocking,
            );

            if wait {
                while live_object.is_none() {
                    live_object = self.get_working_version_at_current(
                        &shared_object,
                        sequence_point,
                        &mut observed_version,
                        &mut transactions_to_reject,
                    );
                }
            }
        }

        let new_transaction_id = self.sequencer.reserve_transaction();
        self.reject_transactions_and_send(&transactions_to_reject, new_transaction_id, true);
        self.sequencer.release_transaction(new_transaction_id);

        self.update_current_sequence_point(&self.local_peer, new_transaction_id);

        live_object
    }

    /// Commits one pending transaction: assigns it an id, projects the
    /// linear event stream onto the objects it touches, settles the
    /// identities of objects it created, inserts it everywhere, and fans it
    /// out to interested peers.
    pub(crate) fn create_transaction(
        &self,
        events: Vec<PendingEvent>,
        modified_objects: Vec<(ObjectReference, Arc<LiveObject>)>,
        prev_sequence_point: &SequencePoint,
    ) -> TransactionId {
        let transaction_id = self.sequencer.reserve_transaction();

        let mut object_transactions = Vec::new();
        for (reference, stream) in project_transaction(&events) {
            for event in &stream {
                self.ensure_objects_in_event_exist(event);
            }
            let shared_object = self.ensure_reference_settled(&reference);
            object_transactions.push((shared_object, stream));
        }

        self.apply_transaction_and_send_message(transaction_id, object_transactions);

        self.sequencer.release_transaction(transaction_id);

        // Memoize the post-transaction states so the next read of each
        // modified object skips the replay.
        let mut cached_point = prev_sequence_point.clone();
        cached_point.add_peer_transaction_id(self.local_peer.clone(), transaction_id);
        for (reference, live_object) in modified_objects {
            if let Some(shared_object) =
                reference.object_id().and_then(|id| self.find_shared_object(id))
            {
                shared_object.set_cached_live_object(live_object, cached_point.clone());
            }
        }

        self.update_current_sequence_point(&self.local_peer, transaction_id);

        transaction_id
    }

    /// True iff `a` and `b` name the same shared object: the same handle,
    /// or two handles bound to the same identity.
    pub fn objects_are_identical(&self, a: &ObjectReference, b: &ObjectReference) -> bool {
        ObjectReference::same_identity(a, b)
    }

    /// Where `base_transaction_id` stands relative to a pending rewind.
    /// Observing `Resume` atomically clears the rewind state.
    pub fn get_execution_phase(&self, base_transaction_id: TransactionId) -> ExecutionPhase {
        let mut rejected = self.rejected_transaction_id.lock();

        if *rejected == TransactionId::MIN {
            ExecutionPhase::Normal
        } else if base_transaction_id >= *rejected {
            ExecutionPhase::Rewind
        } else {
            *rejected = TransactionId::MIN;
            ExecutionPhase::Resume
        }
    }

    /// Blocks until a rewind becomes pending, then clears it.
    pub fn wait_for_rewind(&self) {
        let mut rejected = self.rejected_transaction_id.lock();
        while *rejected == TransactionId::MIN {
            self.rewinding_cond.wait(&mut rejected);
        }
        *rejected = TransactionId::MIN;
    }

    // ---- shared object table ----

    fn get_or_create_shared_object(&self, object_id: ObjectId) -> Arc<SharedObject> {
        self.shared_objects
            .lock()
            .entry(object_id)
            .or_insert_with(|| Arc::new(SharedObject::new(object_id)))
            .clone()
    }

    /// Resolves a reference to its shared object, settling the identity of
    /// a not-yet-bound reference (an object created by an in-flight
    /// transaction) with a fresh id. The reference ends up registered on
    /// the object either way.
    fn ensure_reference_settled(&self, reference: &ObjectReference) -> Arc<SharedObject> {
        let object_id = match reference.object_id() {
            Some(object_id) => object_id,
            None => reference.bind_if_unset(ObjectId::random()),
        };
        let shared_object = self.get_or_create_shared_object(object_id);
        shared_object.add_object_reference(reference.clone());
        shared_object
    }

    fn ensure_value_objects_exist(&self, value: &Value) {
        if let Payload::Reference(reference) = value.payload() {
            self.ensure_reference_settled(reference);
        }
    }

    /// Every shared object referenced anywhere in a committed event must
    /// exist before the event is inserted or serialized.
    fn ensure_objects_in_event_exist(&self, event: &CommittedEvent) {
        match event {
            CommittedEvent::ObjectCreation { .. }
            | CommittedEvent::BeginTransaction
            | CommittedEvent::EndTransaction => {}
            CommittedEvent::SubObjectCreation { new_object, .. } => {
                self.ensure_reference_settled(new_object);
            }
            CommittedEvent::MethodCall { parameters, .. }
            | CommittedEvent::SelfMethodCall { parameters, .. } => {
                for parameter in parameters {
                    self.ensure_value_objects_exist(parameter);
                }
            }
            CommittedEvent::SubMethodCall {
                callee, parameters, ..
            } => {
                self.ensure_reference_settled(callee);
                for parameter in parameters {
                    self.ensure_value_objects_exist(parameter);
                }
            }
            CommittedEvent::MethodReturn { value }
            | CommittedEvent::SubMethodReturn { value }
            | CommittedEvent::SelfMethodReturn { value } => {
                self.ensure_value_objects_exist(value);
            }
        }
    }

    // ---- transaction application and rejection ----

    fn get_working_version_at_current(
        &self,
        shared_object: &SharedObject,
        sequence_point: &SequencePoint,
        observed_version: &mut u64,
        transactions_to_reject: &mut Vec<(Peer, TransactionId)>,
    ) -> Option<Arc<LiveObject>> {
        let store_version_map = {
            let mut current = self.current.lock();
            while current.version_number == *observed_version {
                self.version_changed.wait(&mut current);
            }
            *observed_version = current.version_number;
            current.point.version_map().clone()
        };

        tracing::trace!(
            object = %shared_object.object_id(),
            store_version = ?store_version_map,
            requested = ?sequence_point.version_map(),
            "computing working version",
        );

        shared_object.get_working_version(
            self,
            &store_version_map,
            sequence_point,
            transactions_to_reject,
        )
    }

    fn apply_transaction_and_send_message(
        &self,
        transaction_id: TransactionId,
        object_transactions: Vec<(Arc<SharedObject>, Vec<CommittedEvent>)>,
    ) {
        let wire_transactions: Vec<WireObjectTransaction> = object_transactions
            .iter()
            .map(|(shared_object, events)| WireObjectTransaction {
                object_id: shared_object.object_id(),
                events: events.iter().map(|event| self.event_to_wire(event)).collect(),
            })
            .collect();
        let message = PeerMessage::ApplyTransaction {
            transaction_id,
            object_transactions: wire_transactions,
        };

        let affected_objects: Vec<Arc<SharedObject>> = object_transactions
            .iter()
            .map(|(shared_object, _)| shared_object.clone())
            .collect();

        self.apply_transaction(transaction_id, self.local_peer.clone(), object_transactions);

        self.send_message_to_affected_peers(&message, &affected_objects);
    }

    fn apply_transaction(
        &self,
        transaction_id: TransactionId,
        origin_peer: Peer,
        object_transactions: Vec<(Arc<SharedObject>, Vec<CommittedEvent>)>,
    ) {
        let transaction_is_local = origin_peer == self.local_peer;
        let mut transactions_to_reject = Vec::new();

        for (shared_object, events) in object_transactions {
            shared_object.insert_transaction(
                self,
                origin_peer.clone(),
                transaction_id,
                events,
                transaction_is_local,
                &mut transactions_to_reject,
            );
        }

        // Make the transaction visible to readers of the current sequence
        // point, wherever it originated.
        self.update_current_sequence_point(&origin_peer, transaction_id);

        let new_transaction_id = self.sequencer.reserve_transaction();
        self.reject_transactions_and_send(&transactions_to_reject, new_transaction_id, true);
        self.sequencer.release_transaction(new_transaction_id);

        self.update_current_sequence_point(&self.local_peer, new_transaction_id);
    }

    /// Splits rejections into locally originated ones (which become
    /// invalidated ranges, trigger a rewind of the local program, and are
    /// announced with `InvalidateTransactions`) and remote ones (announced
    /// with `RejectTransaction` when `forward` is set). Every path bumps
    /// the version so blocked readers re-examine the world.
    fn reject_transactions_and_send(
        &self,
        transactions_to_reject: &[(Peer, TransactionId)],
        new_transaction_id: TransactionId,
        forward: bool,
    ) {
        {
            let mut current = self.current.lock();
            for (origin_peer, rejected_id) in transactions_to_reject {
                if *origin_peer == self.local_peer {
                    current.point.add_invalidated_range(
                        origin_peer.clone(),
                        *rejected_id,
                        new_transaction_id,
                    );
                } else {
                    current
                        .point
                        .add_rejected_peer(origin_peer.clone(), *rejected_id);
                }
            }
            current.version_number += 1;
            self.version_changed.notify_all();
        }

        let mut invalidate_start: Option<TransactionId> = None;
        let mut remote_rejections: Vec<(String, TransactionId)> = Vec::new();
        for (origin_peer, rejected_id) in transactions_to_reject {
            if *origin_peer == self.local_peer {
                invalidate_start = Some(match invalidate_start {
                    Some(start) => start.min(*rejected_id),
                    None => *rejected_id,
                });
            } else {
                remote_rejections.push((origin_peer.peer_id().to_string(), *rejected_id));
            }
        }

        if let Some(start_transaction_id) = invalidate_start {
            tracing::debug!(
                start = %start_transaction_id,
                end = %new_transaction_id,
                "locally originated transactions rejected, rewinding",
            );

            {
                let mut rejected = self.rejected_transaction_id.lock();
                *rejected = start_transaction_id;
                self.rewinding_cond.notify_all();
            }

            let cells: Vec<Arc<RewindCell>> = self.recording_threads.lock().clone();
            for cell in &cells {
                cell.rewind(start_transaction_id);
            }

            self.sequencer.broadcast_message(
                &PeerMessage::InvalidateTransactions {
                    start_transaction_id,
                    end_transaction_id: new_transaction_id,
                },
                SendMode::Blocking,
            );

            for cell in &cells {
                cell.resume();
            }
        }

        if forward && !remote_rejections.is_empty() {
            self.sequencer.broadcast_message(
                &PeerMessage::RejectTransaction {
                    new_transaction_id,
                    rejected_peers: remote_rejections,
                },
                SendMode::Blocking,
            );
        }
    }

    fn send_message_to_affected_peers(
        &self,
        message: &PeerMessage,
        affected_objects: &[Arc<SharedObject>],
    ) {
        let mut interested: HashSet<Peer> = HashSet::new();
        for shared_object in affected_objects {
            interested.extend(shared_object.interested_peers());
        }
        interested.remove(&self.local_peer);

        for peer in interested {
            self.sequencer
                .send_message_to_remote_peer(&peer, message, SendMode::Blocking);
        }
    }

    fn update_current_sequence_point(&self, origin_peer: &Peer, transaction_id: TransactionId) {
        let mut current = self.current.lock();
        current
            .point
            .add_peer_transaction_id(origin_peer.clone(), transaction_id);
        current.version_number += 1;
        self.version_changed.notify_all();
    }

    // ---- message handlers ----

    fn handle_apply_transaction(
        &self,
        remote_peer: &Peer,
        transaction_id: TransactionId,
        wire_transactions: Vec<WireObjectTransaction>,
    ) {
        if !transaction_id.is_valid() {
            tracing::warn!(
                peer = remote_peer.peer_id(),
                "{}",
                EngineError::InvalidTransactionId(transaction_id),
            );
            return;
        }

        let mut seen: HashSet<ObjectId> = HashSet::new();
        let mut object_transactions = Vec::new();
        for wire_transaction in wire_transactions {
            if !seen.insert(wire_transaction.object_id) {
                tracing::warn!(
                    peer = remote_peer.peer_id(),
                    "{}",
                    EngineError::DuplicateObjectTransaction(wire_transaction.object_id),
                );
                continue;
            }
            // Transactions for objects this peer has never heard of are not
            // materialized here; the history arrives wholesale via
            // GetObject/StoreObject when the object is first needed.
            let Some(shared_object) = self.find_shared_object(wire_transaction.object_id) else {
                continue;
            };
            let events: Vec<CommittedEvent> = wire_transaction
                .events
                .iter()
                .map(|event| self.event_from_wire(event))
                .collect();
            object_transactions.push((shared_object, events));
        }

        self.apply_transaction(transaction_id, remote_peer.clone(), object_transactions);
    }

    fn handle_get_object(&self, remote_peer: &Peer, object_id: ObjectId) {
        let Some(shared_object) = self.find_shared_object(object_id) else {
            tracing::debug!(
                peer = remote_peer.peer_id(),
                "{}; replying with empty history",
                EngineError::UnknownObject(object_id),
            );
            let reply = PeerMessage::StoreObject {
                object_id,
                transactions: Vec::new(),
                peer_versions: Vec::new(),
                interested_peer_ids: Vec::new(),
            };
            self.sequencer
                .send_message_to_remote_peer(remote_peer, &reply, SendMode::NonBlocking);
            return;
        };

        shared_object.add_interested_peer(remote_peer.clone());

        let store_version_map = self.current.lock().point.version_map().clone();
        let (transactions, effective_version) = shared_object.get_transactions(&store_version_map);

        let wire_transactions: Vec<WireTransaction> = transactions
            .iter()
            .map(|(id, transaction)| WireTransaction {
                transaction_id: *id,
                origin_peer_id: transaction.origin_peer().peer_id().to_string(),
                events: transaction
                    .events()
                    .iter()
                    .map(|event| self.event_to_wire(event))
                    .collect(),
            })
            .collect();

        let peer_versions: Vec<(String, TransactionId)> = effective_version
            .entries()
            .map(|(peer, id)| (peer.peer_id().to_string(), *id))
            .collect();

        let interested_peer_ids: Vec<String> = shared_object
            .interested_peers()
            .iter()
            .map(|peer| peer.peer_id().to_string())
            .collect();

        let reply = PeerMessage::StoreObject {
            object_id,
            transactions: wire_transactions,
            peer_versions,
            interested_peer_ids,
        };
        self.sequencer
            .send_message_to_remote_peer(remote_peer, &reply, SendMode::NonBlocking);
    }

    fn handle_store_object(
        &self,
        remote_peer: &Peer,
        object_id: ObjectId,
        wire_transactions: Vec<WireTransaction>,
        peer_versions: Vec<(String, TransactionId)>,
        interested_peer_ids: Vec<String>,
    ) {
        let shared_object = self.get_or_create_shared_object(object_id);

        let mut transactions: BTreeMap<TransactionId, SharedObjectTransaction> = BTreeMap::new();
        for wire_transaction in &wire_transactions {
            if !wire_transaction.transaction_id.is_valid() {
                tracing::warn!(
                    peer = remote_peer.peer_id(),
                    "{}",
                    EngineError::InvalidTransactionId(wire_transaction.transaction_id),
                );
                continue;
            }
            let origin_peer = self.peer_map.get_peer(&wire_transaction.origin_peer_id);
            let events: Vec<CommittedEvent> = wire_transaction
                .events
                .iter()
                .map(|event| self.event_from_wire(event))
                .collect();
            transactions.insert(
                wire_transaction.transaction_id,
                SharedObjectTransaction::new(events, origin_peer),
            );
        }

        let mut version_map = MaxVersionMap::new();
        for (peer_id, transaction_id) in &peer_versions {
            version_map.add_peer_transaction_id(self.peer_map.get_peer(peer_id), *transaction_id);
        }

        let mut transactions_to_reject = Vec::new();
        shared_object.store_transactions(
            self,
            remote_peer.clone(),
            transactions,
            &version_map,
            &mut transactions_to_reject,
        );

        for interested_peer_id in &interested_peer_ids {
            shared_object.add_interested_peer(self.peer_map.get_peer(interested_peer_id));
        }

        let new_transaction_id = self.sequencer.reserve_transaction();
        self.reject_transactions_and_send(&transactions_to_reject, new_transaction_id, true);
        self.sequencer.release_transaction(new_transaction_id);

        // Fold the received frontier into the current sequence point so the
        // stored transactions become visible to local readers.
        for (peer_id, transaction_id) in &peer_versions {
            self.update_current_sequence_point(&self.peer_map.get_peer(peer_id), *transaction_id);
        }
        self.update_current_sequence_point(&self.local_peer, new_transaction_id);
    }

    fn handle_reject_transaction(
        &self,
        remote_peer: &Peer,
        remote_transaction_id: TransactionId,
        rejected_peers: Vec<(String, TransactionId)>,
    ) {
        let transactions_to_reject: Vec<(Peer, TransactionId)> = rejected_peers
            .into_iter()
            .map(|(peer_id, transaction_id)| (self.peer_map.get_peer(&peer_id), transaction_id))
            .collect();

        let new_transaction_id = self.sequencer.reserve_transaction();
        // Do not forward: every peer sees the originator's broadcast.
        self.reject_transactions_and_send(&transactions_to_reject, new_transaction_id, false);
        self.sequencer.release_transaction(new_transaction_id);

        self.update_current_sequence_point(remote_peer, remote_transaction_id);
        self.update_current_sequence_point(&self.local_peer, new_transaction_id);
    }

    fn handle_invalidate_transactions(
        &self,
        remote_peer: &Peer,
        start_transaction_id: TransactionId,
        end_transaction_id: TransactionId,
    ) {
        {
            let mut current = self.current.lock();
            current.point.add_invalidated_range(
                remote_peer.clone(),
                start_transaction_id,
                end_transaction_id,
            );
            current.version_number += 1;
            self.version_changed.notify_all();
        }

        self.update_current_sequence_point(remote_peer, end_transaction_id);
    }

    // ---- wire conversion ----

    fn event_to_wire(&self, event: &CommittedEvent) -> WireEvent {
        match event {
            CommittedEvent::ObjectCreation { live_object } => {
                let mut context = WireSerializationContext {
                    store: self,
                    indices: HashMap::new(),
                    referenced_object_ids: Vec::new(),
                };
                let data = live_object.serialize(&mut context);
                WireEvent::ObjectCreation {
                    data,
                    referenced_object_ids: context.referenced_object_ids,
                }
            }
            CommittedEvent::SubObjectCreation { name, new_object } => WireEvent::SubObjectCreation {
                name: name.clone(),
                new_object_id: self.ensure_reference_settled(new_object).object_id(),
            },
            CommittedEvent::BeginTransaction => WireEvent::BeginTransaction,
            CommittedEvent::EndTransaction => WireEvent::EndTransaction,
            CommittedEvent::MethodCall { method, parameters } => WireEvent::MethodCall {
                method: method.clone(),
                parameters: parameters.iter().map(|value| self.value_to_wire(value)).collect(),
            },
            CommittedEvent::MethodReturn { value } => WireEvent::MethodReturn {
                value: self.value_to_wire(value),
            },
            CommittedEvent::SubMethodCall {
                callee,
                method,
                parameters,
            } => WireEvent::SubMethodCall {
                callee_object_id: self.ensure_reference_settled(callee).object_id(),
                method: method.clone(),
                parameters: parameters.iter().map(|value| self.value_to_wire(value)).collect(),
            },
            CommittedEvent::SubMethodReturn { value } => WireEvent::SubMethodReturn {
                value: self.value_to_wire(value),
            },
            CommittedEvent::SelfMethodCall { method, parameters } => WireEvent::SelfMethodCall {
                method: method.clone(),
                parameters: parameters.iter().map(|value| self.value_to_wire(value)).collect(),
            },
            CommittedEvent::SelfMethodReturn { value } => WireEvent::SelfMethodReturn {
                value: self.value_to_wire(value),
            },
        }
    }

    fn event_from_wire(&self, event: &WireEvent) -> CommittedEvent {
        match event {
            WireEvent::ObjectCreation {
                data,
                referenced_object_ids,
            } => {
                let references: Vec<ObjectReference> = referenced_object_ids
                    .iter()
                    .map(|object_id| {
                        self.get_or_create_shared_object(*object_id)
                            .get_or_create_object_reference()
                    })
                    .collect();
                let mut context = WireDeserializationContext { references };
                let local_object = self.interpreter.deserialize_object(data, &mut context);
                CommittedEvent::ObjectCreation {
                    live_object: Arc::new(LiveObject::new(local_object)),
                }
            }
            WireEvent::SubObjectCreation {
                name,
                new_object_id,
            } => CommittedEvent::SubObjectCreation {
                name: name.clone(),
                new_object: self
                    .get_or_create_shared_object(*new_object_id)
                    .get_or_create_object_reference(),
            },
            WireEvent::BeginTransaction => CommittedEvent::BeginTransaction,
            WireEvent::EndTransaction => CommittedEvent::EndTransaction,
            WireEvent::MethodCall { method, parameters } => CommittedEvent::MethodCall {
                method: method.clone(),
                parameters: parameters.iter().map(|value| self.value_from_wire(value)).collect(),
            },
            WireEvent::MethodReturn { value } => CommittedEvent::MethodReturn {
                value: self.value_from_wire(value),
            },
            WireEvent::SubMethodCall {
                callee_object_id,
                method,
                parameters,
            } => CommittedEvent::SubMethodCall {
                callee: self
                    .get_or_create_shared_object(*callee_object_id)
                    .get_or_create_object_reference(),
                method: method.clone(),
                parameters: parameters.iter().map(|value| self.value_from_wire(value)).collect(),
            },
            WireEvent::SubMethodReturn { value } => CommittedEvent::SubMethodReturn {
                value: self.value_from_wire(value),
            },
            WireEvent::SelfMethodCall { method, parameters } => CommittedEvent::SelfMethodCall {
                method: method.clone(),
                parameters: parameters.iter().map(|value| self.value_from_wire(value)).collect(),
            },
            WireEvent::SelfMethodReturn { value } => CommittedEvent::SelfMethodReturn {
                value: self.value_from_wire(value),
            },
        }
    }

    fn value_to_wire(&self, value: &Value) -> WireValue {
        let payload = match value.payload() {
            Payload::Empty => WirePayload::Empty,
            Payload::Double(v) => WirePayload::Double(*v),
            Payload::Float(v) => WirePayload::Float(*v),
            Payload::Int64(v) => WirePayload::Int64(*v),
            Payload::Uint64(v) => WirePayload::Uint64(*v),
            Payload::Bool(v) => WirePayload::Bool(*v),
            Payload::String(v) => WirePayload::String(v.clone()),
            Payload::Bytes(v) => WirePayload::Bytes(v.clone()),
            Payload::Reference(reference) => {
                WirePayload::ObjectId(self.ensure_reference_settled(reference).object_id())
            }
        };
        WireValue {
            local_type: value.local_type(),
            payload,
        }
    }

    fn value_from_wire(&self, value: &WireValue) -> Value {
        let local_type = value.local_type;
        match &value.payload {
            WirePayload::Empty => Value::empty(local_type),
            WirePayload::Double(v) => Value::double(local_type, *v),
            WirePayload::Float(v) => Value::float(local_type, *v),
            WirePayload::Int64(v) => Value::int64(local_type, *v),
            WirePayload::Uint64(v) => Value::uint64(local_type, *v),
            WirePayload::Bool(v) => Value::bool(local_type, *v),
            WirePayload::String(v) => Value::string(local_type, v.clone()),
            WirePayload::Bytes(v) => Value::bytes(local_type, v.clone()),
            WirePayload::ObjectId(object_id) => Value::reference(
                local_type,
                self.get_or_create_shared_object(*object_id)
                    .get_or_create_object_reference(),
            ),
        }
    }
}

impl StoreContext for TransactionStore {
    fn find_shared_object(&self, object_id: ObjectId) -> Option<Arc<SharedObject>> {
        self.shared_objects.lock().get(&object_id).cloned()
    }

    fn fatal_conflicts(&self) -> bool {
        self.options.fatal_conflicts
    }
}

impl ConnectionHandler for TransactionStore {
    /// Point the new peer at every named object so their histories start
    /// converging.
    fn notify_new_connection(&self, remote_peer: &Peer) {
        let named_objects: Vec<ObjectId> = self.named_objects.lock().iter().copied().collect();
        for object_id in named_objects {
            self.sequencer.send_message_to_remote_peer(
                remote_peer,
                &PeerMessage::GetObject { object_id },
                SendMode::NonBlocking,
            );
        }
    }

    fn handle_message(&self, remote_peer: &Peer, message: PeerMessage) {
        tracing::trace!(peer = remote_peer.peer_id(), ?message, "handling peer message");
        match message {
            PeerMessage::ApplyTransaction {
                transaction_id,
                object_transactions,
            } => self.handle_apply_transaction(remote_peer, transaction_id, object_transactions),
            PeerMessage::GetObject { object_id } => self.handle_get_object(remote_peer, object_id),
            PeerMessage::StoreObject {
                object_id,
                transactions,
                peer_versions,
                interested_peer_ids,
            } => self.handle_store_object(
                remote_peer,
                object_id,
                transactions,
                peer_versions,
                interested_peer_ids,
            ),
            PeerMessage::RejectTransaction {
                new_transaction_id,
                rejected_peers,
            } => self.handle_reject_transaction(remote_peer, new_transaction_id, rejected_peers),
            PeerMessage::InvalidateTransactions {
                start_transaction_id,
                end_transaction_id,
            } => self.handle_invalidate_transactions(
                remote_peer,
                start_transaction_id,
                end_transaction_id,
            ),
        }
    }
}

impl Dump for TransactionStore {
    fn dump(&self) -> serde_json::Value {
        let objects: Vec<serde_json::Value> = self
            .shared_objects
            .lock()
            .values()
            .map(|shared_object| shared_object.dump())
            .collect();
        serde_json::json!({
            "local_peer": self.local_peer.dump(),
            "current_sequence_point": self.current.lock().point.dump(),
            "shared_objects": objects,
        })
    }
}

struct WireSerializationContext<'a> {
    store: &'a TransactionStore,
    indices: HashMap<RefKey, usize>,
    referenced_object_ids: Vec<ObjectId>,
}

impl SerializationContext for WireSerializationContext<'_> {
    fn index_for_reference(&mut self, reference: &ObjectReference) -> usize {
        let key = RefKey(reference.clone());
        if let Some(index) = self.indices.get(&key) {
            return *index;
        }
        let shared_object = self.store.ensure_reference_settled(reference);
        let index = self.referenced_object_ids.len();
        self.referenced_object_ids.push(shared_object.object_id());
        self.indices.insert(key, index);
        index
    }
}

struct WireDeserializationContext {
    references: Vec<ObjectReference>,
}

impl DeserializationContext for WireDeserializationContext {
    fn reference_for_index(&mut self, index: usize) -> ObjectReference {
        match self.references.get(index) {
            Some(reference) => reference.clone(),
            None => {
                tracing::warn!(index, "serialized object references an out-of-range index");
                ObjectReference::new_unbound()
            }
        }
    }
}

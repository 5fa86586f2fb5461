// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tandem_types::{
    CallFailed, LocalObject, MethodContext, MethodResult, ObjectId, ObjectReference, TransactionId,
    Value,
};

use crate::event::CommittedEvent;
use crate::event_matching::{method_call_matches, value_matches, MatchState};
use crate::live_object::LiveObject;
use crate::peers::Peer;
use crate::pending_event::RefKey;
use crate::shared_object::SharedObject;
use crate::store::StoreContext;

/// Replays one shared object's committed event stream, checking the
/// interpreter's behavior against it.
///
/// The caller queues the events of every visible transaction (tagged with
/// their origin), then runs [`replay`](Self::replay): the drained queue
/// drives the interpreter on the caller's thread. A divergence sets the
/// sticky conflict flag, attributed to the transaction owning the event at
/// which it was observed; the remaining queue is discarded.
pub(crate) struct PlaybackContext<'a> {
    store: &'a dyn StoreContext,
    shared_object: &'a SharedObject,
    live_object: Option<Arc<LiveObject>>,
    queue: VecDeque<TaggedEvent<'a>>,
    conflict: Option<(Peer, TransactionId)>,
    /// Transactions in the queued history that begin with this object's
    /// creation.
    self_creation_transactions: HashSet<TransactionId>,
    new_object_references: HashMap<ObjectId, ObjectReference>,
    unbound_object_references: HashSet<RefKey>,
}

struct TaggedEvent<'a> {
    origin_peer: &'a Peer,
    transaction_id: TransactionId,
    event: &'a CommittedEvent,
}

impl<'a> PlaybackContext<'a> {
    pub fn new(store: &'a dyn StoreContext, shared_object: &'a SharedObject) -> Self {
        Self {
            store,
            shared_object,
            live_object: None,
            queue: VecDeque::new(),
            conflict: None,
            self_creation_transactions: HashSet::new(),
            new_object_references: HashMap::new(),
            unbound_object_references: HashSet::new(),
        }
    }

    pub fn queue_transaction(
        &mut self,
        origin_peer: &'a Peer,
        transaction_id: TransactionId,
        events: &'a [CommittedEvent],
    ) {
        if matches!(events.first(), Some(CommittedEvent::ObjectCreation { .. })) {
            self.self_creation_transactions.insert(transaction_id);
        }
        for event in events {
            self.queue.push_back(TaggedEvent {
                origin_peer,
                transaction_id,
                event,
            });
        }
    }

    /// Drains the queue, driving the interpreter. Top-level events must be
    /// method calls; everything nested is consumed by the method context
    /// callbacks re-entering this context.
    pub fn replay(&mut self) {
        while self.conflict.is_none() && self.check_next("METHOD_CALL") {
            self.do_method_call();
        }

        // After a conflict (or a top-level mismatch), dequeue and discard
        // whatever remains.
        while self.has_next() {
            self.next();
        }
    }

    pub fn take_conflict(&mut self) -> Option<(Peer, TransactionId)> {
        self.conflict.take()
    }

    pub fn into_live_object(self) -> Option<Arc<LiveObject>> {
        self.live_object
    }

    /// Advances past object-creation events (seeding the live object from
    /// the first one) and past anything queued before the object exists.
    /// True iff a real event is available.
    fn has_next(&mut self) -> bool {
        loop {
            let Some(front) = self.queue.front() else {
                return false;
            };

            match front.event {
                CommittedEvent::ObjectCreation { live_object } => {
                    if self.live_object.is_none() {
                        self.live_object = Some(live_object.clone_object());
                    }
                    // Already created; drop the duplicate creation.
                    self.queue.pop_front();
                }
                _ => {
                    if self.live_object.is_some() {
                        return true;
                    }
                    // No creation seen yet; this event cannot apply.
                    self.queue.pop_front();
                }
            }
        }
    }

    fn peek(&mut self) -> Option<(&'static str, Peer, TransactionId)> {
        if !self.has_next() {
            return None;
        }
        let front = self.queue.front().expect("has_next checked");
        Some((
            front.event.kind(),
            front.origin_peer.clone(),
            front.transaction_id,
        ))
    }

    fn next(&mut self) -> TaggedEvent<'a> {
        assert!(self.has_next(), "event queue exhausted");
        self.queue.pop_front().expect("has_next checked")
    }

    /// Checks that the next expected event matches what the interpreter
    /// actually did. A kind mismatch is a conflict; an exhausted queue is
    /// not (the replay simply cannot continue).
    fn check_next(&mut self, actual_kind: &'static str) -> bool {
        assert!(self.conflict.is_none());

        let Some((expected_kind, origin_peer, transaction_id)) = self.peek() else {
            return false;
        };

        if expected_kind != actual_kind {
            self.set_conflict(
                origin_peer,
                transaction_id,
                format!("Expected event type {expected_kind} but received {actual_kind}."),
            );
            return false;
        }

        true
    }

    fn set_conflict(&mut self, origin_peer: Peer, transaction_id: TransactionId, description: String) {
        if self.store.fatal_conflicts() {
            panic!("CONFLICT: {description}");
        }
        tracing::debug!(
            object = %self.shared_object.object_id(),
            transaction = %transaction_id,
            "CONFLICT: {description}",
        );
        if self.conflict.is_none() {
            self.conflict = Some((origin_peer, transaction_id));
        }
    }

    /// Replays one top-level method call on this object.
    fn do_method_call(&mut self) {
        assert!(self.conflict.is_none());

        if !self.check_next("METHOD_CALL") {
            return;
        }

        let tagged = self.next();
        let CommittedEvent::MethodCall { method, parameters } = tagged.event else {
            unreachable!("check_next verified the kind");
        };

        if !self.has_next() {
            return;
        }

        let live_object = self.live_object.clone().expect("live object is seeded");
        let self_reference = self.shared_object.get_or_create_object_reference();
        let result = live_object.invoke_method(self, &self_reference, method, parameters);

        if result.is_err() || self.conflict.is_some() || !self.check_next("METHOD_RETURN") {
            return;
        }

        let tagged = self.next();
        let CommittedEvent::MethodReturn { value: expected } = tagged.event else {
            unreachable!("check_next verified the kind");
        };
        let actual = result.expect("checked above");

        let mut state = MatchState {
            store: self.store,
            self_object_id: self.shared_object.object_id(),
            self_creation_transactions: &self.self_creation_transactions,
            current_transaction: tagged.transaction_id,
            new_object_references: &mut self.new_object_references,
            unbound_object_references: &mut self.unbound_object_references,
        };
        if !value_matches(expected, &actual, &mut state) {
            self.set_conflict(
                tagged.origin_peer.clone(),
                tagged.transaction_id,
                "Return value doesn't match expected return value.".to_string(),
            );
        }
    }

    /// Replays a call the object makes on itself.
    fn do_self_method_call(
        &mut self,
        target: &ObjectReference,
        method: &str,
        parameters: &[Value],
    ) -> MethodResult<Value> {
        if !self.check_next("SELF_METHOD_CALL") {
            return Err(CallFailed);
        }

        let tagged = self.next();
        let CommittedEvent::SelfMethodCall {
            method: expected_method,
            parameters: expected_parameters,
        } = tagged.event
        else {
            unreachable!("check_next verified the kind");
        };

        let mut state = MatchState {
            store: self.store,
            self_object_id: self.shared_object.object_id(),
            self_creation_transactions: &self.self_creation_transactions,
            current_transaction: tagged.transaction_id,
            new_object_references: &mut self.new_object_references,
            unbound_object_references: &mut self.unbound_object_references,
        };
        if !method_call_matches(
            self.shared_object,
            expected_method,
            expected_parameters,
            target,
            method,
            parameters,
            &mut state,
        ) {
            self.set_conflict(
                tagged.origin_peer.clone(),
                tagged.transaction_id,
                "Self method call doesn't match expected method call.".to_string(),
            );
            return Err(CallFailed);
        }

        if !self.has_next() {
            return Err(CallFailed);
        }

        let live_object = self.live_object.clone().expect("live object is seeded");
        let value = live_object.invoke_method(self, target, method, parameters)?;

        if self.conflict.is_some() || !self.check_next("SELF_METHOD_RETURN") {
            return Err(CallFailed);
        }

        let tagged = self.next();
        let CommittedEvent::SelfMethodReturn { value: expected } = tagged.event else {
            unreachable!("check_next verified the kind");
        };

        let mut state = MatchState {
            store: self.store,
            self_object_id: self.shared_object.object_id(),
            self_creation_transactions: &self.self_creation_transactions,
            current_transaction: tagged.transaction_id,
            new_object_references: &mut self.new_object_references,
            unbound_object_references: &mut self.unbound_object_references,
        };
        if !value_matches(expected, &value, &mut state) {
            self.set_conflict(
                tagged.origin_peer.clone(),
                tagged.transaction_id,
                "Return value from self method call doesn't match expected value.".to_string(),
            );
            return Err(CallFailed);
        }

        Ok(value)
    }

    /// Replays a call the object makes out to another object. The callee is
    /// not invoked; its recorded return value is used. Re-entrant calls the
    /// callee makes back into this object are replayed in between.
    fn do_sub_method_call(
        &mut self,
        target: &ObjectReference,
        method: &str,
        parameters: &[Value],
    ) -> MethodResult<Value> {
        if !self.check_next("SUB_METHOD_CALL") {
            return Err(CallFailed);
        }

        let tagged = self.next();
        let CommittedEvent::SubMethodCall {
            callee,
            method: expected_method,
            parameters: expected_parameters,
        } = tagged.event
        else {
            unreachable!("check_next verified the kind");
        };

        let origin_peer = tagged.origin_peer.clone();
        let transaction_id = tagged.transaction_id;

        let Some(callee_shared_object) = callee
            .object_id()
            .and_then(|object_id| self.store.find_shared_object(object_id))
        else {
            self.set_conflict(
                origin_peer,
                transaction_id,
                "Sub method call names an unknown callee.".to_string(),
            );
            return Err(CallFailed);
        };

        if callee_shared_object.object_id() == self.shared_object.object_id() {
            self.set_conflict(
                origin_peer,
                transaction_id,
                "Callee is the same as caller, but a self method call was not expected."
                    .to_string(),
            );
            return Err(CallFailed);
        }

        let mut state = MatchState {
            store: self.store,
            self_object_id: self.shared_object.object_id(),
            self_creation_transactions: &self.self_creation_transactions,
            current_transaction: transaction_id,
            new_object_references: &mut self.new_object_references,
            unbound_object_references: &mut self.unbound_object_references,
        };
        if !method_call_matches(
            &callee_shared_object,
            expected_method,
            expected_parameters,
            target,
            method,
            parameters,
            &mut state,
        ) {
            self.set_conflict(
                origin_peer,
                transaction_id,
                "Sub method call doesn't match expected method call.".to_string(),
            );
            return Err(CallFailed);
        }

        // The callee may call back into this object before returning.
        while self.has_next() && self.peek().map(|(kind, _, _)| kind) == Some("METHOD_CALL") {
            self.do_method_call();
            if self.conflict.is_some() {
                return Err(CallFailed);
            }
        }

        if !self.check_next("SUB_METHOD_RETURN") {
            return Err(CallFailed);
        }

        let tagged = self.next();
        let CommittedEvent::SubMethodReturn { value } = tagged.event else {
            unreachable!("check_next verified the kind");
        };

        Ok(value.clone())
    }
}

impl MethodContext for PlaybackContext<'_> {
    fn begin_transaction(&mut self) -> MethodResult<()> {
        if self.conflict.is_some() || !self.check_next("BEGIN_TRANSACTION") {
            return Err(CallFailed);
        }
        self.next();
        if self.has_next() {
            Ok(())
        } else {
            Err(CallFailed)
        }
    }

    fn end_transaction(&mut self) -> MethodResult<()> {
        if self.conflict.is_some() || !self.check_next("END_TRANSACTION") {
            return Err(CallFailed);
        }
        self.next();
        if self.has_next() {
            Ok(())
        } else {
            Err(CallFailed)
        }
    }

    fn create_object(&mut self, initial: Box<dyn LocalObject>, name: &str) -> ObjectReference {
        // The recorded state is authoritative; the replayed initial state is
        // discarded.
        drop(initial);

        if name.is_empty() {
            // Anonymous creation recorded no event. Hand out a fresh
            // placeholder; it pairs with the recorded identity when it is
            // first used in a matched position.
            let reference = ObjectReference::new_unbound();
            self.unbound_object_references
                .insert(RefKey(reference.clone()));
            return reference;
        }

        if self.conflict.is_some() || !self.check_next("SUB_OBJECT_CREATION") {
            return ObjectReference::new_bound(ObjectId::for_name(name));
        }

        let tagged = self.next();
        let CommittedEvent::SubObjectCreation {
            name: expected_name,
            new_object,
        } = tagged.event
        else {
            unreachable!("check_next verified the kind");
        };

        if expected_name != name {
            self.set_conflict(
                tagged.origin_peer.clone(),
                tagged.transaction_id,
                format!(
                    "Expected object {expected_name:?} to be created, but instead object \
                     {name:?} was created."
                ),
            );
            return ObjectReference::new_bound(ObjectId::for_name(name));
        }

        new_object.clone()
    }

    fn call_method(
        &mut self,
        target: &ObjectReference,
        method: &str,
        parameters: &[Value],
    ) -> MethodResult<Value> {
        assert!(!method.is_empty());

        if self.conflict.is_some() || !self.has_next() {
            return Err(CallFailed);
        }

        let value = if self.shared_object.has_object_reference(target) {
            self.do_self_method_call(target, method, parameters)?
        } else {
            self.do_sub_method_call(target, method, parameters)?
        };

        if self.conflict.is_some() || !self.has_next() {
            return Err(CallFailed);
        }

        Ok(value)
    }

    fn objects_are_identical(&self, a: &ObjectReference, b: &ObjectReference) -> bool {
        ObjectReference::same_identity(a, b)
    }
}

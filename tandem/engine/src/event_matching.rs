// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Matching of replayed interpreter behavior against recorded events.
//!
//! The subtlety is anonymous objects: an object created during recording
//! has a settled identity by the time its transaction is replayed, but the
//! replaying interpreter creates its *own* fresh placeholder. A match
//! between a recorded new object and an unbound replay reference pairs the
//! two, permanently binding the replay reference to the recorded identity.

use std::collections::{HashMap, HashSet};

use tandem_types::{ObjectId, ObjectReference, Payload, TransactionId, Value};

use crate::pending_event::RefKey;
use crate::shared_object::SharedObject;
use crate::store::StoreContext;

/// Mutable matching state threaded through one replay pass.
pub(crate) struct MatchState<'a> {
    pub store: &'a dyn StoreContext,
    /// The object whose history is being replayed.
    pub self_object_id: ObjectId,
    /// Transactions in the replayed history that begin with the object's
    /// creation; consulted instead of the object's own content, which is
    /// busy replaying.
    pub self_creation_transactions: &'a HashSet<TransactionId>,
    /// The transaction owning the expected event being matched.
    pub current_transaction: TransactionId,
    /// Recorded objects already paired with a replay reference.
    pub new_object_references: &'a mut HashMap<ObjectId, ObjectReference>,
    /// References the replaying interpreter created but has not yet tied to
    /// a recorded identity.
    pub unbound_object_references: &'a mut HashSet<RefKey>,
}

impl MatchState<'_> {
    fn object_is_new(&self, shared_object: &SharedObject) -> bool {
        if shared_object.object_id() == self.self_object_id {
            self.self_creation_transactions
                .contains(&self.current_transaction)
        } else {
            shared_object.created_in(self.current_transaction)
        }
    }
}

/// Does `reference` (produced by the replaying interpreter) denote
/// `shared_object` (named by the recorded event)?
///
/// True when the reference is already registered on the object; or when the
/// object was born in the transaction being replayed, the reference is a
/// fresh unbound one, and the object has not been paired with a different
/// reference — in which case the match binds them.
pub(crate) fn object_matches(
    shared_object: &SharedObject,
    reference: &ObjectReference,
    state: &mut MatchState<'_>,
) -> bool {
    if shared_object.has_object_reference(reference) {
        return true;
    }

    if let Some(paired) = state.new_object_references.get(&shared_object.object_id()) {
        // The object is already paired; only that exact reference matches.
        return ObjectReference::same_handle(paired, reference);
    }

    let key = RefKey(reference.clone());
    if state.unbound_object_references.contains(&key) && state.object_is_new(shared_object) {
        state
            .new_object_references
            .insert(shared_object.object_id(), reference.clone());
        state.unbound_object_references.remove(&key);

        let bound = reference.bind_if_unset(shared_object.object_id());
        if bound == shared_object.object_id() {
            shared_object.add_object_reference(reference.clone());
        }
        return true;
    }

    false
}

/// Compares a recorded value against a value the replaying interpreter
/// produced, pairing fresh objects through [`object_matches`].
pub(crate) fn value_matches(
    committed_value: &Value,
    pending_value: &Value,
    state: &mut MatchState<'_>,
) -> bool {
    if committed_value.local_type() != pending_value.local_type() {
        return false;
    }

    match (committed_value.payload(), pending_value.payload()) {
        (Payload::Empty, Payload::Empty) => true,
        (Payload::Double(a), Payload::Double(b)) => a == b,
        (Payload::Float(a), Payload::Float(b)) => a == b,
        (Payload::Int64(a), Payload::Int64(b)) => a == b,
        (Payload::Uint64(a), Payload::Uint64(b)) => a == b,
        (Payload::Bool(a), Payload::Bool(b)) => a == b,
        (Payload::String(a), Payload::String(b)) => a == b,
        (Payload::Bytes(a), Payload::Bytes(b)) => a == b,
        (Payload::Reference(committed), Payload::Reference(pending)) => {
            let Some(object_id) = committed.object_id() else {
                // Committed references are always settled; treat a stray
                // unbound one as a plain identity check.
                return ObjectReference::same_identity(committed, pending);
            };
            let Some(shared_object) = state.store.find_shared_object(object_id) else {
                tracing::warn!(object = %object_id, "committed value names an unknown object");
                return false;
            };
            object_matches(&shared_object, pending, state)
        }
        _ => false,
    }
}

/// Compares a recorded method call (target object, name, parameters)
/// against the call the replaying interpreter actually made.
pub(crate) fn method_call_matches(
    expected_shared_object: &SharedObject,
    expected_method: &str,
    expected_parameters: &[Value],
    reference: &ObjectReference,
    method: &str,
    parameters: &[Value],
    state: &mut MatchState<'_>,
) -> bool {
    if !object_matches(expected_shared_object, reference, state) {
        tracing::trace!("objects don't match");
        return false;
    }

    if expected_method != method {
        tracing::trace!(%expected_method, %method, "method names don't match");
        return false;
    }

    if expected_parameters.len() != parameters.len() {
        tracing::trace!(
            expected = expected_parameters.len(),
            actual = parameters.len(),
            "parameter counts don't match",
        );
        return false;
    }

    for (index, (expected, actual)) in
        expected_parameters.iter().zip(parameters.iter()).enumerate()
    {
        if !value_matches(expected, actual, state) {
            tracing::trace!(index, "parameter values don't match");
            return false;
        }
    }

    true
}

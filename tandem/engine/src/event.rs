// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::Arc;

use tandem_types::{Dump, ObjectReference, Value};

use crate::live_object::LiveObject;
use crate::peers::Peer;

/// One observable action in a shared object's committed history.
///
/// Each shared object's transaction carries the projection of the recorded
/// execution onto that object: calls made *on* it (`MethodCall`), calls it
/// made *out* to other objects (`SubMethodCall`/`SubMethodReturn`), calls it
/// made on itself (`SelfMethodCall`/`SelfMethodReturn`), objects it created
/// (`SubObjectCreation`), and its own birth (`ObjectCreation`).
#[derive(Clone)]
pub enum CommittedEvent {
    /// The object came into existence with the given initial state.
    ObjectCreation { live_object: Arc<LiveObject> },
    /// The object created another (named) object while executing a method.
    SubObjectCreation {
        name: String,
        new_object: ObjectReference,
    },
    /// The object began an explicit (possibly nested) transaction.
    BeginTransaction,
    /// The object ended the current explicit transaction.
    EndTransaction,
    /// A method was called on the object.
    MethodCall {
        method: String,
        parameters: Vec<Value>,
    },
    /// The method called on the object returned.
    MethodReturn { value: Value },
    /// The object called a method on another object.
    SubMethodCall {
        callee: ObjectReference,
        method: String,
        parameters: Vec<Value>,
    },
    /// The other object's method returned to this object.
    SubMethodReturn { value: Value },
    /// The object called a method on itself.
    SelfMethodCall {
        method: String,
        parameters: Vec<Value>,
    },
    /// The self-call returned.
    SelfMethodReturn { value: Value },
}

impl CommittedEvent {
    /// Short variant name, used in conflict diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            CommittedEvent::ObjectCreation { .. } => "OBJECT_CREATION",
            CommittedEvent::SubObjectCreation { .. } => "SUB_OBJECT_CREATION",
            CommittedEvent::BeginTransaction => "BEGIN_TRANSACTION",
            CommittedEvent::EndTransaction => "END_TRANSACTION",
            CommittedEvent::MethodCall { .. } => "METHOD_CALL",
            CommittedEvent::MethodReturn { .. } => "METHOD_RETURN",
            CommittedEvent::SubMethodCall { .. } => "SUB_METHOD_CALL",
            CommittedEvent::SubMethodReturn { .. } => "SUB_METHOD_RETURN",
            CommittedEvent::SelfMethodCall { .. } => "SELF_METHOD_CALL",
            CommittedEvent::SelfMethodReturn { .. } => "SELF_METHOD_RETURN",
        }
    }

    /// True for event kinds that cannot change the object's state, which is
    /// what lets a cached live object remain valid across them.
    pub fn is_state_preserving(&self) -> bool {
        matches!(
            self,
            CommittedEvent::MethodCall { .. } | CommittedEvent::SubMethodReturn { .. }
        )
    }
}

impl fmt::Debug for CommittedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommittedEvent::MethodCall { method, parameters }
            | CommittedEvent::SelfMethodCall { method, parameters } => {
                write!(f, "{}({method}/{})", self.kind(), parameters.len())
            }
            CommittedEvent::SubMethodCall {
                callee,
                method,
                parameters,
            } => write!(f, "{}({callee:?}, {method}/{})", self.kind(), parameters.len()),
            _ => write!(f, "{}", self.kind()),
        }
    }
}

impl Dump for CommittedEvent {
    fn dump(&self) -> serde_json::Value {
        let dump_values =
            |values: &[Value]| serde_json::Value::Array(values.iter().map(|v| v.dump()).collect());

        match self {
            CommittedEvent::ObjectCreation { live_object } => {
                serde_json::json!({ "type": self.kind(), "live_object": live_object.dump() })
            }
            CommittedEvent::SubObjectCreation { name, new_object } => {
                serde_json::json!({ "type": self.kind(), "name": name, "new_object": new_object.dump() })
            }
            CommittedEvent::BeginTransaction | CommittedEvent::EndTransaction => {
                serde_json::json!({ "type": self.kind() })
            }
            CommittedEvent::MethodCall { method, parameters }
            | CommittedEvent::SelfMethodCall { method, parameters } => {
                serde_json::json!({
                    "type": self.kind(),
                    "method": method,
                    "parameters": dump_values(parameters),
                })
            }
            CommittedEvent::SubMethodCall {
                callee,
                method,
                parameters,
            } => serde_json::json!({
                "type": self.kind(),
                "callee": callee.dump(),
                "method": method,
                "parameters": dump_values(parameters),
            }),
            CommittedEvent::MethodReturn { value }
            | CommittedEvent::SubMethodReturn { value }
            | CommittedEvent::SelfMethodReturn { value } => {
                serde_json::json!({ "type": self.kind(), "value": value.dump() })
            }
        }
    }
}

/// The atomic unit of commit against one shared object: the events one peer
/// recorded for that object in one transaction. Immutable once inserted
/// into an object's history.
#[derive(Clone)]
pub struct SharedObjectTransaction {
    events: Vec<CommittedEvent>,
    origin_peer: Peer,
}

impl SharedObjectTransaction {
    pub fn new(events: Vec<CommittedEvent>, origin_peer: Peer) -> Self {
        Self { events, origin_peer }
    }

    pub fn events(&self) -> &[CommittedEvent] {
        &self.events
    }

    pub fn origin_peer(&self) -> &Peer {
        &self.origin_peer
    }
}

impl fmt::Debug for SharedObjectTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedObjectTransaction")
            .field("origin_peer", &self.origin_peer)
            .field("events", &self.events)
            .finish()
    }
}

impl Dump for SharedObjectTransaction {
    fn dump(&self) -> serde_json::Value {
        serde_json::json!({
            "origin_peer": self.origin_peer.dump(),
            "events": serde_json::Value::Array(self.events.iter().map(|e| e.dump()).collect()),
        })
    }
}

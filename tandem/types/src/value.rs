// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use bytes::Bytes;

use crate::{Dump, ObjectReference};

/// Payload of a [`Value`].
#[derive(Clone, Debug)]
pub enum Payload {
    Empty,
    Double(f64),
    Float(f32),
    Int64(i64),
    Uint64(u64),
    Bool(bool),
    String(String),
    Bytes(Bytes),
    Reference(ObjectReference),
}

/// A value crossing the interpreter / engine boundary: a method parameter or
/// return value.
///
/// `local_type` is an interpreter-defined tag that the engine compares on
/// equality but otherwise never interprets; it lets an interpreter
/// distinguish, say, its `nil` from its `false` even when both map onto the
/// same engine payload.
#[derive(Clone, Debug)]
pub struct Value {
    local_type: i64,
    payload: Payload,
}

impl Value {
    pub fn empty(local_type: i64) -> Self {
        Self { local_type, payload: Payload::Empty }
    }

    pub fn double(local_type: i64, v: f64) -> Self {
        Self { local_type, payload: Payload::Double(v) }
    }

    pub fn float(local_type: i64, v: f32) -> Self {
        Self { local_type, payload: Payload::Float(v) }
    }

    pub fn int64(local_type: i64, v: i64) -> Self {
        Self { local_type, payload: Payload::Int64(v) }
    }

    pub fn uint64(local_type: i64, v: u64) -> Self {
        Self { local_type, payload: Payload::Uint64(v) }
    }

    pub fn bool(local_type: i64, v: bool) -> Self {
        Self { local_type, payload: Payload::Bool(v) }
    }

    pub fn string(local_type: i64, v: impl Into<String>) -> Self {
        Self { local_type, payload: Payload::String(v.into()) }
    }

    pub fn bytes(local_type: i64, v: impl Into<Bytes>) -> Self {
        Self { local_type, payload: Payload::Bytes(v.into()) }
    }

    pub fn reference(local_type: i64, reference: ObjectReference) -> Self {
        Self { local_type, payload: Payload::Reference(reference) }
    }

    pub fn local_type(&self) -> i64 {
        self.local_type
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn as_reference(&self) -> Option<&ObjectReference> {
        match &self.payload {
            Payload::Reference(reference) => Some(reference),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.payload {
            Payload::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Equality compares the local type and the payload. For object references
/// the payload comparison is the "same shared object" identity check, so two
/// distinct handles bound to the same object compare equal.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if self.local_type != other.local_type {
            return false;
        }
        match (&self.payload, &other.payload) {
            (Payload::Empty, Payload::Empty) => true,
            (Payload::Double(a), Payload::Double(b)) => a == b,
            (Payload::Float(a), Payload::Float(b)) => a == b,
            (Payload::Int64(a), Payload::Int64(b)) => a == b,
            (Payload::Uint64(a), Payload::Uint64(b)) => a == b,
            (Payload::Bool(a), Payload::Bool(b)) => a == b,
            (Payload::String(a), Payload::String(b)) => a == b,
            (Payload::Bytes(a), Payload::Bytes(b)) => a == b,
            (Payload::Reference(a), Payload::Reference(b)) => {
                ObjectReference::same_identity(a, b)
            }
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::Empty => write!(f, "empty"),
            Payload::Double(v) => write!(f, "{v}"),
            Payload::Float(v) => write!(f, "{v}"),
            Payload::Int64(v) => write!(f, "{v}"),
            Payload::Uint64(v) => write!(f, "{v}"),
            Payload::Bool(v) => write!(f, "{v}"),
            Payload::String(v) => write!(f, "{v:?}"),
            Payload::Bytes(v) => write!(f, "{} bytes", v.len()),
            Payload::Reference(v) => write!(f, "{v:?}"),
        }
    }
}

impl Dump for Value {
    fn dump(&self) -> serde_json::Value {
        let payload = match &self.payload {
            Payload::Empty => serde_json::Value::Null,
            Payload::Double(v) => serde_json::json!(v),
            Payload::Float(v) => serde_json::json!(v),
            Payload::Int64(v) => serde_json::json!(v),
            Payload::Uint64(v) => serde_json::json!(v),
            Payload::Bool(v) => serde_json::json!(v),
            Payload::String(v) => serde_json::json!(v),
            Payload::Bytes(v) => serde_json::json!(v.len()),
            Payload::Reference(v) => v.dump(),
        };
        serde_json::json!({ "local_type": self.local_type, "payload": payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectId;

    #[test]
    fn equality_requires_matching_local_type() {
        assert_eq!(Value::string(1, "pear"), Value::string(1, "pear"));
        assert_ne!(Value::string(1, "pear"), Value::string(2, "pear"));
        assert_ne!(Value::empty(0), Value::int64(0, 0));
    }

    #[test]
    fn reference_equality_is_object_identity() {
        let id = ObjectId::random();
        let a = Value::reference(2, ObjectReference::new_bound(id));
        let b = Value::reference(2, ObjectReference::new_bound(id));
        let c = Value::reference(2, ObjectReference::new_bound(ObjectId::random()));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}

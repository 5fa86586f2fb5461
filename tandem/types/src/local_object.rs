// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use bytes::Bytes;

use crate::{Dump, ObjectReference, Value};

/// A method call was cut short: the engine is rewinding past a rejected
/// transaction, or a replay abandoned the call after a conflict. The
/// interpreter must abandon whatever it was doing and propagate this
/// outward; the engine retries from a consistent state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallFailed;

impl fmt::Display for CallFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method call interrupted")
    }
}

impl std::error::Error for CallFailed {}

pub type MethodResult<T> = Result<T, CallFailed>;

/// Hands out dense indices for object references encountered while
/// serializing a local object, so the serialized form can mention objects
/// by position and the engine can translate positions back to identities.
pub trait SerializationContext {
    fn index_for_reference(&mut self, reference: &ObjectReference) -> usize;
}

/// Inverse of [`SerializationContext`]: resolves the indices embedded in a
/// serialized local object back to live references.
pub trait DeserializationContext {
    fn reference_for_index(&mut self, index: usize) -> ObjectReference;
}

/// The interpreter's in-memory representation of one shared object.
///
/// Implementations handle their own interior mutability: `invoke_method`
/// takes `&self`, and may re-enter the engine through the supplied
/// [`MethodContext`] (which may call back into this same object). State
/// must therefore only be locked while it is actually being touched, never
/// across a context call.
pub trait LocalObject: Send + Sync {
    /// Snapshot the current state into an independent object.
    fn clone_box(&self) -> Box<dyn LocalObject>;

    /// Serialize the current state. References to other shared objects are
    /// replaced by indices obtained from `context`.
    fn serialize(&self, context: &mut dyn SerializationContext) -> Bytes;

    /// Execute `method` against this object. All interaction with the rest
    /// of the shared program goes through `context`; `self_reference` is the
    /// reference under which this object is being addressed.
    ///
    /// A `CallFailed` from the context must be propagated out of this method
    /// unchanged, after unwinding any interpreter-side state.
    fn invoke_method(
        &self,
        context: &mut dyn MethodContext,
        self_reference: &ObjectReference,
        method: &str,
        parameters: &[Value],
    ) -> MethodResult<Value>;

    fn dump(&self) -> serde_json::Value;
}

impl Dump for dyn LocalObject {
    fn dump(&self) -> serde_json::Value {
        LocalObject::dump(self)
    }
}

/// Reconstructs local objects from their serialized form. One interpreter
/// instance serves a whole store.
pub trait Interpreter: Send + Sync {
    fn deserialize_object(
        &self,
        data: &[u8],
        context: &mut dyn DeserializationContext,
    ) -> Box<dyn LocalObject>;
}

/// The engine surface a method body sees, identical in shape whether the
/// method is being recorded for the first time or replayed against a peer's
/// transaction history.
pub trait MethodContext {
    fn begin_transaction(&mut self) -> MethodResult<()>;

    fn end_transaction(&mut self) -> MethodResult<()>;

    /// Create a shared object with the given initial state. An empty name
    /// creates an anonymous object; a non-empty name creates (or joins) the
    /// named object every peer derives the same identity for.
    fn create_object(&mut self, initial: Box<dyn LocalObject>, name: &str) -> ObjectReference;

    fn call_method(
        &mut self,
        target: &ObjectReference,
        method: &str,
        parameters: &[Value],
    ) -> MethodResult<Value>;

    fn objects_are_identical(&self, a: &ObjectReference, b: &ObjectReference) -> bool;
}

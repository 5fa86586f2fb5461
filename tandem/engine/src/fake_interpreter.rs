// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! String-append interpreter used by the engine tests: a shared object is a
//! string, `append` mutates it, `get` reads it back. Deterministic, cheap,
//! and expressive enough to exercise replay, conflicts, and rewind.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tandem_types::{
    DeserializationContext, Interpreter, LocalObject, MethodContext, MethodResult,
    ObjectReference, SerializationContext, Value,
};

const SERIALIZATION_PREFIX: &[u8] = b"FakeLocalObject:";

pub(crate) struct FakeLocalObject {
    s: Mutex<String>,
}

impl FakeLocalObject {
    pub const VOID_TYPE: i64 = 0;
    pub const STRING_TYPE: i64 = 1;
    pub const OBJECT_TYPE: i64 = 2;

    pub fn new(s: impl Into<String>) -> Self {
        Self { s: Mutex::new(s.into()) }
    }
}

impl LocalObject for FakeLocalObject {
    fn clone_box(&self) -> Box<dyn LocalObject> {
        Box::new(FakeLocalObject::new(self.s.lock().clone()))
    }

    fn serialize(&self, _context: &mut dyn SerializationContext) -> Bytes {
        let mut data = SERIALIZATION_PREFIX.to_vec();
        data.extend_from_slice(self.s.lock().as_bytes());
        Bytes::from(data)
    }

    fn invoke_method(
        &self,
        _context: &mut dyn MethodContext,
        _self_reference: &ObjectReference,
        method: &str,
        parameters: &[Value],
    ) -> MethodResult<Value> {
        match method {
            "append" => {
                assert_eq!(parameters.len(), 1);
                let appended = parameters[0].as_str().expect("append takes a string");
                self.s.lock().push_str(appended);
                Ok(Value::empty(Self::VOID_TYPE))
            }
            "clear" => {
                assert!(parameters.is_empty());
                self.s.lock().clear();
                Ok(Value::empty(Self::VOID_TYPE))
            }
            "get" => {
                assert!(parameters.is_empty());
                Ok(Value::string(Self::STRING_TYPE, self.s.lock().clone()))
            }
            other => panic!("unrecognized method {other:?}"),
        }
    }

    fn dump(&self) -> serde_json::Value {
        serde_json::json!(self.s.lock().clone())
    }
}

pub(crate) struct FakeInterpreter;

impl Interpreter for FakeInterpreter {
    fn deserialize_object(
        &self,
        data: &[u8],
        _context: &mut dyn DeserializationContext,
    ) -> Box<dyn LocalObject> {
        let s = data
            .strip_prefix(SERIALIZATION_PREFIX)
            .expect("serialized form carries the fake prefix");
        Box::new(FakeLocalObject::new(String::from_utf8_lossy(s).into_owned()))
    }
}

/// A local object whose behavior is supplied by the test as a closure; used
/// to script interpreter behavior that calls back into the engine (object
/// creation, sub-calls, explicit transactions).
pub(crate) struct ScriptedLocalObject {
    label: String,
    #[allow(clippy::type_complexity)]
    script: Arc<
        dyn Fn(&mut dyn MethodContext, &ObjectReference, &str, &[Value]) -> MethodResult<Value>
            + Send
            + Sync,
    >,
}

impl ScriptedLocalObject {
    pub fn new(
        label: impl Into<String>,
        script: impl Fn(&mut dyn MethodContext, &ObjectReference, &str, &[Value]) -> MethodResult<Value>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            script: Arc::new(script),
        }
    }
}

impl LocalObject for ScriptedLocalObject {
    fn clone_box(&self) -> Box<dyn LocalObject> {
        Box::new(Self {
            label: self.label.clone(),
            script: self.script.clone(),
        })
    }

    fn serialize(&self, _context: &mut dyn SerializationContext) -> Bytes {
        Bytes::from(self.label.clone().into_bytes())
    }

    fn invoke_method(
        &self,
        context: &mut dyn MethodContext,
        self_reference: &ObjectReference,
        method: &str,
        parameters: &[Value],
    ) -> MethodResult<Value> {
        (self.script)(context, self_reference, method, parameters)
    }

    fn dump(&self) -> serde_json::Value {
        serde_json::json!({ "scripted": self.label })
    }
}

/// Method context that supports no engine interaction; for tests invoking
/// live objects directly.
pub(crate) struct NullMethodContext;

impl MethodContext for NullMethodContext {
    fn begin_transaction(&mut self) -> MethodResult<()> {
        Ok(())
    }

    fn end_transaction(&mut self) -> MethodResult<()> {
        Ok(())
    }

    fn create_object(
        &mut self,
        _initial: Box<dyn LocalObject>,
        _name: &str,
    ) -> ObjectReference {
        ObjectReference::new_unbound()
    }

    fn call_method(
        &mut self,
        _target: &ObjectReference,
        method: &str,
        _parameters: &[Value],
    ) -> MethodResult<Value> {
        panic!("unexpected engine call {method:?}")
    }

    fn objects_are_identical(&self, a: &ObjectReference, b: &ObjectReference) -> bool {
        ObjectReference::same_identity(a, b)
    }
}

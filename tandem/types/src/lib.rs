// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Identifier, value, and interpreter-facing types shared between the
//! transaction engine and the interpreter adapters that host it.
//!
//! Nothing in this crate knows about peers, transactions histories, or
//! replay; an interpreter adapter compiles against this crate alone.

mod dump;
mod local_object;
mod object_id;
mod object_reference;
mod transaction_id;
mod value;

pub use dump::Dump;
pub use local_object::{
    CallFailed, DeserializationContext, Interpreter, LocalObject, MethodContext, MethodResult,
    SerializationContext,
};
pub use object_id::{ObjectId, OBJECT_NAMESPACE_ID};
pub use object_reference::ObjectReference;
pub use transaction_id::{TransactionId, TransactionIdGenerator};
pub use value::{Payload, Value};

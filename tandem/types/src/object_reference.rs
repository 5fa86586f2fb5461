// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;

use crate::{Dump, ObjectId};

/// Handle naming a shared object.
///
/// A reference may start out *unbound* — a placeholder the recording thread
/// hands to the interpreter before the object's identity is settled — and is
/// later bound to exactly one object id. Binding is one-shot and permanent.
///
/// Cloning a reference yields another handle to the same placeholder; the
/// engine keeps the backing objects alive for the lifetime of the store, so
/// a bound reference can never dangle.
#[derive(Clone)]
pub struct ObjectReference {
    cell: Arc<OnceLock<ObjectId>>,
}

impl ObjectReference {
    pub fn new_unbound() -> Self {
        Self {
            cell: Arc::new(OnceLock::new()),
        }
    }

    pub fn new_bound(object_id: ObjectId) -> Self {
        let cell = OnceLock::new();
        cell.set(object_id).expect("fresh cell");
        Self { cell: Arc::new(cell) }
    }

    /// The bound object id, if the identity has been settled.
    pub fn object_id(&self) -> Option<ObjectId> {
        self.cell.get().copied()
    }

    pub fn is_bound(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Atomically binds this reference to `object_id` if it is still unbound.
    /// Returns the winning binding, which differs from `object_id` when
    /// another thread bound the reference first.
    pub fn bind_if_unset(&self, object_id: ObjectId) -> ObjectId {
        *self.cell.get_or_init(|| object_id)
    }

    /// True when the two handles are the same placeholder, or both are bound
    /// to the same shared object.
    pub fn same_identity(a: &ObjectReference, b: &ObjectReference) -> bool {
        if Arc::ptr_eq(&a.cell, &b.cell) {
            return true;
        }
        matches!((a.object_id(), b.object_id()), (Some(x), Some(y)) if x == y)
    }

    /// True when `a` and `b` are literally the same handle (not merely bound
    /// to the same object).
    pub fn same_handle(a: &ObjectReference, b: &ObjectReference) -> bool {
        Arc::ptr_eq(&a.cell, &b.cell)
    }

    /// Opaque id of this handle, stable for the handle's lifetime. Distinct
    /// live handles have distinct ids; use it to key maps by handle.
    pub fn handle_id(&self) -> usize {
        Arc::as_ptr(&self.cell) as usize
    }
}

impl fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.object_id() {
            Some(id) => write!(f, "ObjectReference({id})"),
            None => write!(f, "ObjectReference(unbound @{:p})", Arc::as_ptr(&self.cell)),
        }
    }
}

impl Dump for ObjectReference {
    fn dump(&self) -> serde_json::Value {
        match self.object_id() {
            Some(id) => id.dump(),
            None => serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_is_one_shot() {
        let reference = ObjectReference::new_unbound();
        assert!(!reference.is_bound());

        let first = ObjectId::random();
        let second = ObjectId::random();
        assert_eq!(reference.bind_if_unset(first), first);
        assert_eq!(reference.bind_if_unset(second), first);
        assert_eq!(reference.object_id(), Some(first));
    }

    #[test]
    fn identity_follows_binding() {
        let id = ObjectId::random();
        let a = ObjectReference::new_bound(id);
        let b = ObjectReference::new_bound(id);
        let c = ObjectReference::new_bound(ObjectId::random());
        let unbound = ObjectReference::new_unbound();

        assert!(ObjectReference::same_identity(&a, &b));
        assert!(!ObjectReference::same_identity(&a, &c));
        assert!(ObjectReference::same_identity(&unbound, &unbound.clone()));
        assert!(!ObjectReference::same_identity(&unbound, &a));

        assert!(!ObjectReference::same_handle(&a, &b));
        assert!(ObjectReference::same_handle(&unbound, &unbound.clone()));
    }
}

// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tandem_types::{
    Dump, LocalObject, MethodContext, MethodResult, ObjectReference, SerializationContext, Value,
};

/// The interpreter's in-memory state of one shared object, held behind a
/// copy-on-write node.
///
/// Cloning a `LiveObject` snapshots the current node; both handles share it
/// until one of them next invokes a method, at which point the invoking
/// handle switches to a private copy. The node lock guards only the pointer
/// swap — it is never held across a call into the interpreter, so methods
/// may re-enter the engine (and this same object) freely.
pub struct LiveObject {
    slot: Mutex<NodeSlot>,
}

struct NodeSlot {
    node: Arc<dyn LocalObject>,
    // Invocations of this handle currently holding a temporary reference to
    // `node`; these do not count as sharing for copy-on-write purposes.
    active_calls: usize,
}

impl LiveObject {
    pub fn new(local_object: Box<dyn LocalObject>) -> Self {
        Self {
            slot: Mutex::new(NodeSlot {
                node: Arc::from(local_object),
                active_calls: 0,
            }),
        }
    }

    /// Snapshots the current state into an independent `LiveObject`. The
    /// node is shared until either side next mutates.
    pub fn clone_object(&self) -> Arc<LiveObject> {
        let slot = self.slot.lock();
        Arc::new(Self {
            slot: Mutex::new(NodeSlot {
                node: slot.node.clone(),
                active_calls: 0,
            }),
        })
    }

    pub fn serialize(&self, context: &mut dyn SerializationContext) -> Bytes {
        let node = self.slot.lock().node.clone();
        node.serialize(context)
    }

    /// Runs `method` against this object's state.
    ///
    /// If the node is shared with snapshots, a private copy is made first so
    /// the snapshots keep observing the pre-call state. A re-entrant call on
    /// the same handle (a method invoking another method on its own object)
    /// sees the in-progress state, not a stale copy.
    pub fn invoke_method(
        &self,
        context: &mut dyn MethodContext,
        self_reference: &ObjectReference,
        method: &str,
        parameters: &[Value],
    ) -> MethodResult<Value> {
        let node = {
            let mut slot = self.slot.lock();
            if Arc::strong_count(&slot.node) > slot.active_calls + 1 {
                slot.node = Arc::from(slot.node.clone_box());
            }
            slot.active_calls += 1;
            slot.node.clone()
        };

        let result = node.invoke_method(context, self_reference, method, parameters);

        self.slot.lock().active_calls -= 1;
        result
    }
}

impl Dump for LiveObject {
    fn dump(&self) -> serde_json::Value {
        let node = self.slot.lock().node.clone();
        node.dump()
    }
}

impl std::fmt::Debug for LiveObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LiveObject({})", self.dump())
    }
}

// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tandem_types::{ObjectId, TransactionId, Value};

use crate::event::CommittedEvent;
use crate::fake_interpreter::FakeLocalObject;
use crate::live_object::LiveObject;
use crate::messages::{PeerMessage, PeerMessageSender, SendMode};
use crate::peers::Peer;
use crate::sequence_point::SequencePoint;
use crate::shared_object::SharedObject;
use crate::store::{StoreContext, TransactionStore};

pub(crate) fn txn_id(n: u64) -> TransactionId {
    TransactionId::new(n, 0, 0)
}

pub(crate) fn sequence_point(entries: &[(&Peer, TransactionId)]) -> SequencePoint {
    let mut point = SequencePoint::new();
    for (peer, transaction_id) in entries {
        point.add_peer_transaction_id((*peer).clone(), *transaction_id);
    }
    point
}

pub(crate) fn creation_events(initial: &str) -> Vec<CommittedEvent> {
    vec![CommittedEvent::ObjectCreation {
        live_object: Arc::new(LiveObject::new(Box::new(FakeLocalObject::new(initial)))),
    }]
}

pub(crate) fn append_events(appended: &str) -> Vec<CommittedEvent> {
    vec![
        CommittedEvent::MethodCall {
            method: "append".to_string(),
            parameters: vec![Value::string(FakeLocalObject::STRING_TYPE, appended)],
        },
        CommittedEvent::MethodReturn {
            value: Value::empty(FakeLocalObject::VOID_TYPE),
        },
    ]
}

pub(crate) fn get_events(expected_result: &str) -> Vec<CommittedEvent> {
    vec![
        CommittedEvent::MethodCall {
            method: "get".to_string(),
            parameters: vec![],
        },
        CommittedEvent::MethodReturn {
            value: Value::string(FakeLocalObject::STRING_TYPE, expected_result),
        },
    ]
}

pub(crate) fn append_get_events(appended: &str, expected_result: &str) -> Vec<CommittedEvent> {
    let mut events = append_events(appended);
    events.extend(get_events(expected_result));
    events
}

/// Minimal store context for exercising a `SharedObject` in isolation.
#[derive(Default)]
pub(crate) struct TestObjectStore {
    objects: Mutex<HashMap<ObjectId, Arc<SharedObject>>>,
}

impl TestObjectStore {
    pub fn add(&self, shared_object: Arc<SharedObject>) {
        self.objects
            .lock()
            .insert(shared_object.object_id(), shared_object);
    }
}

impl StoreContext for TestObjectStore {
    fn find_shared_object(&self, object_id: ObjectId) -> Option<Arc<SharedObject>> {
        self.objects.lock().get(&object_id).cloned()
    }
}

/// Sender that records every outgoing message.
#[derive(Default)]
pub(crate) struct RecordingSender {
    messages: Mutex<Vec<PeerMessage>>,
}

impl RecordingSender {
    pub fn drain(&self) -> Vec<PeerMessage> {
        std::mem::take(&mut self.messages.lock())
    }
}

impl PeerMessageSender for RecordingSender {
    fn send_to(&self, _peer: &Peer, message: &PeerMessage, _mode: SendMode) {
        self.messages.lock().push(message.clone());
    }

    fn broadcast(&self, message: &PeerMessage, _mode: SendMode) {
        self.messages.lock().push(message.clone());
    }
}

/// Sender that routes messages synchronously into other stores, simulating
/// a fully connected network of peers. Also keeps a log for assertions.
#[derive(Default)]
pub(crate) struct LoopbackSender {
    origin: Mutex<Option<Peer>>,
    routes: Mutex<Vec<(String, Weak<TransactionStore>)>>,
    log: Mutex<Vec<PeerMessage>>,
}

impl LoopbackSender {
    pub fn connect(&self, origin: Peer, routes: Vec<(String, &Arc<TransactionStore>)>) {
        *self.origin.lock() = Some(origin);
        *self.routes.lock() = routes
            .into_iter()
            .map(|(peer_id, store)| (peer_id, Arc::downgrade(store)))
            .collect();
    }

    pub fn log(&self) -> Vec<PeerMessage> {
        self.log.lock().clone()
    }

    fn deliver(&self, target_peer_id: Option<&str>, message: &PeerMessage) {
        use crate::messages::ConnectionHandler;

        let origin = self.origin.lock().clone().expect("sender is connected");
        let routes = self.routes.lock().clone();
        for (peer_id, store) in routes {
            if target_peer_id.is_some_and(|target| target != peer_id) {
                continue;
            }
            if let Some(store) = store.upgrade() {
                store.handle_message(&origin, message.clone());
            }
        }
    }
}

impl PeerMessageSender for LoopbackSender {
    fn send_to(&self, peer: &Peer, message: &PeerMessage, _mode: SendMode) {
        self.log.lock().push(message.clone());
        self.deliver(Some(peer.peer_id()), message);
    }

    fn broadcast(&self, message: &PeerMessage, _mode: SendMode) {
        self.log.lock().push(message.clone());
        self.deliver(None, message);
    }
}

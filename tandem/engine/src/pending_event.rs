// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tandem_types::{ObjectReference, Value};

use crate::event::CommittedEvent;
use crate::live_object::LiveObject;

/// Map/set key addressing an [`ObjectReference`] by handle.
#[derive(Clone)]
pub(crate) struct RefKey(pub ObjectReference);

impl PartialEq for RefKey {
    fn eq(&self, other: &Self) -> bool {
        ObjectReference::same_handle(&self.0, &other.0)
    }
}

impl Eq for RefKey {}

impl Hash for RefKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.handle_id().hash(state);
    }
}

/// An object created by the pending transaction, noted at the first event
/// that mentions it. Named objects carry the name so the creating object's
/// stream can pin it.
#[derive(Clone)]
pub(crate) struct NewObjectRecord {
    pub reference: ObjectReference,
    pub name: Option<String>,
}

/// Per-event snapshot of the objects the event touches.
///
/// `new_objects` lists the subset of `live_objects` that this transaction
/// itself created and that have not been committed yet; their creation is
/// materialized into their own event streams when the transaction commits.
#[derive(Default)]
pub(crate) struct TouchedObjects {
    pub live_objects: Vec<(ObjectReference, Arc<LiveObject>)>,
    pub new_objects: Vec<NewObjectRecord>,
}

impl TouchedObjects {
    fn live_object_for(&self, reference: &ObjectReference) -> Option<&Arc<LiveObject>> {
        self.live_objects
            .iter()
            .find(|(r, _)| ObjectReference::same_handle(r, reference))
            .map(|(_, live)| live)
    }
}

/// What the recording thread emits while a transaction is still open: the
/// forward-direction counterpart of [`CommittedEvent`]. `prev` is the object
/// whose method was executing when the event occurred (`None` at the top
/// level of the program).
pub(crate) enum PendingEvent {
    ObjectCreation {
        touched: TouchedObjects,
        prev: Option<ObjectReference>,
        reference: ObjectReference,
        name: Option<String>,
    },
    BeginTransaction {
        prev: ObjectReference,
    },
    EndTransaction {
        prev: ObjectReference,
    },
    MethodCall {
        touched: TouchedObjects,
        prev: Option<ObjectReference>,
        next: ObjectReference,
        method: String,
        parameters: Vec<Value>,
    },
    MethodReturn {
        touched: TouchedObjects,
        prev: ObjectReference,
        next: Option<ObjectReference>,
        value: Value,
    },
}

impl PendingEvent {
    /// The object that was executing when this event was produced.
    pub fn prev(&self) -> Option<&ObjectReference> {
        match self {
            PendingEvent::ObjectCreation { prev, .. } => prev.as_ref(),
            PendingEvent::BeginTransaction { prev } => Some(prev),
            PendingEvent::EndTransaction { prev } => Some(prev),
            PendingEvent::MethodCall { prev, .. } => prev.as_ref(),
            PendingEvent::MethodReturn { prev, .. } => Some(prev),
        }
    }
}

/// Per-object committed event streams produced from one linear pending
/// stream, in first-touch order.
pub(crate) struct ProjectedStreams {
    order: Vec<RefKey>,
    streams: HashMap<RefKey, Vec<CommittedEvent>>,
}

impl ProjectedStreams {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            streams: HashMap::new(),
        }
    }

    fn stream(&mut self, reference: &ObjectReference) -> &mut Vec<CommittedEvent> {
        let key = RefKey(reference.clone());
        if !self.streams.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.streams.entry(key).or_default()
    }

    fn materialize_new_objects(&mut self, touched: &TouchedObjects) {
        for record in &touched.new_objects {
            let live = touched
                .live_object_for(&record.reference)
                .expect("new object carries its live snapshot")
                .clone();
            let stream = self.stream(&record.reference);
            if stream.is_empty() {
                stream.push(CommittedEvent::ObjectCreation { live_object: live });
            }
        }
    }

    pub fn into_streams(self) -> Vec<(ObjectReference, Vec<CommittedEvent>)> {
        let mut streams = self.streams;
        self.order
            .into_iter()
            .map(|key| {
                let events = streams.remove(&key).expect("ordered key has a stream");
                (key.0, events)
            })
            .collect()
    }
}

/// Projects the linear event stream of one pending transaction onto the
/// objects it touches.
///
/// A call from `prev` into `next` is a `SubMethodCall` in the caller's
/// stream and a `MethodCall` in the callee's; a call onto the same object is
/// a single `SelfMethodCall`; returns mirror the calls. Objects created by
/// the transaction get an `ObjectCreation` as the first event of their own
/// stream at first mention, and a named creation additionally pins the name
/// in the creating object's stream.
pub(crate) fn project_transaction(
    events: &[PendingEvent],
) -> Vec<(ObjectReference, Vec<CommittedEvent>)> {
    let mut projected = ProjectedStreams::new();

    for event in events {
        match event {
            PendingEvent::ObjectCreation {
                touched,
                prev,
                reference,
                name,
            } => {
                projected.materialize_new_objects(touched);
                if let (Some(prev), Some(name)) = (prev, name) {
                    projected.stream(prev).push(CommittedEvent::SubObjectCreation {
                        name: name.clone(),
                        new_object: reference.clone(),
                    });
                }
            }
            PendingEvent::BeginTransaction { prev } => {
                projected.stream(prev).push(CommittedEvent::BeginTransaction);
            }
            PendingEvent::EndTransaction { prev } => {
                projected.stream(prev).push(CommittedEvent::EndTransaction);
            }
            PendingEvent::MethodCall {
                touched,
                prev,
                next,
                method,
                parameters,
            } => {
                projected.materialize_new_objects(touched);
                match prev {
                    Some(prev) if ObjectReference::same_identity(prev, next) => {
                        projected.stream(prev).push(CommittedEvent::SelfMethodCall {
                            method: method.clone(),
                            parameters: parameters.clone(),
                        });
                    }
                    Some(prev) => {
                        projected.stream(prev).push(CommittedEvent::SubMethodCall {
                            callee: next.clone(),
                            method: method.clone(),
                            parameters: parameters.clone(),
                        });
                        projected.stream(next).push(CommittedEvent::MethodCall {
                            method: method.clone(),
                            parameters: parameters.clone(),
                        });
                    }
                    None => {
                        projected.stream(next).push(CommittedEvent::MethodCall {
                            method: method.clone(),
                            parameters: parameters.clone(),
                        });
                    }
                }
            }
            PendingEvent::MethodReturn {
                touched,
                prev,
                next,
                value,
            } => {
                projected.materialize_new_objects(touched);
                match next {
                    Some(next) if ObjectReference::same_identity(prev, next) => {
                        projected.stream(prev).push(CommittedEvent::SelfMethodReturn {
                            value: value.clone(),
                        });
                    }
                    Some(next) => {
                        projected.stream(prev).push(CommittedEvent::MethodReturn {
                            value: value.clone(),
                        });
                        projected.stream(next).push(CommittedEvent::SubMethodReturn {
                            value: value.clone(),
                        });
                    }
                    None => {
                        projected.stream(prev).push(CommittedEvent::MethodReturn {
                            value: value.clone(),
                        });
                    }
                }
            }
        }
    }

    projected.into_streams()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_interpreter::FakeLocalObject;
    use tandem_types::Value;

    fn live(s: &str) -> Arc<LiveObject> {
        Arc::new(LiveObject::new(Box::new(FakeLocalObject::new(s))))
    }

    fn touched_new(reference: &ObjectReference, s: &str, name: Option<&str>) -> TouchedObjects {
        TouchedObjects {
            live_objects: vec![(reference.clone(), live(s))],
            new_objects: vec![NewObjectRecord {
                reference: reference.clone(),
                name: name.map(String::from),
            }],
        }
    }

    #[test]
    fn top_level_call_projects_onto_the_callee() {
        let object = ObjectReference::new_unbound();

        let events = vec![
            PendingEvent::MethodCall {
                touched: touched_new(&object, "apple.", None),
                prev: None,
                next: object.clone(),
                method: "append".to_string(),
                parameters: vec![Value::string(1, "banana.")],
            },
            PendingEvent::MethodReturn {
                touched: TouchedObjects::default(),
                prev: object.clone(),
                next: None,
                value: Value::empty(0),
            },
        ];

        let streams = project_transaction(&events);
        assert_eq!(streams.len(), 1);
        let (reference, stream) = &streams[0];
        assert!(ObjectReference::same_handle(reference, &object));
        let kinds: Vec<&str> = stream.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, ["OBJECT_CREATION", "METHOD_CALL", "METHOD_RETURN"]);
    }

    #[test]
    fn cross_object_call_projects_a_sub_call_pair() {
        let caller = ObjectReference::new_unbound();
        let callee = ObjectReference::new_unbound();

        let events = vec![
            PendingEvent::MethodCall {
                touched: touched_new(&caller, "one", None),
                prev: None,
                next: caller.clone(),
                method: "method1".to_string(),
                parameters: vec![],
            },
            PendingEvent::MethodCall {
                touched: touched_new(&callee, "two", None),
                prev: Some(caller.clone()),
                next: callee.clone(),
                method: "method2".to_string(),
                parameters: vec![],
            },
            PendingEvent::MethodReturn {
                touched: TouchedObjects::default(),
                prev: callee.clone(),
                next: Some(caller.clone()),
                value: Value::empty(0),
            },
            PendingEvent::MethodReturn {
                touched: TouchedObjects::default(),
                prev: caller.clone(),
                next: None,
                value: Value::empty(0),
            },
        ];

        let streams = project_transaction(&events);
        assert_eq!(streams.len(), 2);

        let caller_kinds: Vec<&str> = streams[0].1.iter().map(|e| e.kind()).collect();
        assert_eq!(
            caller_kinds,
            [
                "OBJECT_CREATION",
                "METHOD_CALL",
                "SUB_METHOD_CALL",
                "SUB_METHOD_RETURN",
                "METHOD_RETURN",
            ]
        );

        let callee_kinds: Vec<&str> = streams[1].1.iter().map(|e| e.kind()).collect();
        assert_eq!(callee_kinds, ["OBJECT_CREATION", "METHOD_CALL", "METHOD_RETURN"]);
    }

    #[test]
    fn self_call_projects_a_single_pair() {
        let object = ObjectReference::new_unbound();

        let events = vec![
            PendingEvent::MethodCall {
                touched: touched_new(&object, "s", None),
                prev: None,
                next: object.clone(),
                method: "outer".to_string(),
                parameters: vec![],
            },
            PendingEvent::MethodCall {
                touched: TouchedObjects::default(),
                prev: Some(object.clone()),
                next: object.clone(),
                method: "inner".to_string(),
                parameters: vec![],
            },
            PendingEvent::MethodReturn {
                touched: TouchedObjects::default(),
                prev: object.clone(),
                next: Some(object.clone()),
                value: Value::empty(0),
            },
            PendingEvent::MethodReturn {
                touched: TouchedObjects::default(),
                prev: object.clone(),
                next: None,
                value: Value::empty(0),
            },
        ];

        let streams = project_transaction(&events);
        assert_eq!(streams.len(), 1);
        let kinds: Vec<&str> = streams[0].1.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            [
                "OBJECT_CREATION",
                "METHOD_CALL",
                "SELF_METHOD_CALL",
                "SELF_METHOD_RETURN",
                "METHOD_RETURN",
            ]
        );
    }

    #[test]
    fn named_creation_pins_the_name_in_the_creator_stream() {
        let creator = ObjectReference::new_unbound();
        let created = ObjectReference::new_unbound();

        let events = vec![
            PendingEvent::MethodCall {
                touched: touched_new(&creator, "c", None),
                prev: None,
                next: creator.clone(),
                method: "make".to_string(),
                parameters: vec![],
            },
            PendingEvent::ObjectCreation {
                touched: touched_new(&created, "fresh", Some("registry")),
                prev: Some(creator.clone()),
                reference: created.clone(),
                name: Some("registry".to_string()),
            },
            PendingEvent::MethodReturn {
                touched: TouchedObjects::default(),
                prev: creator.clone(),
                next: None,
                value: Value::empty(0),
            },
        ];

        let streams = project_transaction(&events);
        assert_eq!(streams.len(), 2);

        let creator_kinds: Vec<&str> = streams[0].1.iter().map(|e| e.kind()).collect();
        assert_eq!(
            creator_kinds,
            ["OBJECT_CREATION", "METHOD_CALL", "SUB_OBJECT_CREATION", "METHOD_RETURN"]
        );

        match &streams[0].1[2] {
            CommittedEvent::SubObjectCreation { name, new_object } => {
                assert_eq!(name, "registry");
                assert!(ObjectReference::same_handle(new_object, &created));
            }
            other => panic!("unexpected event {other:?}"),
        }

        let created_kinds: Vec<&str> = streams[1].1.iter().map(|e| e.kind()).collect();
        assert_eq!(created_kinds, ["OBJECT_CREATION"]);
    }

    #[test]
    fn begin_end_land_in_the_current_object_stream() {
        let object = ObjectReference::new_unbound();

        let events = vec![
            PendingEvent::MethodCall {
                touched: touched_new(&object, "s", None),
                prev: None,
                next: object.clone(),
                method: "work".to_string(),
                parameters: vec![],
            },
            PendingEvent::BeginTransaction { prev: object.clone() },
            PendingEvent::EndTransaction { prev: object.clone() },
            PendingEvent::MethodReturn {
                touched: TouchedObjects::default(),
                prev: object.clone(),
                next: None,
                value: Value::empty(0),
            },
        ];

        let streams = project_transaction(&events);
        let kinds: Vec<&str> = streams[0].1.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            [
                "OBJECT_CREATION",
                "METHOD_CALL",
                "BEGIN_TRANSACTION",
                "END_TRANSACTION",
                "METHOD_RETURN",
            ]
        );
    }
}

// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::{Condvar, Mutex};
use tandem_types::{
    CallFailed, LocalObject, MethodContext, MethodResult, ObjectReference, Payload, TransactionId,
    Value,
};

use crate::live_object::LiveObject;
use crate::pending_event::{NewObjectRecord, PendingEvent, RefKey, TouchedObjects};
use crate::sequence_point::SequencePoint;
use crate::store::TransactionStore;

/// Rewind state shared between a recording thread and the store.
///
/// The store signals a rewind when some transaction this peer issued has
/// been rejected; whichever thread delivers the signal registers itself as
/// *blocking* and unregisters (resumes) once the rejection has been fully
/// propagated, so the program does not re-execute against a half-updated
/// view.
pub(crate) struct RewindCell {
    state: Mutex<RewindState>,
    rewound: Condvar,
    unblocked: Condvar,
}

struct RewindState {
    rejected_transaction_id: TransactionId,
    blocking_threads: HashSet<ThreadId>,
}

impl RewindCell {
    fn new() -> Self {
        Self {
            state: Mutex::new(RewindState {
                rejected_transaction_id: TransactionId::MIN,
                blocking_threads: HashSet::new(),
            }),
            rewound: Condvar::new(),
            unblocked: Condvar::new(),
        }
    }

    /// Requests a rewind past `rejected_transaction_id` and registers the
    /// calling thread as blocking until it calls [`resume`](Self::resume).
    pub fn rewind(&self, rejected_transaction_id: TransactionId) {
        let mut state = self.state.lock();
        if state.rejected_transaction_id == TransactionId::MIN
            || rejected_transaction_id < state.rejected_transaction_id
        {
            state.rejected_transaction_id = rejected_transaction_id;
            self.rewound.notify_all();
        }
        assert!(
            state.blocking_threads.insert(std::thread::current().id()),
            "thread already blocking this rewind",
        );
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        assert!(
            state.blocking_threads.remove(&std::thread::current().id()),
            "resume without matching rewind",
        );
        if state.blocking_threads.is_empty() {
            self.unblocked.notify_all();
        }
    }

    fn rewinding(&self) -> bool {
        self.state.lock().rejected_transaction_id != TransactionId::MIN
    }
}

struct NewObject {
    live_object: Arc<LiveObject>,
    name: Option<String>,
}

/// The engine surface a locally executing program sees.
///
/// Every interpreter action funnels through here: events accumulate into
/// the open transaction, objects touched for the first time get snapshotted,
/// and closing the outermost transaction hands everything to the store.
/// When a transaction this thread issued is later rejected by replay
/// (locally or on a remote peer), in-flight method calls fail with
/// [`CallFailed`], the stack unwinds to [`run_program`](Self::run_program),
/// and the program is re-executed against the corrected state.
pub struct RecordingThread {
    store: Arc<TransactionStore>,
    rewind: Arc<RewindCell>,

    transaction_level: u32,
    committing_transaction: bool,
    events: Vec<PendingEvent>,
    modified_objects: HashMap<RefKey, Arc<LiveObject>>,
    new_objects: HashMap<RefKey, NewObject>,
    current_object: Option<ObjectReference>,
    current_live_object: Option<Arc<LiveObject>>,
    current_transaction_id: TransactionId,
    sequence_point: Option<SequencePoint>,
}

impl RecordingThread {
    pub fn new(store: Arc<TransactionStore>) -> Self {
        Self {
            store,
            rewind: Arc::new(RewindCell::new()),
            transaction_level: 0,
            committing_transaction: false,
            events: Vec::new(),
            modified_objects: HashMap::new(),
            new_objects: HashMap::new(),
            current_object: None,
            current_live_object: None,
            current_transaction_id: TransactionId::MIN,
            sequence_point: None,
        }
    }

    pub(crate) fn rewind_cell(&self) -> Arc<RewindCell> {
        self.rewind.clone()
    }

    /// Signals from another thread that this program must rewind past
    /// `rejected_transaction_id`. The caller is registered as blocking and
    /// must call [`resume`](Self::resume) when it is safe to re-execute.
    pub fn rewind(&self, rejected_transaction_id: TransactionId) {
        self.rewind.rewind(rejected_transaction_id);
    }

    pub fn resume(&self) {
        self.rewind.resume();
    }

    /// Runs `method` on a fresh object built from `initial`, retrying
    /// whenever a rewind unwinds the program. With `linger`, a completed
    /// program stays parked so late rejections can still rewind it.
    pub fn run_program(
        &mut self,
        initial: Box<dyn LocalObject>,
        method: &str,
        linger: bool,
    ) -> Value {
        let object_reference = self.create_object(initial, "");

        loop {
            match self.call_method(&object_reference, method, &[]) {
                Ok(value) => {
                    if !linger {
                        return value;
                    }

                    // The program completed. Park until a rewind arrives,
                    // then wait out the blocking threads and run it again.
                    let mut state = self.rewind.state.lock();
                    while state.rejected_transaction_id == TransactionId::MIN {
                        self.rewind.rewound.wait(&mut state);
                    }
                    while !state.blocking_threads.is_empty() {
                        self.rewind.unblocked.wait(&mut state);
                    }
                    state.rejected_transaction_id = TransactionId::MIN;
                }
                Err(CallFailed) => {
                    // The whole program was rewound. Wait for every blocking
                    // thread to resume, clear the rewind, and re-execute.
                    let mut state = self.rewind.state.lock();
                    while !state.blocking_threads.is_empty() {
                        self.rewind.unblocked.wait(&mut state);
                    }
                    state.rejected_transaction_id = TransactionId::MIN;
                }
            }
        }
    }

    fn rewinding(&self) -> bool {
        self.rewind.rewinding()
    }

    fn sequence_point(&mut self) -> SequencePoint {
        self.sequence_point
            .get_or_insert_with(|| self.store.get_current_sequence_point())
            .clone()
    }

    /// Fetches the committed state of `object_reference` for writing,
    /// waiting for it to become available if necessary.
    fn get_live_object(&mut self, object_reference: &ObjectReference) -> Arc<LiveObject> {
        let key = RefKey(object_reference.clone());
        // A new object is moved into modified_objects at first touch, so a
        // fetch here always concerns a previously committed object.
        debug_assert!(!self.new_objects.contains_key(&key));

        if let Some(live_object) = self.modified_objects.get(&key) {
            return live_object.clone();
        }

        let sequence_point = self.sequence_point();
        let existing = self
            .store
            .get_live_object_at_sequence_point(object_reference, &sequence_point, true)
            .expect("waiting fetch always yields an object");
        let live_object = existing.clone_object();
        self.modified_objects.insert(key, live_object.clone());
        live_object
    }

    fn check_if_value_is_new(&mut self, value: &Value, touched: &mut TouchedObjects) {
        if let Payload::Reference(reference) = value.payload() {
            let reference = reference.clone();
            self.check_if_object_is_new(Some(&reference), touched);
        }
    }

    /// If `object_reference` was created by this transaction and not yet
    /// mentioned in any event, records it in `touched` (so commit will
    /// materialize its creation) and promotes it into the modified set so
    /// later events in this transaction can use it.
    fn check_if_object_is_new(
        &mut self,
        object_reference: Option<&ObjectReference>,
        touched: &mut TouchedObjects,
    ) {
        let Some(object_reference) = object_reference else {
            return;
        };
        let key = RefKey(object_reference.clone());
        let Some(new_object) = self.new_objects.remove(&key) else {
            return;
        };

        touched
            .live_objects
            .push((object_reference.clone(), new_object.live_object.clone()));
        touched.new_objects.push(NewObjectRecord {
            reference: object_reference.clone(),
            name: new_object.name.clone(),
        });

        let previous = self
            .modified_objects
            .insert(key, new_object.live_object.clone_object());
        assert!(previous.is_none(), "new object already modified");
    }

    fn add_transaction_event(&mut self, event: PendingEvent) {
        let first_event = self.events.is_empty();
        let top_level_start = first_event && event.prev().is_none();
        self.events.push(event);

        if self.transaction_level == 0 && !top_level_start {
            self.commit_transaction();
        }
    }

    fn commit_transaction(&mut self) {
        assert!(!self.events.is_empty());

        // A commit refreshes the sequence point, and recording the events
        // of the next transaction can re-enter here; don't recurse.
        if self.committing_transaction {
            return;
        }
        self.committing_transaction = true;

        while !self.events.is_empty() {
            let events = std::mem::take(&mut self.events);
            let modified_objects: Vec<(ObjectReference, Arc<LiveObject>)> = self
                .modified_objects
                .drain()
                .map(|(key, live_object)| (key.0, live_object))
                .collect();

            let sequence_point = self.sequence_point();
            self.current_transaction_id =
                self.store
                    .create_transaction(events, modified_objects, &sequence_point);

            self.sequence_point = Some(self.store.get_current_sequence_point());
        }

        self.committing_transaction = false;
    }

    /// Invokes the method, retrying when a rewind that does *not* cover this
    /// call interrupts it. Returns `Err` when the rewind covers this call
    /// and the frame must unwind.
    fn call_method_helper(
        &mut self,
        method_call_transaction_id: TransactionId,
        caller_reference: Option<&ObjectReference>,
        callee_reference: &ObjectReference,
        method: &str,
        parameters: &[Value],
    ) -> MethodResult<(Arc<LiveObject>, Value)> {
        loop {
            let caller_live_object = self.current_live_object.clone();
            let callee_live_object = self.get_live_object(callee_reference);

            self.current_object = Some(callee_reference.clone());
            self.current_live_object = Some(callee_live_object.clone());

            let result =
                callee_live_object.invoke_method(self, callee_reference, method, parameters);

            self.current_live_object = caller_live_object;
            self.current_object = caller_reference.cloned();

            let mut state = self.rewind.state.lock();

            if state.rejected_transaction_id == TransactionId::MIN {
                if let Ok(value) = result {
                    assert!(state.blocking_threads.is_empty());
                    return Ok((callee_live_object, value));
                }
                // The interrupting rewind was already resolved by an outer
                // frame; run the method again.
                continue;
            }

            // A rewind is pending. If it covers this call, unwind; otherwise
            // wait for the blocking threads, clear the state, and retry.
            loop {
                if state.rejected_transaction_id <= method_call_transaction_id {
                    return Err(CallFailed);
                }
                if state.blocking_threads.is_empty() {
                    break;
                }
                self.rewind.unblocked.wait(&mut state);
            }
            state.rejected_transaction_id = TransactionId::MIN;
        }
    }
}

impl MethodContext for RecordingThread {
    fn begin_transaction(&mut self) -> MethodResult<()> {
        if self.rewinding() {
            return Err(CallFailed);
        }

        if let Some(current) = self.current_object.clone() {
            let live_object = self
                .current_live_object
                .clone()
                .expect("current object has a live object");
            self.modified_objects.insert(RefKey(current.clone()), live_object);
            self.add_transaction_event(PendingEvent::BeginTransaction { prev: current });
        }

        self.transaction_level += 1;
        Ok(())
    }

    fn end_transaction(&mut self) -> MethodResult<()> {
        assert!(self.transaction_level > 0, "end_transaction without begin");

        if self.rewinding() {
            return Err(CallFailed);
        }

        if let Some(current) = self.current_object.clone() {
            let live_object = self
                .current_live_object
                .clone()
                .expect("current object has a live object");
            self.modified_objects.insert(RefKey(current.clone()), live_object);
            self.add_transaction_event(PendingEvent::EndTransaction { prev: current });
        }

        self.transaction_level -= 1;

        if self.transaction_level == 0 && !self.events.is_empty() {
            self.commit_transaction();
        }

        Ok(())
    }

    fn create_object(&mut self, initial: Box<dyn LocalObject>, name: &str) -> ObjectReference {
        let live_object = Arc::new(LiveObject::new(initial));

        if name.is_empty() {
            // Anonymous: identity stays unsettled until the object is first
            // used by a committed event.
            let reference = self.store.create_unbound_object_reference();
            let inserted = self.new_objects.insert(
                RefKey(reference.clone()),
                NewObject {
                    live_object,
                    name: None,
                },
            );
            assert!(inserted.is_none());
            return reference;
        }

        // Named: every peer derives the same identity, so the object may
        // already exist (here or remotely).
        let reference = self.store.create_bound_object_reference(name);
        let key = RefKey(reference.clone());
        if !self.new_objects.contains_key(&key) && !self.modified_objects.contains_key(&key) {
            self.new_objects.insert(
                key.clone(),
                NewObject {
                    live_object: live_object.clone(),
                    name: Some(name.to_string()),
                },
            );

            // Probe for existing content. As a side effect this broadcasts a
            // GetObject so the named object converges across peers.
            let sequence_point = self.sequence_point();
            if self
                .store
                .get_live_object_at_sequence_point(&reference, &sequence_point, false)
                .is_some()
            {
                // Already known; this thread did not create it after all.
                self.new_objects.remove(&key);
            }
        }

        // Pin the creation in the creating object's stream so a replay sees
        // the same create-by-name call.
        if self.current_object.is_some() {
            let mut touched = TouchedObjects::default();
            self.check_if_object_is_new(Some(&reference.clone()), &mut touched);
            let event = PendingEvent::ObjectCreation {
                touched,
                prev: self.current_object.clone(),
                reference: reference.clone(),
                name: Some(name.to_string()),
            };
            self.add_transaction_event(event);
        }

        reference
    }

    fn call_method(
        &mut self,
        target: &ObjectReference,
        method: &str,
        parameters: &[Value],
    ) -> MethodResult<Value> {
        assert!(!method.is_empty());

        if self.rewinding() {
            return Err(CallFailed);
        }

        let event_count_save = self.events.len();
        let method_call_transaction_id = self.current_transaction_id;
        let caller_reference = self.current_object.clone();

        // Record the method call.
        {
            let mut touched = TouchedObjects::default();
            self.check_if_object_is_new(caller_reference.clone().as_ref(), &mut touched);
            self.check_if_object_is_new(Some(target), &mut touched);
            for parameter in parameters {
                self.check_if_value_is_new(parameter, &mut touched);
            }

            if let Some(caller) = &caller_reference {
                let live_object = self
                    .current_live_object
                    .clone()
                    .expect("current object has a live object");
                self.modified_objects.insert(RefKey(caller.clone()), live_object);
            }

            self.add_transaction_event(PendingEvent::MethodCall {
                touched,
                prev: caller_reference.clone(),
                next: target.clone(),
                method: method.to_string(),
                parameters: parameters.to_vec(),
            });
        }

        match self.call_method_helper(
            method_call_transaction_id,
            caller_reference.as_ref(),
            target,
            method,
            parameters,
        ) {
            Ok((callee_live_object, value)) => {
                // Record the return.
                let mut touched = TouchedObjects::default();
                self.check_if_value_is_new(&value, &mut touched);
                self.modified_objects
                    .insert(RefKey(target.clone()), callee_live_object);

                self.add_transaction_event(PendingEvent::MethodReturn {
                    touched,
                    prev: target.clone(),
                    next: caller_reference,
                    value: value.clone(),
                });

                Ok(value)
            }
            Err(failed) => {
                // This frame is being rewound. If its method-call event has
                // not been committed yet, drop it (and everything after it).
                if self.current_transaction_id == method_call_transaction_id {
                    assert!(self.events.len() >= event_count_save);
                    self.events.truncate(event_count_save);
                }
                Err(failed)
            }
        }
    }

    fn objects_are_identical(&self, a: &ObjectReference, b: &ObjectReference) -> bool {
        ObjectReference::same_identity(a, b)
    }
}

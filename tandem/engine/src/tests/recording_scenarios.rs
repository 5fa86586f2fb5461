// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Recording threads driving a real store: commit policy, replay of the
//! recorded streams, sub-call matching, and rewind.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tandem_types::{Dump, MethodContext, ObjectId, Value};

use crate::fake_interpreter::{FakeInterpreter, FakeLocalObject, ScriptedLocalObject};
use crate::messages::{ConnectionHandler, PeerMessage};
use crate::peers::PeerMap;
use crate::recording::RecordingThread;
use crate::sequence_point::SequencePoint;
use crate::store::{ExecutionPhase, StoreContext, StoreOptions, TransactionStore};
use crate::tests::common::{txn_id, RecordingSender};

fn new_store() -> (Arc<TransactionStore>, Arc<RecordingSender>, Arc<PeerMap>) {
    let peers = Arc::new(PeerMap::new());
    let sender = Arc::new(RecordingSender::default());
    let store = TransactionStore::new(
        "ip/local/1",
        peers.clone(),
        sender.clone(),
        Arc::new(FakeInterpreter),
        StoreOptions::default(),
    );
    (store, sender, peers)
}

/// A sequence point equal to the store's current one except for an
/// unrelated exclusion, which defeats the post-commit cache and forces a
/// real replay.
fn replaying_sequence_point(store: &TransactionStore, peers: &PeerMap) -> SequencePoint {
    let mut point = store.get_current_sequence_point();
    point.add_invalidated_range(peers.get_peer("ip/unrelated/9"), txn_id(1), txn_id(2));
    point
}

#[test]
fn records_commits_and_reads_back() {
    let (store, sender, _peers) = new_store();
    let mut thread = RecordingThread::new(store.clone());

    let object = thread.create_object(Box::new(FakeLocalObject::new("apple.")), "");

    let value = thread
        .call_method(
            &object,
            "append",
            &[Value::string(FakeLocalObject::STRING_TYPE, "banana.")],
        )
        .unwrap();
    assert_eq!(value, Value::empty(FakeLocalObject::VOID_TYPE));

    // The append committed, so a fresh fetch replays (or serves the cached)
    // committed state.
    let value = thread.call_method(&object, "get", &[]).unwrap();
    assert_eq!(
        value,
        Value::string(FakeLocalObject::STRING_TYPE, "apple.banana.")
    );

    // No peers are interested in the object, so nothing was sent.
    assert!(sender.drain().is_empty());
}

#[test]
fn recorded_sub_calls_replay_cleanly() {
    let (store, sender, peers) = new_store();
    let mut thread = RecordingThread::new(store.clone());

    let program = thread.create_object(
        Box::new(ScriptedLocalObject::new("caller", |context, _self_ref, method, _params| {
            assert_eq!(method, "main");
            let other = context.create_object(Box::new(FakeLocalObject::new("x")), "");
            context.call_method(
                &other,
                "append",
                &[Value::string(FakeLocalObject::STRING_TYPE, "banana.")],
            )?;
            // Hand the freshly created object back to the caller, so the
            // recorded return value names it too.
            Ok(Value::reference(FakeLocalObject::OBJECT_TYPE, other))
        })),
        "",
    );

    thread.call_method(&program, "main", &[]).unwrap();

    // Replaying the program object re-runs the script; the anonymous object
    // it creates must re-pair with the recorded identity, and the recorded
    // sub-call must match the one the script makes.
    let point = replaying_sequence_point(&store, &peers);
    let live_object = store.get_live_object_at_sequence_point(&program, &point, false);
    assert!(live_object.is_some());

    // A clean replay rejects nothing.
    assert!(!sender
        .drain()
        .iter()
        .any(|message| matches!(
            message,
            PeerMessage::RejectTransaction { .. } | PeerMessage::InvalidateTransactions { .. }
        )));
}

#[test]
fn diverging_replay_rejects_the_local_transaction() {
    let (store, sender, peers) = new_store();
    let mut thread = RecordingThread::new(store.clone());

    let suffix = Arc::new(Mutex::new("banana.".to_string()));
    let suffix_for_script = suffix.clone();

    let program = thread.create_object(
        Box::new(ScriptedLocalObject::new("caller", move |context, _self_ref, _method, _params| {
            let other = context.create_object(Box::new(FakeLocalObject::new("x")), "");
            let appended = suffix_for_script.lock().clone();
            context.call_method(
                &other,
                "append",
                &[Value::string(FakeLocalObject::STRING_TYPE, appended)],
            )?;
            Ok(Value::empty(FakeLocalObject::VOID_TYPE))
        })),
        "",
    );

    thread.call_method(&program, "main", &[]).unwrap();

    // The interpreter now behaves differently than it did when recording,
    // so replaying the recorded transaction conflicts.
    *suffix.lock() = "durian.".to_string();

    let point = replaying_sequence_point(&store, &peers);
    let live_object = store.get_live_object_at_sequence_point(&program, &point, false);

    // The rejected transaction carried the program object's creation, so no
    // working version survives.
    assert!(live_object.is_none());

    // The rejection is of a locally originated transaction: it is announced
    // as an invalidated range and the store enters the rewind state.
    let messages = sender.drain();
    let invalidation = messages.iter().find_map(|message| match message {
        PeerMessage::InvalidateTransactions {
            start_transaction_id,
            ..
        } => Some(*start_transaction_id),
        _ => None,
    });
    let start = invalidation.expect("local rejection is broadcast as an invalidation");

    assert_eq!(store.get_execution_phase(start), ExecutionPhase::Rewind);
    // A base below the rejection point resumes and clears the state.
    assert_eq!(store.get_execution_phase(txn_id(1)), ExecutionPhase::Resume);
    assert_eq!(store.get_execution_phase(txn_id(1)), ExecutionPhase::Normal);
}

#[test]
fn named_creation_is_pinned_and_replayable() {
    let (store, sender, peers) = new_store();
    let mut thread = RecordingThread::new(store.clone());

    let program = thread.create_object(
        Box::new(ScriptedLocalObject::new("maker", |context, _self_ref, _method, _params| {
            let shelf = context.create_object(Box::new(FakeLocalObject::new("")), "shelf");
            context.call_method(
                &shelf,
                "append",
                &[Value::string(FakeLocalObject::STRING_TYPE, "book.")],
            )?;
            Ok(Value::empty(FakeLocalObject::VOID_TYPE))
        })),
        "",
    );

    thread.call_method(&program, "main", &[]).unwrap();

    // The named object exists under its derived id.
    let shelf = store
        .find_shared_object(ObjectId::for_name("shelf"))
        .expect("named object is registered");
    let current = store.get_current_sequence_point();
    let mut transactions_to_reject = Vec::new();
    let live_object = shelf.get_working_version(
        store.as_ref(),
        current.version_map(),
        &current,
        &mut transactions_to_reject,
    );
    assert_eq!(
        live_object.map(|live| live.dump()),
        Some(serde_json::json!("book."))
    );

    // Replaying the creator requires the replayed interpreter to create the
    // same name, and hands it the same identity.
    let point = replaying_sequence_point(&store, &peers);
    assert!(store
        .get_live_object_at_sequence_point(&program, &point, false)
        .is_some());
    assert!(!sender
        .drain()
        .iter()
        .any(|message| matches!(message, PeerMessage::InvalidateTransactions { .. })));
}

/// Stages shared by the two racing programs and the thread delivering the
/// rejection: both programs park mid-flight, the rejection lands, then both
/// continue into calls that observe the rewind.
#[derive(Default)]
struct RewindGate {
    first_ready: bool,
    second_ready: bool,
    injected: bool,
}

/// A program that appends twice to a fresh object and reads it back,
/// parking between the appends on its first attempt.
fn gated_program(
    label: &'static str,
    attempts: Arc<AtomicUsize>,
    gate: Arc<(Mutex<RewindGate>, Condvar)>,
    mark_ready: fn(&mut RewindGate),
    initial: &'static str,
    appends: [&'static str; 2],
) -> ScriptedLocalObject {
    ScriptedLocalObject::new(label, move |context, _self_ref, method, _params| {
        assert_eq!(method, "main");
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let object = context.create_object(Box::new(FakeLocalObject::new(initial)), "");
        context.call_method(
            &object,
            "append",
            &[Value::string(FakeLocalObject::STRING_TYPE, appends[0])],
        )?;

        if attempt == 1 {
            let (lock, condvar) = &*gate;
            let mut stage = lock.lock();
            mark_ready(&mut stage);
            condvar.notify_all();
            while !stage.injected {
                condvar.wait(&mut stage);
            }
        }

        context.call_method(
            &object,
            "append",
            &[Value::string(FakeLocalObject::STRING_TYPE, appends[1])],
        )?;
        context.call_method(&object, "get", &[])
    })
}

#[test]
fn rejected_programs_rewind_and_reexecute() {
    let (store, _sender, peers) = new_store();

    let gate: Arc<(Mutex<RewindGate>, Condvar)> =
        Arc::new((Mutex::new(RewindGate::default()), Condvar::new()));
    let first_attempts = Arc::new(AtomicUsize::new(0));
    let second_attempts = Arc::new(AtomicUsize::new(0));

    // Two recording threads issue transactions on the same store; the
    // rejection rewinds both, and neither retries before the delivering
    // thread has resumed.
    let second_store = store.clone();
    let second_program = gated_program(
        "second",
        second_attempts.clone(),
        gate.clone(),
        |stage| stage.second_ready = true,
        "uno.",
        ["dos.", "tres."],
    );
    let second = std::thread::spawn(move || {
        second_store.run_program(Box::new(second_program), "main", false)
    });

    // Once both programs are parked mid-flight, another peer rejects this
    // peer's transactions from the very first id, covering everything both
    // programs have committed so far.
    let injector_store = store.clone();
    let injector_gate = gate.clone();
    let remote_peer = peers.get_peer("ip/remote/1");
    let local_peer_id = store.local_peer().peer_id().to_string();
    let injector = std::thread::spawn(move || {
        let (lock, condvar) = &*injector_gate;
        {
            let mut stage = lock.lock();
            while !(stage.first_ready && stage.second_ready) {
                condvar.wait(&mut stage);
            }
        }

        injector_store.handle_message(
            &remote_peer,
            PeerMessage::RejectTransaction {
                new_transaction_id: txn_id(2),
                rejected_peers: vec![(local_peer_id, txn_id(1))],
            },
        );

        let mut stage = lock.lock();
        stage.injected = true;
        condvar.notify_all();
    });

    let first_program = gated_program(
        "first",
        first_attempts.clone(),
        gate.clone(),
        |stage| stage.first_ready = true,
        "apple.",
        ["banana.", "cherry."],
    );
    let first_value = store.run_program(Box::new(first_program), "main", false);

    let second_value = second.join().unwrap();
    injector.join().unwrap();

    // Each program's first attempt was rewound after its calls failed; the
    // second attempts ran to completion against the corrected state.
    assert_eq!(first_attempts.load(Ordering::SeqCst), 2);
    assert_eq!(second_attempts.load(Ordering::SeqCst), 2);
    assert_eq!(
        first_value,
        Value::string(FakeLocalObject::STRING_TYPE, "apple.banana.cherry.")
    );
    assert_eq!(
        second_value,
        Value::string(FakeLocalObject::STRING_TYPE, "uno.dos.tres.")
    );
}

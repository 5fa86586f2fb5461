// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::{Condvar, Mutex};
use tandem_types::{TransactionId, TransactionIdGenerator};

use crate::messages::{PeerMessage, PeerMessageSender, SendMode};
use crate::peers::Peer;

/// Hands out locally issued transaction ids and sequences outgoing
/// messages against them.
///
/// A thread *reserves* an id before building the messages that announce it
/// and *releases* it when they are out. A blocking send waits until no
/// other thread holds an older reservation, so remote peers observe this
/// peer's ids in increasing order; non-blocking sends (queries and replies
/// nothing depends on) pass straight through.
pub(crate) struct TransactionSequencer {
    generator: TransactionIdGenerator,
    sender: Arc<dyn PeerMessageSender>,
    reservations: Mutex<BTreeMap<TransactionId, ThreadId>>,
    released: Condvar,
}

impl TransactionSequencer {
    pub fn new(sender: Arc<dyn PeerMessageSender>) -> Self {
        Self {
            generator: TransactionIdGenerator::new(),
            sender,
            reservations: Mutex::new(BTreeMap::new()),
            released: Condvar::new(),
        }
    }

    pub fn generate(&self) -> TransactionId {
        self.generator.generate()
    }

    pub fn reserve_transaction(&self) -> TransactionId {
        let transaction_id = self.generator.generate();
        self.reservations
            .lock()
            .insert(transaction_id, std::thread::current().id());
        transaction_id
    }

    pub fn release_transaction(&self, transaction_id: TransactionId) {
        let removed = self.reservations.lock().remove(&transaction_id);
        assert!(removed.is_some(), "release of unreserved {transaction_id:?}");
        self.released.notify_all();
    }

    pub fn send_message_to_remote_peer(&self, peer: &Peer, message: &PeerMessage, mode: SendMode) {
        self.wait_for_turn(mode);
        self.sender.send_to(peer, message, mode);
    }

    pub fn broadcast_message(&self, message: &PeerMessage, mode: SendMode) {
        self.wait_for_turn(mode);
        self.sender.broadcast(message, mode);
    }

    /// Blocks while a reservation older than the calling thread's oldest is
    /// outstanding. Reservation holders never wait on younger ones, so this
    /// cannot deadlock.
    fn wait_for_turn(&self, mode: SendMode) {
        if mode != SendMode::Blocking {
            return;
        }

        let current = std::thread::current().id();
        let mut reservations = self.reservations.lock();
        loop {
            match reservations.first_key_value() {
                Some((_, holder)) if *holder != current => {
                    self.released.wait(&mut reservations);
                }
                _ => return,
            }
        }
    }
}

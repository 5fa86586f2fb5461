// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tandem_types::{ObjectId, TransactionId};

use crate::peers::Peer;

/// How urgently the transport must deliver a message. `Blocking` sends may
/// suspend the caller until the transport accepts the message; the engine
/// uses it for anything that other peers' progress depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendMode {
    Blocking,
    NonBlocking,
}

/// The closed set of messages peers exchange. Framing on the wire is the
/// transport's business; [`PeerMessage::to_bytes`]/[`from_bytes`] provide a
/// canonical encoding for transports that want one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PeerMessage {
    /// A committed transaction, fanned out to every peer interested in any
    /// affected object.
    ApplyTransaction {
        transaction_id: TransactionId,
        object_transactions: Vec<WireObjectTransaction>,
    },
    /// Request for an object's full committed history.
    GetObject { object_id: ObjectId },
    /// Reply to `GetObject`: the history, the sender's effective version of
    /// the object, and the peers known to be interested.
    StoreObject {
        object_id: ObjectId,
        transactions: Vec<WireTransaction>,
        peer_versions: Vec<(String, TransactionId)>,
        interested_peer_ids: Vec<String>,
    },
    /// Transactions of *other* peers that the sender found in conflict.
    RejectTransaction {
        new_transaction_id: TransactionId,
        rejected_peers: Vec<(String, TransactionId)>,
    },
    /// The sender invalidated `[start, end)` of its own transactions.
    InvalidateTransactions {
        start_transaction_id: TransactionId,
        end_transaction_id: TransactionId,
    },
}

impl PeerMessage {
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(bcs::to_bytes(self).expect("message serialization cannot fail"))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bcs::Error> {
        bcs::from_bytes(bytes)
    }
}

/// One object's slice of an `ApplyTransaction`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireObjectTransaction {
    pub object_id: ObjectId,
    pub events: Vec<WireEvent>,
}

/// One historical transaction in a `StoreObject` reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireTransaction {
    pub transaction_id: TransactionId,
    pub origin_peer_id: String,
    pub events: Vec<WireEvent>,
}

/// Wire form of a committed event. Object references travel as object ids;
/// live objects travel in the interpreter's serialized form plus the ids of
/// the objects it references.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WireEvent {
    ObjectCreation {
        data: Bytes,
        referenced_object_ids: Vec<ObjectId>,
    },
    SubObjectCreation {
        name: String,
        new_object_id: ObjectId,
    },
    BeginTransaction,
    EndTransaction,
    MethodCall {
        method: String,
        parameters: Vec<WireValue>,
    },
    MethodReturn { value: WireValue },
    SubMethodCall {
        callee_object_id: ObjectId,
        method: String,
        parameters: Vec<WireValue>,
    },
    SubMethodReturn { value: WireValue },
    SelfMethodCall {
        method: String,
        parameters: Vec<WireValue>,
    },
    SelfMethodReturn { value: WireValue },
}

/// Wire form of a value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireValue {
    pub local_type: i64,
    pub payload: WirePayload,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WirePayload {
    Empty,
    Double(f64),
    Float(f32),
    Int64(i64),
    Uint64(u64),
    Bool(bool),
    String(String),
    Bytes(Bytes),
    ObjectId(ObjectId),
}

/// Outbound half of the transport. Implementations deliver `message` to the
/// named peer (or all connected peers); delivery order across peers is not
/// guaranteed and the engine does not rely on it.
pub trait PeerMessageSender: Send + Sync {
    fn send_to(&self, peer: &Peer, message: &PeerMessage, mode: SendMode);
    fn broadcast(&self, message: &PeerMessage, mode: SendMode);
}

/// Inbound half of the transport: the store registers itself as the handler
/// for messages and connection events, which arrive on transport-owned
/// threads.
pub trait ConnectionHandler: Send + Sync {
    fn notify_new_connection(&self, remote_peer: &Peer);
    fn handle_message(&self, remote_peer: &Peer, message: PeerMessage);
}

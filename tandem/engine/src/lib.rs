// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-object transaction engine for a replicated shared-object runtime.
//!
//! Multiple peers appear to execute a single shared program: each peer
//! records what its local threads do to shared objects as streams of events,
//! commits those streams as totally ordered transactions, and replays
//! transactions received from other peers to reconstruct object state on
//! demand. Replays that diverge from the recorded behavior reject the
//! offending transaction, and the peer that originated it rewinds past it
//! and re-executes.
//!
//! The interpreter hosting the program and the network transport connecting
//! peers are collaborators supplied by the embedder, behind the traits in
//! `tandem_types` and the message layer respectively.

mod error;
mod event;
mod event_matching;
mod interval_set;
mod live_object;
mod messages;
mod object_content;
mod peer_exclusion_map;
mod peers;
mod pending_event;
mod playback;
mod recording;
mod sequence_point;
mod sequencer;
mod shared_object;
mod store;
mod version_map;

#[cfg(test)]
mod fake_interpreter;
#[cfg(test)]
mod tests;

pub use error::{EngineError, EngineResult};
pub use event::{CommittedEvent, SharedObjectTransaction};
pub use interval_set::IntervalSet;
pub use live_object::LiveObject;
pub use messages::{
    ConnectionHandler, PeerMessage, PeerMessageSender, SendMode, WireEvent, WireObjectTransaction,
    WirePayload, WireTransaction, WireValue,
};
pub use peer_exclusion_map::PeerExclusionMap;
pub use peers::{Peer, PeerMap};
pub use recording::RecordingThread;
pub use sequence_point::SequencePoint;
pub use shared_object::SharedObject;
pub use store::{ExecutionPhase, StoreOptions, TransactionStore};
pub use version_map::{MaxVersionMap, MinVersionMap, VersionMap};

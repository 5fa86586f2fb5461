// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;
use tandem_types::Dump;

/// Interned peer identity.
///
/// Peers are identified by an opaque string (conventionally
/// `ip/<host>/<port>`). Every id resolves to exactly one interned
/// `CanonicalPeer` per [`PeerMap`], so the cheap pointer comparison on
/// [`Peer`] handles is equivalent to comparing peer ids.
pub struct CanonicalPeer {
    peer_id: String,
}

/// Shared handle to an interned [`CanonicalPeer`]. Equality and hashing are
/// by pointer.
#[derive(Clone)]
pub struct Peer(Arc<CanonicalPeer>);

impl Peer {
    pub fn peer_id(&self) -> &str {
        &self.0.peer_id
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({})", self.0.peer_id)
    }
}

impl Dump for Peer {
    fn dump(&self) -> serde_json::Value {
        serde_json::Value::String(self.0.peer_id.clone())
    }
}

/// Interning table mapping peer-id strings to canonical handles.
pub struct PeerMap {
    peers: DashMap<String, Peer>,
}

impl PeerMap {
    pub fn new() -> Self {
        Self { peers: DashMap::new() }
    }

    pub fn get_peer(&self, peer_id: &str) -> Peer {
        if let Some(existing) = self.peers.get(peer_id) {
            return existing.clone();
        }
        self.peers
            .entry(peer_id.to_string())
            .or_insert_with(|| {
                Peer(Arc::new(CanonicalPeer {
                    peer_id: peer_id.to_string(),
                }))
            })
            .clone()
    }
}

impl Default for PeerMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(peer: &Peer) -> u64 {
        let mut hasher = DefaultHasher::new();
        peer.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn interning_makes_pointer_equality_id_equality() {
        let map = PeerMap::new();
        let a1 = map.get_peer("ip/10.0.0.1/4000");
        let a2 = map.get_peer("ip/10.0.0.1/4000");
        let b = map.get_peer("ip/10.0.0.2/4000");

        assert_eq!(a1, a2);
        assert_eq!(hash_of(&a1), hash_of(&a2));
        assert_ne!(a1, b);
        assert_eq!(a1.peer_id(), "ip/10.0.0.1/4000");
    }

    #[test]
    fn separate_maps_intern_separately() {
        let map1 = PeerMap::new();
        let map2 = PeerMap::new();
        // Same id, different interning domains: not the same handle.
        assert_ne!(map1.get_peer("ip/h/1"), map2.get_peer("ip/h/1"));
    }
}

// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Dump;

/// Namespace under which named-object ids are derived. Every peer computes
/// the same id for the same name, with no coordination.
pub const OBJECT_NAMESPACE_ID: Uuid = Uuid::from_u128(0xab2d_0b40_fe62_11e2_bf8b_000c_2949_fc67);

/// 128-bit identity of a shared object.
///
/// Anonymous objects get a random id; named objects get an id derived
/// deterministically from ([`OBJECT_NAMESPACE_ID`], name).
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(Uuid);

impl ObjectId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn for_name(name: &str) -> Self {
        Self(Uuid::new_v5(&OBJECT_NAMESPACE_ID, name.as_bytes()))
    }

    pub fn high_word(&self) -> u64 {
        (self.0.as_u128() >> 64) as u64
    }

    pub fn low_word(&self) -> u64 {
        self.0.as_u128() as u64
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:016x}", self.high_word(), self.low_word())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Dump for ObjectId {
    fn dump(&self) -> serde_json::Value {
        serde_json::Value::String(format!("{self:?}"))
    }
}

// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

/// Structured diagnostic output.
///
/// Contract: every field that contributes to a component's equality is
/// emitted, so dumps of equal components are equal JSON documents.
pub trait Dump {
    fn dump(&self) -> serde_json::Value;
}

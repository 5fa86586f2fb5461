// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use tandem_types::{ObjectId, TransactionId};
use thiserror::Error;

/// Errors raised while digesting remote peer input.
///
/// These are protocol-level problems: a malformed or inconsistent message
/// from another peer. They are logged and the offending item is skipped;
/// they are never fatal and never cross back out over the network. Local
/// invariant violations, by contrast, are asserts.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("remote peer referenced unknown object {0}")]
    UnknownObject(ObjectId),

    #[error("remote peer sent invalid transaction id {0}")]
    InvalidTransactionId(TransactionId),

    #[error("remote peer sent duplicate object {0} in one transaction")]
    DuplicateObjectTransaction(ObjectId),
}

pub type EngineResult<T> = Result<T, EngineError>;

// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

/// State machine error
#[derive(Debug, Error)]
pub enum Error {
    /// A record is already being tracked under the given key
    #[error("deal state already tracked for key: {0}")]
    AlreadyTracked(String),
    /// No record persisted under the given key
    #[error("no deal state for key: {0}")]
    NotFound(String),
    /// Persisted record was written by an unknown layout version
    #[error("unsupported deal record version: {0}")]
    UnsupportedVersion(u64),
    /// An event's guard rejected the transition for the current state
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    /// The group is shutting down and refuses new events
    #[error("state machine group stopped")]
    Stopped,
    /// In-flight entry functions did not return before the stop deadline
    #[error("timed out waiting for state machines to finish")]
    StopTimeout,
    /// Error originating from the backing store
    #[error(transparent)]
    Store(#[from] db::Error),
    /// Error originating from record encoding
    #[error("{0}")]
    Encoding(String),
}

impl From<fvm_ipld_encoding::Error> for Error {
    fn from(e: fvm_ipld_encoding::Error) -> Error {
        Error::Encoding(e.to_string())
    }
}

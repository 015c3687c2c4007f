// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Retrieval half of the file market: a client locates payload with the
//! query sub-protocol, then fetches it block by block, paying the
//! provider incrementally with payment-channel vouchers at negotiated
//! checkpoints. The provider unseals sectors on demand to serve data it
//! no longer holds unsealed.

pub mod client;
pub mod network;
pub mod node;
pub mod provider;
pub mod types;

pub use client::{ClientDealEnvironment, RetrievalClient};
pub use provider::{
    check_deal_params, DealDecider, ProviderDealEnvironment, ProviderParams, RetrievalProvider,
};

use thiserror::Error as ThisError;

/// Retrieval market error
#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Fsm(#[from] fsm::Error),
    #[error("node: {0}")]
    Node(anyhow::Error),
    #[error("network: {0}")]
    Network(anyhow::Error),
    #[error("{0}")]
    Encoding(String),
}

impl From<fvm_ipld_encoding::Error> for Error {
    fn from(e: fvm_ipld_encoding::Error) -> Error {
        Error::Encoding(e.to_string())
    }
}

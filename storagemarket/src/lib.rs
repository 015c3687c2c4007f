// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Storage half of the file market: a client escrows funds and proposes
//! a deal, pushes the payload to a provider, and both sides track the
//! deal through publish, sealing and activation with one state machine
//! per deal.

pub mod client;
pub mod network;
pub mod node;
pub mod provider;
pub mod types;

pub use client::{ClientDealEnvironment, ProviderInfo, StorageClient};
pub use provider::{DealDecider, PieceIo, ProviderDealEnvironment, StorageProvider};

use async_trait::async_trait;
use cid::Cid;
use ipld::selector::Selector;
use libp2p::PeerId;
use thiserror::Error as ThisError;

/// Payload movement between client and provider, performed by the data
/// transfer subsystem.
#[async_trait]
pub trait DataTransfer: Send + Sync {
    /// Open a push channel streaming the DAG under `base_cid` to `to`.
    /// The voucher ties the channel back to the deal it belongs to.
    async fn open_push_data_channel(
        &self,
        to: PeerId,
        voucher: Cid,
        base_cid: Cid,
        selector: Selector,
    ) -> anyhow::Result<()>;
}

/// Storage market error
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

// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::types::{ClientDeal, MinerDeal};
use async_trait::async_trait;
use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::deal::DealID;
use fvm_shared::sector::SectorNumber;
use market_types::TipSetToken;

/// Where a handed-off piece landed in the provider's sectors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PieceLocation {
    pub sector_id: SectorNumber,
    pub offset: u64,
    pub length: u64,
}

/// Chain operations both sides of the storage market need.
#[async_trait]
pub trait StorageCommonNode: Send + Sync {
    async fn get_chain_head(&self) -> anyhow::Result<(TipSetToken, ChainEpoch)>;

    /// Verify `signature` over `plaintext` against the key `signer`
    /// resolves to at the given tip.
    async fn verify_signature(
        &self,
        signature: &Signature,
        signer: &Address,
        plaintext: &[u8],
        tok: &TipSetToken,
    ) -> anyhow::Result<bool>;

    async fn sign_bytes(&self, signer: &Address, data: &[u8]) -> anyhow::Result<Signature>;

    /// Ensure `addr` holds at least `amount` of escrowed market funds.
    /// Returns the cid of the funding message if one had to be sent, or
    /// `None` if the escrow already suffices.
    async fn ensure_funds(
        &self,
        addr: &Address,
        amount: &BigInt,
        tok: &TipSetToken,
    ) -> anyhow::Result<Option<Cid>>;

    /// Wait for `msg_cid` to land on chain and return its exit code.
    async fn wait_for_message(&self, msg_cid: &Cid) -> anyhow::Result<i64>;

    async fn get_miner_worker_address(
        &self,
        miner: &Address,
        tok: &TipSetToken,
    ) -> anyhow::Result<Address>;
}

/// Chain operations of the deal-proposing client.
#[async_trait]
pub trait StorageClientNode: StorageCommonNode {
    /// Confirm the provider's publish message includes this deal and
    /// return the on-chain deal id it was assigned.
    async fn validate_published_deal(&self, deal: &ClientDeal) -> anyhow::Result<DealID>;

    /// Resolves once the deal's sector is proven, or with the failure
    /// that prevented it.
    async fn on_deal_sector_committed(
        &self,
        provider: &Address,
        deal_id: DealID,
    ) -> anyhow::Result<()>;
}

/// Chain operations of the deal-accepting provider.
#[async_trait]
pub trait StorageProviderNode: StorageCommonNode {
    /// Send the publish message for the deal. Returns the message cid.
    async fn publish_deals(&self, deal: &MinerDeal) -> anyhow::Result<Cid>;

    /// Wait for the publish message to land and return the deal id it
    /// assigned to this proposal.
    async fn wait_for_published_deal(&self, publish_cid: &Cid) -> anyhow::Result<DealID>;

    /// Hand the deal's payload off to the sealing subsystem. Returns
    /// where the piece was staged so it can be indexed for retrieval.
    async fn on_deal_complete(
        &self,
        deal: &MinerDeal,
        piece_size: u64,
    ) -> anyhow::Result<PieceLocation>;

    /// Resolves once the deal's sector is proven.
    async fn on_deal_sector_committed(
        &self,
        provider: &Address,
        deal_id: DealID,
    ) -> anyhow::Result<()>;
}

// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::types::SignedVoucher;
use async_trait::async_trait;
use futures::AsyncRead;
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::sector::SectorNumber;
use market_types::TipSetToken;

/// Chain operations of the paying retrieval client.
#[async_trait]
pub trait RetrievalClientNode: Send + Sync {
    /// Get the payment channel between `client` and `miner`, funding it
    /// with `funds` or creating it if need be. Resolves once the channel
    /// is usable on chain.
    async fn get_or_create_payment_channel(
        &self,
        client: &Address,
        miner: &Address,
        funds: &BigInt,
    ) -> anyhow::Result<Address>;

    /// Allocate a fresh voucher lane in the channel.
    async fn allocate_lane(&self, payment_channel: &Address) -> anyhow::Result<u64>;

    /// Create and sign a voucher for `amount` on the lane.
    async fn create_payment_voucher(
        &self,
        payment_channel: &Address,
        lane: u64,
        amount: &BigInt,
    ) -> anyhow::Result<SignedVoucher>;
}

/// Chain operations of the serving retrieval provider.
#[async_trait]
pub trait RetrievalProviderNode: Send + Sync {
    async fn get_chain_head(&self) -> anyhow::Result<(TipSetToken, ChainEpoch)>;

    async fn get_miner_worker_address(
        &self,
        miner: &Address,
        tok: &TipSetToken,
    ) -> anyhow::Result<Address>;

    /// Unseal `length` bytes at `offset` of the sector and stream back
    /// the raw piece bytes as a CAR.
    async fn unseal_sector(
        &self,
        sector_id: SectorNumber,
        offset: u64,
        length: u64,
    ) -> anyhow::Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Submit a voucher to the payment channel registry, which enforces
    /// at-most-once redemption per lane and amount. Returns the amount
    /// the voucher added on top of what the channel already held.
    async fn save_voucher(
        &self,
        payment_channel: &Address,
        voucher: &SignedVoucher,
        proof: &[u8],
        expected: &BigInt,
    ) -> anyhow::Result<BigInt>;
}

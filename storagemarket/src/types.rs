// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::Cbor;
use fvm_shared::address::Address;
use fvm_shared::bigint::{bigint_ser, BigInt};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::deal::DealID;
use fvm_shared::piece::PaddedPieceSize;
use libp2p::PeerId;
use market_types::{peerid_ser, PaymentInfo};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Payload is pushed to the provider with a data-transfer channel.
pub const TRANSFER_TYPE_GRAPHSYNC: &str = "graphsync";
/// Payload is delivered out of band and the provider is told when it
/// has landed.
pub const TRANSFER_TYPE_MANUAL: &str = "manual";

/// Lifecycle stage of a storage deal. The same catalog is used on both
/// sides of the protocol and on the wire, so codes are stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageDealStatus {
    Unknown,
    ProposalNotFound,
    ProposalRejected,
    ProposalAccepted,
    Staged,
    Sealing,
    Active,
    Failing,
    NotFound,
    FundsEnsured,
    WaitingForDataRequest,
    Validating,
    Transferring,
    WaitingForData,
    VerifyData,
    EnsureProviderFunds,
    EnsureClientFunds,
    ProviderFunding,
    ClientFunding,
    Publish,
    Publishing,
    Error,
}

impl StorageDealStatus {
    pub fn code(&self) -> u64 {
        use StorageDealStatus::*;
        match self {
            Unknown => 0,
            ProposalNotFound => 1,
            ProposalRejected => 2,
            ProposalAccepted => 3,
            Staged => 4,
            Sealing => 5,
            Active => 6,
            Failing => 7,
            NotFound => 8,
            FundsEnsured => 9,
            WaitingForDataRequest => 10,
            Validating => 11,
            Transferring => 12,
            WaitingForData => 13,
            VerifyData => 14,
            EnsureProviderFunds => 15,
            EnsureClientFunds => 16,
            ProviderFunding => 17,
            ClientFunding => 18,
            Publish => 19,
            Publishing => 20,
            Error => 21,
        }
    }

    pub fn from_code(code: u64) -> StorageDealStatus {
        use StorageDealStatus::*;
        match code {
            0 => Unknown,
            1 => ProposalNotFound,
            2 => ProposalRejected,
            3 => ProposalAccepted,
            4 => Staged,
            5 => Sealing,
            6 => Active,
            7 => Failing,
            8 => NotFound,
            9 => FundsEnsured,
            10 => WaitingForDataRequest,
            11 => Validating,
            12 => Transferring,
            13 => WaitingForData,
            14 => VerifyData,
            15 => EnsureProviderFunds,
            16 => EnsureClientFunds,
            17 => ProviderFunding,
            18 => ClientFunding,
            19 => Publish,
            20 => Publishing,
            _ => Error,
        }
    }
}

impl fmt::Display for StorageDealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl Serialize for StorageDealStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.code().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StorageDealStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let code: u64 = Deserialize::deserialize(deserializer)?;
        Ok(StorageDealStatus::from_code(code))
    }
}

/// Terms of a storage deal as published on chain. Payment is linear
/// between `start_epoch` and `end_epoch` at `storage_price_per_epoch`.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DealProposal {
    pub piece_cid: Cid,
    pub piece_size: PaddedPieceSize,
    pub client: Address,
    pub provider: Address,
    /// Arbitrary client chosen label to apply to the deal
    pub label: String,
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
    #[serde(with = "bigint_ser")]
    pub storage_price_per_epoch: BigInt,
    #[serde(with = "bigint_ser")]
    pub provider_collateral: BigInt,
    #[serde(with = "bigint_ser")]
    pub client_collateral: BigInt,
}

impl Cbor for DealProposal {}

impl DealProposal {
    pub fn duration(&self) -> ChainEpoch {
        self.end_epoch - self.start_epoch
    }

    pub fn total_storage_fee(&self) -> BigInt {
        self.storage_price_per_epoch.clone() * self.duration() as u64
    }

    /// Escrow the client must hold in the market actor for this deal.
    pub fn client_balance_requirement(&self) -> BigInt {
        &self.client_collateral + self.total_storage_fee()
    }
}

/// A [`DealProposal`] signed by the proposing client.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct ClientDealProposal {
    pub proposal: DealProposal,
    pub client_signature: Signature,
}

impl Cbor for ClientDealProposal {}

/// Where deal payload comes from and how it travels to the provider.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DataRef {
    pub transfer_type: String,
    pub root: Cid,
}

/// Storage deal tracked by the proposing client.
#[derive(Clone, Debug, Serialize_tuple, Deserialize_tuple)]
pub struct ClientDeal {
    pub proposal_cid: Cid,
    pub proposal: ClientDealProposal,
    pub state: StorageDealStatus,
    #[serde(with = "peerid_ser")]
    pub miner: PeerId,
    pub miner_worker: Address,
    /// On-chain deal id, assigned when the publish message lands
    pub deal_id: Option<DealID>,
    pub data_ref: DataRef,
    pub message: String,
    pub publish_message: Option<Cid>,
    pub add_funds_cid: Option<Cid>,
    pub payment_info: Option<PaymentInfo>,
    pub connection_closed: bool,
}

/// Storage deal tracked by the receiving provider.
#[derive(Clone, Debug, Serialize_tuple, Deserialize_tuple)]
pub struct MinerDeal {
    pub proposal_cid: Cid,
    pub proposal: ClientDealProposal,
    #[serde(with = "peerid_ser")]
    pub client: PeerId,
    pub state: StorageDealStatus,
    pub piece_ref: DataRef,
    pub message: String,
    pub deal_id: Option<DealID>,
    pub publish_cid: Option<Cid>,
    pub add_funds_cid: Option<Cid>,
    pub connection_closed: bool,
}

/// Initial message on a deal stream: the signed proposal plus a
/// reference to the payload to transfer.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DealProposalMessage {
    pub deal_proposal: ClientDealProposal,
    pub piece: DataRef,
}

impl Cbor for DealProposalMessage {}

/// Provider progress report on a deal stream.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct Response {
    pub state: StorageDealStatus,
    pub message: String,
    /// Proposal the provider is responding to
    pub proposal: Cid,
    /// Set once the provider has put the publish message on chain
    pub publish_message: Option<Cid>,
}

impl Cbor for Response {}

/// [`Response`] signed by the provider's worker key.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct SignedResponse {
    pub response: Response,
    pub signature: Signature,
}

impl Cbor for SignedResponse {}

/// Terms under which a provider is willing to accept deals.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct StorageAsk {
    #[serde(with = "bigint_ser")]
    pub price: BigInt,
    pub min_piece_size: PaddedPieceSize,
    pub miner: Address,
    pub timestamp: ChainEpoch,
    pub expiry: ChainEpoch,
    pub seq_no: u64,
}

impl Cbor for StorageAsk {}

#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct SignedStorageAsk {
    pub ask: StorageAsk,
    pub signature: Signature,
}

impl Cbor for SignedStorageAsk {}

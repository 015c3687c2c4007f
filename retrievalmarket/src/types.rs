// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::{serde_bytes, Cbor};
use fvm_shared::address::Address;
use fvm_shared::bigint::{bigint_ser, BigInt};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::Signature;
use ipld::selector::Selector;
use libp2p::PeerId;
use market_types::{peerid_ser, PaymentInfo};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Client-local identifier of a retrieval deal.
pub type DealId = u64;

/// Default price per delivered payload byte, in the smallest token unit.
pub fn default_price_per_byte() -> BigInt {
    BigInt::from(2u8)
}

/// Default number of bytes delivered between payment checkpoints.
pub const DEFAULT_PAYMENT_INTERVAL: u64 = 1 << 20;

/// Default growth of the checkpoint interval after each payment.
pub const DEFAULT_PAYMENT_INTERVAL_INCREASE: u64 = 1 << 20;

/// Lifecycle stage of a retrieval deal. Shared by both sides and used
/// on the wire in deal responses, so codes are stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DealStatus {
    New,
    PaymentChannelCreating,
    Accepted,
    FundsNeeded,
    Ongoing,
    FundsNeededLastPayment,
    BlocksComplete,
    Finalizing,
    Completed,
    DealNotFound,
    Errored,
    Failing,
    Rejected,
    Unsealing,
    InsufficientFunds,
    Suspended,
}

impl DealStatus {
    pub fn code(&self) -> u64 {
        use DealStatus::*;
        match self {
            New => 0,
            PaymentChannelCreating => 1,
            Accepted => 2,
            FundsNeeded => 3,
            Ongoing => 4,
            FundsNeededLastPayment => 5,
            BlocksComplete => 6,
            Finalizing => 7,
            Completed => 8,
            DealNotFound => 9,
            Errored => 10,
            Failing => 11,
            Rejected => 12,
            Unsealing => 13,
            InsufficientFunds => 14,
            Suspended => 15,
        }
    }

    pub fn from_code(code: u64) -> DealStatus {
        use DealStatus::*;
        match code {
            0 => New,
            1 => PaymentChannelCreating,
            2 => Accepted,
            3 => FundsNeeded,
            4 => Ongoing,
            5 => FundsNeededLastPayment,
            6 => BlocksComplete,
            7 => Finalizing,
            8 => Completed,
            9 => DealNotFound,
            11 => Failing,
            12 => Rejected,
            13 => Unsealing,
            14 => InsufficientFunds,
            15 => Suspended,
            _ => Errored,
        }
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl Serialize for DealStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.code().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DealStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let code: u64 = Deserialize::deserialize(deserializer)?;
        Ok(DealStatus::from_code(code))
    }
}

/// Negotiable terms of a retrieval deal.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct Params {
    /// Traversal over the payload DAG; `None` retrieves everything
    pub selector: Option<Selector>,
    /// Restrict retrieval to a specific piece holding the payload
    pub piece_cid: Option<Cid>,
    #[serde(with = "bigint_ser")]
    pub price_per_byte: BigInt,
    pub payment_interval: u64,
    pub payment_interval_increase: u64,
}

impl Params {
    pub fn new(price_per_byte: BigInt, payment_interval: u64, payment_interval_increase: u64) -> Self {
        Self {
            selector: None,
            piece_cid: None,
            price_per_byte,
            payment_interval,
            payment_interval_increase,
        }
    }
}

impl Default for Params {
    fn default() -> Self {
        Self::new(
            default_price_per_byte(),
            DEFAULT_PAYMENT_INTERVAL,
            DEFAULT_PAYMENT_INTERVAL_INCREASE,
        )
    }
}

/// Short-lived question to a provider: can this payload be retrieved,
/// and on what terms?
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct Query {
    pub payload_cid: Cid,
    pub params: QueryParams,
}

impl Cbor for Query {}

#[derive(Clone, Debug, Default, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct QueryParams {
    pub piece_cid: Option<Cid>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryResponseStatus {
    Available,
    Unavailable,
    Error,
}

impl QueryResponseStatus {
    pub fn code(&self) -> u64 {
        match self {
            QueryResponseStatus::Available => 0,
            QueryResponseStatus::Unavailable => 1,
            QueryResponseStatus::Error => 2,
        }
    }

    pub fn from_code(code: u64) -> QueryResponseStatus {
        match code {
            0 => QueryResponseStatus::Available,
            1 => QueryResponseStatus::Unavailable,
            _ => QueryResponseStatus::Error,
        }
    }
}

impl Serialize for QueryResponseStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.code().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueryResponseStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let code: u64 = Deserialize::deserialize(deserializer)?;
        Ok(QueryResponseStatus::from_code(code))
    }
}

/// Whether a specific queried piece was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryItemStatus {
    Available,
    Unavailable,
    Unknown,
}

impl QueryItemStatus {
    pub fn code(&self) -> u64 {
        match self {
            QueryItemStatus::Available => 0,
            QueryItemStatus::Unavailable => 1,
            QueryItemStatus::Unknown => 2,
        }
    }

    pub fn from_code(code: u64) -> QueryItemStatus {
        match code {
            0 => QueryItemStatus::Available,
            1 => QueryItemStatus::Unavailable,
            _ => QueryItemStatus::Unknown,
        }
    }
}

impl Serialize for QueryItemStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.code().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueryItemStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let code: u64 = Deserialize::deserialize(deserializer)?;
        Ok(QueryItemStatus::from_code(code))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct QueryResponse {
    pub status: QueryResponseStatus,
    pub piece_cid_found: QueryItemStatus,
    pub size: u64,
    pub payment_address: Address,
    #[serde(with = "bigint_ser")]
    pub min_price_per_byte: BigInt,
    pub max_payment_interval: u64,
    pub max_payment_interval_increase: u64,
    pub message: String,
}

impl Cbor for QueryResponse {}

/// Opening message on a retrieval deal stream.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DealProposal {
    pub payload_cid: Cid,
    pub id: DealId,
    pub params: Params,
}

impl Cbor for DealProposal {}

/// One payload block on the wire: the Cid metadata and raw bytes, from
/// which the receiver recomputes and checks the block Cid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct Block {
    #[serde(with = "serde_bytes")]
    pub prefix: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Provider message on a retrieval deal stream: a status report, blocks
/// being delivered, and any payment currently owed.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DealResponse {
    pub status: DealStatus,
    pub id: DealId,
    #[serde(with = "bigint_ser")]
    pub payment_owed: BigInt,
    pub message: String,
    pub blocks: Vec<Block>,
}

impl Cbor for DealResponse {}

/// Off-chain payment channel increment. The recipient may redeem the
/// channel for up to `amount` on the voucher's lane.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct SignedVoucher {
    /// Address of the payment channel this signed voucher is valid for
    pub channel_addr: Address,
    /// Min epoch before which the voucher cannot be redeemed
    pub time_lock_min: ChainEpoch,
    /// Max epoch beyond which the voucher cannot be redeemed
    /// set to 0 means no timeout
    pub time_lock_max: ChainEpoch,
    /// (optional) Used by `to` to validate
    #[serde(with = "serde_bytes")]
    pub secret_pre_image: Vec<u8>,
    /// Specifies which lane the voucher is added to
    pub lane: u64,
    /// Set by `from` to prevent redemption of stale vouchers on a lane
    pub nonce: u64,
    /// Amount the voucher can be redeemed for
    #[serde(with = "bigint_ser")]
    pub amount: BigInt,
    /// (optional) Can extend channel min_settle_height if needed
    pub min_settle_height: ChainEpoch,
    /// Sender's signature over the voucher
    pub signature: Option<Signature>,
}

impl Cbor for SignedVoucher {}

/// Client payment message on a retrieval deal stream.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DealPayment {
    pub id: DealId,
    pub payment_channel: Address,
    pub payment_voucher: SignedVoucher,
}

impl Cbor for DealPayment {}

/// Retrieval deal tracked by the requesting client.
#[derive(Clone, Debug, Serialize_tuple, Deserialize_tuple)]
pub struct ClientDealState {
    pub deal_proposal: DealProposal,
    #[serde(with = "peerid_ser")]
    pub sender: PeerId,
    pub client_wallet: Address,
    pub miner_wallet: Address,
    /// Ceiling on what this retrieval may spend
    #[serde(with = "bigint_ser")]
    pub total_funds: BigInt,
    pub payment_info: Option<PaymentInfo>,
    pub status: DealStatus,
    pub total_received: u64,
    pub bytes_paid_for: u64,
    pub current_interval: u64,
    /// Sum of all vouchers sent so far
    #[serde(with = "bigint_ser")]
    pub funds_spent: BigInt,
    pub message: String,
}

impl ClientDealState {
    pub fn new(
        deal_proposal: DealProposal,
        sender: PeerId,
        client_wallet: Address,
        miner_wallet: Address,
        total_funds: BigInt,
    ) -> Self {
        let current_interval = deal_proposal.params.payment_interval;
        Self {
            deal_proposal,
            sender,
            client_wallet,
            miner_wallet,
            total_funds,
            payment_info: None,
            status: DealStatus::New,
            total_received: 0,
            bytes_paid_for: 0,
            current_interval,
            funds_spent: BigInt::default(),
            message: String::new(),
        }
    }
}

/// Identifies an inbound deal: the requesting peer plus its deal id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProviderDealIdentifier {
    pub receiver: PeerId,
    pub deal_id: DealId,
}

impl fmt::Display for ProviderDealIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.receiver, self.deal_id)
    }
}

/// Retrieval deal tracked by the serving provider.
#[derive(Clone, Debug, Serialize_tuple, Deserialize_tuple)]
pub struct ProviderDealState {
    pub proposal: DealProposal,
    #[serde(with = "peerid_ser")]
    pub receiver: PeerId,
    pub status: DealStatus,
    pub total_sent: u64,
    #[serde(with = "bigint_ser")]
    pub funds_received: BigInt,
    pub current_interval: u64,
    pub message: String,
    /// Status to re-enter when a suspension is lifted
    pub suspended_from: Option<DealStatus>,
}

impl ProviderDealState {
    pub fn new(proposal: DealProposal, receiver: PeerId) -> Self {
        let current_interval = proposal.params.payment_interval;
        Self {
            proposal,
            receiver,
            status: DealStatus::New,
            total_sent: 0,
            funds_received: BigInt::default(),
            current_interval,
            message: String::new(),
            suspended_from: None,
        }
    }

    pub fn identifier(&self) -> ProviderDealIdentifier {
        ProviderDealIdentifier {
            receiver: self.receiver.clone(),
            deal_id: self.proposal.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cid::multihash::{Code, MultihashDigest};
    use fvm_ipld_encoding::{from_slice, to_vec, DAG_CBOR};

    #[test]
    fn deal_proposal_roundtrip() {
        let proposal = DealProposal {
            payload_cid: Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(b"payload")),
            id: 7,
            params: Params::default(),
        };
        let bz = to_vec(&proposal).unwrap();
        assert_eq!(from_slice::<DealProposal>(&bz).unwrap(), proposal);
    }

    #[test]
    fn deal_response_roundtrip() {
        let response = DealResponse {
            status: DealStatus::FundsNeeded,
            id: 7,
            payment_owed: BigInt::from(10_136_000u64),
            message: String::new(),
            blocks: vec![Block {
                prefix: vec![1, 113, 160, 228, 2, 32],
                data: b"block data".to_vec(),
            }],
        };
        let bz = to_vec(&response).unwrap();
        assert_eq!(from_slice::<DealResponse>(&bz).unwrap(), response);
    }

    #[test]
    fn status_codes_roundtrip() {
        for code in 0..=15u64 {
            assert_eq!(DealStatus::from_code(code).code(), code);
        }
    }
}

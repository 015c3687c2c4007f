// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::types::{DealProposalMessage, SignedResponse};
use async_trait::async_trait;
use cid::Cid;
use libp2p::PeerId;
use std::sync::Arc;

/// One duplex deal stream between a client and a provider. The stream is
/// owned by its deal until the deal's terminal transition.
#[async_trait]
pub trait StorageDealStream: Send + Sync {
    async fn read_deal_proposal(&mut self) -> anyhow::Result<DealProposalMessage>;
    async fn write_deal_proposal(&mut self, proposal: DealProposalMessage) -> anyhow::Result<()>;
    async fn read_deal_response(&mut self) -> anyhow::Result<SignedResponse>;
    async fn write_deal_response(&mut self, response: SignedResponse) -> anyhow::Result<()>;
    fn remote_peer(&self) -> PeerId;
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Inbound deal-stream delegate bound by a provider.
#[async_trait]
pub trait StorageDealReceiver: Send + Sync {
    async fn receive_deal_stream(&self, stream: Box<dyn StorageDealStream>);
}

/// Storage-market face of the peer-to-peer host.
#[async_trait]
pub trait StorageMarketNetwork: Send + Sync {
    async fn new_deal_stream(&self, peer: PeerId) -> anyhow::Result<Box<dyn StorageDealStream>>;

    /// Tag the connection to `peer` so the connection manager keeps it
    /// alive while the tagged deal is in flight.
    fn tag_peer(&self, peer: PeerId, tag: &str);

    fn untag_peer(&self, peer: PeerId, tag: &str);

    /// Start routing inbound deal streams to `delegate`.
    async fn set_delegate(&self, delegate: Arc<dyn StorageDealReceiver>) -> anyhow::Result<()>;

    /// Unbind the delegate and stop accepting deal streams.
    async fn stop_handling_requests(&self) -> anyhow::Result<()>;
}

/// Tag applied to a deal's connection, unique per proposal.
pub fn deal_tag(proposal_cid: &Cid) -> String {
    format!("storage-deal/{}", proposal_cid)
}

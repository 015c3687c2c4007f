// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::types::{DealPayment, DealProposal, DealResponse, Query, QueryResponse};
use async_trait::async_trait;
use libp2p::PeerId;
use std::sync::Arc;

/// Short-lived stream for the query sub-protocol.
#[async_trait]
pub trait RetrievalQueryStream: Send + Sync {
    async fn read_query(&mut self) -> anyhow::Result<Query>;
    async fn write_query(&mut self, query: Query) -> anyhow::Result<()>;
    async fn read_query_response(&mut self) -> anyhow::Result<QueryResponse>;
    async fn write_query_response(&mut self, response: QueryResponse) -> anyhow::Result<()>;
    fn remote_peer(&self) -> PeerId;
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Duplex stream a retrieval deal runs over, owned by the deal until
/// its terminal transition.
#[async_trait]
pub trait RetrievalDealStream: Send + Sync {
    async fn read_deal_proposal(&mut self) -> anyhow::Result<DealProposal>;
    async fn write_deal_proposal(&mut self, proposal: DealProposal) -> anyhow::Result<()>;
    async fn read_deal_response(&mut self) -> anyhow::Result<DealResponse>;
    async fn write_deal_response(&mut self, response: DealResponse) -> anyhow::Result<()>;
    async fn read_deal_payment(&mut self) -> anyhow::Result<DealPayment>;
    async fn write_deal_payment(&mut self, payment: DealPayment) -> anyhow::Result<()>;
    fn remote_peer(&self) -> PeerId;
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Inbound stream delegate bound by a provider.
#[async_trait]
pub trait RetrievalReceiver: Send + Sync {
    async fn receive_query_stream(&self, stream: Box<dyn RetrievalQueryStream>);
    async fn receive_deal_stream(&self, stream: Box<dyn RetrievalDealStream>);
}

/// Retrieval-market face of the peer-to-peer host.
#[async_trait]
pub trait RetrievalMarketNetwork: Send + Sync {
    async fn new_query_stream(&self, peer: PeerId) -> anyhow::Result<Box<dyn RetrievalQueryStream>>;
    async fn new_deal_stream(&self, peer: PeerId) -> anyhow::Result<Box<dyn RetrievalDealStream>>;

    /// Start routing inbound query and deal streams to `delegate`.
    async fn set_delegate(&self, delegate: Arc<dyn RetrievalReceiver>) -> anyhow::Result<()>;

    /// Unbind the delegate and stop accepting streams.
    async fn stop_handling_requests(&self) -> anyhow::Result<()>;
}

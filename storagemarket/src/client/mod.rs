// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod states;

pub use self::states::{ClientDealSpec, ClientEvent};

use super::network::{deal_tag, StorageDealStream, StorageMarketNetwork};
use super::node::StorageClientNode;
use super::types::{
    ClientDeal, ClientDealProposal, DataRef, DealProposal, DealProposalMessage, SignedResponse,
    StorageDealStatus,
};
use super::{DataTransfer, Error};
use async_std::sync::Mutex;
use async_trait::async_trait;
use cid::Cid;
use db::Store;
use fsm::{StateMachineGroup, SubscriptionId};
use fvm_ipld_encoding::Cbor;
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::piece::PaddedPieceSize;
use ipld::selector::Selector;
use libp2p::PeerId;
use log::warn;
use market_types::all_selector;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A provider a client can place deals with.
#[derive(Clone, Debug)]
pub struct ProviderInfo {
    pub address: Address,
    pub worker: Address,
    pub peer_id: PeerId,
}

/// External collaborators a client deal's entry functions reach.
#[async_trait]
pub trait ClientDealEnvironment: Send + Sync {
    fn node(&self) -> &dyn StorageClientNode;

    /// Open a stream to `peer`, send the proposal, and retain the stream
    /// under `proposal_cid` for the rest of the deal.
    async fn write_deal_proposal(
        &self,
        peer: PeerId,
        proposal_cid: Cid,
        proposal: DealProposalMessage,
    ) -> anyhow::Result<()>;

    async fn read_deal_response(&self, proposal_cid: &Cid) -> anyhow::Result<SignedResponse>;

    /// Mark the deal's connection so the network layer does not drop it.
    fn tag_connection(&self, proposal_cid: &Cid, peer: PeerId);

    async fn start_data_transfer(
        &self,
        to: PeerId,
        voucher: Cid,
        base_cid: Cid,
        selector: Selector,
    ) -> anyhow::Result<()>;

    async fn close_stream(&self, proposal_cid: &Cid) -> anyhow::Result<()>;
}

struct ClientEnv {
    network: Arc<dyn StorageMarketNetwork>,
    node: Arc<dyn StorageClientNode>,
    data_transfer: Arc<dyn DataTransfer>,
    streams: RwLock<HashMap<Cid, Arc<Mutex<Box<dyn StorageDealStream>>>>>,
}

impl ClientEnv {
    fn stream(&self, proposal_cid: &Cid) -> anyhow::Result<Arc<Mutex<Box<dyn StorageDealStream>>>> {
        self.streams
            .read()
            .get(proposal_cid)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no open stream for deal {}", proposal_cid))
    }
}

#[async_trait]
impl ClientDealEnvironment for ClientEnv {
    fn node(&self) -> &dyn StorageClientNode {
        self.node.as_ref()
    }

    async fn write_deal_proposal(
        &self,
        peer: PeerId,
        proposal_cid: Cid,
        proposal: DealProposalMessage,
    ) -> anyhow::Result<()> {
        let mut stream = self.network.new_deal_stream(peer).await?;
        if let Err(e) = stream.write_deal_proposal(proposal).await {
            if let Err(close_err) = stream.close().await {
                warn!(
                    "dropping deal stream after failed proposal write: {}",
                    close_err
                );
            }
            return Err(e);
        }
        self.streams
            .write()
            .insert(proposal_cid, Arc::new(Mutex::new(stream)));
        Ok(())
    }

    async fn read_deal_response(&self, proposal_cid: &Cid) -> anyhow::Result<SignedResponse> {
        let stream = self.stream(proposal_cid)?;
        let mut stream = stream.lock().await;
        stream.read_deal_response().await
    }

    fn tag_connection(&self, proposal_cid: &Cid, peer: PeerId) {
        self.network.tag_peer(peer, &deal_tag(proposal_cid));
    }

    async fn start_data_transfer(
        &self,
        to: PeerId,
        voucher: Cid,
        base_cid: Cid,
        selector: Selector,
    ) -> anyhow::Result<()> {
        self.data_transfer
            .open_push_data_channel(to, voucher, base_cid, selector)
            .await
            .map_err(|e| anyhow::anyhow!("failed to open push data channel: {}", e))
    }

    async fn close_stream(&self, proposal_cid: &Cid) -> anyhow::Result<()> {
        let stream = self.streams.write().remove(proposal_cid);
        match stream {
            Some(stream) => stream.lock().await.close().await,
            None => Ok(()),
        }
    }
}

/// Client side of the storage market: proposes deals, escrows funds,
/// pushes payload, and follows each deal to activation.
pub struct StorageClient<DB> {
    machine: StateMachineGroup<DB, ClientDealSpec>,
    node: Arc<dyn StorageClientNode>,
}

impl<DB> StorageClient<DB>
where
    DB: Store + Send + Sync + 'static,
{
    pub fn new(
        db: Arc<DB>,
        network: Arc<dyn StorageMarketNetwork>,
        data_transfer: Arc<dyn DataTransfer>,
        node: Arc<dyn StorageClientNode>,
    ) -> Self {
        let env: Arc<dyn ClientDealEnvironment> = Arc::new(ClientEnv {
            network,
            node: node.clone(),
            data_transfer,
            streams: RwLock::new(HashMap::new()),
        });
        Self {
            machine: StateMachineGroup::new(db, "/storagemarket/client", env),
            node,
        }
    }

    /// Resume deals persisted by an earlier run.
    pub fn start(&self) -> Result<(), Error> {
        Ok(self.machine.restart()?)
    }

    pub async fn stop(&self, deadline: Duration) -> Result<(), Error> {
        Ok(self.machine.stop(deadline).await?)
    }

    /// Sign and propose a storage deal. Returns the proposal cid the
    /// deal is tracked under.
    #[allow(clippy::too_many_arguments)]
    pub async fn propose_storage_deal(
        &self,
        client_addr: Address,
        provider: &ProviderInfo,
        data: DataRef,
        piece_cid: Cid,
        piece_size: PaddedPieceSize,
        start_epoch: ChainEpoch,
        end_epoch: ChainEpoch,
        price_per_epoch: BigInt,
        collateral: BigInt,
    ) -> Result<Cid, Error> {
        let proposal = DealProposal {
            piece_cid,
            piece_size,
            client: client_addr,
            provider: provider.address,
            label: data.root.to_string(),
            start_epoch,
            end_epoch,
            storage_price_per_epoch: price_per_epoch,
            provider_collateral: collateral.clone(),
            client_collateral: collateral,
        };
        let signature = self
            .node
            .sign_bytes(&client_addr, &proposal.marshal_cbor()?)
            .await
            .map_err(Error::Node)?;
        let signed = ClientDealProposal {
            proposal,
            client_signature: signature,
        };
        let proposal_cid = signed.cid()?;

        let deal = ClientDeal {
            proposal_cid,
            proposal: signed,
            state: StorageDealStatus::EnsureClientFunds,
            miner: provider.peer_id.clone(),
            miner_worker: provider.worker,
            deal_id: None,
            data_ref: data,
            message: String::new(),
            publish_message: None,
            add_funds_cid: None,
            payment_info: None,
            connection_closed: false,
        };
        self.machine.begin(deal)?;
        Ok(proposal_cid)
    }

    pub fn list_local_deals(&self) -> Result<Vec<ClientDeal>, Error> {
        Ok(self.machine.list()?)
    }

    pub fn get_local_deal(&self, proposal_cid: &Cid) -> Result<ClientDeal, Error> {
        Ok(self.machine.get(proposal_cid)?)
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&'static str, &ClientDeal) + Send + Sync + 'static,
    {
        self.machine.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.machine.unsubscribe(id)
    }
}

/// Default selector sent with a push data transfer: the whole DAG.
pub(crate) fn transfer_selector() -> Selector {
    all_selector()
}

// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod states;

pub use self::states::{ClientDealSpec, ClientEvent};

use super::network::{RetrievalDealStream, RetrievalMarketNetwork};
use super::node::RetrievalClientNode;
use super::types::{
    ClientDealState, DealId, DealPayment, DealProposal, DealResponse, Params, Query, QueryParams,
    QueryResponse,
};
use super::Error;
use async_std::sync::Mutex;
use async_trait::async_trait;
use cid::Cid;
use db::Store;
use fsm::{StateMachineGroup, SubscriptionId};
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use libp2p::PeerId;
use market_types::Prefix;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// External collaborators a client deal's entry functions reach.
#[async_trait]
pub trait ClientDealEnvironment: Send + Sync {
    fn node(&self) -> &dyn RetrievalClientNode;

    /// Open a deal stream to `peer` and retain it under the deal id.
    async fn open_deal_stream(&self, id: DealId, peer: PeerId) -> anyhow::Result<()>;

    async fn write_deal_proposal(&self, id: DealId, proposal: DealProposal)
        -> anyhow::Result<()>;

    async fn read_deal_response(&self, id: DealId) -> anyhow::Result<DealResponse>;

    async fn write_deal_payment(&self, id: DealId, payment: DealPayment) -> anyhow::Result<()>;

    /// Verify a delivered block against its prefix, store it, and
    /// return the number of payload bytes it contributed.
    fn put_block(&self, prefix: &[u8], data: &[u8]) -> anyhow::Result<u64>;

    async fn close_stream(&self, id: DealId) -> anyhow::Result<()>;
}

struct ClientEnv<BS> {
    network: Arc<dyn RetrievalMarketNetwork>,
    node: Arc<dyn RetrievalClientNode>,
    blockstore: Arc<BS>,
    streams: RwLock<HashMap<DealId, Arc<Mutex<Box<dyn RetrievalDealStream>>>>>,
}

impl<BS> ClientEnv<BS> {
    fn stream(&self, id: DealId) -> anyhow::Result<Arc<Mutex<Box<dyn RetrievalDealStream>>>> {
        self.streams
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no open stream for deal {}", id))
    }
}

#[async_trait]
impl<BS> ClientDealEnvironment for ClientEnv<BS>
where
    BS: Blockstore + Send + Sync + 'static,
{
    fn node(&self) -> &dyn RetrievalClientNode {
        self.node.as_ref()
    }

    async fn open_deal_stream(&self, id: DealId, peer: PeerId) -> anyhow::Result<()> {
        let stream = self.network.new_deal_stream(peer).await?;
        self.streams
            .write()
            .insert(id, Arc::new(Mutex::new(stream)));
        Ok(())
    }

    async fn write_deal_proposal(
        &self,
        id: DealId,
        proposal: DealProposal,
    ) -> anyhow::Result<()> {
        let stream = self.stream(id)?;
        let mut stream = stream.lock().await;
        stream.write_deal_proposal(proposal).await
    }

    async fn read_deal_response(&self, id: DealId) -> anyhow::Result<DealResponse> {
        let stream = self.stream(id)?;
        let mut stream = stream.lock().await;
        stream.read_deal_response().await
    }

    async fn write_deal_payment(&self, id: DealId, payment: DealPayment) -> anyhow::Result<()> {
        let stream = self.stream(id)?;
        let mut stream = stream.lock().await;
        stream.write_deal_payment(payment).await
    }

    fn put_block(&self, prefix: &[u8], data: &[u8]) -> anyhow::Result<u64> {
        let prefix = Prefix::new_from_bytes(prefix)?;
        let cid = prefix.to_cid(data)?;
        self.blockstore.put_keyed(&cid, data)?;
        Ok(data.len() as u64)
    }

    async fn close_stream(&self, id: DealId) -> anyhow::Result<()> {
        let stream = self.streams.write().remove(&id);
        match stream {
            Some(stream) => stream.lock().await.close().await,
            None => Ok(()),
        }
    }
}

/// Client side of the retrieval market: queries providers for payload
/// availability and fetches it, paying incrementally with payment
/// channel vouchers.
pub struct RetrievalClient<DB> {
    machine: StateMachineGroup<DB, ClientDealSpec>,
    network: Arc<dyn RetrievalMarketNetwork>,
    next_deal_id: AtomicU64,
}

impl<DB> RetrievalClient<DB>
where
    DB: Store + Send + Sync + 'static,
{
    pub fn new<BS>(
        db: Arc<DB>,
        network: Arc<dyn RetrievalMarketNetwork>,
        node: Arc<dyn RetrievalClientNode>,
        blockstore: Arc<BS>,
    ) -> Self
    where
        BS: Blockstore + Send + Sync + 'static,
    {
        let env: Arc<dyn ClientDealEnvironment> = Arc::new(ClientEnv {
            network: network.clone(),
            node,
            blockstore,
            streams: RwLock::new(HashMap::new()),
        });
        Self {
            machine: StateMachineGroup::new(db, "/retrievalmarket/client", env),
            network,
            next_deal_id: AtomicU64::new(1),
        }
    }

    /// Resume deals persisted by an earlier run.
    pub fn start(&self) -> Result<(), Error> {
        // keep fresh ids above anything persisted
        let ceiling = self
            .machine
            .list()?
            .iter()
            .map(|deal| deal.deal_proposal.id)
            .max()
            .unwrap_or_default();
        self.next_deal_id.fetch_max(ceiling + 1, Ordering::SeqCst);
        self.machine.restart()?;
        Ok(())
    }

    pub async fn stop(&self, deadline: Duration) -> Result<(), Error> {
        Ok(self.machine.stop(deadline).await?)
    }

    /// Ask `peer` whether `payload_cid` can be retrieved and on what
    /// terms. Opens a short-lived query stream and closes it after one
    /// exchange.
    pub async fn query(
        &self,
        peer: PeerId,
        payload_cid: Cid,
        piece_cid: Option<Cid>,
    ) -> Result<QueryResponse, Error> {
        let mut stream = self
            .network
            .new_query_stream(peer)
            .await
            .map_err(Error::Network)?;
        let result = async {
            stream
                .write_query(Query {
                    payload_cid,
                    params: QueryParams { piece_cid },
                })
                .await?;
            stream.read_query_response().await
        }
        .await;
        if let Err(e) = stream.close().await {
            log::info!("closing query stream: {}", e);
        }
        result.map_err(Error::Network)
    }

    /// Start retrieving `payload_cid` from `miner_peer`, spending at
    /// most `total_funds`. Returns the local id the deal is tracked
    /// under.
    pub fn retrieve(
        &self,
        payload_cid: Cid,
        params: Params,
        total_funds: BigInt,
        miner_peer: PeerId,
        client_wallet: Address,
        miner_wallet: Address,
    ) -> Result<DealId, Error> {
        let id = self.next_deal_id.fetch_add(1, Ordering::SeqCst);
        let deal = ClientDealState::new(
            DealProposal {
                payload_cid,
                id,
                params,
            },
            miner_peer,
            client_wallet,
            miner_wallet,
            total_funds,
        );
        self.machine.begin(deal)?;
        Ok(id)
    }

    pub fn list_deals(&self) -> Result<Vec<ClientDealState>, Error> {
        Ok(self.machine.list()?)
    }

    pub fn get_deal(&self, id: DealId) -> Result<ClientDealState, Error> {
        Ok(self.machine.get(&id)?)
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&'static str, &ClientDealState) + Send + Sync + 'static,
    {
        self.machine.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.machine.unsubscribe(id)
    }
}

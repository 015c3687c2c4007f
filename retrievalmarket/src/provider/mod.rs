// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod states;
mod unseal;

pub use self::states::{ProviderDealSpec, ProviderEvent};
pub use self::unseal::{PieceLocks, UnsealingLoader};

use super::network::{
    RetrievalDealStream, RetrievalMarketNetwork, RetrievalQueryStream, RetrievalReceiver,
};
use super::node::RetrievalProviderNode;
use super::types::{
    default_price_per_byte, Block, DealPayment, DealResponse, DealStatus, Params,
    ProviderDealIdentifier, ProviderDealState, Query, QueryItemStatus, QueryResponse,
    QueryResponseStatus, DEFAULT_PAYMENT_INTERVAL, DEFAULT_PAYMENT_INTERVAL_INCREASE,
};
use super::Error;
use async_std::sync::Mutex;
use async_std::task;
use async_trait::async_trait;
use db::Store;
use fsm::{StateMachineGroup, SubscriptionId};
use futures::channel::mpsc::{channel, Receiver};
use futures::{SinkExt, StreamExt};
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use ipld::Ipld;
use log::{info, warn};
use market_types::all_selector;
use parking_lot::RwLock;
use piecestore::PieceStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Terms this provider serves retrievals under, reflected in query
/// responses and enforced against inbound proposals.
#[derive(Clone, Debug)]
pub struct ProviderParams {
    pub price_per_byte: BigInt,
    pub payment_interval: u64,
    pub payment_interval_increase: u64,
}

impl Default for ProviderParams {
    fn default() -> Self {
        Self {
            price_per_byte: default_price_per_byte(),
            payment_interval: DEFAULT_PAYMENT_INTERVAL,
            payment_interval_increase: DEFAULT_PAYMENT_INTERVAL_INCREASE,
        }
    }
}

/// Validate proposed deal terms against the provider's minimums.
pub fn check_deal_params(provider: &ProviderParams, proposed: &Params) -> Result<(), String> {
    if proposed.price_per_byte < provider.price_per_byte {
        return Err("Price per byte too low".to_owned());
    }
    if proposed.payment_interval > provider.payment_interval {
        return Err("Payment interval too large".to_owned());
    }
    if proposed.payment_interval_increase > provider.payment_interval_increase {
        return Err("Payment interval increase too large".to_owned());
    }
    Ok(())
}

/// Pluggable acceptance decision run against each inbound proposal.
pub type DealDecider = Arc<dyn Fn(&ProviderDealState) -> (bool, String) + Send + Sync>;

/// External collaborators a provider deal's entry functions reach.
#[async_trait]
pub trait ProviderDealEnvironment: Send + Sync {
    fn node(&self) -> &dyn RetrievalProviderNode;

    fn piece_store(&self) -> &dyn PieceStore;

    fn check_deal_params(&self, proposed: &Params) -> Result<(), String>;

    fn accept_deal(&self, deal: &ProviderDealState) -> (bool, String);

    /// Start the deal's payload traversal, unsealing the backing piece
    /// if its root is not in the local block-store yet.
    async fn prepare_blocks(&self, deal: &ProviderDealState) -> anyhow::Result<()>;

    /// Next block of the deal's traversal, or `None` when every block
    /// has been delivered.
    async fn next_block(&self, id: &ProviderDealIdentifier) -> anyhow::Result<Option<Block>>;

    async fn write_deal_response(
        &self,
        id: &ProviderDealIdentifier,
        response: DealResponse,
    ) -> anyhow::Result<()>;

    async fn read_deal_payment(&self, id: &ProviderDealIdentifier) -> anyhow::Result<DealPayment>;

    async fn close_stream(&self, id: &ProviderDealIdentifier) -> anyhow::Result<()>;
}

type SharedStream = Arc<Mutex<Box<dyn RetrievalDealStream>>>;
type BlockFeed = Arc<Mutex<Receiver<anyhow::Result<Block>>>>;

struct ProviderEnv<BS> {
    node: Arc<dyn RetrievalProviderNode>,
    piece_store: Arc<dyn PieceStore>,
    blockstore: Arc<BS>,
    params: RwLock<ProviderParams>,
    decider: DealDecider,
    miner_address: Address,
    piece_locks: Arc<PieceLocks>,
    streams: RwLock<HashMap<ProviderDealIdentifier, SharedStream>>,
    blocks: RwLock<HashMap<ProviderDealIdentifier, BlockFeed>>,
}

impl<BS> ProviderEnv<BS> {
    fn track_stream(&self, id: ProviderDealIdentifier, stream: Box<dyn RetrievalDealStream>) {
        self.streams.write().insert(id, Arc::new(Mutex::new(stream)));
    }

    fn stream(&self, id: &ProviderDealIdentifier) -> anyhow::Result<SharedStream> {
        self.streams
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no open stream for deal {}", id))
    }

    async fn close_all(&self) {
        let streams = std::mem::take(&mut *self.streams.write());
        self.blocks.write().clear();
        for (id, stream) in streams {
            if let Err(e) = stream.lock().await.close().await {
                info!("deal {}: closing stream: {}", id, e);
            }
        }
    }
}

#[async_trait]
impl<BS> ProviderDealEnvironment for ProviderEnv<BS>
where
    BS: Blockstore + Send + Sync + 'static,
{
    fn node(&self) -> &dyn RetrievalProviderNode {
        self.node.as_ref()
    }

    fn piece_store(&self) -> &dyn PieceStore {
        self.piece_store.as_ref()
    }

    fn check_deal_params(&self, proposed: &Params) -> Result<(), String> {
        check_deal_params(&self.params.read(), proposed)
    }

    fn accept_deal(&self, deal: &ProviderDealState) -> (bool, String) {
        (self.decider)(deal)
    }

    async fn prepare_blocks(&self, deal: &ProviderDealState) -> anyhow::Result<()> {
        let (sender, receiver) = channel(8);
        let loader = UnsealingLoader {
            blockstore: self.blockstore.clone(),
            piece_store: self.piece_store.clone(),
            node: self.node.clone(),
            payload_cid: deal.proposal.payload_cid,
            piece_cid: deal.proposal.params.piece_cid,
            piece_locks: self.piece_locks.clone(),
            blocks: sender.clone(),
        };
        // resolve the root eagerly so unsealing happens here rather
        // than midway through the send loop
        loader.load_raw(&deal.proposal.payload_cid).await?;

        let selector = deal
            .proposal
            .params
            .selector
            .clone()
            .unwrap_or_else(all_selector);
        let root = Ipld::Link(deal.proposal.payload_cid);
        let id = deal.identifier();
        task::spawn(async move {
            let mut sender = sender;
            if let Err(e) = selector
                .walk_all(&root, Some(loader), |_, _, _| Ok(()))
                .await
            {
                let _ = sender
                    .send(Err(anyhow::anyhow!("traversing payload: {}", e)))
                    .await;
            }
        });
        self.blocks
            .write()
            .insert(id, Arc::new(Mutex::new(receiver)));
        Ok(())
    }

    async fn next_block(&self, id: &ProviderDealIdentifier) -> anyhow::Result<Option<Block>> {
        let feed = self
            .blocks
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no block feed for deal {}", id))?;
        let mut feed = feed.lock().await;
        feed.next().await.transpose()
    }

    async fn write_deal_response(
        &self,
        id: &ProviderDealIdentifier,
        response: DealResponse,
    ) -> anyhow::Result<()> {
        let stream = self.stream(id)?;
        let mut stream = stream.lock().await;
        stream.write_deal_response(response).await
    }

    async fn read_deal_payment(&self, id: &ProviderDealIdentifier) -> anyhow::Result<DealPayment> {
        let stream = self.stream(id)?;
        let mut stream = stream.lock().await;
        stream.read_deal_payment().await
    }

    async fn close_stream(&self, id: &ProviderDealIdentifier) -> anyhow::Result<()> {
        self.blocks.write().remove(id);
        let stream = self.streams.write().remove(id);
        match stream {
            Some(stream) => stream.lock().await.close().await,
            None => Ok(()),
        }
    }
}

/// Answer one retrieval query: report whether the payload is held in
/// any piece (optionally constrained to the queried piece) and the
/// terms retrieval is offered under.
async fn answer_query<BS>(env: &ProviderEnv<BS>, query: &Query) -> QueryResponse {
    let params = env.params.read().clone();
    let mut response = QueryResponse {
        status: QueryResponseStatus::Unavailable,
        piece_cid_found: QueryItemStatus::Unavailable,
        size: 0,
        payment_address: Address::new_id(0),
        min_price_per_byte: params.price_per_byte,
        max_payment_interval: params.payment_interval,
        max_payment_interval_increase: params.payment_interval_increase,
        message: String::new(),
    };

    let head = env.node.get_chain_head().await;
    let payment_address = match head {
        Ok((tok, _)) => {
            env.node
                .get_miner_worker_address(&env.miner_address, &tok)
                .await
        }
        Err(e) => Err(e),
    };
    match payment_address {
        Ok(address) => response.payment_address = address,
        Err(e) => {
            response.status = QueryResponseStatus::Error;
            response.message = format!("failed to look up payment address: {}", e);
            return response;
        }
    }

    let cid_info = match env.piece_store.get_cid_info(&query.payload_cid) {
        Ok(cid_info) => cid_info,
        Err(piecestore::Error::NotFound) => return response,
        Err(e) => {
            response.status = QueryResponseStatus::Error;
            response.message = e.to_string();
            return response;
        }
    };

    for location in &cid_info.piece_block_locations {
        if let Some(piece_cid) = &query.params.piece_cid {
            if location.piece_cid != *piece_cid {
                continue;
            }
        }
        match env.piece_store.get_piece_info(&location.piece_cid) {
            Ok(piece_info) => {
                if let Some(deal) = piece_info.deals.first() {
                    response.status = QueryResponseStatus::Available;
                    response.piece_cid_found = QueryItemStatus::Available;
                    response.size = deal.length;
                    break;
                }
            }
            Err(piecestore::Error::NotFound) => continue,
            Err(e) => {
                response.status = QueryResponseStatus::Error;
                response.message = e.to_string();
                return response;
            }
        }
    }
    response
}

struct ProviderReceiver<DB, BS> {
    machine: Arc<StateMachineGroup<DB, ProviderDealSpec>>,
    env: Arc<ProviderEnv<BS>>,
}

#[async_trait]
impl<DB, BS> RetrievalReceiver for ProviderReceiver<DB, BS>
where
    DB: Store + Send + Sync + 'static,
    BS: Blockstore + Send + Sync + 'static,
{
    async fn receive_query_stream(&self, mut stream: Box<dyn RetrievalQueryStream>) {
        let env = self.env.clone();
        task::spawn(async move {
            let query = match stream.read_query().await {
                Ok(query) => query,
                Err(e) => {
                    warn!("failed to read retrieval query: {}", e);
                    let _ = stream.close().await;
                    return;
                }
            };
            let response = answer_query(&env, &query).await;
            if let Err(e) = stream.write_query_response(response).await {
                warn!("failed to answer retrieval query: {}", e);
            }
            if let Err(e) = stream.close().await {
                info!("closing query stream: {}", e);
            }
        });
    }

    async fn receive_deal_stream(&self, mut stream: Box<dyn RetrievalDealStream>) {
        let proposal = match stream.read_deal_proposal().await {
            Ok(proposal) => proposal,
            Err(e) => {
                warn!("failed to read retrieval deal proposal: {}", e);
                let _ = stream.close().await;
                return;
            }
        };
        let deal = ProviderDealState::new(proposal, stream.remote_peer());
        let id = deal.identifier();
        self.env.track_stream(id.clone(), stream);
        if let Err(e) = self.machine.begin(deal) {
            warn!("failed to track inbound retrieval deal {}: {}", id, e);
        }
    }
}

/// Provider side of the retrieval market: answers queries and serves
/// payload in exchange for payment-channel vouchers, unsealing sectors
/// on demand.
pub struct RetrievalProvider<DB, BS> {
    machine: Arc<StateMachineGroup<DB, ProviderDealSpec>>,
    env: Arc<ProviderEnv<BS>>,
    network: Arc<dyn RetrievalMarketNetwork>,
}

impl<DB, BS> RetrievalProvider<DB, BS>
where
    DB: Store + Send + Sync + 'static,
    BS: Blockstore + Send + Sync + 'static,
{
    pub fn new(
        db: Arc<DB>,
        network: Arc<dyn RetrievalMarketNetwork>,
        node: Arc<dyn RetrievalProviderNode>,
        piece_store: Arc<dyn PieceStore>,
        blockstore: Arc<BS>,
        miner_address: Address,
        decider: Option<DealDecider>,
    ) -> Self {
        let env = Arc::new(ProviderEnv {
            node,
            piece_store,
            blockstore,
            params: RwLock::new(ProviderParams::default()),
            decider: decider.unwrap_or_else(|| Arc::new(|_| (true, String::new()))),
            miner_address,
            piece_locks: Arc::new(PieceLocks::default()),
            streams: RwLock::new(HashMap::new()),
            blocks: RwLock::new(HashMap::new()),
        });
        let machine = Arc::new(StateMachineGroup::new(
            db,
            "/retrievalmarket/provider",
            env.clone() as Arc<dyn ProviderDealEnvironment>,
        ));
        Self {
            machine,
            env,
            network,
        }
    }

    /// Bind the network delegate and resume persisted deals, lifting
    /// any suspension left by a previous `stop`.
    pub async fn start(&self) -> Result<(), Error> {
        let receiver = Arc::new(ProviderReceiver {
            machine: self.machine.clone(),
            env: self.env.clone(),
        });
        self.network
            .set_delegate(receiver)
            .await
            .map_err(Error::Network)?;
        self.machine.restart()?;
        for deal in self.machine.list()? {
            if deal.status == DealStatus::Suspended {
                let _ = self
                    .machine
                    .send(&deal.identifier(), ProviderEvent::DealResumed);
            }
        }
        Ok(())
    }

    /// Close every open stream, suspend every live deal, stop the
    /// engine, and unbind the network delegate.
    pub async fn stop(&self, deadline: Duration) -> Result<(), Error> {
        self.env.close_all().await;
        for key in self.machine.live_keys() {
            let _ = self.machine.send(&key, ProviderEvent::DealSuspended);
        }
        self.machine.stop(deadline).await?;
        self.network
            .stop_handling_requests()
            .await
            .map_err(Error::Network)?;
        Ok(())
    }

    /// Replace the terms offered for future deals.
    pub fn set_params(&self, params: ProviderParams) {
        *self.env.params.write() = params;
    }

    pub fn get_params(&self) -> ProviderParams {
        self.env.params.read().clone()
    }

    pub fn list_deals(&self) -> Result<Vec<ProviderDealState>, Error> {
        Ok(self.machine.list()?)
    }

    pub fn get_deal(&self, id: &ProviderDealIdentifier) -> Result<ProviderDealState, Error> {
        Ok(self.machine.get(id)?)
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&'static str, &ProviderDealState) + Send + Sync + 'static,
    {
        self.machine.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.machine.unsubscribe(id)
    }
}

// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod states;

pub use self::states::{ProviderDealSpec, ProviderEvent};

use super::network::{StorageDealReceiver, StorageDealStream, StorageMarketNetwork};
use super::node::StorageProviderNode;
use super::types::{
    MinerDeal, Response, SignedResponse, SignedStorageAsk, StorageAsk, StorageDealStatus,
};
use super::Error;
use async_std::sync::Mutex;
use async_trait::async_trait;
use cid::Cid;
use db::Store;
use fsm::{StateMachineGroup, SubscriptionId};
use fvm_ipld_encoding::{from_slice, to_vec, Cbor};
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::piece::PaddedPieceSize;
use libp2p::PeerId;
use log::warn;
use parking_lot::RwLock;
use piecestore::PieceStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const ASK_KEY: &str = "/storagemarket/provider/latest-ask";

/// Piece commitment computation over transferred payload.
#[async_trait]
pub trait PieceIo: Send + Sync {
    /// Compute the piece cid and padded size of the payload DAG under
    /// `root`.
    async fn generate_piece_commitment(
        &self,
        root: &Cid,
    ) -> anyhow::Result<(Cid, PaddedPieceSize)>;
}

/// Pluggable acceptance decision run against each inbound proposal.
pub type DealDecider = Arc<dyn Fn(&MinerDeal) -> (bool, String) + Send + Sync>;

/// External collaborators a provider deal's entry functions reach.
#[async_trait]
pub trait ProviderDealEnvironment: Send + Sync {
    fn node(&self) -> &dyn StorageProviderNode;

    fn piece_store(&self) -> &dyn PieceStore;

    fn provider_address(&self) -> Address;

    async fn generate_piece_commitment(
        &self,
        root: &Cid,
    ) -> anyhow::Result<(Cid, PaddedPieceSize)>;

    /// Run the configured acceptance decision.
    fn accept_deal(&self, deal: &MinerDeal) -> (bool, String);

    /// Sign `response` with the miner worker key and send it on the
    /// deal's stream.
    async fn send_signed_response(
        &self,
        proposal_cid: &Cid,
        response: Response,
    ) -> anyhow::Result<()>;

    async fn close_stream(&self, proposal_cid: &Cid) -> anyhow::Result<()>;
}

struct ProviderEnv {
    node: Arc<dyn StorageProviderNode>,
    piece_store: Arc<dyn PieceStore>,
    piece_io: Arc<dyn PieceIo>,
    decider: DealDecider,
    actor: Address,
    streams: RwLock<HashMap<Cid, Arc<Mutex<Box<dyn StorageDealStream>>>>>,
}

impl ProviderEnv {
    fn track_stream(&self, proposal_cid: Cid, stream: Box<dyn StorageDealStream>) {
        self.streams
            .write()
            .insert(proposal_cid, Arc::new(Mutex::new(stream)));
    }
}

#[async_trait]
impl ProviderDealEnvironment for ProviderEnv {
    fn node(&self) -> &dyn StorageProviderNode {
        self.node.as_ref()
    }

    fn piece_store(&self) -> &dyn PieceStore {
        self.piece_store.as_ref()
    }

    fn provider_address(&self) -> Address {
        self.actor
    }

    async fn generate_piece_commitment(
        &self,
        root: &Cid,
    ) -> anyhow::Result<(Cid, PaddedPieceSize)> {
        self.piece_io.generate_piece_commitment(root).await
    }

    fn accept_deal(&self, deal: &MinerDeal) -> (bool, String) {
        (self.decider)(deal)
    }

    async fn send_signed_response(
        &self,
        proposal_cid: &Cid,
        response: Response,
    ) -> anyhow::Result<()> {
        let stream = self
            .streams
            .read()
            .get(proposal_cid)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no open stream for deal {}", proposal_cid))?;

        let (tok, _) = self.node.get_chain_head().await?;
        let worker = self
            .node
            .get_miner_worker_address(&self.actor, &tok)
            .await?;
        let signature = self
            .node
            .sign_bytes(&worker, &response.marshal_cbor()?)
            .await?;
        let signed = SignedResponse {
            response,
            signature,
        };
        let result = stream.lock().await.write_deal_response(signed).await;
        result
    }

    async fn close_stream(&self, proposal_cid: &Cid) -> anyhow::Result<()> {
        let stream = self.streams.write().remove(proposal_cid);
        match stream {
            Some(stream) => stream.lock().await.close().await,
            None => Ok(()),
        }
    }
}

struct ProviderReceiver<DB> {
    machine: Arc<StateMachineGroup<DB, ProviderDealSpec>>,
    env: Arc<ProviderEnv>,
}

#[async_trait]
impl<DB> StorageDealReceiver for ProviderReceiver<DB>
where
    DB: Store + Send + Sync + 'static,
{
    async fn receive_deal_stream(&self, mut stream: Box<dyn StorageDealStream>) {
        let proposal = match stream.read_deal_proposal().await {
            Ok(proposal) => proposal,
            Err(e) => {
                warn!("failed to read inbound deal proposal: {}", e);
                return;
            }
        };
        let proposal_cid = match proposal.deal_proposal.cid() {
            Ok(cid) => cid,
            Err(e) => {
                warn!("failed to compute proposal cid: {}", e);
                return;
            }
        };
        let deal = MinerDeal {
            proposal_cid,
            proposal: proposal.deal_proposal,
            client: stream.remote_peer(),
            state: StorageDealStatus::Validating,
            piece_ref: proposal.piece,
            message: String::new(),
            deal_id: None,
            publish_cid: None,
            add_funds_cid: None,
            connection_closed: false,
        };
        self.env.track_stream(proposal_cid, stream);
        if let Err(e) = self.machine.begin(deal) {
            warn!("failed to track inbound deal {}: {}", proposal_cid, e);
        }
    }
}

/// Provider side of the storage market: accepts proposals over the
/// network, publishes deals on chain, and hands payload off for
/// sealing.
pub struct StorageProvider<DB> {
    machine: Arc<StateMachineGroup<DB, ProviderDealSpec>>,
    env: Arc<ProviderEnv>,
    network: Arc<dyn StorageMarketNetwork>,
    node: Arc<dyn StorageProviderNode>,
    actor: Address,
    ask: RwLock<Option<SignedStorageAsk>>,
    db: Arc<DB>,
}

impl<DB> StorageProvider<DB>
where
    DB: Store + Send + Sync + 'static,
{
    pub fn new(
        db: Arc<DB>,
        network: Arc<dyn StorageMarketNetwork>,
        node: Arc<dyn StorageProviderNode>,
        piece_store: Arc<dyn PieceStore>,
        piece_io: Arc<dyn PieceIo>,
        actor: Address,
        decider: Option<DealDecider>,
    ) -> Result<Self, Error> {
        let env = Arc::new(ProviderEnv {
            node: node.clone(),
            piece_store,
            piece_io,
            decider: decider.unwrap_or_else(|| Arc::new(|_| (true, String::new()))),
            actor,
            streams: RwLock::new(HashMap::new()),
        });
        let machine = Arc::new(StateMachineGroup::new(
            db.clone(),
            "/storagemarket/provider",
            env.clone() as Arc<dyn ProviderDealEnvironment>,
        ));
        let ask = match db.read(ASK_KEY).map_err(fsm::Error::from)? {
            Some(bz) => Some(from_slice(&bz)?),
            None => None,
        };
        Ok(Self {
            machine,
            env,
            network,
            node,
            actor,
            ask: RwLock::new(ask),
            db,
        })
    }

    /// Bind the inbound-stream delegate and resume persisted deals.
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
        Ok(())
    }

    pub async fn stop(&self, deadline: Duration) -> Result<(), Error> {
        self.network
            .stop_handling_requests()
            .await
            .map_err(Error::Network)?;
        self.machine.stop(deadline).await?;
        Ok(())
    }

    /// Signal that the payload for `proposal_cid` has fully landed in
    /// the local store, whether pushed over data transfer or delivered
    /// manually.
    pub fn on_data_transfer_completed(&self, proposal_cid: &Cid) -> Result<(), Error> {
        Ok(self
            .machine
            .send(proposal_cid, ProviderEvent::DataTransferCompleted)?)
    }

    /// Re-sign and publish new deal terms.
    pub async fn set_ask(
        &self,
        price: BigInt,
        min_piece_size: PaddedPieceSize,
        duration: ChainEpoch,
    ) -> Result<(), Error> {
        let (tok, epoch) = self.node.get_chain_head().await.map_err(Error::Node)?;
        let seq_no = self
            .ask
            .read()
            .as_ref()
            .map(|signed| signed.ask.seq_no + 1)
            .unwrap_or_default();
        let ask = StorageAsk {
            price,
            min_piece_size,
            miner: self.actor,
            timestamp: epoch,
            expiry: epoch + duration,
            seq_no,
        };
        let worker = self
            .node
            .get_miner_worker_address(&self.actor, &tok)
            .await
            .map_err(Error::Node)?;
        let signature = self
            .node
            .sign_bytes(&worker, &ask.marshal_cbor()?)
            .await
            .map_err(Error::Node)?;
        let signed = SignedStorageAsk { ask, signature };
        self.db
            .write(ASK_KEY, to_vec(&signed)?)
            .map_err(fsm::Error::from)?;
        *self.ask.write() = Some(signed);
        Ok(())
    }

    pub fn get_ask(&self) -> Option<SignedStorageAsk> {
        self.ask.read().clone()
    }

    pub fn list_deals(&self) -> Result<Vec<MinerDeal>, Error> {
        Ok(self.machine.list()?)
    }

    pub fn get_deal(&self, proposal_cid: &Cid) -> Result<MinerDeal, Error> {
        Ok(self.machine.get(proposal_cid)?)
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&'static str, &MinerDeal) + Send + Sync + 'static,
    {
        self.machine.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.machine.unsubscribe(id)
    }
}

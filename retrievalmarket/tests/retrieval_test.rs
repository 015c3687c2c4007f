// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! End-to-end retrieval between an in-process client and provider over
//! an in-memory network. The provider starts with nothing unsealed and
//! serves the payload out of a CAR produced by the fake node's
//! unsealer.

use async_std::task;
use async_trait::async_trait;
use cid::multihash::{Code, MultihashDigest};
use cid::Cid;
use db::MemoryDB;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_car::CarHeader;
use fvm_ipld_encoding::DAG_CBOR;
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::sector::SectorNumber;
use futures::AsyncRead;
use ipld::Ipld;
use libp2p::PeerId;
use market_types::TipSetToken;
use parking_lot::{Mutex, RwLock};
use piecestore::{BlockLocation, DbPieceStore, PieceStore};
use retrievalmarket::network::*;
use retrievalmarket::node::{RetrievalClientNode, RetrievalProviderNode};
use retrievalmarket::types::*;
use retrievalmarket::{
    check_deal_params, ProviderParams, RetrievalClient, RetrievalProvider,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

const IPLD_RAW: u64 = 0x55;
const FILE_SIZE: usize = 19_000;
const CHUNK_SIZE: usize = 2_304;
const ROOT_BLOCK_SIZE: usize = 920;
const PIECE_LENGTH: u64 = 32 << 10;

// ---------------------------------------------------------------- fixture

struct Fixture {
    root: Cid,
    piece: Cid,
    /// (cid, bytes) in traversal order: root first, then leaves
    blocks: Vec<(Cid, Vec<u8>)>,
    file: Vec<u8>,
}

fn build_fixture() -> Fixture {
    let mut file = Vec::with_capacity(FILE_SIZE);
    let mut leaves = Vec::new();
    let mut offset = 0usize;
    let mut chunk_index = 0u8;
    while offset < FILE_SIZE {
        let len = CHUNK_SIZE.min(FILE_SIZE - offset);
        let data = vec![chunk_index + 1; len];
        file.extend_from_slice(&data);
        let cid = Cid::new_v1(IPLD_RAW, Code::Blake2b256.digest(&data));
        leaves.push((cid, data));
        offset += len;
        chunk_index += 1;
    }

    // pad the root node out to a fixed size so interval arithmetic in
    // the assertions below stays exact
    let links = Ipld::List(leaves.iter().map(|(cid, _)| Ipld::Link(*cid)).collect());
    let mut root_bytes = Vec::new();
    for pad_len in 0..2048usize {
        let mut map = BTreeMap::new();
        map.insert("Links".to_owned(), links.clone());
        map.insert("pad".to_owned(), Ipld::Bytes(vec![0u8; pad_len]));
        let bytes = encoding::to_vec(&Ipld::Map(map)).unwrap();
        if bytes.len() == ROOT_BLOCK_SIZE {
            root_bytes = bytes;
            break;
        }
    }
    assert_eq!(root_bytes.len(), ROOT_BLOCK_SIZE, "fixture root never hit target size");

    let root = Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(&root_bytes));
    let piece = Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(b"piece of the payload"));

    let mut blocks = vec![(root, root_bytes)];
    blocks.extend(leaves);
    Fixture {
        root,
        piece,
        blocks,
        file,
    }
}

fn build_car(fixture: &Fixture) -> Vec<u8> {
    task::block_on(async {
        let header = CarHeader {
            roots: vec![fixture.root],
            version: 1,
        };
        let mut buffer = futures::io::Cursor::new(Vec::new());
        let mut stream = futures::stream::iter(fixture.blocks.clone());
        header
            .write_stream_async(&mut buffer, &mut stream)
            .await
            .unwrap();
        buffer.into_inner()
    })
}

// ------------------------------------------------------------- blockstore

#[derive(Default)]
struct TestBlockstore {
    blocks: RwLock<HashMap<Cid, Vec<u8>>>,
}

impl Blockstore for TestBlockstore {
    fn get(&self, k: &Cid) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.blocks.read().get(k).cloned())
    }

    fn put_keyed(&self, k: &Cid, block: &[u8]) -> anyhow::Result<()> {
        self.blocks.write().insert(*k, block.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------- network

enum WireMsg {
    Query(Query),
    QueryResponse(QueryResponse),
    Proposal(DealProposal),
    Response(DealResponse),
    Payment(DealPayment),
}

struct TestStream {
    remote: PeerId,
    tx: UnboundedSender<WireMsg>,
    rx: UnboundedReceiver<WireMsg>,
}

fn stream_pair(a_remote: PeerId, b_remote: PeerId) -> (TestStream, TestStream) {
    let (a_tx, b_rx) = unbounded();
    let (b_tx, a_rx) = unbounded();
    (
        TestStream {
            remote: a_remote,
            tx: a_tx,
            rx: a_rx,
        },
        TestStream {
            remote: b_remote,
            tx: b_tx,
            rx: b_rx,
        },
    )
}

impl TestStream {
    fn send(&self, msg: WireMsg) -> anyhow::Result<()> {
        self.tx
            .unbounded_send(msg)
            .map_err(|_| anyhow::anyhow!("stream closed"))
    }
}

#[async_trait]
impl RetrievalQueryStream for TestStream {
    async fn read_query(&mut self) -> anyhow::Result<Query> {
        match self.rx.next().await {
            Some(WireMsg::Query(query)) => Ok(query),
            Some(_) => anyhow::bail!("unexpected message on query stream"),
            None => anyhow::bail!("stream closed"),
        }
    }

    async fn write_query(&mut self, query: Query) -> anyhow::Result<()> {
        self.send(WireMsg::Query(query))
    }

    async fn read_query_response(&mut self) -> anyhow::Result<QueryResponse> {
        match self.rx.next().await {
            Some(WireMsg::QueryResponse(response)) => Ok(response),
            Some(_) => anyhow::bail!("unexpected message on query stream"),
            None => anyhow::bail!("stream closed"),
        }
    }

    async fn write_query_response(&mut self, response: QueryResponse) -> anyhow::Result<()> {
        self.send(WireMsg::QueryResponse(response))
    }

    fn remote_peer(&self) -> PeerId {
        self.remote.clone()
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.tx.close_channel();
        Ok(())
    }
}

#[async_trait]
impl RetrievalDealStream for TestStream {
    async fn read_deal_proposal(&mut self) -> anyhow::Result<DealProposal> {
        match self.rx.next().await {
            Some(WireMsg::Proposal(proposal)) => Ok(proposal),
            Some(_) => anyhow::bail!("unexpected message on deal stream"),
            None => anyhow::bail!("stream closed"),
        }
    }

    async fn write_deal_proposal(&mut self, proposal: DealProposal) -> anyhow::Result<()> {
        self.send(WireMsg::Proposal(proposal))
    }

    async fn read_deal_response(&mut self) -> anyhow::Result<DealResponse> {
        match self.rx.next().await {
            Some(WireMsg::Response(response)) => Ok(response),
            Some(_) => anyhow::bail!("unexpected message on deal stream"),
            None => anyhow::bail!("stream closed"),
        }
    }

    async fn write_deal_response(&mut self, response: DealResponse) -> anyhow::Result<()> {
        self.send(WireMsg::Response(response))
    }

    async fn read_deal_payment(&mut self) -> anyhow::Result<DealPayment> {
        match self.rx.next().await {
            Some(WireMsg::Payment(payment)) => Ok(payment),
            Some(_) => anyhow::bail!("unexpected message on deal stream"),
            None => anyhow::bail!("stream closed"),
        }
    }

    async fn write_deal_payment(&mut self, payment: DealPayment) -> anyhow::Result<()> {
        self.send(WireMsg::Payment(payment))
    }

    fn remote_peer(&self) -> PeerId {
        self.remote.clone()
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.tx.close_channel();
        Ok(())
    }
}

/// Loopback network: streams the client opens are handed straight to
/// the provider's delegate.
struct TestNetwork {
    delegate: RwLock<Option<Arc<dyn RetrievalReceiver>>>,
    provider_peer: PeerId,
    client_peer: PeerId,
}

impl TestNetwork {
    fn new(provider_peer: PeerId, client_peer: PeerId) -> Self {
        Self {
            delegate: RwLock::new(None),
            provider_peer,
            client_peer,
        }
    }

    fn delegate(&self) -> anyhow::Result<Arc<dyn RetrievalReceiver>> {
        self.delegate
            .read()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("protocol not supported by peer"))
    }
}

#[async_trait]
impl RetrievalMarketNetwork for TestNetwork {
    async fn new_query_stream(
        &self,
        _peer: PeerId,
    ) -> anyhow::Result<Box<dyn RetrievalQueryStream>> {
        let delegate = self.delegate()?;
        let (ours, theirs) = stream_pair(self.provider_peer.clone(), self.client_peer.clone());
        task::spawn(async move { delegate.receive_query_stream(Box::new(theirs)).await });
        Ok(Box::new(ours))
    }

    async fn new_deal_stream(&self, _peer: PeerId) -> anyhow::Result<Box<dyn RetrievalDealStream>> {
        let delegate = self.delegate()?;
        let (ours, theirs) = stream_pair(self.provider_peer.clone(), self.client_peer.clone());
        task::spawn(async move { delegate.receive_deal_stream(Box::new(theirs)).await });
        Ok(Box::new(ours))
    }

    async fn set_delegate(&self, delegate: Arc<dyn RetrievalReceiver>) -> anyhow::Result<()> {
        *self.delegate.write() = Some(delegate);
        Ok(())
    }

    async fn stop_handling_requests(&self) -> anyhow::Result<()> {
        *self.delegate.write() = None;
        Ok(())
    }
}

// ------------------------------------------------------------------ nodes

struct ClientNode {
    vouchers: Mutex<Vec<BigInt>>,
    lanes: Mutex<u64>,
}

#[async_trait]
impl RetrievalClientNode for ClientNode {
    async fn get_or_create_payment_channel(
        &self,
        _client: &Address,
        _miner: &Address,
        _funds: &BigInt,
    ) -> anyhow::Result<Address> {
        Ok(Address::new_id(777))
    }

    async fn allocate_lane(&self, _payment_channel: &Address) -> anyhow::Result<u64> {
        let mut lanes = self.lanes.lock();
        let lane = *lanes;
        *lanes += 1;
        Ok(lane)
    }

    async fn create_payment_voucher(
        &self,
        payment_channel: &Address,
        lane: u64,
        amount: &BigInt,
    ) -> anyhow::Result<SignedVoucher> {
        let mut vouchers = self.vouchers.lock();
        vouchers.push(amount.clone());
        Ok(SignedVoucher {
            channel_addr: *payment_channel,
            time_lock_min: 0,
            time_lock_max: 0,
            secret_pre_image: Vec::new(),
            lane,
            nonce: vouchers.len() as u64,
            amount: amount.clone(),
            min_settle_height: 0,
            signature: None,
        })
    }
}

struct ProviderNode {
    car: Vec<u8>,
    unsealed: Mutex<u32>,
    saved: Mutex<Vec<BigInt>>,
}

#[async_trait]
impl RetrievalProviderNode for ProviderNode {
    async fn get_chain_head(&self) -> anyhow::Result<(TipSetToken, ChainEpoch)> {
        Ok((vec![1, 2, 3], 1))
    }

    async fn get_miner_worker_address(
        &self,
        _miner: &Address,
        _tok: &TipSetToken,
    ) -> anyhow::Result<Address> {
        Ok(Address::new_id(201))
    }

    async fn unseal_sector(
        &self,
        _sector_id: SectorNumber,
        _offset: u64,
        _length: u64,
    ) -> anyhow::Result<Box<dyn AsyncRead + Send + Unpin>> {
        *self.unsealed.lock() += 1;
        Ok(Box::new(futures::io::Cursor::new(self.car.clone())))
    }

    async fn save_voucher(
        &self,
        _payment_channel: &Address,
        voucher: &SignedVoucher,
        _proof: &[u8],
        _expected: &BigInt,
    ) -> anyhow::Result<BigInt> {
        self.saved.lock().push(voucher.amount.clone());
        Ok(voucher.amount.clone())
    }
}

// ------------------------------------------------------------------ setup

struct Harness {
    fixture: Fixture,
    client: RetrievalClient<MemoryDB>,
    provider: RetrievalProvider<MemoryDB, TestBlockstore>,
    client_node: Arc<ClientNode>,
    provider_node: Arc<ProviderNode>,
    client_blockstore: Arc<TestBlockstore>,
    provider_peer: PeerId,
    client_peer: PeerId,
}

async fn harness() -> Harness {
    let fixture = build_fixture();
    let provider_peer = PeerId::random();
    let client_peer = PeerId::random();
    let network = Arc::new(TestNetwork::new(provider_peer.clone(), client_peer.clone()));

    let piece_store = Arc::new(DbPieceStore::new(Arc::new(MemoryDB::default())));
    piece_store
        .add_deal_for_piece(
            &fixture.piece,
            piecestore::DealInfo {
                deal_id: 1,
                sector_id: 5,
                offset: 0,
                length: PIECE_LENGTH,
            },
        )
        .unwrap();
    piece_store
        .add_piece_block_locations(
            &fixture.piece,
            &[(
                fixture.root,
                BlockLocation {
                    rel_offset: 0,
                    block_size: ROOT_BLOCK_SIZE as u64,
                },
            )],
        )
        .unwrap();

    let provider_node = Arc::new(ProviderNode {
        car: build_car(&fixture),
        unsealed: Mutex::new(0),
        saved: Mutex::new(Vec::new()),
    });
    let provider = RetrievalProvider::new(
        Arc::new(MemoryDB::default()),
        network.clone(),
        provider_node.clone(),
        piece_store,
        Arc::new(TestBlockstore::default()),
        Address::new_id(200),
        None,
    );
    provider.set_params(ProviderParams {
        price_per_byte: BigInt::from(1000u64),
        payment_interval: 10_000,
        payment_interval_increase: 1_000,
    });
    provider.start().await.unwrap();

    let client_node = Arc::new(ClientNode {
        vouchers: Mutex::new(Vec::new()),
        lanes: Mutex::new(0),
    });
    let client_blockstore = Arc::new(TestBlockstore::default());
    let client = RetrievalClient::new(
        Arc::new(MemoryDB::default()),
        network,
        client_node.clone(),
        client_blockstore.clone(),
    );

    Harness {
        fixture,
        client,
        provider,
        client_node,
        provider_node,
        client_blockstore,
        provider_peer,
        client_peer,
    }
}

fn deal_params() -> Params {
    Params::new(BigInt::from(1000u64), 10_000, 1_000)
}

async fn wait_until<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..1000 {
        if check() {
            return;
        }
        task::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

// ------------------------------------------------------------------ tests

#[async_std::test]
async fn query_reports_availability_and_terms() {
    let h = harness().await;

    let response = h
        .client
        .query(h.provider_peer.clone(), h.fixture.root, None)
        .await
        .unwrap();
    assert_eq!(response.status, QueryResponseStatus::Available);
    assert_eq!(response.piece_cid_found, QueryItemStatus::Available);
    assert_eq!(response.size, PIECE_LENGTH);
    assert_eq!(response.payment_address, Address::new_id(201));
    assert_eq!(response.min_price_per_byte, BigInt::from(1000u64));
    assert_eq!(response.max_payment_interval, 10_000);

    // unknown payload
    let unknown = Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(b"unknown"));
    let response = h
        .client
        .query(h.provider_peer.clone(), unknown, None)
        .await
        .unwrap();
    assert_eq!(response.status, QueryResponseStatus::Unavailable);
    assert_eq!(response.piece_cid_found, QueryItemStatus::Unavailable);
    assert_eq!(response.size, 0);

    // known payload constrained to a piece the provider does not have
    let other_piece = Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(b"other piece"));
    let response = h
        .client
        .query(h.provider_peer.clone(), h.fixture.root, Some(other_piece))
        .await
        .unwrap();
    assert_eq!(response.status, QueryResponseStatus::Unavailable);
    assert_eq!(response.piece_cid_found, QueryItemStatus::Unavailable);
}

#[async_std::test]
async fn client_retrieves_file_paying_by_interval() {
    let h = harness().await;

    let id = h
        .client
        .retrieve(
            h.fixture.root,
            deal_params(),
            BigInt::from(100_000_000u64),
            h.provider_peer.clone(),
            Address::new_id(100),
            Address::new_id(200),
        )
        .unwrap();

    wait_until("client deal to complete", || {
        h.client
            .get_deal(id)
            .map(|deal| deal.status == DealStatus::Completed)
            .unwrap_or(false)
    })
    .await;

    let deal = h.client.get_deal(id).unwrap();
    assert_eq!(deal.total_received, 19_920);
    assert_eq!(deal.bytes_paid_for, 19_920);
    assert_eq!(deal.funds_spent, BigInt::from(19_920_000u64));
    assert_eq!(deal.message, "");

    // one voucher per checkpoint, for exactly the bytes delivered since
    // the previous one
    assert_eq!(
        *h.client_node.vouchers.lock(),
        vec![BigInt::from(10_136_000u64), BigInt::from(9_784_000u64)]
    );
    assert_eq!(
        *h.provider_node.saved.lock(),
        vec![BigInt::from(10_136_000u64), BigInt::from(9_784_000u64)]
    );
    // the piece was unsealed exactly once
    assert_eq!(*h.provider_node.unsealed.lock(), 1);

    let provider_key = ProviderDealIdentifier {
        receiver: h.client_peer.clone(),
        deal_id: id,
    };
    wait_until("provider deal to complete", || {
        h.provider
            .get_deal(&provider_key)
            .map(|deal| deal.status == DealStatus::Completed)
            .unwrap_or(false)
    })
    .await;
    let provider_deal = h.provider.get_deal(&provider_key).unwrap();
    assert_eq!(provider_deal.total_sent, 19_920);
    assert_eq!(provider_deal.funds_received, BigInt::from(19_920_000u64));

    // the delivered blocks reassemble the original file
    let root_bytes = h
        .client_blockstore
        .get(&h.fixture.root)
        .unwrap()
        .expect("root block not delivered");
    let root: Ipld = encoding::from_slice(&root_bytes).unwrap();
    let links = match root {
        Ipld::Map(ref map) => match map.get("Links") {
            Some(Ipld::List(links)) => links.clone(),
            _ => panic!("root node has no links"),
        },
        _ => panic!("root node is not a map"),
    };
    let mut file = Vec::new();
    for link in links {
        let cid = match link {
            Ipld::Link(cid) => cid,
            _ => panic!("link entry is not a link"),
        };
        file.extend_from_slice(&h.client_blockstore.get(&cid).unwrap().unwrap());
    }
    assert_eq!(file.len(), FILE_SIZE);
    assert_eq!(file, h.fixture.file);
}

#[async_std::test]
async fn client_aborts_before_overspending() {
    let h = harness().await;

    // budget covers less than the first checkpoint
    let id = h
        .client
        .retrieve(
            h.fixture.root,
            deal_params(),
            BigInt::from(5_000_000u64),
            h.provider_peer.clone(),
            Address::new_id(100),
            Address::new_id(200),
        )
        .unwrap();

    wait_until("client deal to error", || {
        h.client
            .get_deal(id)
            .map(|deal| deal.status == DealStatus::Errored)
            .unwrap_or(false)
    })
    .await;

    let deal = h.client.get_deal(id).unwrap();
    assert!(deal.message.starts_with("not enough funds left:"));
    // no voucher was created past the budget
    assert!(h.client_node.vouchers.lock().is_empty());
}

#[async_std::test]
async fn deal_params_validated_against_provider_terms() {
    let provider = ProviderParams {
        price_per_byte: BigInt::from(1000u64),
        payment_interval: 10_000,
        payment_interval_increase: 1_000,
    };

    assert!(check_deal_params(&provider, &deal_params()).is_ok());

    let mut cheap = deal_params();
    cheap.price_per_byte = BigInt::from(999u64);
    assert_eq!(
        check_deal_params(&provider, &cheap).unwrap_err(),
        "Price per byte too low"
    );

    let mut wide = deal_params();
    wide.payment_interval = 10_001;
    assert_eq!(
        check_deal_params(&provider, &wide).unwrap_err(),
        "Payment interval too large"
    );

    let mut steep = deal_params();
    steep.payment_interval_increase = 1_001;
    assert_eq!(
        check_deal_params(&provider, &steep).unwrap_err(),
        "Payment interval increase too large"
    );
}

#[async_std::test]
async fn rejected_terms_surface_to_the_client() {
    let h = harness().await;

    let mut params = deal_params();
    params.price_per_byte = BigInt::from(1u64);
    let id = h
        .client
        .retrieve(
            h.fixture.root,
            params,
            BigInt::from(100_000_000u64),
            h.provider_peer.clone(),
            Address::new_id(100),
            Address::new_id(200),
        )
        .unwrap();

    wait_until("client deal to error", || {
        h.client
            .get_deal(id)
            .map(|deal| deal.status == DealStatus::Errored)
            .unwrap_or(false)
    })
    .await;
    let deal = h.client.get_deal(id).unwrap();
    assert_eq!(deal.message, "deal rejected: Price per byte too low");
}

#[async_std::test]
async fn stopped_provider_stops_answering() {
    let h = harness().await;
    h.provider.stop(Duration::from_secs(1)).await.unwrap();

    let err = h
        .client
        .query(h.provider_peer.clone(), h.fixture.root, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("protocol not supported"));
}

#[test]
fn suspension_parks_and_resumes_status() {
    use fsm::MachineSpec;
    use retrievalmarket::provider::{ProviderDealSpec, ProviderEvent};

    let fixture = build_fixture();
    let mut deal = ProviderDealState::new(
        DealProposal {
            payload_cid: fixture.root,
            id: 1,
            params: deal_params(),
        },
        PeerId::random(),
    );
    deal.status = DealStatus::Ongoing;
    deal.total_sent = 5_000;

    ProviderDealSpec::apply(ProviderEvent::DealSuspended, &mut deal).unwrap();
    assert_eq!(deal.status, DealStatus::Suspended);
    // a second suspension is rejected
    assert!(ProviderDealSpec::apply(ProviderEvent::DealSuspended, &mut deal).is_err());

    ProviderDealSpec::apply(ProviderEvent::DealResumed, &mut deal).unwrap();
    assert_eq!(deal.status, DealStatus::Ongoing);
    assert_eq!(deal.total_sent, 5_000);
}

#[async_std::test]
async fn query_without_listening_provider_is_a_transport_error() {
    let fixture = build_fixture();
    let network = Arc::new(TestNetwork::new(PeerId::random(), PeerId::random()));
    let client = RetrievalClient::new(
        Arc::new(MemoryDB::default()),
        network.clone(),
        Arc::new(ClientNode {
            vouchers: Mutex::new(Vec::new()),
            lanes: Mutex::new(0),
        }),
        Arc::new(TestBlockstore::default()),
    );

    // nobody bound a delegate, so the protocol is not spoken
    let err = client
        .query(PeerId::random(), fixture.root, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("protocol not supported"));
}

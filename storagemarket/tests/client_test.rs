// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use async_std::task;
use async_trait::async_trait;
use cid::multihash::{Code, MultihashDigest};
use cid::Cid;
use db::MemoryDB;
use fsm::StateMachineGroup;
use fvm_ipld_encoding::{from_slice, to_vec, Cbor, DAG_CBOR};
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::deal::DealID;
use fvm_shared::piece::PaddedPieceSize;
use ipld::selector::Selector;
use libp2p::PeerId;
use market_types::TipSetToken;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storagemarket::client::{ClientDealEnvironment, ClientDealSpec};
use storagemarket::node::{StorageClientNode, StorageCommonNode};
use storagemarket::types::*;

fn test_cid(data: &[u8]) -> Cid {
    Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(data))
}

fn test_proposal() -> ClientDealProposal {
    ClientDealProposal {
        proposal: DealProposal {
            piece_cid: test_cid(b"piece"),
            piece_size: PaddedPieceSize(2048),
            client: Address::new_id(100),
            provider: Address::new_id(200),
            label: "deal".to_owned(),
            start_epoch: 10,
            end_epoch: 200,
            storage_price_per_epoch: BigInt::from(500u64),
            provider_collateral: BigInt::from(1000u64),
            client_collateral: BigInt::from(1000u64),
        },
        client_signature: Signature::new_bls(b"client-sig".to_vec()),
    }
}

fn test_deal(state: StorageDealStatus) -> ClientDeal {
    let proposal = test_proposal();
    ClientDeal {
        proposal_cid: proposal.cid().unwrap(),
        proposal,
        state,
        miner: PeerId::random(),
        miner_worker: Address::new_id(201),
        deal_id: None,
        data_ref: DataRef {
            transfer_type: TRANSFER_TYPE_GRAPHSYNC.to_owned(),
            root: test_cid(b"payload"),
        },
        message: String::new(),
        publish_message: None,
        add_funds_cid: None,
        payment_info: None,
        connection_closed: false,
    }
}

fn signed_response(response: Response) -> SignedResponse {
    SignedResponse {
        response,
        signature: Signature::new_bls(b"worker-sig".to_vec()),
    }
}

#[derive(Default)]
struct FakeNode {
    ensure_funds_cid: Option<Cid>,
    ensure_funds_error: Option<String>,
    wait_msg_exit_code: i64,
    reject_signatures: bool,
    published_deal_id: DealID,
    publish_error: Option<String>,
    activation_error: Option<String>,
}

#[async_trait]
impl StorageCommonNode for FakeNode {
    async fn get_chain_head(&self) -> anyhow::Result<(TipSetToken, ChainEpoch)> {
        Ok((vec![1, 2, 3], 1))
    }

    async fn verify_signature(
        &self,
        _signature: &Signature,
        _signer: &Address,
        _plaintext: &[u8],
        _tok: &TipSetToken,
    ) -> anyhow::Result<bool> {
        Ok(!self.reject_signatures)
    }

    async fn sign_bytes(&self, _signer: &Address, _data: &[u8]) -> anyhow::Result<Signature> {
        Ok(Signature::new_bls(b"fake-sig".to_vec()))
    }

    async fn ensure_funds(
        &self,
        _addr: &Address,
        _amount: &BigInt,
        _tok: &TipSetToken,
    ) -> anyhow::Result<Option<Cid>> {
        if let Some(e) = &self.ensure_funds_error {
            anyhow::bail!("{}", e);
        }
        Ok(self.ensure_funds_cid)
    }

    async fn wait_for_message(&self, _msg_cid: &Cid) -> anyhow::Result<i64> {
        Ok(self.wait_msg_exit_code)
    }

    async fn get_miner_worker_address(
        &self,
        _miner: &Address,
        _tok: &TipSetToken,
    ) -> anyhow::Result<Address> {
        Ok(Address::new_id(201))
    }
}

#[async_trait]
impl StorageClientNode for FakeNode {
    async fn validate_published_deal(&self, _deal: &ClientDeal) -> anyhow::Result<DealID> {
        if let Some(e) = &self.publish_error {
            anyhow::bail!("{}", e);
        }
        Ok(self.published_deal_id)
    }

    async fn on_deal_sector_committed(
        &self,
        _provider: &Address,
        _deal_id: DealID,
    ) -> anyhow::Result<()> {
        if let Some(e) = &self.activation_error {
            anyhow::bail!("{}", e);
        }
        Ok(())
    }
}

struct FakeEnv {
    node: FakeNode,
    responses: Mutex<VecDeque<Result<SignedResponse, String>>>,
    write_proposal_error: Option<String>,
    transfer_error: Option<String>,
    tagged: AtomicBool,
    closed: AtomicBool,
}

impl FakeEnv {
    fn new(node: FakeNode) -> Self {
        Self {
            node,
            responses: Mutex::new(VecDeque::new()),
            write_proposal_error: None,
            transfer_error: None,
            tagged: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn queue_response(&self, response: SignedResponse) {
        self.responses.lock().push_back(Ok(response));
    }
}

#[async_trait]
impl ClientDealEnvironment for FakeEnv {
    fn node(&self) -> &dyn StorageClientNode {
        &self.node
    }

    async fn write_deal_proposal(
        &self,
        _peer: PeerId,
        _proposal_cid: Cid,
        _proposal: DealProposalMessage,
    ) -> anyhow::Result<()> {
        match &self.write_proposal_error {
            Some(e) => anyhow::bail!("{}", e),
            None => Ok(()),
        }
    }

    async fn read_deal_response(&self, _proposal_cid: &Cid) -> anyhow::Result<SignedResponse> {
        match self.responses.lock().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => anyhow::bail!("{}", e),
            None => anyhow::bail!("no response queued"),
        }
    }

    fn tag_connection(&self, _proposal_cid: &Cid, _peer: PeerId) {
        self.tagged.store(true, Ordering::SeqCst);
    }

    async fn start_data_transfer(
        &self,
        _to: PeerId,
        _voucher: Cid,
        _base_cid: Cid,
        _selector: Selector,
    ) -> anyhow::Result<()> {
        match &self.transfer_error {
            Some(e) => anyhow::bail!("failed to open push data channel: {}", e),
            None => Ok(()),
        }
    }

    async fn close_stream(&self, _proposal_cid: &Cid) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

type EventLog = Arc<Mutex<Vec<(&'static str, ClientDeal)>>>;

/// Runs a deal from `deal.state` until it terminates, returning the
/// final record and every (event, snapshot) observed on the way.
async fn run_deal(env: Arc<FakeEnv>, deal: ClientDeal) -> (ClientDeal, EventLog) {
    let key = deal.proposal_cid;
    let group: StateMachineGroup<MemoryDB, ClientDealSpec> = StateMachineGroup::new(
        Arc::new(MemoryDB::default()),
        "/deals/client",
        env as Arc<dyn ClientDealEnvironment>,
    );
    let log: EventLog = Default::default();
    let sink = log.clone();
    group.subscribe(move |name, deal| sink.lock().push((name, deal.clone())));

    group.begin(deal).unwrap();
    for _ in 0..400 {
        let current = group.get(&key).unwrap();
        if StateMachineGroup::<MemoryDB, ClientDealSpec>::is_terminated(&current) {
            group.stop(Duration::from_secs(2)).await.unwrap();
            return (current, log);
        }
        task::sleep(Duration::from_millis(5)).await;
    }
    panic!("deal never terminated");
}

fn snapshot(log: &EventLog, event: &str) -> ClientDeal {
    log.lock()
        .iter()
        .find(|(name, _)| *name == event)
        .map(|(_, deal)| deal.clone())
        .unwrap_or_else(|| panic!("no {} event observed", event))
}

#[async_std::test]
async fn ensure_funds_immediate_success() {
    let env = Arc::new(FakeEnv::new(FakeNode::default()));
    let (_, log) = run_deal(env, test_deal(StorageDealStatus::EnsureClientFunds)).await;

    let deal = snapshot(&log, "FundsEnsured");
    assert_eq!(deal.state, StorageDealStatus::FundsEnsured);
    assert_eq!(deal.message, "");
    assert_eq!(deal.add_funds_cid, None);
}

#[async_std::test]
async fn ensure_funds_async() {
    let add_funds_cid = test_cid(b"add-funds");
    let env = Arc::new(FakeEnv::new(FakeNode {
        ensure_funds_cid: Some(add_funds_cid),
        ..Default::default()
    }));
    let (_, log) = run_deal(env, test_deal(StorageDealStatus::EnsureClientFunds)).await;

    let deal = snapshot(&log, "FundingInitiated");
    assert_eq!(deal.state, StorageDealStatus::ClientFunding);
    assert_eq!(deal.add_funds_cid, Some(add_funds_cid));
}

#[async_std::test]
async fn wait_for_funding_non_zero_exit() {
    let env = Arc::new(FakeEnv::new(FakeNode {
        wait_msg_exit_code: 19,
        ..Default::default()
    }));
    let mut deal = test_deal(StorageDealStatus::ClientFunding);
    deal.add_funds_cid = Some(test_cid(b"add-funds"));
    let (final_deal, log) = run_deal(env, deal).await;

    let failing = snapshot(&log, "FundsEnsureFailed");
    assert_eq!(failing.state, StorageDealStatus::Failing);
    assert_eq!(
        failing.message,
        "adding market funds failed: AddFunds exit code: 19"
    );
    // the failure is preserved through cleanup
    assert_eq!(final_deal.state, StorageDealStatus::Error);
    assert_eq!(
        final_deal.message,
        "adding market funds failed: AddFunds exit code: 19"
    );
}

#[async_std::test]
async fn unexpected_state_while_waiting_for_data_request() {
    let env = Arc::new(FakeEnv::new(FakeNode::default()));
    let deal = test_deal(StorageDealStatus::WaitingForDataRequest);
    env.queue_response(signed_response(Response {
        state: StorageDealStatus::ProposalNotFound,
        message: String::new(),
        proposal: deal.proposal_cid,
        publish_message: None,
    }));
    let (final_deal, log) = run_deal(env, deal).await;

    let failing = snapshot(&log, "UnexpectedDealState");
    assert_eq!(failing.state, StorageDealStatus::Failing);
    assert_eq!(
        failing.message,
        "unexpected deal status while waiting for data request: 1"
    );
    assert_eq!(final_deal.state, StorageDealStatus::Error);
}

#[async_std::test]
async fn response_to_wrong_proposal() {
    let env = Arc::new(FakeEnv::new(FakeNode::default()));
    let deal = test_deal(StorageDealStatus::Validating);
    env.queue_response(signed_response(Response {
        state: StorageDealStatus::ProposalAccepted,
        message: String::new(),
        proposal: test_cid(b"some other proposal"),
        publish_message: None,
    }));
    let (final_deal, log) = run_deal(env, deal).await;

    let failing = snapshot(&log, "ResponseDealDidNotMatch");
    assert_eq!(failing.state, StorageDealStatus::Failing);
    assert!(failing
        .message
        .starts_with("miner responded to a wrong proposal:"));
    assert_eq!(final_deal.state, StorageDealStatus::Error);
}

#[async_std::test]
async fn rejected_signature_on_response() {
    let env = Arc::new(FakeEnv::new(FakeNode {
        reject_signatures: true,
        ..Default::default()
    }));
    let deal = test_deal(StorageDealStatus::Validating);
    env.queue_response(signed_response(Response {
        state: StorageDealStatus::ProposalAccepted,
        message: String::new(),
        proposal: deal.proposal_cid,
        publish_message: None,
    }));
    let (final_deal, _) = run_deal(env, deal).await;

    assert_eq!(final_deal.state, StorageDealStatus::Error);
    assert!(final_deal
        .message
        .starts_with("unable to verify signature on deal response"));
}

#[async_std::test]
async fn deal_runs_to_activation() {
    let env = Arc::new(FakeEnv::new(FakeNode {
        published_deal_id: 42,
        ..Default::default()
    }));
    let deal = test_deal(StorageDealStatus::EnsureClientFunds);
    let publish_cid = test_cid(b"publish");
    env.queue_response(signed_response(Response {
        state: StorageDealStatus::WaitingForData,
        message: String::new(),
        proposal: deal.proposal_cid,
        publish_message: None,
    }));
    env.queue_response(signed_response(Response {
        state: StorageDealStatus::ProposalAccepted,
        message: String::new(),
        proposal: deal.proposal_cid,
        publish_message: Some(publish_cid),
    }));
    let (final_deal, log) = run_deal(env.clone(), deal).await;

    assert_eq!(final_deal.state, StorageDealStatus::Active);
    assert_eq!(final_deal.message, "");
    assert_eq!(final_deal.deal_id, Some(42));
    assert_eq!(final_deal.publish_message, Some(publish_cid));
    assert!(final_deal.connection_closed);
    assert!(env.tagged.load(Ordering::SeqCst));
    assert!(env.closed.load(Ordering::SeqCst));

    // the deal travelled the expected path
    let names: Vec<&str> = log.lock().iter().map(|(name, _)| *name).collect();
    assert_eq!(
        names,
        vec![
            "FundsEnsured",
            "DealProposed",
            "DataTransferInitiated",
            "DealAccepted",
            "DealPublished",
            "DealActivated",
        ]
    );
}

#[async_std::test]
async fn rejection_reports_provider_state_and_message() {
    let env = Arc::new(FakeEnv::new(FakeNode::default()));
    let deal = test_deal(StorageDealStatus::Transferring);
    env.queue_response(signed_response(Response {
        state: StorageDealStatus::ProposalRejected,
        message: "piece too small".to_owned(),
        proposal: deal.proposal_cid,
        publish_message: None,
    }));
    let (final_deal, _) = run_deal(env, deal).await;

    assert_eq!(final_deal.state, StorageDealStatus::Error);
    assert_eq!(
        final_deal.message,
        "deal failed: (State=2) piece too small"
    );
}

#[test]
fn proposal_message_roundtrip() {
    let message = DealProposalMessage {
        deal_proposal: test_proposal(),
        piece: DataRef {
            transfer_type: TRANSFER_TYPE_MANUAL.to_owned(),
            root: test_cid(b"payload"),
        },
    };
    let bz = to_vec(&message).unwrap();
    assert_eq!(from_slice::<DealProposalMessage>(&bz).unwrap(), message);
}

// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Event catalog and state-entry functions for client deals. Every
//! failure path maps to an event so no entry function errors past the
//! engine.

use super::{transfer_selector, ClientDealEnvironment};
use crate::types::{ClientDeal, DealProposalMessage, StorageDealStatus, TRANSFER_TYPE_MANUAL};
use async_trait::async_trait;
use cid::Cid;
use fsm::{Context, Error as FsmError, MachineSpec};
use fvm_ipld_encoding::Cbor;
use fvm_shared::deal::DealID;
use std::sync::Arc;

use StorageDealStatus::*;

/// Events that drive a client deal between states.
pub enum ClientEvent {
    FundingInitiated(Cid),
    FundsEnsured,
    FundsEnsureFailed(String),
    DealProposed,
    WriteProposalFailed(String),
    DataTransferInitiated,
    DataTransferFailed(String),
    ManualTransferRequested,
    UnexpectedDealState(u64),
    ReadResponseFailed(String),
    ResponseVerificationFailed,
    ResponseDealDidNotMatch { got: Cid, expected: Cid },
    DealRejected { state: u64, message: String },
    DealAccepted { publish_message: Option<Cid> },
    StreamCloseFailed(String),
    DealPublished(DealID),
    PublishValidationFailed(String),
    DealActivated,
    ActivationFailed(String),
    DealFailed(Option<String>),
}

fn expect_state(deal: &ClientDeal, allowed: &[StorageDealStatus]) -> Result<(), FsmError> {
    if allowed.contains(&deal.state) {
        Ok(())
    } else {
        Err(FsmError::InvalidTransition(format!(
            "not valid in state {}",
            deal.state
        )))
    }
}

pub struct ClientDealSpec;

#[async_trait]
impl MachineSpec for ClientDealSpec {
    type Key = Cid;
    type Record = ClientDeal;
    type Event = ClientEvent;
    type Environment = dyn ClientDealEnvironment;

    fn key(record: &ClientDeal) -> Cid {
        record.proposal_cid
    }

    fn event_name(event: &ClientEvent) -> &'static str {
        use ClientEvent::*;
        match event {
            FundingInitiated(_) => "FundingInitiated",
            FundsEnsured => "FundsEnsured",
            FundsEnsureFailed(_) => "FundsEnsureFailed",
            DealProposed => "DealProposed",
            WriteProposalFailed(_) => "WriteProposalFailed",
            DataTransferInitiated => "DataTransferInitiated",
            DataTransferFailed(_) => "DataTransferFailed",
            ManualTransferRequested => "ManualTransferRequested",
            UnexpectedDealState(_) => "UnexpectedDealState",
            ReadResponseFailed(_) => "ReadResponseFailed",
            ResponseVerificationFailed => "ResponseVerificationFailed",
            ResponseDealDidNotMatch { .. } => "ResponseDealDidNotMatch",
            DealRejected { .. } => "DealRejected",
            DealAccepted { .. } => "DealAccepted",
            StreamCloseFailed(_) => "StreamCloseFailed",
            DealPublished(_) => "DealPublished",
            PublishValidationFailed(_) => "PublishValidationFailed",
            DealActivated => "DealActivated",
            ActivationFailed(_) => "ActivationFailed",
            DealFailed(_) => "DealFailed",
        }
    }

    fn apply(event: ClientEvent, deal: &mut ClientDeal) -> Result<(), FsmError> {
        match event {
            ClientEvent::FundingInitiated(msg_cid) => {
                expect_state(deal, &[EnsureClientFunds])?;
                deal.add_funds_cid = Some(msg_cid);
                deal.state = ClientFunding;
            }
            ClientEvent::FundsEnsured => {
                expect_state(deal, &[EnsureClientFunds, ClientFunding])?;
                deal.state = FundsEnsured;
            }
            ClientEvent::FundsEnsureFailed(cause) => {
                expect_state(deal, &[EnsureClientFunds, ClientFunding])?;
                deal.message = format!("adding market funds failed: {}", cause);
                deal.state = Failing;
            }
            ClientEvent::DealProposed => {
                expect_state(deal, &[FundsEnsured])?;
                deal.state = WaitingForDataRequest;
            }
            ClientEvent::WriteProposalFailed(cause) => {
                expect_state(deal, &[FundsEnsured])?;
                deal.message = format!("sending proposal to storage provider failed: {}", cause);
                deal.connection_closed = true;
                deal.state = Error;
            }
            ClientEvent::DataTransferInitiated => {
                expect_state(deal, &[WaitingForDataRequest])?;
                deal.state = Transferring;
            }
            ClientEvent::DataTransferFailed(cause) => {
                expect_state(deal, &[WaitingForDataRequest, Transferring])?;
                deal.message = format!("failed to initiate data transfer: {}", cause);
                deal.state = Failing;
            }
            ClientEvent::ManualTransferRequested => {
                expect_state(deal, &[WaitingForDataRequest])?;
                deal.state = Validating;
            }
            ClientEvent::UnexpectedDealState(code) => {
                expect_state(deal, &[WaitingForDataRequest])?;
                deal.message = format!(
                    "unexpected deal status while waiting for data request: {}",
                    code
                );
                deal.state = Failing;
            }
            ClientEvent::ReadResponseFailed(cause) => {
                expect_state(deal, &[WaitingForDataRequest, Validating, Transferring])?;
                deal.message = format!("error reading Response message: {}", cause);
                deal.state = Error;
            }
            ClientEvent::ResponseVerificationFailed => {
                expect_state(deal, &[Validating, Transferring])?;
                deal.message = "unable to verify signature on deal response".to_owned();
                deal.state = Failing;
            }
            ClientEvent::ResponseDealDidNotMatch { got, expected } => {
                expect_state(deal, &[Validating, Transferring])?;
                deal.message = format!("miner responded to a wrong proposal: {} != {}", got, expected);
                deal.state = Failing;
            }
            ClientEvent::DealRejected { state, message } => {
                expect_state(deal, &[Validating, Transferring])?;
                deal.message = format!("deal failed: (State={}) {}", state, message);
                deal.state = Failing;
            }
            ClientEvent::DealAccepted { publish_message } => {
                expect_state(deal, &[Validating, Transferring])?;
                deal.publish_message = publish_message;
                deal.connection_closed = true;
                deal.state = ProposalAccepted;
            }
            ClientEvent::StreamCloseFailed(cause) => {
                expect_state(deal, &[Validating, Transferring])?;
                deal.message = format!("error attempting to close stream: {}", cause);
                deal.connection_closed = true;
                deal.state = Error;
            }
            ClientEvent::DealPublished(deal_id) => {
                expect_state(deal, &[ProposalAccepted])?;
                deal.deal_id = Some(deal_id);
                deal.state = Sealing;
            }
            ClientEvent::PublishValidationFailed(cause) => {
                expect_state(deal, &[ProposalAccepted])?;
                deal.message = format!("error validating deal published: {}", cause);
                deal.state = Error;
            }
            ClientEvent::DealActivated => {
                expect_state(deal, &[Sealing])?;
                deal.state = Active;
            }
            ClientEvent::ActivationFailed(cause) => {
                expect_state(deal, &[Sealing])?;
                deal.message = format!("error in deal activation: {}", cause);
                deal.state = Error;
            }
            ClientEvent::DealFailed(close_error) => {
                expect_state(deal, &[Failing])?;
                if let Some(cause) = close_error {
                    // keep the semantic cause first, then the close failure
                    deal.message =
                        format!("{}; error attempting to close stream: {}", deal.message, cause);
                }
                deal.connection_closed = true;
                deal.state = Error;
            }
        }
        Ok(())
    }

    async fn handle(
        ctx: Context<Self>,
        env: Arc<dyn ClientDealEnvironment>,
        deal: ClientDeal,
    ) {
        match deal.state {
            EnsureClientFunds => ensure_client_funds(ctx, env, deal).await,
            ClientFunding => wait_for_funding(ctx, env, deal).await,
            FundsEnsured => propose_deal(ctx, env, deal).await,
            WaitingForDataRequest => wait_for_data_request(ctx, env, deal).await,
            Validating | Transferring => verify_deal_response(ctx, env, deal).await,
            ProposalAccepted => validate_deal_published(ctx, env, deal).await,
            Sealing => verify_deal_activated(ctx, env, deal).await,
            Failing => fail_deal(ctx, env, deal).await,
            // terminal states release the deal's stream if one is still
            // held, e.g. after a transport failure
            Active | Error => {
                if !deal.connection_closed {
                    if let Err(e) = env.close_stream(&deal.proposal_cid).await {
                        log::info!("deal {}: closing stream: {}", deal.proposal_cid, e);
                    }
                }
            }
            _ => {}
        }
    }

    fn is_terminated(record: &ClientDeal) -> bool {
        matches!(record.state, Active | Error)
    }
}

async fn ensure_client_funds(
    ctx: Context<ClientDealSpec>,
    env: Arc<dyn ClientDealEnvironment>,
    deal: ClientDeal,
) {
    let node = env.node();
    let (tok, _) = match node.get_chain_head().await {
        Ok(head) => head,
        Err(e) => return ctx.trigger(ClientEvent::FundsEnsureFailed(e.to_string())),
    };
    let proposal = &deal.proposal.proposal;
    match node
        .ensure_funds(&proposal.client, &proposal.client_balance_requirement(), &tok)
        .await
    {
        Ok(Some(msg_cid)) => ctx.trigger(ClientEvent::FundingInitiated(msg_cid)),
        Ok(None) => ctx.trigger(ClientEvent::FundsEnsured),
        Err(e) => ctx.trigger(ClientEvent::FundsEnsureFailed(e.to_string())),
    }
}

async fn wait_for_funding(
    ctx: Context<ClientDealSpec>,
    env: Arc<dyn ClientDealEnvironment>,
    deal: ClientDeal,
) {
    let msg_cid = match deal.add_funds_cid {
        Some(msg_cid) => msg_cid,
        None => {
            return ctx.trigger(ClientEvent::FundsEnsureFailed(
                "no funding message recorded".to_owned(),
            ))
        }
    };
    match env.node().wait_for_message(&msg_cid).await {
        Ok(0) => ctx.trigger(ClientEvent::FundsEnsured),
        Ok(code) => ctx.trigger(ClientEvent::FundsEnsureFailed(format!(
            "AddFunds exit code: {}",
            code
        ))),
        Err(e) => ctx.trigger(ClientEvent::FundsEnsureFailed(e.to_string())),
    }
}

async fn propose_deal(
    ctx: Context<ClientDealSpec>,
    env: Arc<dyn ClientDealEnvironment>,
    deal: ClientDeal,
) {
    let message = DealProposalMessage {
        deal_proposal: deal.proposal.clone(),
        piece: deal.data_ref.clone(),
    };
    match env
        .write_deal_proposal(deal.miner.clone(), deal.proposal_cid, message)
        .await
    {
        Ok(()) => {
            env.tag_connection(&deal.proposal_cid, deal.miner.clone());
            ctx.trigger(ClientEvent::DealProposed)
        }
        Err(e) => ctx.trigger(ClientEvent::WriteProposalFailed(e.to_string())),
    }
}

async fn wait_for_data_request(
    ctx: Context<ClientDealSpec>,
    env: Arc<dyn ClientDealEnvironment>,
    deal: ClientDeal,
) {
    let response = match env.read_deal_response(&deal.proposal_cid).await {
        Ok(response) => response,
        Err(e) => return ctx.trigger(ClientEvent::ReadResponseFailed(e.to_string())),
    };
    match response.response.state {
        WaitingForData => {
            if deal.data_ref.transfer_type == TRANSFER_TYPE_MANUAL {
                return ctx.trigger(ClientEvent::ManualTransferRequested);
            }
            match env
                .start_data_transfer(
                    deal.miner.clone(),
                    deal.proposal_cid,
                    deal.data_ref.root,
                    transfer_selector(),
                )
                .await
            {
                Ok(()) => ctx.trigger(ClientEvent::DataTransferInitiated),
                Err(e) => ctx.trigger(ClientEvent::DataTransferFailed(e.to_string())),
            }
        }
        state => ctx.trigger(ClientEvent::UnexpectedDealState(state.code())),
    }
}

async fn verify_deal_response(
    ctx: Context<ClientDealSpec>,
    env: Arc<dyn ClientDealEnvironment>,
    deal: ClientDeal,
) {
    let signed = match env.read_deal_response(&deal.proposal_cid).await {
        Ok(signed) => signed,
        Err(e) => return ctx.trigger(ClientEvent::ReadResponseFailed(e.to_string())),
    };

    let node = env.node();
    let verified = async {
        let (tok, _) = node.get_chain_head().await?;
        let plaintext = signed.response.marshal_cbor()?;
        node.verify_signature(&signed.signature, &deal.miner_worker, &plaintext, &tok)
            .await
    }
    .await;
    match verified {
        Ok(true) => {}
        Ok(false) => return ctx.trigger(ClientEvent::ResponseVerificationFailed),
        Err(e) => return ctx.trigger(ClientEvent::ReadResponseFailed(e.to_string())),
    }

    if signed.response.proposal != deal.proposal_cid {
        return ctx.trigger(ClientEvent::ResponseDealDidNotMatch {
            got: signed.response.proposal,
            expected: deal.proposal_cid,
        });
    }

    match signed.response.state {
        ProposalAccepted => match env.close_stream(&deal.proposal_cid).await {
            Ok(()) => ctx.trigger(ClientEvent::DealAccepted {
                publish_message: signed.response.publish_message,
            }),
            Err(e) => ctx.trigger(ClientEvent::StreamCloseFailed(e.to_string())),
        },
        state => ctx.trigger(ClientEvent::DealRejected {
            state: state.code(),
            message: signed.response.message,
        }),
    }
}

async fn validate_deal_published(
    ctx: Context<ClientDealSpec>,
    env: Arc<dyn ClientDealEnvironment>,
    deal: ClientDeal,
) {
    match env.node().validate_published_deal(&deal).await {
        Ok(deal_id) => ctx.trigger(ClientEvent::DealPublished(deal_id)),
        Err(e) => ctx.trigger(ClientEvent::PublishValidationFailed(e.to_string())),
    }
}

async fn verify_deal_activated(
    ctx: Context<ClientDealSpec>,
    env: Arc<dyn ClientDealEnvironment>,
    deal: ClientDeal,
) {
    let deal_id = match deal.deal_id {
        Some(deal_id) => deal_id,
        None => {
            return ctx.trigger(ClientEvent::ActivationFailed(
                "no deal id recorded".to_owned(),
            ))
        }
    };
    match env
        .node()
        .on_deal_sector_committed(&deal.proposal.proposal.provider, deal_id)
        .await
    {
        Ok(()) => ctx.trigger(ClientEvent::DealActivated),
        Err(e) => ctx.trigger(ClientEvent::ActivationFailed(e.to_string())),
    }
}

async fn fail_deal(
    ctx: Context<ClientDealSpec>,
    env: Arc<dyn ClientDealEnvironment>,
    deal: ClientDeal,
) {
    if deal.connection_closed {
        return ctx.trigger(ClientEvent::DealFailed(None));
    }
    match env.close_stream(&deal.proposal_cid).await {
        Ok(()) => ctx.trigger(ClientEvent::DealFailed(None)),
        Err(e) => ctx.trigger(ClientEvent::DealFailed(Some(e.to_string()))),
    }
}

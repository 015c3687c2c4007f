// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Event catalog and state-entry functions for provider deals. The
//! provider mirrors the client: every inbound proposal is validated,
//! collateral escrowed, data verified, the deal published and handed
//! off, with progress reported to the client over the deal stream.

use super::ProviderDealEnvironment;
use crate::types::{MinerDeal, Response, StorageDealStatus};
use async_trait::async_trait;
use cid::Cid;
use fsm::{Context, Error as FsmError, MachineSpec};
use fvm_ipld_encoding::Cbor;
use fvm_shared::deal::DealID;
use log::info;
use piecestore::{BlockLocation, DealInfo};
use std::sync::Arc;

use StorageDealStatus::*;

/// Events that drive a provider deal between states.
pub enum ProviderEvent {
    DealRejected(String),
    DealAccepted,
    DataTransferCompleted,
    VerifyDataFailed(String),
    DataVerified,
    FundingInitiated(Cid),
    FundsEnsured,
    FundsEnsureFailed(String),
    DealPublishInitiated(Cid),
    DealPublishFailed(String),
    DealPublished(DealID),
    HandoffFailed(String),
    DealHandedOff,
    DealActivated,
    DealActivationFailed(String),
    SendResponseFailed(String),
    DealFailed(Option<String>),
}

fn expect_state(deal: &MinerDeal, allowed: &[StorageDealStatus]) -> Result<(), FsmError> {
    if allowed.contains(&deal.state) {
        Ok(())
    } else {
        Err(FsmError::InvalidTransition(format!(
            "not valid in state {}",
            deal.state
        )))
    }
}

pub struct ProviderDealSpec;

#[async_trait]
impl MachineSpec for ProviderDealSpec {
    type Key = Cid;
    type Record = MinerDeal;
    type Event = ProviderEvent;
    type Environment = dyn ProviderDealEnvironment;

    fn key(record: &MinerDeal) -> Cid {
        record.proposal_cid
    }

    fn event_name(event: &ProviderEvent) -> &'static str {
        use ProviderEvent::*;
        match event {
            DealRejected(_) => "DealRejected",
            DealAccepted => "DealAccepted",
            DataTransferCompleted => "DataTransferCompleted",
            VerifyDataFailed(_) => "VerifyDataFailed",
            DataVerified => "DataVerified",
            FundingInitiated(_) => "FundingInitiated",
            FundsEnsured => "FundsEnsured",
            FundsEnsureFailed(_) => "FundsEnsureFailed",
            DealPublishInitiated(_) => "DealPublishInitiated",
            DealPublishFailed(_) => "DealPublishFailed",
            DealPublished(_) => "DealPublished",
            HandoffFailed(_) => "HandoffFailed",
            DealHandedOff => "DealHandedOff",
            DealActivated => "DealActivated",
            DealActivationFailed(_) => "DealActivationFailed",
            SendResponseFailed(_) => "SendResponseFailed",
            DealFailed(_) => "DealFailed",
        }
    }

    fn apply(event: ProviderEvent, deal: &mut MinerDeal) -> Result<(), FsmError> {
        match event {
            ProviderEvent::DealRejected(reason) => {
                expect_state(deal, &[Validating, VerifyData])?;
                deal.message = format!("deal rejected: {}", reason);
                deal.state = Failing;
            }
            ProviderEvent::DealAccepted => {
                expect_state(deal, &[Validating])?;
                deal.state = WaitingForData;
            }
            ProviderEvent::DataTransferCompleted => {
                expect_state(deal, &[WaitingForData])?;
                deal.state = VerifyData;
            }
            ProviderEvent::VerifyDataFailed(cause) => {
                expect_state(deal, &[VerifyData])?;
                deal.message = format!("deal data verification failed: {}", cause);
                deal.state = Failing;
            }
            ProviderEvent::DataVerified => {
                expect_state(deal, &[VerifyData])?;
                deal.state = EnsureProviderFunds;
            }
            ProviderEvent::FundingInitiated(msg_cid) => {
                expect_state(deal, &[EnsureProviderFunds])?;
                deal.add_funds_cid = Some(msg_cid);
                deal.state = ProviderFunding;
            }
            ProviderEvent::FundsEnsured => {
                expect_state(deal, &[EnsureProviderFunds, ProviderFunding])?;
                deal.state = Publish;
            }
            ProviderEvent::FundsEnsureFailed(cause) => {
                expect_state(deal, &[EnsureProviderFunds, ProviderFunding])?;
                deal.message = format!("adding market funds failed: {}", cause);
                deal.state = Failing;
            }
            ProviderEvent::DealPublishInitiated(publish_cid) => {
                expect_state(deal, &[Publish])?;
                deal.publish_cid = Some(publish_cid);
                deal.state = Publishing;
            }
            ProviderEvent::DealPublishFailed(cause) => {
                expect_state(deal, &[Publish, Publishing])?;
                deal.message = format!("error publishing deal: {}", cause);
                deal.state = Failing;
            }
            ProviderEvent::DealPublished(deal_id) => {
                expect_state(deal, &[Publishing])?;
                deal.deal_id = Some(deal_id);
                deal.connection_closed = true;
                deal.state = Staged;
            }
            ProviderEvent::HandoffFailed(cause) => {
                expect_state(deal, &[Staged])?;
                deal.message = format!("error handing off deal to node: {}", cause);
                deal.state = Failing;
            }
            ProviderEvent::DealHandedOff => {
                expect_state(deal, &[Staged])?;
                deal.state = Sealing;
            }
            ProviderEvent::DealActivated => {
                expect_state(deal, &[Sealing])?;
                deal.state = Active;
            }
            ProviderEvent::DealActivationFailed(cause) => {
                expect_state(deal, &[Sealing])?;
                deal.message = format!("error in deal activation: {}", cause);
                deal.state = Error;
            }
            ProviderEvent::SendResponseFailed(cause) => {
                deal.message = format!("sending response to deal: {}", cause);
                deal.connection_closed = true;
                deal.state = Error;
            }
            ProviderEvent::DealFailed(close_error) => {
                expect_state(deal, &[Failing])?;
                if let Some(cause) = close_error {
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
        env: Arc<dyn ProviderDealEnvironment>,
        deal: MinerDeal,
    ) {
        match deal.state {
            Validating => validate_deal_proposal(ctx, env, deal).await,
            WaitingForData => request_deal_data(ctx, env, deal).await,
            VerifyData => verify_deal_data(ctx, env, deal).await,
            EnsureProviderFunds => ensure_provider_funds(ctx, env, deal).await,
            ProviderFunding => wait_for_funding(ctx, env, deal).await,
            Publish => publish_deal(ctx, env, deal).await,
            Publishing => wait_for_publish(ctx, env, deal).await,
            Staged => handoff_deal(ctx, env, deal).await,
            Sealing => verify_deal_activated(ctx, env, deal).await,
            Failing => fail_deal(ctx, env, deal).await,
            // terminal states release the deal's stream if one is still
            // held, e.g. after a transport failure
            Active | Error => {
                if !deal.connection_closed {
                    if let Err(e) = env.close_stream(&deal.proposal_cid).await {
                        info!("deal {}: closing stream: {}", deal.proposal_cid, e);
                    }
                }
            }
            _ => {}
        }
    }

    fn is_terminated(record: &MinerDeal) -> bool {
        matches!(record.state, Active | Error)
    }
}

async fn validate_deal_proposal(
    ctx: Context<ProviderDealSpec>,
    env: Arc<dyn ProviderDealEnvironment>,
    deal: MinerDeal,
) {
    let node = env.node();
    let verified = async {
        let (tok, _) = node.get_chain_head().await?;
        let proposal = &deal.proposal;
        let plaintext = proposal.proposal.marshal_cbor()?;
        node.verify_signature(
            &proposal.client_signature,
            &proposal.proposal.client,
            &plaintext,
            &tok,
        )
        .await
    }
    .await;
    match verified {
        Ok(true) => {}
        Ok(false) => {
            return ctx.trigger(ProviderEvent::DealRejected(
                "verifying StorageDealProposal: could not verify signature".to_owned(),
            ))
        }
        Err(e) => return ctx.trigger(ProviderEvent::DealRejected(e.to_string())),
    }

    if deal.proposal.proposal.provider != env.provider_address() {
        return ctx.trigger(ProviderEvent::DealRejected(format!(
            "incorrect provider for deal; proposal targets {}",
            deal.proposal.proposal.provider
        )));
    }

    let (accepted, reason) = env.accept_deal(&deal);
    if !accepted {
        return ctx.trigger(ProviderEvent::DealRejected(reason));
    }
    ctx.trigger(ProviderEvent::DealAccepted)
}

async fn request_deal_data(
    ctx: Context<ProviderDealSpec>,
    env: Arc<dyn ProviderDealEnvironment>,
    deal: MinerDeal,
) {
    let response = Response {
        state: WaitingForData,
        message: String::new(),
        proposal: deal.proposal_cid,
        publish_message: None,
    };
    // after a successful write the machine idles here until the data
    // transfer subsystem reports completion
    if let Err(e) = env.send_signed_response(&deal.proposal_cid, response).await {
        ctx.trigger(ProviderEvent::SendResponseFailed(e.to_string()));
    }
}

async fn verify_deal_data(
    ctx: Context<ProviderDealSpec>,
    env: Arc<dyn ProviderDealEnvironment>,
    deal: MinerDeal,
) {
    match env.generate_piece_commitment(&deal.piece_ref.root).await {
        Ok((piece_cid, _)) => {
            if piece_cid != deal.proposal.proposal.piece_cid {
                ctx.trigger(ProviderEvent::VerifyDataFailed(format!(
                    "proposal CommP does not match calculated CommP {}",
                    piece_cid
                )))
            } else {
                ctx.trigger(ProviderEvent::DataVerified)
            }
        }
        Err(e) => ctx.trigger(ProviderEvent::VerifyDataFailed(e.to_string())),
    }
}

async fn ensure_provider_funds(
    ctx: Context<ProviderDealSpec>,
    env: Arc<dyn ProviderDealEnvironment>,
    deal: MinerDeal,
) {
    let node = env.node();
    let (tok, _) = match node.get_chain_head().await {
        Ok(head) => head,
        Err(e) => return ctx.trigger(ProviderEvent::FundsEnsureFailed(e.to_string())),
    };
    let proposal = &deal.proposal.proposal;
    match node
        .ensure_funds(&proposal.provider, &proposal.provider_collateral, &tok)
        .await
    {
        Ok(Some(msg_cid)) => ctx.trigger(ProviderEvent::FundingInitiated(msg_cid)),
        Ok(None) => ctx.trigger(ProviderEvent::FundsEnsured),
        Err(e) => ctx.trigger(ProviderEvent::FundsEnsureFailed(e.to_string())),
    }
}

async fn wait_for_funding(
    ctx: Context<ProviderDealSpec>,
    env: Arc<dyn ProviderDealEnvironment>,
    deal: MinerDeal,
) {
    let msg_cid = match deal.add_funds_cid {
        Some(msg_cid) => msg_cid,
        None => {
            return ctx.trigger(ProviderEvent::FundsEnsureFailed(
                "no funding message recorded".to_owned(),
            ))
        }
    };
    match env.node().wait_for_message(&msg_cid).await {
        Ok(0) => ctx.trigger(ProviderEvent::FundsEnsured),
        Ok(code) => ctx.trigger(ProviderEvent::FundsEnsureFailed(format!(
            "AddFunds exit code: {}",
            code
        ))),
        Err(e) => ctx.trigger(ProviderEvent::FundsEnsureFailed(e.to_string())),
    }
}

async fn publish_deal(
    ctx: Context<ProviderDealSpec>,
    env: Arc<dyn ProviderDealEnvironment>,
    deal: MinerDeal,
) {
    match env.node().publish_deals(&deal).await {
        Ok(publish_cid) => ctx.trigger(ProviderEvent::DealPublishInitiated(publish_cid)),
        Err(e) => ctx.trigger(ProviderEvent::DealPublishFailed(e.to_string())),
    }
}

async fn wait_for_publish(
    ctx: Context<ProviderDealSpec>,
    env: Arc<dyn ProviderDealEnvironment>,
    deal: MinerDeal,
) {
    let publish_cid = match deal.publish_cid {
        Some(publish_cid) => publish_cid,
        None => {
            return ctx.trigger(ProviderEvent::DealPublishFailed(
                "no publish message recorded".to_owned(),
            ))
        }
    };

    let response = Response {
        state: ProposalAccepted,
        message: String::new(),
        proposal: deal.proposal_cid,
        publish_message: Some(publish_cid),
    };
    if let Err(e) = env.send_signed_response(&deal.proposal_cid, response).await {
        return ctx.trigger(ProviderEvent::SendResponseFailed(e.to_string()));
    }
    if let Err(e) = env.close_stream(&deal.proposal_cid).await {
        info!("deal {}: closing stream: {}", deal.proposal_cid, e);
    }

    match env.node().wait_for_published_deal(&publish_cid).await {
        Ok(deal_id) => ctx.trigger(ProviderEvent::DealPublished(deal_id)),
        Err(e) => ctx.trigger(ProviderEvent::DealPublishFailed(e.to_string())),
    }
}

async fn handoff_deal(
    ctx: Context<ProviderDealSpec>,
    env: Arc<dyn ProviderDealEnvironment>,
    deal: MinerDeal,
) {
    let proposal = &deal.proposal.proposal;
    let location = match env
        .node()
        .on_deal_complete(&deal, proposal.piece_size.0)
        .await
    {
        Ok(location) => location,
        Err(e) => return ctx.trigger(ProviderEvent::HandoffFailed(e.to_string())),
    };

    let deal_id = match deal.deal_id {
        Some(deal_id) => deal_id,
        None => {
            return ctx.trigger(ProviderEvent::HandoffFailed(
                "no deal id recorded".to_owned(),
            ))
        }
    };
    let indexed = env
        .piece_store()
        .add_deal_for_piece(
            &proposal.piece_cid,
            DealInfo {
                deal_id,
                sector_id: location.sector_id,
                offset: location.offset,
                length: location.length,
            },
        )
        .and_then(|_| {
            env.piece_store().add_piece_block_locations(
                &proposal.piece_cid,
                &[(
                    deal.piece_ref.root,
                    BlockLocation {
                        rel_offset: 0,
                        block_size: proposal.piece_size.0,
                    },
                )],
            )
        });
    match indexed {
        Ok(()) => ctx.trigger(ProviderEvent::DealHandedOff),
        Err(e) => ctx.trigger(ProviderEvent::HandoffFailed(e.to_string())),
    }
}

async fn verify_deal_activated(
    ctx: Context<ProviderDealSpec>,
    env: Arc<dyn ProviderDealEnvironment>,
    deal: MinerDeal,
) {
    let deal_id = match deal.deal_id {
        Some(deal_id) => deal_id,
        None => {
            return ctx.trigger(ProviderEvent::DealActivationFailed(
                "no deal id recorded".to_owned(),
            ))
        }
    };
    match env
        .node()
        .on_deal_sector_committed(&deal.proposal.proposal.provider, deal_id)
        .await
    {
        Ok(()) => ctx.trigger(ProviderEvent::DealActivated),
        Err(e) => ctx.trigger(ProviderEvent::DealActivationFailed(e.to_string())),
    }
}

async fn fail_deal(
    ctx: Context<ProviderDealSpec>,
    env: Arc<dyn ProviderDealEnvironment>,
    deal: MinerDeal,
) {
    if deal.connection_closed {
        return ctx.trigger(ProviderEvent::DealFailed(None));
    }
    let response = Response {
        state: Failing,
        message: deal.message.clone(),
        proposal: deal.proposal_cid,
        publish_message: None,
    };
    if let Err(e) = env.send_signed_response(&deal.proposal_cid, response).await {
        info!("deal {}: sending failure response: {}", deal.proposal_cid, e);
    }
    match env.close_stream(&deal.proposal_cid).await {
        Ok(()) => ctx.trigger(ProviderEvent::DealFailed(None)),
        Err(e) => ctx.trigger(ProviderEvent::DealFailed(Some(e.to_string()))),
    }
}

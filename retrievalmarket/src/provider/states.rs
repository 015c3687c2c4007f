// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Event catalog and state-entry functions for retrieval provider
//! deals. Blocks are sent until a payment checkpoint is reached, then
//! the machine waits for a voucher before resuming, finishing with a
//! final payment for any remainder.

use super::ProviderDealEnvironment;
use crate::types::{DealResponse, DealStatus, ProviderDealIdentifier, ProviderDealState};
use async_trait::async_trait;
use fsm::{Context, Error as FsmError, MachineSpec};
use fvm_shared::bigint::BigInt;
use log::info;
use num_traits::{ToPrimitive, Zero};
use std::sync::Arc;

use DealStatus::*;

/// Events that drive a provider retrieval deal between states.
pub enum ProviderEvent {
    DealRejected(String),
    DealNotFound(String),
    DealAccepted,
    UnsealErrored(String),
    UnsealComplete,
    FundsRequested { total_sent: u64 },
    LastFundsRequested { total_sent: u64 },
    AllBlocksSent { total_sent: u64 },
    BlockErrored(String),
    WriteResponseFailed(String),
    ReadPaymentFailed(String),
    SaveVoucherFailed(String),
    InsufficientPayment { expected: BigInt, received: BigInt },
    PaymentReceived { amount: BigInt },
    DealSuspended,
    DealResumed,
    Failed(Option<String>),
    Complete,
}

fn expect_status(deal: &ProviderDealState, allowed: &[DealStatus]) -> Result<(), FsmError> {
    if allowed.contains(&deal.status) {
        Ok(())
    } else {
        Err(FsmError::InvalidTransition(format!(
            "not valid in status {}",
            deal.status
        )))
    }
}

pub struct ProviderDealSpec;

#[async_trait]
impl MachineSpec for ProviderDealSpec {
    type Key = ProviderDealIdentifier;
    type Record = ProviderDealState;
    type Event = ProviderEvent;
    type Environment = dyn ProviderDealEnvironment;

    fn key(record: &ProviderDealState) -> ProviderDealIdentifier {
        record.identifier()
    }

    fn event_name(event: &ProviderEvent) -> &'static str {
        use ProviderEvent::*;
        match event {
            DealRejected(_) => "DealRejected",
            DealNotFound(_) => "DealNotFound",
            DealAccepted => "DealAccepted",
            UnsealErrored(_) => "UnsealErrored",
            UnsealComplete => "UnsealComplete",
            FundsRequested { .. } => "FundsRequested",
            LastFundsRequested { .. } => "LastFundsRequested",
            AllBlocksSent { .. } => "AllBlocksSent",
            BlockErrored(_) => "BlockErrored",
            WriteResponseFailed(_) => "WriteResponseFailed",
            ReadPaymentFailed(_) => "ReadPaymentFailed",
            SaveVoucherFailed(_) => "SaveVoucherFailed",
            InsufficientPayment { .. } => "InsufficientPayment",
            PaymentReceived { .. } => "PaymentReceived",
            DealSuspended => "DealSuspended",
            DealResumed => "DealResumed",
            Failed(_) => "Failed",
            Complete => "Complete",
        }
    }

    fn apply(event: ProviderEvent, deal: &mut ProviderDealState) -> Result<(), FsmError> {
        match event {
            ProviderEvent::DealRejected(reason) => {
                expect_status(deal, &[New])?;
                deal.message = format!("deal rejected: {}", reason);
                deal.status = Rejected;
            }
            ProviderEvent::DealNotFound(message) => {
                expect_status(deal, &[New])?;
                deal.message = message;
                deal.status = DealNotFound;
            }
            ProviderEvent::DealAccepted => {
                expect_status(deal, &[New])?;
                deal.status = Unsealing;
            }
            ProviderEvent::UnsealErrored(cause) => {
                expect_status(deal, &[Unsealing])?;
                deal.message = format!("unsealing payload: {}", cause);
                deal.status = Failing;
            }
            ProviderEvent::UnsealComplete => {
                expect_status(deal, &[Unsealing])?;
                deal.status = Ongoing;
            }
            ProviderEvent::FundsRequested { total_sent } => {
                expect_status(deal, &[Ongoing])?;
                deal.total_sent = total_sent;
                deal.status = FundsNeeded;
            }
            ProviderEvent::LastFundsRequested { total_sent } => {
                expect_status(deal, &[Ongoing])?;
                deal.total_sent = total_sent;
                deal.status = FundsNeededLastPayment;
            }
            ProviderEvent::AllBlocksSent { total_sent } => {
                expect_status(deal, &[Ongoing])?;
                deal.total_sent = total_sent;
                deal.status = Finalizing;
            }
            ProviderEvent::BlockErrored(cause) => {
                expect_status(deal, &[Ongoing])?;
                deal.message = format!("reading payload blocks: {}", cause);
                deal.status = Failing;
            }
            ProviderEvent::WriteResponseFailed(cause) => {
                expect_status(
                    deal,
                    &[New, Unsealing, Ongoing, FundsNeeded, FundsNeededLastPayment, Finalizing],
                )?;
                deal.message = format!("writing deal response: {}", cause);
                deal.status = Failing;
            }
            ProviderEvent::ReadPaymentFailed(cause) => {
                expect_status(deal, &[FundsNeeded, FundsNeededLastPayment])?;
                deal.message = format!("reading deal payment: {}", cause);
                deal.status = Failing;
            }
            ProviderEvent::SaveVoucherFailed(cause) => {
                expect_status(deal, &[FundsNeeded, FundsNeededLastPayment])?;
                deal.message = format!("saving voucher: {}", cause);
                deal.status = Failing;
            }
            ProviderEvent::InsufficientPayment { expected, received } => {
                expect_status(deal, &[FundsNeeded, FundsNeededLastPayment])?;
                deal.message = format!(
                    "insufficient payment: expected {}, received {}",
                    expected, received
                );
                deal.status = Failing;
            }
            ProviderEvent::PaymentReceived { amount } => {
                expect_status(deal, &[FundsNeeded, FundsNeededLastPayment])?;
                deal.funds_received += amount;
                deal.current_interval += deal.proposal.params.payment_interval_increase;
                deal.status = if deal.status == FundsNeededLastPayment {
                    Finalizing
                } else {
                    Ongoing
                };
            }
            ProviderEvent::DealSuspended => {
                if Self::is_terminated(deal) || deal.status == Suspended {
                    return Err(FsmError::InvalidTransition(format!(
                        "not valid in status {}",
                        deal.status
                    )));
                }
                deal.suspended_from = Some(deal.status);
                deal.status = Suspended;
            }
            ProviderEvent::DealResumed => {
                expect_status(deal, &[Suspended])?;
                deal.status = deal.suspended_from.take().unwrap_or(New);
            }
            ProviderEvent::Failed(close_error) => {
                expect_status(deal, &[Failing])?;
                if let Some(cause) = close_error {
                    deal.message =
                        format!("{}; error attempting to close stream: {}", deal.message, cause);
                }
                deal.status = Errored;
            }
            ProviderEvent::Complete => {
                expect_status(deal, &[Finalizing])?;
                deal.status = Completed;
            }
        }
        Ok(())
    }

    async fn handle(
        ctx: Context<Self>,
        env: Arc<dyn ProviderDealEnvironment>,
        deal: ProviderDealState,
    ) {
        match deal.status {
            New => receive_deal(ctx, env, deal).await,
            Unsealing => unseal(ctx, env, deal).await,
            Ongoing => send_blocks(ctx, env, deal).await,
            FundsNeeded | FundsNeededLastPayment => process_payment(ctx, env, deal).await,
            Finalizing => finalize_deal(ctx, env, deal).await,
            Failing => fail_deal(ctx, env, deal).await,
            _ => {}
        }
    }

    fn is_terminated(record: &ProviderDealState) -> bool {
        matches!(record.status, Completed | Errored | Rejected | DealNotFound)
    }
}

/// Reject the deal on its stream, then settle into `event`.
async fn reject_deal(
    ctx: Context<ProviderDealSpec>,
    env: Arc<dyn ProviderDealEnvironment>,
    deal: &ProviderDealState,
    status: DealStatus,
    message: String,
    event: ProviderEvent,
) {
    let id = deal.identifier();
    let response = DealResponse {
        status,
        id: deal.proposal.id,
        payment_owed: BigInt::zero(),
        message,
        blocks: Vec::new(),
    };
    if let Err(e) = env.write_deal_response(&id, response).await {
        info!("deal {}: writing rejection: {}", id, e);
    }
    if let Err(e) = env.close_stream(&id).await {
        info!("deal {}: closing stream: {}", id, e);
    }
    ctx.trigger(event)
}

async fn receive_deal(
    ctx: Context<ProviderDealSpec>,
    env: Arc<dyn ProviderDealEnvironment>,
    deal: ProviderDealState,
) {
    if let Err(reason) = env.check_deal_params(&deal.proposal.params) {
        let event = ProviderEvent::DealRejected(reason.clone());
        return reject_deal(ctx, env.clone(), &deal, Rejected, reason, event).await;
    }

    match env.piece_store().get_cid_info(&deal.proposal.payload_cid) {
        Ok(_) => {}
        Err(piecestore::Error::NotFound) => {
            let message = format!("payload {} not found", deal.proposal.payload_cid);
            let event = ProviderEvent::DealNotFound(message.clone());
            return reject_deal(ctx, env.clone(), &deal, DealNotFound, message, event).await;
        }
        Err(e) => {
            let message = e.to_string();
            let event = ProviderEvent::DealRejected(message.clone());
            return reject_deal(ctx, env.clone(), &deal, Rejected, message, event).await;
        }
    }

    let (accepted, reason) = env.accept_deal(&deal);
    if !accepted {
        let event = ProviderEvent::DealRejected(reason.clone());
        return reject_deal(ctx, env.clone(), &deal, Rejected, reason, event).await;
    }
    ctx.trigger(ProviderEvent::DealAccepted)
}

async fn unseal(
    ctx: Context<ProviderDealSpec>,
    env: Arc<dyn ProviderDealEnvironment>,
    deal: ProviderDealState,
) {
    let id = deal.identifier();
    let response = DealResponse {
        status: Accepted,
        id: deal.proposal.id,
        payment_owed: BigInt::zero(),
        message: String::new(),
        blocks: Vec::new(),
    };
    if let Err(e) = env.write_deal_response(&id, response).await {
        return ctx.trigger(ProviderEvent::WriteResponseFailed(e.to_string()));
    }
    match env.prepare_blocks(&deal).await {
        Ok(()) => ctx.trigger(ProviderEvent::UnsealComplete),
        Err(e) => ctx.trigger(ProviderEvent::UnsealErrored(e.to_string())),
    }
}

async fn send_blocks(
    ctx: Context<ProviderDealSpec>,
    env: Arc<dyn ProviderDealEnvironment>,
    deal: ProviderDealState,
) {
    let id = deal.identifier();
    let price = deal.proposal.params.price_per_byte.clone();
    // bytes the received funds already cover; checkpoints trigger once
    // the unpaid tail reaches the current interval
    let threshold = if price.is_zero() {
        None
    } else {
        (&deal.funds_received / &price)
            .to_u64()
            .map(|paid_for| paid_for + deal.current_interval)
    };

    let mut total_sent = deal.total_sent;
    let mut blocks = Vec::new();
    let mut all_sent = false;
    loop {
        if let Some(threshold) = threshold {
            if total_sent >= threshold {
                break;
            }
        }
        match env.next_block(&id).await {
            Ok(Some(block)) => {
                total_sent += block.data.len() as u64;
                blocks.push(block);
            }
            Ok(None) => {
                all_sent = true;
                break;
            }
            Err(e) => return ctx.trigger(ProviderEvent::BlockErrored(e.to_string())),
        }
    }

    let owed = BigInt::from(total_sent) * &price - &deal.funds_received;
    let (status, payment_owed, event) = if all_sent {
        if owed > BigInt::zero() {
            (
                FundsNeededLastPayment,
                owed,
                ProviderEvent::LastFundsRequested { total_sent },
            )
        } else {
            (
                BlocksComplete,
                BigInt::zero(),
                ProviderEvent::AllBlocksSent { total_sent },
            )
        }
    } else {
        (FundsNeeded, owed, ProviderEvent::FundsRequested { total_sent })
    };

    let response = DealResponse {
        status,
        id: deal.proposal.id,
        payment_owed,
        message: String::new(),
        blocks,
    };
    match env.write_deal_response(&id, response).await {
        Ok(()) => ctx.trigger(event),
        Err(e) => ctx.trigger(ProviderEvent::WriteResponseFailed(e.to_string())),
    }
}

async fn process_payment(
    ctx: Context<ProviderDealSpec>,
    env: Arc<dyn ProviderDealEnvironment>,
    deal: ProviderDealState,
) {
    let id = deal.identifier();
    let payment = match env.read_deal_payment(&id).await {
        Ok(payment) => payment,
        Err(e) => return ctx.trigger(ProviderEvent::ReadPaymentFailed(e.to_string())),
    };

    let owed =
        BigInt::from(deal.total_sent) * &deal.proposal.params.price_per_byte - &deal.funds_received;
    let received = match env
        .node()
        .save_voucher(
            &payment.payment_channel,
            &payment.payment_voucher,
            &[],
            &owed,
        )
        .await
    {
        Ok(received) => received,
        Err(e) => return ctx.trigger(ProviderEvent::SaveVoucherFailed(e.to_string())),
    };

    if received < owed {
        return ctx.trigger(ProviderEvent::InsufficientPayment {
            expected: owed,
            received,
        });
    }
    ctx.trigger(ProviderEvent::PaymentReceived { amount: received })
}

async fn finalize_deal(
    ctx: Context<ProviderDealSpec>,
    env: Arc<dyn ProviderDealEnvironment>,
    deal: ProviderDealState,
) {
    let id = deal.identifier();
    let response = DealResponse {
        status: Completed,
        id: deal.proposal.id,
        payment_owed: BigInt::zero(),
        message: String::new(),
        blocks: Vec::new(),
    };
    if let Err(e) = env.write_deal_response(&id, response).await {
        return ctx.trigger(ProviderEvent::WriteResponseFailed(e.to_string()));
    }
    if let Err(e) = env.close_stream(&id).await {
        info!("deal {}: closing stream: {}", id, e);
    }
    ctx.trigger(ProviderEvent::Complete)
}

async fn fail_deal(
    ctx: Context<ProviderDealSpec>,
    env: Arc<dyn ProviderDealEnvironment>,
    deal: ProviderDealState,
) {
    let id = deal.identifier();
    let response = DealResponse {
        status: Errored,
        id: deal.proposal.id,
        payment_owed: BigInt::zero(),
        message: deal.message.clone(),
        blocks: Vec::new(),
    };
    if let Err(e) = env.write_deal_response(&id, response).await {
        info!("deal {}: writing failure response: {}", id, e);
    }
    match env.close_stream(&id).await {
        Ok(()) => ctx.trigger(ProviderEvent::Failed(None)),
        Err(e) => ctx.trigger(ProviderEvent::Failed(Some(e.to_string()))),
    }
}

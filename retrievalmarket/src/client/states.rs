// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Event catalog and state-entry functions for retrieval client deals.
//! The client proposes, sets up a payment channel lane, then alternates
//! between receiving blocks and answering the provider's payment
//! checkpoints until the deal completes.

use super::ClientDealEnvironment;
use crate::types::{ClientDealState, DealId, DealPayment, DealStatus};
use async_trait::async_trait;
use fsm::{Context, Error as FsmError, MachineSpec};
use fvm_shared::bigint::BigInt;
use market_types::PaymentInfo;
use num_traits::Zero;
use std::sync::Arc;

use DealStatus::*;

/// Events that drive a client retrieval deal between states.
pub enum ClientEvent {
    DealAccepted,
    DealRejected(String),
    DealNotFound(String),
    UnknownResponseReceived(u64),
    WriteDealProposalErrored(String),
    ReadDealResponseErrored(String),
    PaymentChannelErrored(String),
    PaymentChannelReady(PaymentInfo),
    BlocksReceived { total_received: u64 },
    BlockVerificationFailed(String),
    PaymentRequested { total_received: u64 },
    LastPaymentRequested { total_received: u64 },
    CompleteReceived { total_received: u64 },
    ProviderErrored(String),
    FundsExpended { required: BigInt },
    CreateVoucherFailed(String),
    WriteDealPaymentErrored(String),
    PaymentSent { amount: BigInt },
    Failed(Option<String>),
    Complete,
}

fn expect_status(deal: &ClientDealState, allowed: &[DealStatus]) -> Result<(), FsmError> {
    if allowed.contains(&deal.status) {
        Ok(())
    } else {
        Err(FsmError::InvalidTransition(format!(
            "not valid in status {}",
            deal.status
        )))
    }
}

pub struct ClientDealSpec;

#[async_trait]
impl MachineSpec for ClientDealSpec {
    type Key = DealId;
    type Record = ClientDealState;
    type Event = ClientEvent;
    type Environment = dyn ClientDealEnvironment;

    fn key(record: &ClientDealState) -> DealId {
        record.deal_proposal.id
    }

    fn event_name(event: &ClientEvent) -> &'static str {
        use ClientEvent::*;
        match event {
            DealAccepted => "DealAccepted",
            DealRejected(_) => "DealRejected",
            DealNotFound(_) => "DealNotFound",
            UnknownResponseReceived(_) => "UnknownResponseReceived",
            WriteDealProposalErrored(_) => "WriteDealProposalErrored",
            ReadDealResponseErrored(_) => "ReadDealResponseErrored",
            PaymentChannelErrored(_) => "PaymentChannelErrored",
            PaymentChannelReady(_) => "PaymentChannelReady",
            BlocksReceived { .. } => "BlocksReceived",
            BlockVerificationFailed(_) => "BlockVerificationFailed",
            PaymentRequested { .. } => "PaymentRequested",
            LastPaymentRequested { .. } => "LastPaymentRequested",
            CompleteReceived { .. } => "CompleteReceived",
            ProviderErrored(_) => "ProviderErrored",
            FundsExpended { .. } => "FundsExpended",
            CreateVoucherFailed(_) => "CreateVoucherFailed",
            WriteDealPaymentErrored(_) => "WriteDealPaymentErrored",
            PaymentSent { .. } => "PaymentSent",
            Failed(_) => "Failed",
            Complete => "Complete",
        }
    }

    fn apply(event: ClientEvent, deal: &mut ClientDealState) -> Result<(), FsmError> {
        match event {
            ClientEvent::DealAccepted => {
                expect_status(deal, &[New])?;
                deal.status = PaymentChannelCreating;
            }
            ClientEvent::DealRejected(message) => {
                expect_status(deal, &[New])?;
                deal.message = format!("deal rejected: {}", message);
                deal.status = Failing;
            }
            ClientEvent::DealNotFound(message) => {
                expect_status(deal, &[New])?;
                deal.message = format!("deal not found: {}", message);
                deal.status = Failing;
            }
            ClientEvent::UnknownResponseReceived(code) => {
                expect_status(deal, &[New])?;
                deal.message = format!("unexpected deal response status: {}", code);
                deal.status = Failing;
            }
            ClientEvent::WriteDealProposalErrored(cause) => {
                expect_status(deal, &[New])?;
                deal.message = format!("proposing deal: {}", cause);
                deal.status = Failing;
            }
            ClientEvent::ReadDealResponseErrored(cause) => {
                expect_status(deal, &[New, Ongoing])?;
                deal.message = format!("reading deal response: {}", cause);
                deal.status = Failing;
            }
            ClientEvent::PaymentChannelErrored(cause) => {
                expect_status(deal, &[PaymentChannelCreating])?;
                deal.message = format!("get or create payment channel: {}", cause);
                deal.status = Failing;
            }
            ClientEvent::PaymentChannelReady(payment_info) => {
                expect_status(deal, &[PaymentChannelCreating])?;
                deal.payment_info = Some(payment_info);
                deal.status = Ongoing;
            }
            ClientEvent::BlocksReceived { total_received } => {
                expect_status(deal, &[Ongoing])?;
                deal.total_received = total_received;
            }
            ClientEvent::BlockVerificationFailed(cause) => {
                expect_status(deal, &[Ongoing])?;
                deal.message = format!("consuming block: {}", cause);
                deal.status = Failing;
            }
            ClientEvent::PaymentRequested { total_received } => {
                expect_status(deal, &[Ongoing])?;
                deal.total_received = total_received;
                deal.status = FundsNeeded;
            }
            ClientEvent::LastPaymentRequested { total_received } => {
                expect_status(deal, &[Ongoing])?;
                deal.total_received = total_received;
                deal.status = FundsNeededLastPayment;
            }
            ClientEvent::CompleteReceived { total_received } => {
                expect_status(deal, &[Ongoing])?;
                deal.total_received = total_received;
                deal.status = Finalizing;
            }
            ClientEvent::ProviderErrored(message) => {
                expect_status(deal, &[New, Ongoing])?;
                deal.message = message;
                deal.status = Failing;
            }
            ClientEvent::FundsExpended { required } => {
                expect_status(deal, &[FundsNeeded, FundsNeededLastPayment])?;
                deal.message = format!(
                    "not enough funds left: {} requested, {} unspent",
                    required,
                    &deal.total_funds - &deal.funds_spent
                );
                deal.status = InsufficientFunds;
            }
            ClientEvent::CreateVoucherFailed(cause) => {
                expect_status(deal, &[FundsNeeded, FundsNeededLastPayment])?;
                deal.message = format!("creating payment voucher: {}", cause);
                deal.status = Failing;
            }
            ClientEvent::WriteDealPaymentErrored(cause) => {
                expect_status(deal, &[FundsNeeded, FundsNeededLastPayment])?;
                deal.message = format!("writing deal payment: {}", cause);
                deal.status = Failing;
            }
            ClientEvent::PaymentSent { amount } => {
                expect_status(deal, &[FundsNeeded, FundsNeededLastPayment])?;
                deal.funds_spent += amount;
                deal.bytes_paid_for = deal.total_received;
                deal.current_interval += deal.deal_proposal.params.payment_interval_increase;
                deal.status = Ongoing;
            }
            ClientEvent::Failed(close_error) => {
                expect_status(deal, &[Failing, InsufficientFunds, Finalizing])?;
                if let Some(cause) = close_error {
                    deal.message =
                        format!("{}; error attempting to close stream: {}", deal.message, cause);
                }
                deal.status = Errored;
            }
            ClientEvent::Complete => {
                expect_status(deal, &[Finalizing])?;
                deal.status = Completed;
            }
        }
        Ok(())
    }

    async fn handle(
        ctx: Context<Self>,
        env: Arc<dyn ClientDealEnvironment>,
        deal: ClientDealState,
    ) {
        match deal.status {
            New => propose_deal(ctx, env, deal).await,
            PaymentChannelCreating => setup_payment_channel(ctx, env, deal).await,
            Ongoing => receive_blocks(ctx, env, deal).await,
            FundsNeeded | FundsNeededLastPayment => send_funds(ctx, env, deal).await,
            Finalizing => finalize_deal(ctx, env, deal).await,
            Failing | InsufficientFunds => fail_deal(ctx, env, deal).await,
            _ => {}
        }
    }

    fn is_terminated(record: &ClientDealState) -> bool {
        matches!(record.status, Completed | Errored)
    }
}

async fn propose_deal(
    ctx: Context<ClientDealSpec>,
    env: Arc<dyn ClientDealEnvironment>,
    deal: ClientDealState,
) {
    let id = deal.deal_proposal.id;
    let opened = async {
        env.open_deal_stream(id, deal.sender.clone()).await?;
        env.write_deal_proposal(id, deal.deal_proposal.clone()).await
    }
    .await;
    if let Err(e) = opened {
        return ctx.trigger(ClientEvent::WriteDealProposalErrored(e.to_string()));
    }

    let response = match env.read_deal_response(id).await {
        Ok(response) => response,
        Err(e) => return ctx.trigger(ClientEvent::ReadDealResponseErrored(e.to_string())),
    };
    match response.status {
        Accepted => ctx.trigger(ClientEvent::DealAccepted),
        Rejected => ctx.trigger(ClientEvent::DealRejected(response.message)),
        DealNotFound => ctx.trigger(ClientEvent::DealNotFound(response.message)),
        status => ctx.trigger(ClientEvent::UnknownResponseReceived(status.code())),
    }
}

async fn setup_payment_channel(
    ctx: Context<ClientDealSpec>,
    env: Arc<dyn ClientDealEnvironment>,
    deal: ClientDealState,
) {
    let node = env.node();
    let ready = async {
        let payment_channel = node
            .get_or_create_payment_channel(&deal.client_wallet, &deal.miner_wallet, &deal.total_funds)
            .await?;
        let lane = node.allocate_lane(&payment_channel).await?;
        Ok::<_, anyhow::Error>(PaymentInfo {
            payment_channel,
            lane,
        })
    }
    .await;
    match ready {
        Ok(payment_info) => ctx.trigger(ClientEvent::PaymentChannelReady(payment_info)),
        Err(e) => ctx.trigger(ClientEvent::PaymentChannelErrored(e.to_string())),
    }
}

async fn receive_blocks(
    ctx: Context<ClientDealSpec>,
    env: Arc<dyn ClientDealEnvironment>,
    deal: ClientDealState,
) {
    let response = match env.read_deal_response(deal.deal_proposal.id).await {
        Ok(response) => response,
        Err(e) => return ctx.trigger(ClientEvent::ReadDealResponseErrored(e.to_string())),
    };

    let mut total_received = deal.total_received;
    for block in &response.blocks {
        match env.put_block(&block.prefix, &block.data) {
            Ok(size) => total_received += size,
            Err(e) => return ctx.trigger(ClientEvent::BlockVerificationFailed(e.to_string())),
        }
    }

    match response.status {
        Ongoing | BlocksComplete => ctx.trigger(ClientEvent::BlocksReceived { total_received }),
        FundsNeeded => ctx.trigger(ClientEvent::PaymentRequested { total_received }),
        FundsNeededLastPayment => {
            ctx.trigger(ClientEvent::LastPaymentRequested { total_received })
        }
        Completed => ctx.trigger(ClientEvent::CompleteReceived { total_received }),
        Errored => ctx.trigger(ClientEvent::ProviderErrored(response.message)),
        status => ctx.trigger(ClientEvent::ProviderErrored(format!(
            "unexpected deal response status: {}",
            status
        ))),
    }
}

async fn send_funds(
    ctx: Context<ClientDealSpec>,
    env: Arc<dyn ClientDealEnvironment>,
    deal: ClientDealState,
) {
    let params = &deal.deal_proposal.params;
    let owed = BigInt::from(deal.total_received) * &params.price_per_byte - &deal.funds_spent;
    if owed <= BigInt::zero() {
        // nothing outstanding; resume reception
        return ctx.trigger(ClientEvent::PaymentSent {
            amount: BigInt::zero(),
        });
    }
    if &deal.funds_spent + &owed > deal.total_funds {
        return ctx.trigger(ClientEvent::FundsExpended { required: owed });
    }

    let payment_info = match &deal.payment_info {
        Some(payment_info) => payment_info.clone(),
        None => {
            return ctx.trigger(ClientEvent::CreateVoucherFailed(
                "no payment channel allocated".to_owned(),
            ))
        }
    };

    let voucher = match env
        .node()
        .create_payment_voucher(&payment_info.payment_channel, payment_info.lane, &owed)
        .await
    {
        Ok(voucher) => voucher,
        Err(e) => return ctx.trigger(ClientEvent::CreateVoucherFailed(e.to_string())),
    };

    let payment = DealPayment {
        id: deal.deal_proposal.id,
        payment_channel: payment_info.payment_channel,
        payment_voucher: voucher,
    };
    match env.write_deal_payment(deal.deal_proposal.id, payment).await {
        Ok(()) => ctx.trigger(ClientEvent::PaymentSent { amount: owed }),
        Err(e) => ctx.trigger(ClientEvent::WriteDealPaymentErrored(e.to_string())),
    }
}

async fn finalize_deal(
    ctx: Context<ClientDealSpec>,
    env: Arc<dyn ClientDealEnvironment>,
    deal: ClientDealState,
) {
    match env.close_stream(deal.deal_proposal.id).await {
        Ok(()) => ctx.trigger(ClientEvent::Complete),
        Err(e) => ctx.trigger(ClientEvent::Failed(Some(e.to_string()))),
    }
}

async fn fail_deal(
    ctx: Context<ClientDealSpec>,
    env: Arc<dyn ClientDealEnvironment>,
    deal: ClientDealState,
) {
    match env.close_stream(deal.deal_proposal.id).await {
        Ok(()) => ctx.trigger(ClientEvent::Failed(None)),
        Err(e) => ctx.trigger(ClientEvent::Failed(Some(e.to_string()))),
    }
}

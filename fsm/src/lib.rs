// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Generic per-deal finite state machines backed by a persistent record
//! store. A [`StateMachineGroup`] owns one record per deal, serializes
//! event application per deal, persists every mutation before the next
//! state-entry function runs, and notifies subscribers of each applied
//! event.

mod errors;
mod machine;
mod statestore;
mod subscribe;

pub use self::errors::Error;
pub use self::machine::{Context, MachineSpec, StateMachineGroup};
pub use self::statestore::{StateStore, RECORD_VERSION};
pub use self::subscribe::{SubscriberRegistry, SubscriptionId};

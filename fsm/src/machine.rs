// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::statestore::StateStore;
use super::subscribe::{SubscriberRegistry, SubscriptionId};
use super::Error;
use async_std::future::timeout;
use async_std::task::{self, JoinHandle};
use async_trait::async_trait;
use db::Store;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::future::join_all;
use futures::StreamExt;
use log::{error, warn};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Description of one family of deal state machines: the record type, its
/// key, the event catalog (guard + mutation in [`MachineSpec::apply`]) and
/// the state-entry dispatch in [`MachineSpec::handle`].
///
/// Entry functions never fail past the engine: every failure path must
/// trigger an event that moves the record to a well-defined next state.
#[async_trait]
pub trait MachineSpec: Send + Sync + Sized + 'static {
    type Key: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static;
    type Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;
    type Event: Send + 'static;
    type Environment: ?Sized + Send + Sync + 'static;

    fn key(record: &Self::Record) -> Self::Key;

    fn event_name(event: &Self::Event) -> &'static str;

    /// Guard and mutation for one event. An error rejects the event and
    /// leaves the record untouched.
    fn apply(event: Self::Event, record: &mut Self::Record) -> Result<(), Error>;

    /// Entry function for the record's current state. Runs after the
    /// mutated record has been persisted and subscribers notified.
    async fn handle(ctx: Context<Self>, env: Arc<Self::Environment>, record: Self::Record);

    fn is_terminated(record: &Self::Record) -> bool;
}

struct GroupShared<S: MachineSpec> {
    queues: RwLock<HashMap<S::Key, UnboundedSender<S::Event>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    subscribers: SubscriberRegistry<S::Record>,
    stopping: AtomicBool,
}

/// Handle given to entry functions to feed further events into their own
/// machine. Triggering never blocks; events queue behind the running
/// entry function. The context does not keep the machine's queue alive,
/// so a stopped group drains and shuts down even while contexts exist.
pub struct Context<S: MachineSpec> {
    key: S::Key,
    shared: Arc<GroupShared<S>>,
}

impl<S: MachineSpec> Clone for Context<S> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<S: MachineSpec> Context<S> {
    pub fn key(&self) -> &S::Key {
        &self.key
    }

    pub fn trigger(&self, event: S::Event) {
        let queues = self.shared.queues.read();
        match queues.get(&self.key) {
            Some(sender) => {
                if sender.unbounded_send(event).is_err() {
                    warn!("dropping event for stopped deal {}", self.key);
                }
            }
            None => warn!("dropping event for stopped deal {}", self.key),
        }
    }
}

/// A group of state machines of one [`MachineSpec`], one live machine per
/// deal key. Events for the same key are applied strictly in order; each
/// applied event is persisted and published before the new state's entry
/// function runs. Distinct keys run in parallel.
pub struct StateMachineGroup<DB, S: MachineSpec> {
    store: StateStore<DB, S::Record>,
    env: Arc<S::Environment>,
    shared: Arc<GroupShared<S>>,
}

impl<DB, S> StateMachineGroup<DB, S>
where
    DB: Store + Send + Sync + 'static,
    S: MachineSpec,
{
    pub fn new(db: Arc<DB>, prefix: &str, env: Arc<S::Environment>) -> Self {
        Self {
            store: StateStore::new(db, prefix),
            env,
            shared: Arc::new(GroupShared {
                queues: RwLock::new(HashMap::new()),
                handles: Mutex::new(Vec::new()),
                subscribers: SubscriberRegistry::default(),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    /// Begin tracking a new record and run the entry function for its
    /// initial state.
    pub fn begin(&self, record: S::Record) -> Result<(), Error> {
        if self.shared.stopping.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        let key = S::key(&record);
        self.store.begin(&key.to_string(), &record)?;
        self.spawn_machine(key, true);
        Ok(())
    }

    /// Queue an event for the machine under `key`. The guard runs when the
    /// event is dequeued; a rejected event is logged and dropped.
    pub fn send(&self, key: &S::Key, event: S::Event) -> Result<(), Error> {
        if self.shared.stopping.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        let queues = self.shared.queues.read();
        let sender = queues
            .get(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        sender
            .unbounded_send(event)
            .map_err(|_| Error::NotFound(key.to_string()))
    }

    /// Rehydrate every persisted record and re-enter its current state.
    /// Entry functions are idempotent, so re-entering a state a machine
    /// was suspended in resumes where it left off.
    pub fn restart(&self) -> Result<(), Error> {
        for record in self.store.list()? {
            let key = S::key(&record);
            if self.shared.queues.read().contains_key(&key) {
                continue;
            }
            self.spawn_machine(key, true);
        }
        Ok(())
    }

    /// Refuse further sends and wait for in-flight entry functions to
    /// return, bounded by `deadline`.
    pub async fn stop(&self, deadline: Duration) -> Result<(), Error> {
        self.shared.stopping.store(true, Ordering::SeqCst);
        // closing the queues lets each machine finish its current entry
        // function and drain
        self.shared.queues.write().clear();
        let handles = std::mem::take(&mut *self.shared.handles.lock());
        timeout(deadline, join_all(handles))
            .await
            .map_err(|_| Error::StopTimeout)?;
        Ok(())
    }

    pub fn get(&self, key: &S::Key) -> Result<S::Record, Error> {
        self.store.get(&key.to_string())
    }

    pub fn has(&self, key: &S::Key) -> Result<bool, Error> {
        self.store.has(&key.to_string())
    }

    pub fn list(&self) -> Result<Vec<S::Record>, Error> {
        self.store.list()
    }

    /// Keys of machines currently live (not yet terminated).
    pub fn live_keys(&self) -> Vec<S::Key> {
        self.shared.queues.read().keys().cloned().collect()
    }

    pub fn is_terminated(record: &S::Record) -> bool {
        S::is_terminated(record)
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&'static str, &S::Record) + Send + Sync + 'static,
    {
        self.shared.subscribers.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.shared.subscribers.unsubscribe(id)
    }

    fn spawn_machine(&self, key: S::Key, enter_current: bool) {
        let (sender, receiver) = unbounded();
        let ctx = Context {
            key: key.clone(),
            shared: self.shared.clone(),
        };
        self.shared.queues.write().insert(key.clone(), sender);

        let store = self.store.clone();
        let env = self.env.clone();
        let shared = self.shared.clone();
        let handle = task::spawn(async move {
            run_machine::<DB, S>(store, env, shared.clone(), ctx, receiver, enter_current).await;
            shared.queues.write().remove(&key);
        });
        self.shared.handles.lock().push(handle);
    }
}

async fn run_machine<DB, S>(
    store: StateStore<DB, S::Record>,
    env: Arc<S::Environment>,
    shared: Arc<GroupShared<S>>,
    ctx: Context<S>,
    mut events: UnboundedReceiver<S::Event>,
    enter_current: bool,
) where
    DB: Store + Send + Sync + 'static,
    S: MachineSpec,
{
    let key = ctx.key().to_string();

    if enter_current {
        match store.get(&key) {
            Ok(record) => {
                if S::is_terminated(&record) {
                    return;
                }
                S::handle(ctx.clone(), env.clone(), record).await;
            }
            Err(e) => {
                error!("deal {} failed to load: {}", key, e);
                return;
            }
        }
    }

    while let Some(event) = events.next().await {
        let name = S::event_name(&event);
        let mut record = match store.get(&key) {
            Ok(record) => record,
            Err(e) => {
                error!("deal {} failed to load: {}", key, e);
                return;
            }
        };
        if let Err(e) = S::apply(event, &mut record) {
            warn!("deal {} rejected event {}: {}", key, name, e);
            continue;
        }
        if let Err(e) = store.put(&key, &record) {
            error!("deal {} failed to persist after {}: {}", key, name, e);
            return;
        }
        shared.subscribers.notify(name, &record);
        let terminated = S::is_terminated(&record);
        S::handle(ctx.clone(), env.clone(), record).await;
        if terminated {
            return;
        }
    }
}

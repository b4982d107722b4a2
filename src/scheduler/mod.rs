mod catalog;
mod ledger;
mod rotation;
mod swap;
mod types;
mod util;
mod workflow;

pub use types::{
    CustomMapping, Rotation, RotationSummary, RosterDraft, SchedError, ShiftSpec, ShiftUpdate,
    SkippedCandidate, UnderstaffedSlot,
};

use crate::auth::{Authorizer, CapabilityAuthorizer};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::model::Registry;
use crate::notification::{Notifier, NullNotifier, SchedulingEvent};
use crate::storage::{MemoryStorage, Storage, Store};
use std::sync::Arc;
use util::{KeyLocks, KeyScope, SlotKey};

/// Scheduler : façade du moteur (catalogue, registre d'affectations,
/// échanges, circuit de validation, rotations).
///
/// Toutes les opérations prennent `&self` ; l'instance se partage entre
/// threads derrière un `Arc`.
pub struct Scheduler {
    store: Store,
    locks: KeyLocks,
    config: EngineConfig,
    notifier: Arc<dyn Notifier>,
    authorizer: Arc<dyn Authorizer>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    /// Moteur en mémoire, sans notifieur.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_store(
            config,
            Store::new(Box::new(MemoryStorage), Registry::default()),
        )
    }

    pub fn with_store(config: EngineConfig, store: Store) -> Self {
        Self {
            store,
            locks: KeyLocks::default(),
            config,
            notifier: Arc::new(NullNotifier),
            authorizer: Arc::new(CapabilityAuthorizer),
            clock: Arc::new(SystemClock),
        }
    }

    /// Ouvre un support persistant et recharge son registre.
    pub fn open(config: EngineConfig, storage: Box<dyn Storage>) -> anyhow::Result<Self> {
        Ok(Self::with_store(config, Store::open(storage)?))
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Copie cohérente du registre.
    pub fn snapshot(&self) -> Registry {
        self.store.snapshot()
    }

    fn emit(&self, event: SchedulingEvent) {
        tracing::debug!(?event, "emitting");
        self.notifier.notify(&event);
    }

    fn emit_all<I: IntoIterator<Item = SchedulingEvent>>(&self, events: I) {
        for event in events {
            self.emit(event);
        }
    }

    /// Verrouille les clés calculées sur l'état courant, puis vérifie
    /// qu'elles n'ont pas bougé entre lecture et acquisition.
    fn lock_slots<F>(&self, keys_of: F) -> Result<KeyScope<'_>, SchedError>
    where
        F: Fn(&Registry) -> Result<Vec<SlotKey>, SchedError>,
    {
        loop {
            let keys = util::normalize(self.store.read(&keys_of)?);
            let scope = self.locks.acquire(keys.clone());
            if util::normalize(self.store.read(&keys_of)?) == keys {
                return Ok(scope);
            }
        }
    }
}

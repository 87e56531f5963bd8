//! Process-wide bootstrap of the shared physical store.
//!
//! The coordinator opens the store exactly once and hands the same
//! `Database` to every table. While an open is in flight every other caller
//! awaits that same future. A failed open triggers one delete-and-recreate
//! recovery; if that also fails, replication is disabled and the coordinator
//! falls back to `Uninitialized` so a later manual `bootstrap()` can retry.
//!
//! Tables entering a freshly opened connection are admitted one at a time,
//! each pausing for a short stagger, so their first transactions never pile
//! onto the connection at the same instant.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, error, info, warn};

use crate::config::ReplicaConfig;
use crate::error::{ReplicaError, Result};
use crate::store::{Database, SqliteOpener, StoreOpener};

type OpenFuture = Shared<BoxFuture<'static, Result<Database>>>;

enum State {
    Uninitialized,
    Opening(OpenFuture),
    Open(Database),
}

/// Observable coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapPhase {
    Uninitialized,
    Opening,
    Recovering,
    Open,
}

struct Inner {
    opener: Arc<dyn StoreOpener>,
    open_timeout: Duration,
    admission_stagger: Duration,
    state: Mutex<State>,
    /// Bumped by `shutdown`; an open from an older generation never
    /// publishes its result.
    generation: AtomicU64,
    /// Serializes physical opens, including ones abandoned by `shutdown`.
    open_gate: tokio::sync::Mutex<()>,
    recovering: AtomicBool,
    replication_disabled: AtomicBool,
    /// Held by the table currently taking its admission turn.
    admission: tokio::sync::Mutex<()>,
    admitted: Mutex<HashSet<String>>,
}

/// Cheap `Clone` handle; every clone drives the same state machine.
#[derive(Clone)]
pub struct BootstrapCoordinator {
    inner: Arc<Inner>,
}

impl BootstrapCoordinator {
    pub fn new(
        opener: impl StoreOpener,
        open_timeout: Duration,
        admission_stagger: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                opener: Arc::new(opener),
                open_timeout,
                admission_stagger,
                state: Mutex::new(State::Uninitialized),
                generation: AtomicU64::new(0),
                open_gate: tokio::sync::Mutex::new(()),
                recovering: AtomicBool::new(false),
                replication_disabled: AtomicBool::new(false),
                admission: tokio::sync::Mutex::new(()),
                admitted: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Coordinator for the SQLite file named by `config`.
    pub fn from_config(config: &ReplicaConfig) -> anyhow::Result<Self> {
        let path = config.database_path()?;
        let opener = SqliteOpener::new(path, config.operation_timeout());
        Ok(Self::new(
            opener,
            config.open_timeout(),
            config.admission_stagger(),
        ))
    }

    /// Set once recovery has failed; tables read it to degrade instead of
    /// touching the store.
    pub fn replication_disabled(&self) -> bool {
        self.inner.replication_disabled.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> BootstrapPhase {
        match &*lock(&self.inner.state) {
            State::Uninitialized => BootstrapPhase::Uninitialized,
            State::Open(_) => BootstrapPhase::Open,
            State::Opening(_) if self.inner.recovering.load(Ordering::Acquire) => {
                BootstrapPhase::Recovering
            }
            State::Opening(_) => BootstrapPhase::Opening,
        }
    }

    /// Shared connection for `table`, opening the store on first use and
    /// taking the table's admission turn. Fails fast with `StoreUnavailable`
    /// while replication is disabled.
    pub async fn connect(&self, table: &str) -> Result<Database> {
        if self.replication_disabled() {
            return Err(ReplicaError::StoreUnavailable(
                "replication disabled".to_string(),
            ));
        }
        let db = self.open_shared().await?;
        self.admit(table).await;
        Ok(db)
    }

    /// Open the store regardless of the disabled flag. This is the manual
    /// retry path after a failed recovery.
    pub async fn bootstrap(&self) -> Result<Database> {
        self.open_shared().await
    }

    /// Drop the cached connection. Tables that already hold a handle keep
    /// it; new callers trigger a fresh open, which waits for any open still
    /// in flight.
    pub fn shutdown(&self) {
        let mut state = lock(&self.inner.state);
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        *state = State::Uninitialized;
        drop(state);
        lock(&self.inner.admitted).clear();
        info!("Replica store shut down");
    }

    async fn open_shared(&self) -> Result<Database> {
        let pending = {
            let mut state = lock(&self.inner.state);
            match &*state {
                State::Open(db) => return Ok(db.clone()),
                State::Opening(pending) => pending.clone(),
                State::Uninitialized => {
                    let generation = self.inner.generation.load(Ordering::Acquire);
                    let pending = Self::start_open(Arc::clone(&self.inner), generation);
                    *state = State::Opening(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    fn start_open(inner: Arc<Inner>, generation: u64) -> OpenFuture {
        async move {
            let result = {
                let _gate = inner.open_gate.lock().await;
                open_with_recovery(&inner).await
            };
            let mut state = lock(&inner.state);
            if inner.generation.load(Ordering::Acquire) != generation {
                debug!(generation, "Open finished after shutdown, not published");
                return result;
            }
            match &result {
                Ok(db) => *state = State::Open(db.clone()),
                Err(_) => {
                    *state = State::Uninitialized;
                    lock(&inner.admitted).clear();
                }
            }
            result
        }
        .boxed()
        .shared()
    }

    async fn admit(&self, table: &str) {
        if lock(&self.inner.admitted).contains(table) {
            return;
        }
        let _turn = self.inner.admission.lock().await;
        if !lock(&self.inner.admitted).insert(table.to_string()) {
            return;
        }
        debug!(table, stagger_ms = self.inner.admission_stagger.as_millis() as u64, "Table admitted");
        tokio::time::sleep(self.inner.admission_stagger).await;
    }
}

async fn open_with_recovery(inner: &Inner) -> Result<Database> {
    let store = inner.opener.describe();
    info!(store = %store, "Opening replica store");

    let first = match open_once(inner).await {
        Ok(db) => {
            inner.replication_disabled.store(false, Ordering::Release);
            return Ok(db);
        }
        Err(e) => e,
    };

    warn!(store = %store, error = %first, "Store open failed, recreating");
    inner.replication_disabled.store(true, Ordering::Release);
    inner.recovering.store(true, Ordering::Release);

    let opener = Arc::clone(&inner.opener);
    match tokio::task::spawn_blocking(move || opener.destroy()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(store = %store, error = %e, "Failed to remove store"),
        Err(e) => warn!(store = %store, error = %e, "Store removal task failed"),
    }

    let retry = open_once(inner).await;
    inner.recovering.store(false, Ordering::Release);
    match retry {
        Ok(db) => {
            inner.replication_disabled.store(false, Ordering::Release);
            info!(store = %store, "Replica store recreated");
            Ok(db)
        }
        Err(e) => {
            error!(store = %store, error = %e, "Store recovery failed, replication disabled");
            Err(e)
        }
    }
}

async fn open_once(inner: &Inner) -> Result<Database> {
    let opener = Arc::clone(&inner.opener);
    let mut task = tokio::task::spawn_blocking(move || opener.open());
    match tokio::time::timeout(inner.open_timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(ReplicaError::StoreUnavailable(format!("open task failed: {}", e))),
        Err(_) => {
            let timeout_ms = inner.open_timeout.as_millis() as u64;
            warn!(timeout_ms, "Store open timed out, waiting for it to finish");
            // Nothing may touch the files until the blocking open returns.
            // A late connection is dropped.
            let _ = task.await;
            Err(ReplicaError::OperationTimeout {
                operation: "open",
                timeout_ms,
            })
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

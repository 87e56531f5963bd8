#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tempfile::TempDir;
use trialcache_core::store::{Database, SqliteOpener, StoreOpener};
use trialcache_core::{
    BootstrapCoordinator, NetworkStatus, RemoteError, RemoteRow, RemoteSource, ReplicaError,
    ReplicaTable, TableOptions,
};

pub fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("replica.sqlite3")
}

pub fn coordinator(dir: &TempDir) -> BootstrapCoordinator {
    let opener = SqliteOpener::new(db_path(dir), Duration::from_secs(3));
    BootstrapCoordinator::new(opener, Duration::from_secs(5), Duration::from_millis(2))
}

pub fn options() -> TableOptions {
    TableOptions {
        debounce: Duration::from_millis(50),
        ..TableOptions::default()
    }
}

pub fn table<T>(name: &str, coordinator: &BootstrapCoordinator, network: &NetworkStatus, options: TableOptions) -> ReplicaTable<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    ReplicaTable::new(name, coordinator.clone(), network.clone(), options)
}

/// Writes garbage over the store file before its first `corrupt` opens.
pub struct CorruptingOpener {
    inner: SqliteOpener,
    corrupt: AtomicUsize,
    pub opens: AtomicUsize,
}

impl CorruptingOpener {
    pub fn new(path: &Path, corrupt: usize) -> Self {
        Self {
            inner: SqliteOpener::new(path, Duration::from_secs(3)),
            corrupt: AtomicUsize::new(corrupt),
            opens: AtomicUsize::new(0),
        }
    }
}

impl StoreOpener for CorruptingOpener {
    fn open(&self) -> Result<Database, ReplicaError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let remaining = self.corrupt.load(Ordering::SeqCst);
        if remaining > 0 {
            self.corrupt.store(remaining - 1, Ordering::SeqCst);
            std::fs::write(self.inner.path(), vec![0xAB; 8192])?;
        }
        self.inner.open()
    }

    fn destroy(&self) -> Result<(), ReplicaError> {
        self.inner.destroy()
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

/// In-memory remote source recording what it was asked for.
#[derive(Default)]
pub struct FakeRemote {
    pub rows: Mutex<Vec<RemoteRow>>,
    pub fetches: Mutex<Vec<(DateTime<Utc>, String)>>,
    pub pushed: Mutex<Vec<RemoteRow>>,
    pub fail_fetch: AtomicBool,
    pub reject_push: AtomicBool,
}

impl FakeRemote {
    pub fn with_rows(rows: Vec<RemoteRow>) -> Self {
        Self {
            rows: Mutex::new(rows),
            ..Default::default()
        }
    }

    pub fn set_rows(&self, rows: Vec<RemoteRow>) {
        *self.rows.lock().unwrap() = rows;
    }

    pub fn last_since(&self) -> Option<DateTime<Utc>> {
        self.fetches.lock().unwrap().last().map(|(since, _)| *since)
    }
}

#[async_trait]
impl RemoteSource for FakeRemote {
    async fn fetch_changed(
        &self,
        _table: &str,
        since: DateTime<Utc>,
        tenant_key: &str,
    ) -> Result<Vec<RemoteRow>, RemoteError> {
        self.fetches
            .lock()
            .unwrap()
            .push((since, tenant_key.to_string()));
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("connection reset".to_string()));
        }
        Ok(self.rows.lock().unwrap().clone())
    }

    async fn push_row(&self, _table: &str, row: RemoteRow) -> Result<(), RemoteError> {
        if self.reject_push.load(Ordering::SeqCst) {
            return Err(RemoteError::Rejected {
                id: row.id,
                reason: "locked".to_string(),
            });
        }
        self.pushed.lock().unwrap().push(row);
        Ok(())
    }
}

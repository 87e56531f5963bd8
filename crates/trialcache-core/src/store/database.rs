//! The shared physical connection.
//!
//! `Database` is a cheap `Clone` handle around one SQLite connection. Every
//! operation runs on the blocking pool under a deadline so that one hung
//! statement surfaces as `OperationTimeout` instead of stalling the caller.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};

use super::schema;
use crate::error::{ReplicaError, Result};

/// How long SQLite itself waits on a locked database before giving up.
const BUSY_TIMEOUT_MS: u64 = 2_000;

struct DatabaseInner {
    connection: Mutex<Connection>,
    path: Option<PathBuf>,
    operation_timeout: Duration,
}

#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.path)
            .field("operation_timeout", &self.inner.operation_timeout)
            .finish()
    }
}

impl Database {
    /// Open (creating if needed) the store at `path` and bring its schema up to date.
    pub fn open(path: &Path, operation_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let mut connection = Connection::open_with_flags(path, flags)?;
        apply_pragmas(&connection)?;
        schema::upgrade(&mut connection)?;
        debug!(path = %path.display(), "Replica database opened");
        Ok(Self::from_connection(
            connection,
            Some(path.to_path_buf()),
            operation_timeout,
        ))
    }

    /// Volatile store, used when no on-disk location is wanted.
    pub fn open_in_memory(operation_timeout: Duration) -> Result<Self> {
        let mut connection = Connection::open_in_memory()?;
        schema::upgrade(&mut connection)?;
        Ok(Self::from_connection(connection, None, operation_timeout))
    }

    fn from_connection(
        connection: Connection,
        path: Option<PathBuf>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                connection: Mutex::new(connection),
                path,
                operation_timeout,
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn operation_timeout(&self) -> Duration {
        self.inner.operation_timeout
    }

    /// Whether two handles share the same physical connection.
    pub fn same_connection(&self, other: &Database) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `f` against the connection on the blocking pool, bounded by the
    /// operation timeout. An abandoned operation still finishes in the
    /// background; the caller just stops waiting for it.
    pub async fn run<F, R>(&self, operation: &'static str, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let task = tokio::task::spawn_blocking(move || {
            let mut connection = inner
                .connection
                .lock()
                .map_err(|_| ReplicaError::StoreUnavailable("connection lock poisoned".to_string()))?;
            f(&mut connection)
        });

        let timeout = self.inner.operation_timeout;
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ReplicaError::StoreUnavailable(format!(
                "{} task failed: {}",
                operation, e
            ))),
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                warn!(operation, timeout_ms, "Store operation timed out");
                Err(ReplicaError::OperationTimeout {
                    operation,
                    timeout_ms,
                })
            }
        }
    }
}

fn apply_pragmas(connection: &Connection) -> Result<()> {
    connection.execute_batch("PRAGMA journal_mode = WAL;")?;
    connection.execute_batch("PRAGMA synchronous = NORMAL;")?;
    connection.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// Opens and destroys the physical store on behalf of the bootstrap
/// coordinator. Both calls block and are run off the async executor.
pub trait StoreOpener: Send + Sync + 'static {
    fn open(&self) -> Result<Database>;

    /// Remove every trace of the physical store so the next `open` starts clean.
    fn destroy(&self) -> Result<()>;

    fn describe(&self) -> String;
}

/// SQLite file store at a fixed path.
#[derive(Debug, Clone)]
pub struct SqliteOpener {
    path: PathBuf,
    operation_timeout: Duration,
}

impl SqliteOpener {
    pub fn new(path: impl Into<PathBuf>, operation_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            operation_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StoreOpener for SqliteOpener {
    fn open(&self) -> Result<Database> {
        Database::open(&self.path, self.operation_timeout)
    }

    fn destroy(&self) -> Result<()> {
        let base = self.path.as_os_str().to_owned();
        let mut candidates = vec![self.path.clone()];
        for suffix in ["-wal", "-shm", "-journal"] {
            let mut name = base.clone();
            name.push(suffix);
            candidates.push(PathBuf::from(name));
        }
        for file in candidates {
            match std::fs::remove_file(&file) {
                Ok(()) => debug!(file = %file.display(), "Removed store file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

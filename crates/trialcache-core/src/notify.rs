//! Debounced change fan-out.
//!
//! Mutations call `schedule()`, which drops a signal into a capacity-one
//! channel; a full channel means a delivery is already pending, so bursts
//! collapse for free. A single dispatcher task waits for the table to go
//! quiet for the debounce window, loads the current rows once, and hands
//! them to every listener.

use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub type Listener<T> = Arc<dyn Fn(&[T]) + Send + Sync>;

/// Produces the table's current rows for a delivery.
pub type RowLoader<T> = Arc<dyn Fn() -> BoxFuture<'static, Vec<T>> + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

impl<T> Registry<T> {
    fn remove(&mut self, id: u64) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }
}

/// Handle returned by `subscribe`. Unsubscribing twice is harmless.
#[derive(Clone)]
pub struct Subscription {
    id: u64,
    cancel: Arc<dyn Fn(u64) -> bool + Send + Sync>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns whether the listener was still registered.
    pub fn unsubscribe(&self) -> bool {
        (self.cancel)(self.id)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

pub struct ChangeNotifier<T> {
    table: String,
    debounce: Duration,
    registry: Arc<Mutex<Registry<T>>>,
    loader: RowLoader<T>,
    signal: OnceLock<mpsc::Sender<()>>,
}

impl<T: Send + Sync + 'static> ChangeNotifier<T> {
    pub fn new(table: impl Into<String>, debounce: Duration, loader: RowLoader<T>) -> Self {
        Self {
            table: table.into(),
            debounce,
            registry: Arc::new(Mutex::new(Registry {
                next_id: 1,
                listeners: Vec::new(),
            })),
            loader,
            signal: OnceLock::new(),
        }
    }

    /// Register `listener` and deliver the current rows to it once.
    pub async fn subscribe(&self, listener: Listener<T>) -> Subscription {
        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.push((id, Arc::clone(&listener)));
            id
        };
        debug!(table = %self.table, subscription = id, "Listener subscribed");

        let rows = (self.loader)().await;
        listener(&rows);

        let registry: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            id,
            cancel: Arc::new(move |id| match registry.upgrade() {
                Some(registry) => lock(&registry).remove(id),
                None => false,
            }),
        }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        lock(&self.registry).remove(id)
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.registry).listeners.len()
    }

    /// Request a delivery after the table goes quiet. Never blocks.
    pub fn schedule(&self) {
        let Some(sender) = self.sender() else {
            return;
        };
        match sender.try_send(()) {
            Ok(()) => trace!(table = %self.table, "Change scheduled"),
            Err(mpsc::error::TrySendError::Full(())) => trace!(table = %self.table, "Change coalesced"),
            Err(mpsc::error::TrySendError::Closed(())) => {
                debug!(table = %self.table, "Dispatcher gone, change dropped")
            }
        }
    }

    fn sender(&self) -> Option<&mpsc::Sender<()>> {
        if let Some(sender) = self.signal.get() {
            return Some(sender);
        }
        // The dispatcher needs a runtime; outside one there is nobody to notify.
        let handle = tokio::runtime::Handle::try_current().ok()?;
        Some(self.signal.get_or_init(|| {
            let (tx, rx) = mpsc::channel(1);
            handle.spawn(dispatch(
                self.table.clone(),
                self.debounce,
                rx,
                Arc::clone(&self.registry),
                Arc::clone(&self.loader),
            ));
            tx
        }))
    }
}

async fn dispatch<T: Send + Sync + 'static>(
    table: String,
    debounce: Duration,
    mut rx: mpsc::Receiver<()>,
    registry: Arc<Mutex<Registry<T>>>,
    loader: RowLoader<T>,
) {
    while rx.recv().await.is_some() {
        let mut open = true;
        loop {
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => {
                    open = false;
                    break;
                }
                Err(_) => break,
            }
        }

        let listeners: Vec<Listener<T>> = lock(&registry)
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        if !listeners.is_empty() {
            let rows = loader().await;
            debug!(table = %table, rows = rows.len(), listeners = listeners.len(), "Delivering change");
            for listener in listeners {
                listener(&rows);
            }
        }

        if !open {
            break;
        }
    }
    trace!(table = %table, "Change dispatcher stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use trialcache_core::models::{tables, Entry, Trial};
use trialcache_core::{
    BootstrapCoordinator, BootstrapPhase, NetworkStatus, ReplicaError, RetryPolicy, TableOptions,
};

use common::{coordinator, db_path, options, table, CorruptingOpener};

fn entry(id: &str, class: &str, armband: u32) -> Entry {
    Entry::new(id, class, "t1", "lic-1", armband, format!("Handler {}", armband))
}

#[tokio::test]
async fn test_clean_rows_expire_dirty_and_offline_rows_survive() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir);
    let network = NetworkStatus::default();
    let entries = table::<Entry>(
        tables::ENTRIES,
        &coordinator,
        &network,
        TableOptions {
            ttl: Duration::from_millis(50),
            ..options()
        },
    );

    entries.set("clean", &entry("clean", "c1", 1), false).await.unwrap();
    entries.set("dirty", &entry("dirty", "c1", 2), true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    network.set_online(false);
    assert!(entries.get("clean").await.is_some(), "offline rows never expire");
    assert_eq!(entries.clean_expired().await.unwrap(), 0);

    network.set_online(true);
    assert!(entries.get("clean").await.is_none());
    assert!(entries.get("dirty").await.is_some());
    assert_eq!(entries.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_clean_expired_sweeps_only_stale_clean_rows() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir);
    let network = NetworkStatus::default();
    let entries = table::<Entry>(
        tables::ENTRIES,
        &coordinator,
        &network,
        TableOptions {
            ttl: Duration::from_millis(50),
            ..options()
        },
    );

    entries.set("a", &entry("a", "c1", 1), false).await.unwrap();
    entries.set("b", &entry("b", "c1", 2), true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    entries.set("c", &entry("c", "c1", 3), false).await.unwrap();

    assert_eq!(entries.clean_expired().await.unwrap(), 1);
    let mut ids: Vec<_> = entries.get_all(None).await.into_iter().map(|e| e.id).collect();
    ids.sort();
    assert_eq!(ids, vec!["b", "c"]);
}

#[tokio::test]
async fn test_concurrent_optimistic_updates_are_both_applied() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir);
    let entries = table::<Entry>(tables::ENTRIES, &coordinator, &NetworkStatus::default(), options());
    let initial = entries.set("e1", &entry("e1", "c1", 7), false).await.unwrap();

    let (a, b) = (entries.clone(), entries.clone());
    let policy = RetryPolicy::new(5, Duration::from_millis(2));
    let bump = |mut e: Entry| {
        e.faults += 5;
        e
    };
    let (ra, rb) = tokio::join!(
        a.optimistic_update("e1", bump, policy),
        b.optimistic_update("e1", bump, policy)
    );
    ra.unwrap();
    rb.unwrap();

    let row = entries.try_get("e1").await.unwrap().unwrap();
    assert_eq!(row.version, initial + 2);
    assert_eq!(row.data.faults, 10);
}

#[tokio::test]
async fn test_stale_expected_version_never_writes() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir);
    let entries = table::<Entry>(tables::ENTRIES, &coordinator, &NetworkStatus::default(), options());
    entries.set("e1", &entry("e1", "c1", 1), false).await.unwrap();
    entries.set("e1", &entry("e1", "c1", 2), false).await.unwrap();

    let err = entries
        .set_versioned("e1", &entry("e1", "c1", 3), false, 1)
        .await
        .unwrap_err();
    match err {
        ReplicaError::ConcurrentModification { expected, found, .. } => {
            assert_eq!((expected, found), (1, 2));
        }
        other => panic!("unexpected error: {}", other),
    }
    let row = entries.try_get("e1").await.unwrap().unwrap();
    assert_eq!((row.version, row.data.armband), (2, 2));
}

#[tokio::test]
async fn test_eviction_never_touches_protected_rows() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir);
    let entries = table::<Entry>(
        tables::ENTRIES,
        &coordinator,
        &NetworkStatus::default(),
        TableOptions {
            protection_window: Duration::ZERO,
            ..options()
        },
    );

    for i in 0..4 {
        let id = format!("dirty{}", i);
        entries.set(&id, &entry(&id, "c1", i), true).await.unwrap();
    }
    for i in 0..6 {
        let id = format!("clean{}", i);
        entries.set(&id, &entry(&id, "c1", 10 + i), false).await.unwrap();
    }

    let report = entries.evict(1).await.unwrap();
    assert_eq!(report.evicted, 6);
    assert!(report.over_budget);

    let remaining = entries.try_get_all(None).await.unwrap();
    assert_eq!(remaining.len(), 4);
    assert!(remaining.iter().all(|r| r.is_dirty));
}

#[tokio::test]
async fn test_eviction_prefers_cold_rows() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir);
    let entries = table::<Entry>(
        tables::ENTRIES,
        &coordinator,
        &NetworkStatus::default(),
        TableOptions {
            protection_window: Duration::ZERO,
            ..options()
        },
    );
    for i in 0..3 {
        let id = format!("e{}", i);
        entries.set(&id, &entry(&id, "c1", i), false).await.unwrap();
    }
    for _ in 0..10 {
        entries.get("e0").await.unwrap();
        entries.get("e2").await.unwrap();
    }

    let stats = entries.stats().await.unwrap();
    let per_row = stats.estimated_bytes / 3;
    let report = entries.evict(stats.estimated_bytes - per_row / 2).await.unwrap();
    assert_eq!(report.evicted, 1);
    assert!(entries.get("e1").await.is_none());
    assert!(entries.get("e0").await.is_some());
}

#[tokio::test]
async fn test_chunked_hydration_notifies_once() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir);
    let entries = table::<Entry>(
        tables::ENTRIES,
        &coordinator,
        &NetworkStatus::default(),
        TableOptions {
            chunk_size: 10,
            debounce: Duration::from_millis(100),
            ..options()
        },
    );

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(AtomicUsize::new(0));
    let (c, s) = (Arc::clone(&calls), Arc::clone(&seen));
    let _subscription = entries
        .subscribe(move |rows: &[Entry]| {
            c.fetch_add(1, Ordering::SeqCst);
            s.store(rows.len(), Ordering::SeqCst);
        })
        .await;

    let items: Vec<(String, Entry)> = (0..50)
        .map(|i| (format!("e{:02}", i), entry(&format!("e{:02}", i), "c1", i)))
        .collect();
    let mut chunks = 0;
    entries
        .batch_set_chunked(&items, false, |_, _| chunks += 1)
        .await
        .unwrap();
    assert_eq!(chunks, 5);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2, "initial delivery plus one for the batch");
    assert_eq!(seen.load(Ordering::SeqCst), 50);
}

#[tokio::test]
async fn test_tables_share_one_connection() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir);
    let network = NetworkStatus::default();
    let trials = table::<Trial>(tables::TRIALS, &coordinator, &network, options());
    let entries = table::<Entry>(tables::ENTRIES, &coordinator, &network, options());

    let trial = Trial::new("t1", "lic-1", "Spring Trial");
    let first = entry("e1", "c1", 1);
    let (a, b) = tokio::join!(
        trials.set("t1", &trial, false),
        entries.set("e1", &first, false)
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(coordinator.phase(), BootstrapPhase::Open);

    let db = coordinator.bootstrap().await.unwrap();
    assert_eq!(db.path(), Some(db_path(&dir).as_path()));
    assert_eq!(trials.count().await.unwrap(), 1);
    assert_eq!(entries.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_persistent_corruption_disables_then_manual_retry_recovers() {
    let dir = TempDir::new().unwrap();
    let opener = CorruptingOpener::new(&db_path(&dir), 2);
    let coordinator =
        BootstrapCoordinator::new(opener, Duration::from_secs(5), Duration::from_millis(1));
    let entries = table::<Entry>(tables::ENTRIES, &coordinator, &NetworkStatus::default(), options());

    assert!(entries.get("e1").await.is_none());
    assert!(coordinator.replication_disabled());
    assert_eq!(coordinator.phase(), BootstrapPhase::Uninitialized);
    assert!(entries.get_all(None).await.is_empty());
    let err = entries.set("e1", &entry("e1", "c1", 1), false).await.unwrap_err();
    assert!(matches!(err, ReplicaError::StoreUnavailable(_)));

    coordinator.bootstrap().await.unwrap();
    assert!(!coordinator.replication_disabled());
    assert_eq!(coordinator.phase(), BootstrapPhase::Open);

    entries.set("e1", &entry("e1", "c1", 1), false).await.unwrap();
    assert_eq!(entries.get("e1").await.unwrap().armband, 1);
}

#[tokio::test]
async fn test_single_corruption_recovers_transparently() {
    let dir = TempDir::new().unwrap();
    let opener = CorruptingOpener::new(&db_path(&dir), 1);
    let coordinator =
        BootstrapCoordinator::new(opener, Duration::from_secs(5), Duration::from_millis(1));
    let entries = table::<Entry>(tables::ENTRIES, &coordinator, &NetworkStatus::default(), options());

    entries.set("e1", &entry("e1", "c1", 1), false).await.unwrap();
    assert!(!coordinator.replication_disabled());
    assert_eq!(entries.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let coordinator = coordinator(&dir);
        let entries = table::<Entry>(tables::ENTRIES, &coordinator, &NetworkStatus::default(), options());
        entries.stage("e1", &entry("e1", "c1", 4)).await.unwrap();
        coordinator.shutdown();
    }

    let coordinator = coordinator(&dir);
    let entries = table::<Entry>(tables::ENTRIES, &coordinator, &NetworkStatus::default(), options());
    let row = entries.try_get("e1").await.unwrap().unwrap();
    assert!(row.is_dirty);
    assert_eq!(row.version, 1);
    assert_eq!(entries.stats().await.unwrap().pending_mutations, 1);
}

//! Hybrid LRU+LFU eviction under a per-table byte budget.
//!
//! Rows are split into protected (dirty, or modified inside the protection
//! window) and evictable. Evictable rows are ranked by a weighted blend of
//! access count and access recency and removed lowest score first until the
//! table fits its budget. Protected rows are never touched, even when that
//! leaves the table over budget.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::{RowFootprint, RowStore};

/// Relative weight of frequency and recency in the eviction score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvictionWeights {
    pub frequency: f64,
    pub recency: f64,
}

impl Default for EvictionWeights {
    fn default() -> Self {
        Self {
            frequency: 0.7,
            recency: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvictionOptions {
    pub budget_bytes: u64,
    pub protection_window: Duration,
    /// Explicit override: allow dirty rows to be evicted.
    pub include_dirty: bool,
    pub weights: EvictionWeights,
}

impl EvictionOptions {
    pub fn new(budget_bytes: u64, protection_window: Duration) -> Self {
        Self {
            budget_bytes,
            protection_window,
            include_dirty: false,
            weights: EvictionWeights::default(),
        }
    }
}

/// Rows chosen for deletion and the expected outcome.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EvictionPlan {
    pub victims: Vec<String>,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub protected: usize,
}

impl EvictionPlan {
    pub fn over_budget(&self, budget_bytes: u64) -> bool {
        self.bytes_after > budget_bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvictionReport {
    pub evicted: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub over_budget: bool,
}

/// Score used to order evictable rows; lower is evicted first.
///
/// Recency is measured in seconds since `oldest_access`, the least recent
/// access among the candidates, so both terms stay on comparable scales.
pub fn score(row: &RowFootprint, weights: EvictionWeights, oldest_access: DateTime<Utc>) -> f64 {
    let recency_secs = (row.last_accessed_at - oldest_access).num_milliseconds().max(0) as f64 / 1000.0;
    weights.frequency * row.access_count as f64 + weights.recency * recency_secs
}

pub fn is_protected(row: &RowFootprint, options: &EvictionOptions, now: DateTime<Utc>) -> bool {
    if row.is_dirty && !options.include_dirty {
        return true;
    }
    let window = chrono::Duration::from_std(options.protection_window).unwrap_or(chrono::Duration::MAX);
    now.signed_duration_since(row.last_modified_at) < window
}

/// Decide which rows to evict without touching the store.
pub fn plan_eviction(rows: &[RowFootprint], options: &EvictionOptions, now: DateTime<Utc>) -> EvictionPlan {
    let bytes_before: u64 = rows.iter().map(|r| r.bytes).sum();
    let (protected, mut candidates): (Vec<&RowFootprint>, Vec<&RowFootprint>) =
        rows.iter().partition(|r| is_protected(r, options, now));

    let mut plan = EvictionPlan {
        victims: Vec::new(),
        bytes_before,
        bytes_after: bytes_before,
        protected: protected.len(),
    };
    if bytes_before <= options.budget_bytes {
        return plan;
    }

    let oldest = candidates
        .iter()
        .map(|r| r.last_accessed_at)
        .min()
        .unwrap_or(now);
    candidates.sort_by(|a, b| {
        score(a, options.weights, oldest)
            .partial_cmp(&score(b, options.weights, oldest))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.last_accessed_at.cmp(&b.last_accessed_at))
            .then_with(|| a.id.cmp(&b.id))
    });

    for row in candidates {
        if plan.bytes_after <= options.budget_bytes {
            break;
        }
        plan.bytes_after -= row.bytes;
        plan.victims.push(row.id.clone());
    }
    plan
}

/// Bring `table` under `options.budget_bytes`, returning what was removed.
/// Rows that vanish between planning and deletion are simply skipped.
pub async fn evict(store: &RowStore, table: &str, options: &EvictionOptions) -> Result<EvictionReport> {
    let rows = store.footprints(table).await?;
    let plan = plan_eviction(&rows, options, Utc::now());
    let over_budget = plan.over_budget(options.budget_bytes);

    if plan.victims.is_empty() {
        if over_budget {
            warn!(
                table,
                bytes = plan.bytes_before,
                budget = options.budget_bytes,
                protected = plan.protected,
                "Over budget but nothing is evictable"
            );
        } else {
            debug!(table, bytes = plan.bytes_before, "Within budget");
        }
        return Ok(EvictionReport {
            evicted: 0,
            bytes_before: plan.bytes_before,
            bytes_after: plan.bytes_after,
            over_budget,
        });
    }

    let evicted = store.delete_many(table, plan.victims.clone()).await?;
    info!(
        table,
        evicted,
        bytes_before = plan.bytes_before,
        bytes_after = plan.bytes_after,
        over_budget,
        "Evicted rows"
    );
    Ok(EvictionReport {
        evicted,
        bytes_before: plan.bytes_before,
        bytes_after: plan.bytes_after,
        over_budget,
    })
}

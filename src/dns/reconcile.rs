//! Record reconciliation
//!
//! Converges one record type at one store toward a desired multiset of
//! values with as few mutations as possible. Records whose value is still
//! wanted are kept; the remaining records are rewritten in place before any
//! record is added or deleted.

use std::collections::HashMap;

use tracing::{debug, info};

use super::{RecordStore, RecordType, RemoteRecord};
use crate::error::Result;

/// Operations needed to turn the existing records into the desired set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub keep: Vec<RemoteRecord>,
    /// Record keeps its id and takes the new value
    pub updates: Vec<(RemoteRecord, String)>,
    pub adds: Vec<String>,
    pub deletes: Vec<RemoteRecord>,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.adds.is_empty()
            && self.deletes.is_empty()
            && self.updates.iter().all(|(rec, value)| &rec.value == value)
    }
}

/// Counts of what was applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub kept: usize,
    pub updated: usize,
    pub added: usize,
    pub deleted: usize,
}

/// Match `desired` against `existing`.
///
/// Duplicate desired values ask for that many records. Still-needed values
/// are paired with changeable records in first-appearance order.
pub fn plan(desired: &[String], existing: Vec<RemoteRecord>) -> ReconcilePlan {
    let mut order: Vec<&str> = Vec::new();
    let mut remaining: HashMap<&str, usize> = HashMap::new();
    for value in desired {
        let count = remaining.entry(value.as_str()).or_insert(0);
        if *count == 0 {
            order.push(value.as_str());
        }
        *count += 1;
    }

    let mut keep = Vec::new();
    let mut changeable = Vec::new();
    for record in existing {
        match remaining.get_mut(record.value.as_str()) {
            Some(count) if *count > 0 => {
                *count -= 1;
                keep.push(record);
            }
            _ => changeable.push(record),
        }
    }

    let mut needed: Vec<String> = Vec::new();
    for value in order {
        let count = remaining.get(value).copied().unwrap_or(0);
        needed.extend(std::iter::repeat(value.to_string()).take(count));
    }

    let paired = changeable.len().min(needed.len());
    let deletes = changeable.split_off(paired);
    let adds = needed.split_off(paired);
    let updates = changeable.into_iter().zip(needed).collect();

    ReconcilePlan {
        keep,
        updates,
        adds,
        deletes,
    }
}

/// Apply a plan: updates, then adds, then deletes.
///
/// The first failing operation aborts the rest; nothing is rolled back.
pub async fn execute(
    store: &dyn RecordStore,
    record_type: RecordType,
    plan: ReconcilePlan,
) -> Result<ReconcileSummary> {
    let ttl = store.ttl();
    let mut summary = ReconcileSummary {
        kept: plan.keep.len(),
        ..ReconcileSummary::default()
    };

    for (record, value) in &plan.updates {
        if &record.value == value {
            continue;
        }
        debug!(
            "{} update {} record {}: {} -> {}",
            store.name(),
            record_type,
            record.id,
            record.value,
            value
        );
        store.update(record_type, &record.id, value, ttl).await?;
        summary.updated += 1;
    }

    for value in &plan.adds {
        debug!("{} add {} record {}", store.name(), record_type, value);
        store.create(record_type, value, ttl).await?;
        summary.added += 1;
    }

    for record in &plan.deletes {
        debug!(
            "{} delete {} record {} ({})",
            store.name(),
            record_type,
            record.id,
            record.value
        );
        store.delete(record_type, &record.id).await?;
        summary.deleted += 1;
    }

    Ok(summary)
}

/// List, plan and execute for one record type at one store
pub async fn reconcile(
    store: &dyn RecordStore,
    record_type: RecordType,
    desired: &[String],
) -> Result<ReconcileSummary> {
    let existing = store.list(record_type).await?;
    let plan = plan(desired, existing);
    if plan.is_noop() {
        debug!("{} {} records already up to date", store.name(), record_type);
        return Ok(ReconcileSummary {
            kept: plan.keep.len(),
            ..ReconcileSummary::default()
        });
    }
    let summary = execute(store, record_type, plan).await?;
    info!(
        "{} {} records: {} kept, {} updated, {} added, {} deleted",
        store.name(),
        record_type,
        summary.kept,
        summary.updated,
        summary.added,
        summary.deleted
    );
    Ok(summary)
}

//! Reconciliation engine, upsert executor and retention sweeper.
//!
//! A cycle is `normalize -> plan -> execute`. Planning only reads storage;
//! execution applies the whole plan inside one [`StationTx`] and verifies the
//! committed rows before reporting success.

use std::collections::{HashMap, HashSet};

use aqi_adapters::{Normalizer, RawStationPayload};
use aqi_core::{Clock, ReconcileOutcome, StationReading, StoredStationRow, SweepOutcome};
use aqi_storage::{StationStore, StationTx, StoreError};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedUpdate {
    pub row_id: i64,
    pub reading: StationReading,
}

/// Complete set of writes for one cycle. Every row written gets `cycle_at`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationPlan {
    pub cycle_at: DateTime<Utc>,
    pub updates: Vec<PlannedUpdate>,
    pub inserts: Vec<StationReading>,
}

impl ReconciliationPlan {
    pub fn empty(cycle_at: DateTime<Utc>) -> Self {
        Self {
            cycle_at,
            updates: Vec::new(),
            inserts: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.inserts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.updates.len() + self.inserts.len()
    }

    pub fn outcome(&self) -> ReconcileOutcome {
        ReconcileOutcome {
            updated: self.updates.len(),
            inserted: self.inserts.len(),
        }
    }

    /// Station ids targeted by the plan, updates first.
    pub fn station_ids(&self) -> Vec<i64> {
        self.updates
            .iter()
            .map(|u| u.reading.station_id)
            .chain(self.inserts.iter().map(|r| r.station_id))
            .collect()
    }

    /// Rejects plans that would give a station or row two dispositions.
    pub fn validate(&self) -> Result<(), SyncError> {
        let mut stations = HashSet::new();
        for station_id in self.station_ids() {
            if !stations.insert(station_id) {
                return Err(SyncError::InvariantViolation(format!(
                    "station {station_id} targeted more than once in one plan"
                )));
            }
        }
        let mut rows = HashSet::new();
        for update in &self.updates {
            if !rows.insert(update.row_id) {
                return Err(SyncError::InvariantViolation(format!(
                    "row {} targeted more than once in one plan",
                    update.row_id
                )));
            }
        }
        Ok(())
    }
}

/// Splits `readings` into updates of `existing` rows and fresh inserts.
///
/// Incoming values are authoritative: an update carries the full reading,
/// absent fields included. Duplicate station ids are not collapsed here;
/// the normalizer owns that, and [`ReconciliationPlan::validate`] catches misses.
pub fn plan(
    readings: Vec<StationReading>,
    existing: &[StoredStationRow],
    cycle_at: DateTime<Utc>,
) -> ReconciliationPlan {
    let by_station: HashMap<i64, i64> = existing
        .iter()
        .map(|row| (row.station_id(), row.row_id))
        .collect();

    let mut plan = ReconciliationPlan::empty(cycle_at);
    for reading in readings {
        match by_station.get(&reading.station_id) {
            Some(&row_id) => plan.updates.push(PlannedUpdate { row_id, reading }),
            None => plan.inserts.push(reading),
        }
    }
    plan
}

/// Reads the stored rows for `readings` and plans against them.
pub async fn build_plan(
    store: &dyn StationStore,
    readings: Vec<StationReading>,
    cycle_at: DateTime<Utc>,
) -> Result<ReconciliationPlan, SyncError> {
    let ids = readings.iter().map(|r| r.station_id).collect::<Vec<_>>();
    let existing = store
        .rows_for_stations(&ids)
        .await
        .map_err(SyncError::persistence("lookup"))?;
    Ok(plan(readings, &existing, cycle_at))
}

async fn apply_writes(tx: &mut dyn StationTx, plan: &ReconciliationPlan) -> Result<(), StoreError> {
    for update in &plan.updates {
        tx.update_row(update.row_id, &update.reading, plan.cycle_at)
            .await?;
    }
    for reading in &plan.inserts {
        let row_id = tx.insert_row(reading, plan.cycle_at).await?;
        debug!(row_id, station_id = reading.station_id, "station row created");
    }
    Ok(())
}

async fn verify(store: &dyn StationStore, plan: &ReconciliationPlan) -> Result<(), SyncError> {
    let rows = store
        .rows_for_stations(&plan.station_ids())
        .await
        .map_err(SyncError::persistence("verify"))?;
    let by_station: HashMap<i64, &StoredStationRow> =
        rows.iter().map(|row| (row.station_id(), row)).collect();

    let expected = plan
        .updates
        .iter()
        .map(|u| (Some(u.row_id), &u.reading))
        .chain(plan.inserts.iter().map(|r| (None, r)));
    for (row_id, reading) in expected {
        let station_id = reading.station_id;
        let Some(row) = by_station.get(&station_id) else {
            return Err(SyncError::Verification {
                station_id,
                detail: "row not readable after commit".to_string(),
            });
        };
        if row_id.is_some_and(|id| id != row.row_id) {
            return Err(SyncError::Verification {
                station_id,
                detail: format!("expected row {:?}, found row {}", row_id, row.row_id),
            });
        }
        if row.last_update != plan.cycle_at || &row.reading != reading {
            return Err(SyncError::Verification {
                station_id,
                detail: "stored values differ from the committed plan".to_string(),
            });
        }
    }
    Ok(())
}

/// Applies `plan` atomically. An empty plan never opens a transaction.
pub async fn execute(
    store: &dyn StationStore,
    plan: &ReconciliationPlan,
) -> Result<ReconcileOutcome, SyncError> {
    plan.validate()?;
    if plan.is_empty() {
        debug!("empty reconciliation plan; nothing to write");
        return Ok(ReconcileOutcome::default());
    }

    let mut tx = store
        .begin()
        .await
        .map_err(SyncError::persistence("begin"))?;
    if let Err(err) = apply_writes(tx.as_mut(), plan).await {
        error!(error = %err, writes = plan.len(), "write failed; rolling back cycle");
        if let Err(rollback_err) = tx.rollback().await {
            warn!(error = %rollback_err, "rollback failed; transaction dropped");
        }
        return Err(SyncError::Persistence {
            stage: "write",
            source: err,
        });
    }
    tx.commit()
        .await
        .map_err(SyncError::persistence("commit"))?;

    verify(store, plan).await?;
    Ok(plan.outcome())
}

/// Normalizes one fetch batch and commits it. Zero usable readings is a
/// successful no-op that leaves storage untouched.
pub async fn reconcile_payloads(
    store: &dyn StationStore,
    clock: &dyn Clock,
    normalizer: &Normalizer,
    payloads: &[RawStationPayload],
) -> Result<ReconcileOutcome, SyncError> {
    let cycle_at = clock.cycle_start();
    let batch = normalizer.normalize_batch(payloads);
    info!(
        payloads = payloads.len(),
        readings = batch.readings.len(),
        malformed = batch.malformed.len(),
        discarded = batch.discarded,
        duplicates = batch.duplicates,
        "batch normalized"
    );
    if batch.readings.is_empty() {
        info!("no usable readings; stored rows left untouched");
        return Ok(ReconcileOutcome::default());
    }

    let plan = build_plan(store, batch.readings, cycle_at).await?;
    let outcome = execute(store, &plan).await?;
    info!(
        updated = outcome.updated,
        inserted = outcome.inserted,
        %cycle_at,
        "reconciliation committed"
    );
    Ok(outcome)
}

/// Deletes every row whose `last_update` is older than `now - horizon`.
pub async fn sweep_with(
    store: &dyn StationStore,
    clock: &dyn Clock,
    horizon: Duration,
) -> Result<SweepOutcome, SyncError> {
    if horizon < Duration::zero() {
        return Err(SyncError::Config(format!(
            "retention horizon must not be negative (got {horizon})"
        )));
    }
    let Some(cutoff) = clock.now().checked_sub_signed(horizon) else {
        info!(%horizon, "retention horizon reaches past the earliest timestamp; nothing to delete");
        return Ok(SweepOutcome { deleted: 0 });
    };
    let deleted = store
        .delete_older_than(cutoff)
        .await
        .map_err(SyncError::persistence("sweep"))?;
    info!(deleted, %cutoff, "retention sweep finished");
    Ok(SweepOutcome { deleted })
}

/// Converts a whole number of days into a sweep horizon.
pub fn horizon_from_days(days: i64) -> Result<Duration, SyncError> {
    Duration::try_days(days)
        .ok_or_else(|| SyncError::Config(format!("retention of {days} days is out of range")))
}

//! Station snapshot storage + HTTP fetch utilities.
//!
//! Storage is reached through [`StationStore`]; writes happen only inside a
//! [`StationTx`] so the caller owns the commit/rollback boundary.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use aqi_core::{StationReading, StoredStationRow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod http;
pub mod postgres;

pub use http::{BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher};
pub use postgres::{PgPoolConfig, PgStationStore};

pub const CRATE_NAME: &str = "aqi-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("row {0} not found")]
    RowNotFound(i64),
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, std::time::Duration),
    #[error("transaction already finished")]
    TransactionClosed,
    #[error("injected storage fault: {0}")]
    Injected(String),
}

/// Read side of the snapshot table plus the entry point for write transactions.
#[async_trait]
pub trait StationStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StationTx>, StoreError>;

    async fn rows_for_stations(&self, station_ids: &[i64])
        -> Result<Vec<StoredStationRow>, StoreError>;

    async fn row_for_station(&self, station_id: i64)
        -> Result<Option<StoredStationRow>, StoreError>;

    /// Rows ordered by `last_update` descending, then `station_id`.
    async fn latest_rows(&self, limit: Option<usize>) -> Result<Vec<StoredStationRow>, StoreError>;

    async fn rows_for_region(&self, region: &str) -> Result<Vec<StoredStationRow>, StoreError>;

    async fn count_rows(&self) -> Result<u64, StoreError>;

    /// Newest `last_update` in the table.
    async fn last_refresh(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Deletes rows with `last_update < cutoff`, returning how many went.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Write transaction. Dropping it without `commit` discards every write.
#[async_trait]
pub trait StationTx: Send {
    async fn update_row(
        &mut self,
        row_id: i64,
        reading: &StationReading,
        last_update: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Inserts a row for a station that had none when the cycle was planned.
    /// If another writer committed that station in the meantime, its row is
    /// overwritten instead. Returns the `row_id` the reading ends up in.
    async fn insert_row(
        &mut self,
        reading: &StationReading,
        last_update: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}

/// Fault injected into [`MemoryStationStore`] transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFault {
    /// The write after the first `n` successful writes fails.
    FailAfterWrites(usize),
    FailOnCommit,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<i64, StoredStationRow>,
    next_row_id: i64,
    fault: Option<StoreFault>,
}

impl MemoryState {
    fn row_id_for_station(&self, station_id: i64) -> Option<i64> {
        self.rows
            .values()
            .find(|row| row.station_id() == station_id)
            .map(|row| row.row_id)
    }
}

/// In-process store used for development runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStationStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory store mutex poisoned")
    }

    pub fn set_fault(&self, fault: Option<StoreFault>) {
        self.lock().fault = fault;
    }

    pub fn fail_after_writes(&self, writes: usize) {
        self.set_fault(Some(StoreFault::FailAfterWrites(writes)));
    }

    /// Inserts a committed row directly, bypassing transactions.
    pub fn seed_row(&self, reading: StationReading, last_update: DateTime<Utc>) -> i64 {
        let mut state = self.lock();
        state.next_row_id += 1;
        let row_id = state.next_row_id;
        state.rows.insert(
            row_id,
            StoredStationRow {
                row_id,
                last_update,
                reading,
            },
        );
        row_id
    }

    /// All committed rows in `row_id` order.
    pub fn snapshot(&self) -> Vec<StoredStationRow> {
        self.lock().rows.values().cloned().collect()
    }
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Update {
        row_id: i64,
        reading: StationReading,
        last_update: DateTime<Utc>,
    },
    Insert {
        row_id: i64,
        reading: StationReading,
        last_update: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct MemoryStationTx {
    state: Arc<Mutex<MemoryState>>,
    pending: Vec<PendingWrite>,
    fault: Option<StoreFault>,
    finished: bool,
}

impl MemoryStationTx {
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory store mutex poisoned")
    }

    fn check_open_and_fault(&self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::TransactionClosed);
        }
        if let Some(StoreFault::FailAfterWrites(limit)) = self.fault {
            if self.pending.len() >= limit {
                return Err(StoreError::Injected(format!(
                    "write #{} rejected",
                    self.pending.len() + 1
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StationTx for MemoryStationTx {
    async fn update_row(
        &mut self,
        row_id: i64,
        reading: &StationReading,
        last_update: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_open_and_fault()?;
        if !self.lock().rows.contains_key(&row_id) {
            return Err(StoreError::RowNotFound(row_id));
        }
        self.pending.push(PendingWrite::Update {
            row_id,
            reading: reading.clone(),
            last_update,
        });
        Ok(())
    }

    async fn insert_row(
        &mut self,
        reading: &StationReading,
        last_update: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.check_open_and_fault()?;
        let row_id = {
            let mut state = self.lock();
            match state.row_id_for_station(reading.station_id) {
                Some(existing) => existing,
                None => {
                    // Ids are reserved eagerly and never reused, like a sequence.
                    state.next_row_id += 1;
                    state.next_row_id
                }
            }
        };
        self.pending.push(PendingWrite::Insert {
            row_id,
            reading: reading.clone(),
            last_update,
        });
        Ok(row_id)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::TransactionClosed);
        }
        self.finished = true;
        if self.fault == Some(StoreFault::FailOnCommit) {
            self.pending.clear();
            return Err(StoreError::Injected("commit rejected".to_string()));
        }

        let pending = std::mem::take(&mut self.pending);
        let mut state = self.lock();
        let mut rows = state.rows.clone();
        for write in pending {
            match write {
                PendingWrite::Update {
                    row_id,
                    reading,
                    last_update,
                } => {
                    let row = rows.get_mut(&row_id).ok_or(StoreError::RowNotFound(row_id))?;
                    row.reading = reading;
                    row.last_update = last_update;
                }
                PendingWrite::Insert {
                    row_id,
                    reading,
                    last_update,
                } => {
                    // Conflict on station_id: the committed row takes the new values.
                    let existing = rows
                        .values()
                        .find(|row| row.station_id() == reading.station_id)
                        .map(|row| row.row_id);
                    let row_id = existing.unwrap_or(row_id);
                    rows.insert(
                        row_id,
                        StoredStationRow {
                            row_id,
                            last_update,
                            reading,
                        },
                    );
                }
            }
        }
        state.rows = rows;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::TransactionClosed);
        }
        self.finished = true;
        self.pending.clear();
        Ok(())
    }
}

#[async_trait]
impl StationStore for MemoryStationStore {
    async fn begin(&self) -> Result<Box<dyn StationTx>, StoreError> {
        let fault = self.lock().fault;
        Ok(Box::new(MemoryStationTx {
            state: Arc::clone(&self.state),
            pending: Vec::new(),
            fault,
            finished: false,
        }))
    }

    async fn rows_for_stations(
        &self,
        station_ids: &[i64],
    ) -> Result<Vec<StoredStationRow>, StoreError> {
        let wanted: HashSet<i64> = station_ids.iter().copied().collect();
        Ok(self
            .lock()
            .rows
            .values()
            .filter(|row| wanted.contains(&row.station_id()))
            .cloned()
            .collect())
    }

    async fn row_for_station(
        &self,
        station_id: i64,
    ) -> Result<Option<StoredStationRow>, StoreError> {
        Ok(self
            .lock()
            .rows
            .values()
            .find(|row| row.station_id() == station_id)
            .cloned())
    }

    async fn latest_rows(&self, limit: Option<usize>) -> Result<Vec<StoredStationRow>, StoreError> {
        let mut rows = self.snapshot();
        rows.sort_by(|a, b| {
            b.last_update
                .cmp(&a.last_update)
                .then_with(|| a.station_id().cmp(&b.station_id()))
        });
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn rows_for_region(&self, region: &str) -> Result<Vec<StoredStationRow>, StoreError> {
        let mut rows = self
            .snapshot()
            .into_iter()
            .filter(|row| row.reading.region == region)
            .collect::<Vec<_>>();
        rows.sort_by_key(|row| row.station_id());
        Ok(rows)
    }

    async fn count_rows(&self) -> Result<u64, StoreError> {
        Ok(self.lock().rows.len() as u64)
    }

    async fn last_refresh(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.lock().rows.values().map(|row| row.last_update).max())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.lock();
        let before = state.rows.len();
        state.rows.retain(|_, row| row.last_update >= cutoff);
        Ok((before - state.rows.len()) as u64)
    }
}

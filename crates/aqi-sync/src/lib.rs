//! Reconciliation cycles, retention sweeps and their scheduling.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use aqi_adapters::{
    AdapterContext, FixtureSource, Normalizer, SourceRegistry, StationSource, WaqiConfig,
    WaqiSource,
};
use aqi_core::{Clock, ReconcileOutcome, SweepOutcome, SystemClock};
use aqi_storage::{
    HttpClientConfig, HttpFetcher, MemoryStationStore, PgPoolConfig, PgStationStore, StationStore,
    StoreError,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod reconcile;
pub mod scheduler;

pub use config::{RegionConfig, RegionRegistry, SyncConfig};
pub use reconcile::{
    build_plan, execute, horizon_from_days, plan, reconcile_payloads, sweep_with, PlannedUpdate,
    ReconciliationPlan,
};
pub use scheduler::{maybe_build_scheduler, start_scheduler};

pub const CRATE_NAME: &str = "aqi-sync";

/// Cycle-level failures. Per-record problems never surface here; the
/// normalizer skips them.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("upstream fetch from {source_id} failed: {message}")]
    TransientFetch { source_id: String, message: String },
    #[error("storage failure during {stage}: {source}")]
    Persistence {
        stage: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("station {station_id} failed read-after-write check: {detail}")]
    Verification { station_id: i64, detail: String },
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("unknown region {0}")]
    UnknownRegion(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub(crate) fn persistence(stage: &'static str) -> impl FnOnce(StoreError) -> SyncError {
        move |source| SyncError::Persistence { stage, source }
    }

    pub fn is_transient_fetch(&self) -> bool {
        matches!(self, Self::TransientFetch { .. })
    }

    /// Storage failures and failed read-after-write checks.
    pub fn is_persistence_failure(&self) -> bool {
        matches!(self, Self::Persistence { .. } | Self::Verification { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleRecord {
    pub cycle_id: Uuid,
    pub finished_at: DateTime<Utc>,
    pub outcome: Option<ReconcileOutcome>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepRecord {
    pub finished_at: DateTime<Utc>,
    pub deleted: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub reconcile_cron: Option<String>,
    pub sweep_cron: Option<String>,
    /// Most recent cycle per region, scheduled or manual.
    pub cycles: BTreeMap<String, CycleRecord>,
    pub last_sweep: Option<SweepRecord>,
}

/// Long-lived owner of everything a cycle needs. Built once by the entry
/// point and shared behind an `Arc`.
pub struct AirQualityService {
    store: Arc<dyn StationStore>,
    sources: SourceRegistry,
    clock: Arc<dyn Clock>,
    regions: RegionRegistry,
    fetch_timeout: Duration,
    retention: chrono::Duration,
    status: RwLock<SchedulerStatus>,
}

impl AirQualityService {
    pub fn new(
        store: Arc<dyn StationStore>,
        sources: SourceRegistry,
        clock: Arc<dyn Clock>,
        regions: RegionRegistry,
    ) -> Self {
        Self {
            store,
            sources,
            clock,
            regions,
            fetch_timeout: Duration::from_secs(60),
            retention: chrono::Duration::days(7),
            status: RwLock::new(SchedulerStatus::default()),
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn store(&self) -> &Arc<dyn StationStore> {
        &self.store
    }

    pub fn regions(&self) -> &RegionRegistry {
        &self.regions
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    pub fn retention(&self) -> chrono::Duration {
        self.retention
    }

    pub async fn status(&self) -> SchedulerStatus {
        self.status.read().await.clone()
    }

    pub async fn mark_scheduler_running(&self, reconcile_cron: &str, sweep_cron: &str) {
        let mut status = self.status.write().await;
        status.running = true;
        status.reconcile_cron = Some(reconcile_cron.to_string());
        status.sweep_cron = Some(sweep_cron.to_string());
    }

    /// Runs one fetch, normalize, reconcile, commit cycle for `region`.
    pub async fn reconcile(&self, region: &str) -> Result<ReconcileOutcome, SyncError> {
        let region = self
            .regions
            .get(region)
            .ok_or_else(|| SyncError::UnknownRegion(region.to_string()))?;
        let cycle_id = Uuid::new_v4();
        let span = info_span!("reconcile_cycle", %cycle_id, region = %region.name);
        let result = self.run_cycle(cycle_id, region).instrument(span).await;

        let record = CycleRecord {
            cycle_id,
            finished_at: self.clock.now(),
            outcome: result.as_ref().ok().copied(),
            error: result.as_ref().err().map(ToString::to_string),
        };
        self.status
            .write()
            .await
            .cycles
            .insert(region.name.clone(), record);
        result
    }

    /// Reconciles every enabled region in declaration order.
    pub async fn reconcile_enabled(&self) -> Vec<(String, Result<ReconcileOutcome, SyncError>)> {
        let mut results = Vec::new();
        for region in self.regions.enabled() {
            let result = self.reconcile(&region.name).await;
            results.push((region.name.clone(), result));
        }
        results
    }

    pub async fn sweep(&self, horizon: chrono::Duration) -> Result<SweepOutcome, SyncError> {
        let result = sweep_with(self.store.as_ref(), self.clock.as_ref(), horizon).await;
        self.status.write().await.last_sweep = Some(SweepRecord {
            finished_at: self.clock.now(),
            deleted: result.as_ref().ok().map(|o| o.deleted),
            error: result.as_ref().err().map(ToString::to_string),
        });
        result
    }

    /// Sweeps with the configured retention horizon.
    pub async fn sweep_default(&self) -> Result<SweepOutcome, SyncError> {
        self.sweep(self.retention).await
    }

    fn sources_for(&self, region: &RegionConfig) -> Vec<Arc<dyn StationSource>> {
        if region.sources.is_empty() {
            return self
                .sources
                .source_ids()
                .iter()
                .filter_map(|id| self.sources.get(id))
                .collect();
        }
        region
            .sources
            .iter()
            .filter_map(|id| {
                let source = self.sources.get(id);
                if source.is_none() {
                    warn!(source_id = %id, region = %region.name, "source not registered; skipping");
                }
                source
            })
            .collect()
    }

    async fn run_cycle(
        &self,
        cycle_id: Uuid,
        region: &RegionConfig,
    ) -> Result<ReconcileOutcome, SyncError> {
        let sources = self.sources_for(region);
        if sources.is_empty() {
            return Err(SyncError::Config(format!(
                "no registered source serves region {}",
                region.name
            )));
        }

        let ctx = AdapterContext {
            cycle_id,
            started_at: self.clock.now(),
        };
        let query = region.query();
        let mut payloads = Vec::new();
        for source in sources {
            let source_id = source.source_id().to_string();
            match tokio::time::timeout(self.fetch_timeout, source.fetch(&ctx, &query)).await {
                Ok(Ok(fetched)) => {
                    info!(%source_id, payloads = fetched.len(), "source fetched");
                    payloads.extend(fetched);
                }
                Ok(Err(err)) => {
                    warn!(%source_id, error = %err, "fetch failed; cycle aborted with zero writes");
                    return Err(SyncError::TransientFetch {
                        source_id,
                        message: err.to_string(),
                    });
                }
                Err(_) => {
                    warn!(%source_id, timeout = ?self.fetch_timeout, "fetch timed out; cycle aborted with zero writes");
                    return Err(SyncError::TransientFetch {
                        source_id,
                        message: format!("timed out after {:?}", self.fetch_timeout),
                    });
                }
            }
        }

        let normalizer = Normalizer::new(region.normalizer_policy());
        reconcile_payloads(
            self.store.as_ref(),
            self.clock.as_ref(),
            &normalizer,
            &payloads,
        )
        .await
    }
}

impl std::fmt::Debug for AirQualityService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AirQualityService")
            .field("sources", &self.sources)
            .field("regions", &self.regions)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

/// Opens the configured store. `DATABASE_URL=memory` selects the in-process store.
pub async fn store_from_config(config: &SyncConfig) -> Result<Arc<dyn StationStore>> {
    if config.uses_memory_store() {
        warn!("using in-memory station store; data is lost on exit");
        return Ok(Arc::new(MemoryStationStore::new()));
    }
    let store = PgStationStore::connect(
        &config.database_url,
        PgPoolConfig {
            max_connections: config.db_max_connections,
            commit_timeout: Duration::from_secs(config.db_commit_timeout_secs.max(1)),
            ..Default::default()
        },
    )
    .await
    .context("connecting to postgres")?;
    store.migrate().await.context("applying migrations")?;
    Ok(Arc::new(store))
}

/// Registers every source the configuration enables.
pub fn sources_from_config(config: &SyncConfig) -> Result<SourceRegistry> {
    let mut registry = SourceRegistry::new();
    match &config.waqi_token {
        Some(token) => {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            })?;
            let waqi = WaqiConfig::new(token.clone()).with_base_url(config.waqi_base_url.clone());
            registry.register(Arc::new(WaqiSource::new(Arc::new(http), waqi)));
        }
        None => warn!("WAQI_API_TOKEN not set; waqi source disabled"),
    }
    if let Some(path) = &config.fixture_file {
        let fixture = FixtureSource::from_file("fixture", path)?;
        info!(path = %path.display(), payloads = fixture.payloads().len(), "fixture source registered");
        registry.register(Arc::new(fixture));
    }
    Ok(registry)
}

pub async fn service_from_config(config: &SyncConfig) -> Result<AirQualityService> {
    let store = store_from_config(config).await?;
    let sources = sources_from_config(config)?;
    let regions = RegionRegistry::load_or_default(&config.regions_file).await?;
    Ok(AirQualityService::new(store, sources, Arc::new(SystemClock), regions)
        .with_fetch_timeout(config.fetch_timeout())
        .with_retention(config.retention_horizon()))
}

pub async fn service_from_env() -> Result<AirQualityService> {
    service_from_config(&SyncConfig::from_env()).await
}

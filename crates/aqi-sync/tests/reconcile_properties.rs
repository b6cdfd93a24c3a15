use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use aqi_adapters::{
    AdapterContext, AdapterError, FixtureSource, Normalizer, RawStationPayload, RegionQuery,
    SourceRegistry, StationSource,
};
use aqi_core::{Clock, FixedClock, ReconcileOutcome, StoredStationRow, SweepOutcome};
use aqi_storage::{MemoryStationStore, StationStore, StationTx, StoreError};
use aqi_sync::{
    build_plan, execute, reconcile_payloads, sweep_with, AirQualityService, RegionRegistry,
    SyncError,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
}

fn bounds(uid: i64, aqi: i64) -> RawStationPayload {
    RawStationPayload::bounds_result(
        "waqi",
        json!({
            "uid": uid,
            "lat": 52.40 + uid as f64 / 1000.0,
            "lon": 13.30,
            "aqi": aqi.to_string(),
            "station": {"name": format!("Bounds {uid}"), "time": "2026-03-01T12:00:00+01:00"}
        }),
    )
}

fn search(uid: i64, lat: f64, lon: f64, aqi: i64) -> RawStationPayload {
    RawStationPayload::search_result(
        "waqi",
        json!({
            "uid": uid,
            "aqi": aqi,
            "time": {"stime": "2026-03-01 12:00:00"},
            "station": {"name": format!("Search {uid}"), "geo": [lat, lon], "url": "search-url"}
        }),
    )
}

/// Returns whatever batch the test last handed it.
#[derive(Clone)]
struct ScriptedSource {
    batch: Arc<Mutex<Result<Vec<RawStationPayload>, String>>>,
    delay: Option<StdDuration>,
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self {
            batch: Arc::new(Mutex::new(Ok(Vec::new()))),
            delay: None,
        }
    }
}

impl ScriptedSource {
    fn set(&self, batch: Result<Vec<RawStationPayload>, String>) {
        *self.batch.lock().unwrap() = batch;
    }
}

#[async_trait]
impl StationSource for ScriptedSource {
    fn source_id(&self) -> &str {
        "waqi"
    }

    async fn fetch(
        &self,
        _ctx: &AdapterContext,
        _region: &RegionQuery,
    ) -> Result<Vec<RawStationPayload>, AdapterError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.batch.lock().unwrap().clone().map_err(AdapterError::Message)
    }
}

struct Harness {
    store: Arc<MemoryStationStore>,
    clock: Arc<FixedClock>,
    source: ScriptedSource,
    service: AirQualityService,
}

fn harness_with(source: ScriptedSource) -> Harness {
    let store = Arc::new(MemoryStationStore::new());
    let clock = Arc::new(FixedClock::new(t0()));
    let service = AirQualityService::new(
        store.clone(),
        SourceRegistry::new().with_source(Arc::new(source.clone())),
        clock.clone(),
        RegionRegistry::default(),
    )
    .with_fetch_timeout(StdDuration::from_millis(200));
    Harness {
        store,
        clock,
        source,
        service,
    }
}

fn harness() -> Harness {
    harness_with(ScriptedSource::default())
}

#[tokio::test]
async fn idempotence_second_cycle_only_updates() {
    let h = harness();
    h.source.set(Ok((1..=4).map(|uid| bounds(uid, 20 + uid)).collect()));

    let first = h.service.reconcile("Berlin").await.unwrap();
    assert_eq!(first, ReconcileOutcome { updated: 0, inserted: 4 });
    let before = h.store.snapshot();

    h.clock.advance(Duration::minutes(5));
    let second = h.service.reconcile("Berlin").await.unwrap();
    assert_eq!(second, ReconcileOutcome { updated: 4, inserted: 0 });

    let after = h.store.snapshot();
    assert_eq!(before.len(), after.len());
    for (old, new) in before.iter().zip(&after) {
        assert_eq!(old.row_id, new.row_id);
        assert_eq!(old.reading, new.reading);
        assert_eq!(new.last_update, t0() + Duration::minutes(5));
    }
}

#[tokio::test]
async fn at_most_one_row_per_station_across_cycles() {
    let h = harness();
    let batches = vec![
        vec![bounds(1, 10), bounds(2, 11)],
        vec![bounds(2, 12), search(2, 52.5, 13.4, 99), bounds(3, 13)],
        vec![search(1, 52.5, 13.4, 5), bounds(3, 14), bounds(1, 15)],
        vec![],
    ];
    for batch in batches {
        h.source.set(Ok(batch));
        h.service.reconcile("Berlin").await.unwrap();
        h.clock.advance(Duration::hours(1));

        let rows = h.store.snapshot();
        let mut ids = rows.iter().map(|r| r.station_id()).collect::<Vec<_>>();
        ids.sort_unstable();
        let before = ids.len();
        ids.dedup();
        assert_eq!(before, ids.len(), "duplicate station rows: {rows:?}");
    }
    assert_eq!(h.store.count_rows().await.unwrap(), 3);
}

#[tokio::test]
async fn empty_batch_leaves_storage_untouched() {
    let h = harness();
    h.source.set(Ok(vec![bounds(1, 10), bounds(2, 11)]));
    h.service.reconcile("Berlin").await.unwrap();
    let before = h.store.snapshot();

    h.clock.advance(Duration::hours(1));
    h.source.set(Ok(Vec::new()));
    let outcome = h.service.reconcile("Berlin").await.unwrap();
    assert_eq!(outcome, ReconcileOutcome { updated: 0, inserted: 0 });
    assert_eq!(h.store.snapshot(), before);

    // Only unusable readings is the same as none.
    let zero_coords = RawStationPayload::bounds_result("waqi", json!({"uid": 9, "lat": 0, "lon": 0}));
    h.source.set(Ok(vec![zero_coords]));
    let outcome = h.service.reconcile("Berlin").await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::default());
    assert_eq!(h.store.snapshot(), before);
}

#[tokio::test]
async fn first_seen_wins_prefers_bounding_box_reading() {
    let h = harness();
    // Search result arrives first but bounding-box has priority.
    h.source.set(Ok(vec![search(7, 52.5, 13.4, 99), bounds(7, 33)]));
    h.service.reconcile("Berlin").await.unwrap();

    let row = h.store.row_for_station(7).await.unwrap().unwrap();
    assert_eq!(row.reading.aqi, Some(33));
    assert_eq!(row.reading.name.as_deref(), Some("Bounds 7"));
    assert_eq!(row.reading.source_url, None);
    assert_eq!(row.reading.observed_at.as_deref(), Some("2026-03-01T12:00:00+01:00"));
}

#[tokio::test]
async fn coordinate_filter_applies_to_keyword_search_only() {
    let h = harness();
    let outside = RawStationPayload::bounds_result(
        "waqi",
        json!({"uid": 500, "lat": 48.14, "lon": 11.58, "aqi": 40}),
    );
    h.source.set(Ok(vec![search(400, 48.14, 11.58, 40), outside, search(401, 52.5, 13.4, 12)]));
    let outcome = h.service.reconcile("Berlin").await.unwrap();
    assert_eq!(outcome, ReconcileOutcome { updated: 0, inserted: 2 });
    assert!(h.store.row_for_station(400).await.unwrap().is_none());
    assert!(h.store.row_for_station(500).await.unwrap().is_some());
    assert!(h.store.row_for_station(401).await.unwrap().is_some());
}

#[tokio::test]
async fn retention_sweep_deletes_only_expired_rows() {
    let store = MemoryStationStore::new();
    let clock = FixedClock::new(t0());
    let stale = aqi_core::StationReading::bare(1, 52.5, 13.4);
    let fresh = aqi_core::StationReading::bare(2, 52.5, 13.4);
    store.seed_row(stale, t0() - Duration::days(10));
    store.seed_row(fresh, t0() - Duration::days(1));

    let outcome = sweep_with(&store, &clock, Duration::days(7)).await.unwrap();
    assert_eq!(outcome, SweepOutcome { deleted: 1 });
    let remaining = store.snapshot();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].station_id(), 2);

    let again = sweep_with(&store, &clock, Duration::days(7)).await.unwrap();
    assert_eq!(again, SweepOutcome { deleted: 0 });
}

#[tokio::test]
async fn failed_write_rolls_back_every_targeted_row() {
    let store = MemoryStationStore::new();
    let clock = FixedClock::new(t0());
    let normalizer = Normalizer::default();

    // Two existing stations, three new ones: five planned writes.
    let seed = vec![bounds(1, 10), bounds(2, 11)];
    reconcile_payloads(&store, &clock, &normalizer, &seed).await.unwrap();
    let before = store.snapshot();

    clock.advance(Duration::hours(1));
    store.fail_after_writes(3);
    let batch = (1..=5).map(|uid| bounds(uid, 90 + uid)).collect::<Vec<_>>();
    let err = reconcile_payloads(&store, &clock, &normalizer, &batch)
        .await
        .unwrap_err();
    assert!(err.is_persistence_failure(), "unexpected error: {err:?}");

    assert_eq!(store.snapshot(), before);
    for uid in 3..=5 {
        assert!(store.row_for_station(uid).await.unwrap().is_none());
    }

    // Next cycle succeeds once the fault clears.
    store.set_fault(None);
    let outcome = reconcile_payloads(&store, &clock, &normalizer, &batch).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome { updated: 2, inserted: 3 });
}

#[tokio::test]
async fn racing_cycles_on_one_station_keep_the_later_commit() {
    let store = MemoryStationStore::new();
    let normalizer = Normalizer::default();
    let reading = |aqi| {
        normalizer
            .normalize_batch(&[bounds(1, aqi)])
            .readings
            .into_iter()
            .next()
            .unwrap()
    };

    // Both cycles plan against the same empty read.
    let plan_a = build_plan(&store, vec![reading(10)], t0()).await.unwrap();
    let plan_b = build_plan(&store, vec![reading(20)], t0() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(plan_a.inserts.len(), 1);
    assert_eq!(plan_b.inserts.len(), 1);

    let first = execute(&store, &plan_a).await.unwrap();
    assert_eq!(first, ReconcileOutcome { updated: 0, inserted: 1 });
    let second = execute(&store, &plan_b).await.unwrap();
    assert_eq!(second, ReconcileOutcome { updated: 0, inserted: 1 });

    let rows = store.snapshot();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].reading.aqi, Some(20));
    assert_eq!(rows[0].last_update, t0() + Duration::seconds(1));
}

/// Commits like a memory store but keeps serving the rows it held before
/// the first commit, as a lagging read replica would.
#[derive(Default)]
struct LaggingReadStore {
    inner: MemoryStationStore,
    stale: Mutex<Option<Vec<StoredStationRow>>>,
}

impl LaggingReadStore {
    fn freeze(&self) {
        *self.stale.lock().unwrap() = Some(self.inner.snapshot());
    }

    fn visible(&self) -> Vec<StoredStationRow> {
        self.stale
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| self.inner.snapshot())
    }
}

#[async_trait]
impl StationStore for LaggingReadStore {
    async fn begin(&self) -> Result<Box<dyn StationTx>, StoreError> {
        self.freeze();
        self.inner.begin().await
    }

    async fn rows_for_stations(&self, station_ids: &[i64]) -> Result<Vec<StoredStationRow>, StoreError> {
        Ok(self
            .visible()
            .into_iter()
            .filter(|row| station_ids.contains(&row.station_id()))
            .collect())
    }

    async fn row_for_station(&self, station_id: i64) -> Result<Option<StoredStationRow>, StoreError> {
        Ok(self.visible().into_iter().find(|row| row.station_id() == station_id))
    }

    async fn latest_rows(&self, limit: Option<usize>) -> Result<Vec<StoredStationRow>, StoreError> {
        self.inner.latest_rows(limit).await
    }

    async fn rows_for_region(&self, region: &str) -> Result<Vec<StoredStationRow>, StoreError> {
        self.inner.rows_for_region(region).await
    }

    async fn count_rows(&self) -> Result<u64, StoreError> {
        self.inner.count_rows().await
    }

    async fn last_refresh(&self) -> Result<Option<chrono::DateTime<Utc>>, StoreError> {
        self.inner.last_refresh().await
    }

    async fn delete_older_than(&self, cutoff: chrono::DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.delete_older_than(cutoff).await
    }
}

#[tokio::test]
async fn stale_read_after_commit_is_a_persistence_failure() {
    let store = LaggingReadStore::default();
    store.inner.seed_row(aqi_core::StationReading::bare(1, 52.401, 13.30), t0() - Duration::hours(1));
    let clock = FixedClock::new(t0());

    // Updating an existing row: the re-read still shows last hour's values.
    let err = reconcile_payloads(&store, &clock, &Normalizer::default(), &[bounds(1, 42)])
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Verification { station_id: 1, .. }), "unexpected error: {err:?}");
    assert!(err.is_persistence_failure());

    // Inserting a new row: the re-read does not find it at all.
    let err = reconcile_payloads(&store, &clock, &Normalizer::default(), &[bounds(2, 42)])
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Verification { station_id: 2, .. }), "unexpected error: {err:?}");
    assert!(err.is_persistence_failure());
}

#[tokio::test]
async fn absent_pollutants_stay_absent_in_storage() {
    let store = MemoryStationStore::new();
    let clock = FixedClock::new(t0());
    let detail = RawStationPayload::detail_feed(
        "waqi",
        aqi_core::DiscoveryMethod::BoundingBox,
        json!({
            "idx": 42,
            "aqi": 17,
            "city": {"geo": [52.5, 13.4], "name": "Neukölln"},
            "iaqi": {"pm25": {"v": 17}, "no2": {"v": null}, "t": {"v": 4.5}}
        }),
    );
    reconcile_payloads(&store, &clock, &Normalizer::default(), &[detail])
        .await
        .unwrap();

    let row = store.row_for_station(42).await.unwrap().unwrap();
    assert_eq!(row.reading.pollutants.pm25, Some(17.0));
    assert_eq!(row.reading.pollutants.pm10, None);
    assert_eq!(row.reading.pollutants.no2, None);
    assert_eq!(row.reading.weather.temperature, Some(4.5));
    assert_eq!(row.reading.weather.humidity, None);
    assert_eq!(row.last_update, clock.cycle_start());
}

#[tokio::test]
async fn fetch_failure_aborts_cycle_with_zero_writes() {
    let h = harness();
    h.source.set(Ok(vec![bounds(1, 10)]));
    h.service.reconcile("Berlin").await.unwrap();
    let before = h.store.snapshot();

    h.source.set(Err("upstream 502".to_string()));
    let err = h.service.reconcile("Berlin").await.unwrap_err();
    assert!(err.is_transient_fetch());
    assert_eq!(h.store.snapshot(), before);

    let status = h.service.status().await;
    let record = status.cycles.get("Berlin").unwrap();
    assert!(record.outcome.is_none());
    assert!(record.error.as_deref().unwrap().contains("upstream 502"));
}

#[tokio::test]
async fn fetch_timeout_is_a_transient_failure() {
    let h = harness_with(ScriptedSource {
        delay: Some(StdDuration::from_secs(5)),
        ..Default::default()
    });
    h.source.set(Ok(vec![bounds(1, 10)]));
    let err = h.service.reconcile("Berlin").await.unwrap_err();
    assert!(matches!(err, SyncError::TransientFetch { .. }));
    assert_eq!(h.store.count_rows().await.unwrap(), 0);
}

#[tokio::test]
async fn unknown_region_is_rejected_before_fetching() {
    let h = harness();
    let err = h.service.reconcile("Atlantis").await.unwrap_err();
    assert!(matches!(err, SyncError::UnknownRegion(name) if name == "Atlantis"));
}

#[tokio::test]
async fn fixture_file_drives_a_full_cycle() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/waqi/berlin_cycle.json");
    let fixture = FixtureSource::from_file("waqi", &path).unwrap();
    let store = Arc::new(MemoryStationStore::new());
    let service = AirQualityService::new(
        store.clone(),
        SourceRegistry::new().with_source(Arc::new(fixture)),
        Arc::new(FixedClock::new(t0())),
        RegionRegistry::default(),
    );

    let outcome = service.reconcile("berlin").await.unwrap();
    assert_eq!(outcome, ReconcileOutcome { updated: 0, inserted: 3 });
    let mitte = store.row_for_station(6132).await.unwrap().unwrap();
    assert_eq!(mitte.reading.region, "Berlin");
    assert_eq!(mitte.reading.pollutants.pm25, Some(38.0));
    assert!(mitte.reading.attribution.is_some());
}

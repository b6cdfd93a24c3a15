//! Core domain model for station readings and their persisted snapshots.

use std::sync::Mutex;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "aqi-core";

/// Region tag applied when a reading does not carry one of its own.
pub const DEFAULT_REGION: &str = "Berlin";

/// Upstream discovery call a raw station payload was found by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    BoundingBox,
    KeywordSearch,
}

impl DiscoveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BoundingBox => "bounding_box",
            Self::KeywordSearch => "keyword_search",
        }
    }

    /// Whether readings from this method are already constrained to the region.
    pub fn is_geo_constrained(&self) -> bool {
        matches!(self, Self::BoundingBox)
    }
}

/// Latitude/longitude rectangle, bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl BoundingBox {
    pub fn berlin() -> Self {
        Self {
            lat_min: 52.35,
            lat_max: 52.65,
            lon_min: 13.10,
            lon_max: 13.70,
        }
    }

    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        (self.lat_min..=self.lat_max).contains(&latitude)
            && (self.lon_min..=self.lon_max).contains(&longitude)
    }

    pub fn is_well_formed(&self) -> bool {
        self.lat_min <= self.lat_max && self.lon_min <= self.lon_max
    }
}

/// Individual pollutant values. `None` means the station did not report it.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pollutants {
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
    pub no2: Option<f64>,
    pub o3: Option<f64>,
    pub co: Option<f64>,
    pub so2: Option<f64>,
}

impl Pollutants {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Weather {
    pub temperature: Option<f64>,
    pub pressure: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
}

impl Weather {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Canonical reading produced by the normalizer, keyed by `station_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationReading {
    pub station_id: i64,
    pub name: Option<String>,
    pub source_url: Option<String>,
    pub aqi: Option<i32>,
    pub pollutants: Pollutants,
    pub weather: Weather,
    pub latitude: f64,
    pub longitude: f64,
    /// Provider timestamp, kept verbatim.
    pub observed_at: Option<String>,
    /// Name of the registered source that produced the reading.
    pub source: String,
    pub attribution: Option<JsonValue>,
    pub region: String,
}

impl StationReading {
    /// A reading with identity and coordinates only; every measurement absent.
    pub fn bare(station_id: i64, latitude: f64, longitude: f64) -> Self {
        Self {
            station_id,
            name: None,
            source_url: None,
            aqi: None,
            pollutants: Pollutants::default(),
            weather: Weather::default(),
            latitude,
            longitude,
            observed_at: None,
            source: String::new(),
            attribution: None,
            region: DEFAULT_REGION.to_string(),
        }
    }
}

/// Persisted snapshot row: one per station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredStationRow {
    pub row_id: i64,
    pub last_update: DateTime<Utc>,
    #[serde(flatten)]
    pub reading: StationReading,
}

impl StoredStationRow {
    pub fn station_id(&self) -> i64 {
        self.reading.station_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub updated: usize,
    pub inserted: usize,
}

impl ReconcileOutcome {
    pub fn touched(&self) -> usize {
        self.updated + self.inserted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SweepOutcome {
    pub deleted: u64,
}

/// Wall-clock source used to stamp cycles and compute retention cutoffs.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Cycle timestamp, truncated to microseconds so it round-trips through
    /// `TIMESTAMPTZ` unchanged.
    fn cycle_start(&self) -> DateTime<Utc> {
        self.now().trunc_subsecs(6)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("clock mutex poisoned") = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock mutex poisoned");
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock mutex poisoned")
    }
}

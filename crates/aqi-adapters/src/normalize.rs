//! Station record normalizer.
//!
//! Turns raw upstream payloads of any [`PayloadShape`] into canonical
//! [`StationReading`]s. Within one batch the first reading seen for a
//! `station_id` wins, after payloads are ordered by the policy's
//! per-method priority list.

use std::collections::HashSet;

use aqi_core::{
    BoundingBox, DiscoveryMethod, Pollutants, StationReading, Weather, DEFAULT_REGION,
};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{PayloadShape, RawStationPayload};

#[derive(Debug, Clone, PartialEq, Error)]
#[error("malformed {shape:?} record (station {station_id:?}): {reason}")]
pub struct MalformedRecord {
    pub shape: PayloadShape,
    pub station_id: Option<i64>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizerPolicy {
    pub region: String,
    /// Keyword-search readings outside this box are dropped.
    pub bounds: BoundingBox,
    /// Earlier methods win duplicate `station_id`s. Unlisted methods rank last.
    pub priority: Vec<DiscoveryMethod>,
}

impl Default for NormalizerPolicy {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            bounds: BoundingBox::berlin(),
            priority: vec![DiscoveryMethod::BoundingBox, DiscoveryMethod::KeywordSearch],
        }
    }
}

impl NormalizerPolicy {
    fn rank(&self, method: DiscoveryMethod) -> usize {
        self.priority
            .iter()
            .position(|m| *m == method)
            .unwrap_or(self.priority.len())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub readings: Vec<StationReading>,
    pub malformed: Vec<MalformedRecord>,
    /// Zero-coordinate or out-of-bounds readings.
    pub discarded: usize,
    /// Readings dropped because a higher-priority one had the same station.
    pub duplicates: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    policy: NormalizerPolicy,
}

impl Normalizer {
    pub fn new(policy: NormalizerPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &NormalizerPolicy {
        &self.policy
    }

    /// Normalizes one payload. `Ok(None)` means the record is well formed but
    /// not usable here (sentinel coordinates, or outside the region).
    pub fn normalize(
        &self,
        payload: &RawStationPayload,
    ) -> Result<Option<StationReading>, MalformedRecord> {
        let body = &payload.body;
        let shape = payload.shape;
        let malformed = |station_id: Option<i64>, reason: &str| MalformedRecord {
            shape,
            station_id,
            reason: reason.to_string(),
        };

        let station_id = match shape {
            PayloadShape::DetailFeed => lenient_i64_at(body, &["idx"])
                .or_else(|| lenient_i64_at(body, &["uid"])),
            PayloadShape::BoundsResult | PayloadShape::SearchResult => {
                lenient_i64_at(body, &["uid"])
            }
        }
        .ok_or_else(|| malformed(None, "missing or unparseable station id"))?;

        let (lat, lon) = match shape {
            PayloadShape::BoundsResult => (
                lenient_f64_at(body, &["lat"]),
                lenient_f64_at(body, &["lon"]),
            ),
            PayloadShape::SearchResult => geo_pair(json_at(body, &["station", "geo"])),
            PayloadShape::DetailFeed => geo_pair(json_at(body, &["city", "geo"])),
        };
        let (Some(latitude), Some(longitude)) = (lat, lon) else {
            return Err(malformed(Some(station_id), "missing or unparseable coordinates"));
        };
        if latitude == 0.0 || longitude == 0.0 {
            debug!(station_id, "discarding reading with sentinel coordinates");
            return Ok(None);
        }
        if !payload.method.is_geo_constrained() && !self.policy.bounds.contains(latitude, longitude)
        {
            debug!(
                station_id,
                latitude,
                longitude,
                method = payload.method.as_str(),
                "discarding reading outside region bounds"
            );
            return Ok(None);
        }

        let aqi = match json_at(body, &["aqi"]) {
            None => None,
            Some(value) => match lenient_i64(value) {
                Some(v) => Some(
                    i32::try_from(v).map_err(|_| malformed(Some(station_id), "aqi out of range"))?,
                ),
                None => None,
            },
        };

        let mut reading = StationReading {
            station_id,
            name: None,
            source_url: None,
            aqi,
            pollutants: Pollutants::default(),
            weather: Weather::default(),
            latitude,
            longitude,
            observed_at: None,
            source: payload.source.clone(),
            attribution: None,
            region: self.policy.region.clone(),
        };

        match shape {
            PayloadShape::BoundsResult => {
                reading.name = text_at(body, &["station", "name"]);
                reading.observed_at = timestamp_text(json_at(body, &["station", "time"]));
            }
            PayloadShape::SearchResult => {
                reading.name = text_at(body, &["station", "name"]);
                reading.source_url = text_at(body, &["station", "url"]);
                reading.observed_at = timestamp_text(json_at(body, &["time"]))
                    .or_else(|| timestamp_text(json_at(body, &["station", "time"])));
            }
            PayloadShape::DetailFeed => {
                reading.name = text_at(body, &["city", "name"]);
                reading.source_url = text_at(body, &["city", "url"]);
                reading.observed_at = timestamp_text(json_at(body, &["time"]));
                reading.pollutants = Pollutants {
                    pm25: iaqi(body, "pm25"),
                    pm10: iaqi(body, "pm10"),
                    no2: iaqi(body, "no2"),
                    o3: iaqi(body, "o3"),
                    co: iaqi(body, "co"),
                    so2: iaqi(body, "so2"),
                };
                reading.weather = Weather {
                    temperature: iaqi(body, "t"),
                    pressure: iaqi(body, "p"),
                    humidity: iaqi(body, "h"),
                    wind_speed: iaqi(body, "w"),
                };
                reading.attribution = json_at(body, &["attributions"]).cloned();
            }
        }

        Ok(Some(reading))
    }

    /// Normalizes a whole fetch batch, skipping malformed records and
    /// collapsing duplicate stations by method priority.
    pub fn normalize_batch(&self, payloads: &[RawStationPayload]) -> NormalizedBatch {
        let mut order = (0..payloads.len()).collect::<Vec<_>>();
        // Stable: arrival order is kept within a method.
        order.sort_by_key(|&idx| self.policy.rank(payloads[idx].method));

        let mut batch = NormalizedBatch::default();
        let mut seen = HashSet::new();
        for idx in order {
            let payload = &payloads[idx];
            match self.normalize(payload) {
                Ok(Some(reading)) => {
                    if seen.insert(reading.station_id) {
                        batch.readings.push(reading);
                    } else {
                        debug!(
                            station_id = reading.station_id,
                            method = payload.method.as_str(),
                            "dropping lower-priority duplicate"
                        );
                        batch.duplicates += 1;
                    }
                }
                Ok(None) => batch.discarded += 1,
                Err(err) => {
                    warn!(error = %err, source = payload.source.as_str(), "skipping malformed record");
                    batch.malformed.push(err);
                }
            }
        }
        batch
    }
}

/// Walks `path`, treating explicit JSON `null` as absent.
fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

fn lenient_f64(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

fn lenient_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn lenient_f64_at(value: &JsonValue, path: &[&str]) -> Option<f64> {
    json_at(value, path).and_then(lenient_f64)
}

fn lenient_i64_at(value: &JsonValue, path: &[&str]) -> Option<i64> {
    json_at(value, path).and_then(lenient_i64)
}

fn text_at(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_at(value, path)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn geo_pair(value: Option<&JsonValue>) -> (Option<f64>, Option<f64>) {
    let Some(arr) = value.and_then(JsonValue::as_array) else {
        return (None, None);
    };
    (
        arr.first().and_then(lenient_f64),
        arr.get(1).and_then(lenient_f64),
    )
}

/// Provider timestamps are stored verbatim: either a plain string or the
/// first string member of a `{s|stime|iso}` object.
fn timestamp_text(value: Option<&JsonValue>) -> Option<String> {
    let value = value?;
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.clone()),
        JsonValue::Object(_) => ["s", "stime", "iso"]
            .into_iter()
            .find_map(|key| text_at(value, &[key])),
        _ => None,
    }
}

fn iaqi(body: &JsonValue, key: &str) -> Option<f64> {
    lenient_f64_at(body, &["iaqi", key, "v"])
}

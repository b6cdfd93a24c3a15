//! World Air Quality Index (aqicn.org) source.
//!
//! One cycle issues a bounding-box scan, an optional keyword search and one
//! detail-feed call per distinct station. Only the bounding-box call is
//! load-bearing; the other two degrade to whatever was already discovered.

use std::collections::HashSet;
use std::sync::Arc;

use aqi_core::BoundingBox;
use aqi_storage::HttpFetcher;
use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value as JsonValue;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{AdapterContext, AdapterError, RawStationPayload, RegionQuery, StationSource};

pub const SOURCE_ID: &str = "waqi";
pub const DEFAULT_BASE_URL: &str = "https://api.waqi.info";

#[derive(Debug, Clone)]
pub struct WaqiConfig {
    pub base_url: String,
    pub token: String,
    /// Replace discovery entries with the richer per-station feed.
    pub fetch_details: bool,
}

impl WaqiConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: token.into(),
            fetch_details: true,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct WaqiSource {
    http: Arc<HttpFetcher>,
    config: WaqiConfig,
}

impl WaqiSource {
    pub fn new(http: Arc<HttpFetcher>, config: WaqiConfig) -> Self {
        Self { http, config }
    }

    fn endpoint(&self, path: &str, params: &[(&str, String)]) -> Result<String, AdapterError> {
        let base = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
        let query = params
            .iter()
            .map(|(k, v)| (*k, v.as_str()))
            .chain(std::iter::once(("token", self.config.token.as_str())));
        Url::parse_with_params(&base, query)
            .map(String::from)
            .map_err(|err| AdapterError::Message(format!("invalid WAQI url {base}: {err}")))
    }

    pub fn bounds_url(&self, bounds: &BoundingBox) -> Result<String, AdapterError> {
        let latlng = format!(
            "{},{},{},{}",
            bounds.lat_min, bounds.lon_min, bounds.lat_max, bounds.lon_max
        );
        self.endpoint("map/bounds/", &[("latlng", latlng)])
    }

    pub fn search_url(&self, keyword: &str) -> Result<String, AdapterError> {
        self.endpoint("search/", &[("keyword", keyword.to_string())])
    }

    pub fn feed_url(&self, uid: i64) -> Result<String, AdapterError> {
        self.endpoint(&format!("feed/@{uid}/"), &[])
    }

    async fn search(
        &self,
        ctx: &AdapterContext,
        keyword: &str,
    ) -> Result<Vec<RawStationPayload>, AdapterError> {
        let url = self.search_url(keyword)?;
        let body = self.http.fetch_json(ctx.cycle_id, SOURCE_ID, &url).await?;
        Ok(data_array("search", body)?
            .into_iter()
            .map(|item| RawStationPayload::search_result(SOURCE_ID, item))
            .collect())
    }

    /// Swaps each station's first discovery payload for its detail feed.
    /// Failed or unusable detail calls leave the discovery payload in place.
    async fn enrich_with_details(&self, ctx: &AdapterContext, payloads: &mut [RawStationPayload]) {
        let mut seen = HashSet::new();
        let mut tasks = JoinSet::new();
        for (idx, payload) in payloads.iter().enumerate() {
            let Some(uid) = payload.body.get("uid").and_then(station_uid) else {
                continue;
            };
            if !seen.insert(uid) {
                continue;
            }
            let url = match self.feed_url(uid) {
                Ok(url) => url,
                Err(err) => {
                    warn!(uid, error = %err, "skipping detail feed");
                    continue;
                }
            };
            let http = Arc::clone(&self.http);
            let cycle_id = ctx.cycle_id;
            tasks.spawn(async move {
                let result = match http.fetch_json(cycle_id, SOURCE_ID, &url).await {
                    Ok(body) => parse_envelope("feed", body),
                    Err(err) => Err(err.into()),
                };
                (idx, uid, result)
            });
        }

        let mut enriched = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, uid, Ok(data))) => {
                    if apply_detail(payloads, idx, uid, data) {
                        enriched += 1;
                    } else {
                        debug!(uid, "detail feed had no coordinates; keeping discovery payload");
                    }
                }
                Ok((_, uid, Err(err))) => {
                    warn!(uid, error = %err, "detail feed failed; keeping discovery payload");
                }
                Err(err) => warn!(error = %err, "detail feed task aborted"),
            }
        }
        debug!(requested = seen.len(), enriched, "detail enrichment finished");
    }
}

#[async_trait]
impl StationSource for WaqiSource {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    async fn fetch(
        &self,
        ctx: &AdapterContext,
        region: &RegionQuery,
    ) -> Result<Vec<RawStationPayload>, AdapterError> {
        let span = info_span!(
            "waqi_fetch",
            cycle_id = %ctx.cycle_id,
            cycle_started_at = %ctx.started_at,
            region = %region.name
        );
        self.discover(ctx, region).instrument(span).await
    }
}

impl WaqiSource {
    async fn discover(
        &self,
        ctx: &AdapterContext,
        region: &RegionQuery,
    ) -> Result<Vec<RawStationPayload>, AdapterError> {
        let url = self.bounds_url(&region.bounds)?;
        let body = self.http.fetch_json(ctx.cycle_id, SOURCE_ID, &url).await?;
        let mut payloads = data_array("map/bounds", body)?
            .into_iter()
            .map(|item| RawStationPayload::bounds_result(SOURCE_ID, item))
            .collect::<Vec<_>>();
        info!(region = %region.name, stations = payloads.len(), "bounding-box discovery finished");

        if let Some(keyword) = region
            .search_keyword
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
        {
            match self.search(ctx, keyword).await {
                Ok(found) => {
                    info!(region = %region.name, keyword, stations = found.len(), "keyword discovery finished");
                    payloads.extend(found);
                }
                Err(err) => {
                    warn!(region = %region.name, keyword, error = %err, "keyword discovery failed; continuing with bounding-box results");
                }
            }
        }

        if self.config.fetch_details {
            self.enrich_with_details(ctx, &mut payloads).await;
        }
        Ok(payloads)
    }
}

/// Unwraps `{"status": "ok", "data": ...}`.
pub fn parse_envelope(endpoint: &'static str, body: JsonValue) -> Result<JsonValue, AdapterError> {
    let status = body.get("status").and_then(JsonValue::as_str);
    if status != Some("ok") {
        let message = match body.get("data").or_else(|| body.get("message")) {
            Some(JsonValue::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "no message".to_string(),
        };
        return Err(AdapterError::UpstreamStatus {
            endpoint,
            status: status.map(ToString::to_string),
            message,
        });
    }
    match body.get("data") {
        Some(data) if !data.is_null() => Ok(data.clone()),
        _ => Err(AdapterError::MissingData { endpoint }),
    }
}

fn data_array(endpoint: &'static str, body: JsonValue) -> Result<Vec<JsonValue>, AdapterError> {
    match parse_envelope(endpoint, body)? {
        JsonValue::Array(items) => Ok(items),
        _ => Err(AdapterError::MissingData { endpoint }),
    }
}

fn station_uid(value: &JsonValue) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn apply_detail(payloads: &mut [RawStationPayload], idx: usize, uid: i64, mut data: JsonValue) -> bool {
    let has_geo = data
        .pointer("/city/geo")
        .and_then(JsonValue::as_array)
        .is_some_and(|geo| geo.len() >= 2);
    let Some(slot) = payloads.get_mut(idx) else {
        return false;
    };
    let Some(object) = data.as_object_mut().filter(|_| has_geo) else {
        return false;
    };
    object.entry("idx").or_insert_with(|| JsonValue::from(uid));
    *slot = RawStationPayload::detail_feed(slot.source.clone(), slot.method, data);
    true
}

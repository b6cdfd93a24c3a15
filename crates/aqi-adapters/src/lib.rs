//! Upstream station source contracts, the WAQI client and the record normalizer.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use aqi_core::{BoundingBox, DiscoveryMethod};
use aqi_storage::FetchError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub mod normalize;
pub mod waqi;

pub use normalize::{MalformedRecord, NormalizedBatch, Normalizer, NormalizerPolicy};
pub use waqi::{WaqiConfig, WaqiSource};

pub const CRATE_NAME: &str = "aqi-adapters";

/// Response schema a raw payload was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadShape {
    /// One entry of a `map/bounds` result.
    BoundsResult,
    /// One entry of a keyword `search` result.
    SearchResult,
    /// The `data` object of a per-station `feed/@uid` result.
    DetailFeed,
}

/// One station as returned by an upstream call, tagged with how it was discovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawStationPayload {
    pub source: String,
    pub method: DiscoveryMethod,
    pub shape: PayloadShape,
    pub body: JsonValue,
}

impl RawStationPayload {
    pub fn bounds_result(source: impl Into<String>, body: JsonValue) -> Self {
        Self {
            source: source.into(),
            method: DiscoveryMethod::BoundingBox,
            shape: PayloadShape::BoundsResult,
            body,
        }
    }

    pub fn search_result(source: impl Into<String>, body: JsonValue) -> Self {
        Self {
            source: source.into(),
            method: DiscoveryMethod::KeywordSearch,
            shape: PayloadShape::SearchResult,
            body,
        }
    }

    pub fn detail_feed(source: impl Into<String>, method: DiscoveryMethod, body: JsonValue) -> Self {
        Self {
            source: source.into(),
            method,
            shape: PayloadShape::DetailFeed,
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
}

/// What a source needs to know about a region to query it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionQuery {
    pub name: String,
    pub bounds: BoundingBox,
    pub search_keyword: Option<String>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{endpoint} answered with status {status:?}: {message}")]
    UpstreamStatus {
        endpoint: &'static str,
        status: Option<String>,
        message: String,
    },
    #[error("{endpoint} response has no data array")]
    MissingData { endpoint: &'static str },
    #[error("{0}")]
    Message(String),
}

impl AdapterError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Fetch(err) if err.is_timeout())
    }
}

/// Capability interface: anything that can list raw station payloads for a region.
#[async_trait]
pub trait StationSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch(
        &self,
        ctx: &AdapterContext,
        region: &RegionQuery,
    ) -> Result<Vec<RawStationPayload>, AdapterError>;
}

/// Name to implementation mapping; only implemented sources are ever registered.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: Vec<Arc<dyn StationSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `source`, replacing any earlier source with the same id.
    pub fn register(&mut self, source: Arc<dyn StationSource>) {
        self.sources.retain(|s| s.source_id() != source.source_id());
        self.sources.push(source);
    }

    pub fn with_source(mut self, source: Arc<dyn StationSource>) -> Self {
        self.register(source);
        self
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<dyn StationSource>> {
        self.sources
            .iter()
            .find(|s| s.source_id() == source_id)
            .cloned()
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.sources
            .iter()
            .map(|s| s.source_id().to_string())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.source_ids())
            .finish()
    }
}

/// Serves canned payloads, either built in code or loaded from a JSON file.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    source_id: String,
    payloads: Vec<RawStationPayload>,
    failure: Option<String>,
}

impl FixtureSource {
    pub fn new(source_id: impl Into<String>, payloads: Vec<RawStationPayload>) -> Self {
        Self {
            source_id: source_id.into(),
            payloads,
            failure: None,
        }
    }

    /// A source whose every fetch fails with `message`.
    pub fn failing(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            payloads: Vec::new(),
            failure: Some(message.into()),
        }
    }

    pub fn from_file(source_id: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let payloads: Vec<RawStationPayload> =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(source_id, payloads))
    }

    pub fn payloads(&self) -> &[RawStationPayload] {
        &self.payloads
    }
}

#[async_trait]
impl StationSource for FixtureSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(
        &self,
        _ctx: &AdapterContext,
        _region: &RegionQuery,
    ) -> Result<Vec<RawStationPayload>, AdapterError> {
        match &self.failure {
            Some(message) => Err(AdapterError::Message(message.clone())),
            None => Ok(self.payloads.clone()),
        }
    }
}

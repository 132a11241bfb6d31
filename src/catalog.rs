//! Stream catalog client
//!
//! Read-only view of the streams API: what is live right now, what has
//! ended, and the details of one stream.

use crate::config::CatalogConfig;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Catalog request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid catalog URL: {0}")]
    InvalidUrl(String),
    #[error("Stream {0} not found")]
    NotFound(String),
    #[error("{url} returned {status}")]
    Status { url: String, status: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Like {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// One stream record as served by the streams API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub stream_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Seconds
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub likes: Vec<Like>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl StreamInfo {
    pub fn duration_minutes(&self) -> Option<u64> {
        self.duration.filter(|d| *d >= 0.0).map(|d| (d / 60.0).floor() as u64)
    }
}

/// Newest first; records without a timestamp go last
pub fn sort_newest_first<F>(streams: &mut [StreamInfo], key: F)
where
    F: Fn(&StreamInfo) -> Option<DateTime<Utc>>,
{
    streams.sort_by_key(|s| Reverse(key(s)));
}

pub struct StreamCatalog {
    client: reqwest::Client,
    base_url: Url,
}

impl StreamCatalog {
    pub fn new(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| CatalogError::InvalidUrl(format!("{}: {}", config.base_url, e)))?;
        Ok(Self { client, base_url })
    }

    /// Live streams, most recently started first
    pub async fn live_streams(&self) -> Result<Vec<StreamInfo>, CatalogError> {
        let mut streams: Vec<StreamInfo> = self.get(&["api", "streams", "live"]).await?;
        sort_newest_first(&mut streams, |s| s.started_at);
        Ok(streams)
    }

    /// Ended streams, most recently ended first
    pub async fn ended_streams(&self) -> Result<Vec<StreamInfo>, CatalogError> {
        let mut streams: Vec<StreamInfo> = self.get(&["api", "streams", "ended"]).await?;
        sort_newest_first(&mut streams, |s| s.ended_at);
        Ok(streams)
    }

    pub async fn stream(&self, stream_id: &str) -> Result<StreamInfo, CatalogError> {
        match self.get(&["api", "streams", stream_id]).await {
            Err(CatalogError::Status { status: 404, .. }) => Err(CatalogError::NotFound(stream_id.to_string())),
            other => other,
        }
    }

    /// Base URL with `segments` appended, each one percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Result<Url, CatalogError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CatalogError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, segments: &[&str]) -> Result<T, CatalogError> {
        let url = self.endpoint(segments)?;
        debug!("GET {}", url);

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.json().await?)
    }
}

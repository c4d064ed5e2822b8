//! JSON-over-HTTP source adapter.

use super::mapper::{RawRow, map_detail, map_summary_row};
use super::{SourceAdapter, SourceAdapterFactory, SummaryFetch};
use crate::core::{DetailRecord, FeedError, Result};
use crate::lifecycle::{StatusStrategy, default_strategy};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, event};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    /// Live summary feed.
    pub summary_url: String,
    /// Per-entity detail document; `{id}` is replaced by the entity id.
    pub detail_url_template: String,
    /// Only keep rows whose group name contains this text (case-insensitive).
    pub group_filter: Option<String>,
    pub timeout: Duration,
}

impl HttpSourceConfig {
    pub fn new(summary_url: impl Into<String>, detail_url_template: impl Into<String>) -> Self {
        Self {
            summary_url: summary_url.into(),
            detail_url_template: detail_url_template.into(),
            group_filter: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn group_filter(mut self, filter: impl Into<String>) -> Self {
        self.group_filter = Some(filter.into().to_lowercase());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn detail_url(&self, id: &str) -> String {
        self.detail_url_template.replace("{id}", id)
    }
}

pub struct HttpSourceAdapter {
    config: HttpSourceConfig,
    client: reqwest::Client,
    status: Box<dyn StatusStrategy>,
}

impl HttpSourceAdapter {
    pub fn new(config: HttpSourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| FeedError::SourceUnavailable(format!("http client: {e}")))?;
        Ok(Self {
            config,
            client,
            status: default_strategy(),
        })
    }

    pub fn with_status_strategy(mut self, status: Box<dyn StatusStrategy>) -> Self {
        self.status = status;
        self
    }

    fn keep(&self, group_name: &str) -> bool {
        match &self.config.group_filter {
            Some(filter) => group_name.to_lowercase().contains(filter.as_str()),
            None => true,
        }
    }
}

/// Summary bodies are either a bare array of rows or `{"matches": [...]}`.
fn summary_rows(body: JsonValue) -> Option<Vec<RawRow>> {
    let rows = match body {
        JsonValue::Array(rows) => rows,
        JsonValue::Object(mut map) => match map.remove("matches") {
            Some(JsonValue::Array(rows)) => rows,
            _ => return None,
        },
        _ => return None,
    };
    Some(
        rows.into_iter()
            .filter_map(|row| match row {
                JsonValue::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
    )
}

#[async_trait]
impl SourceAdapter for HttpSourceAdapter {
    async fn fetch_live_summary(&self) -> Result<SummaryFetch> {
        let response = self
            .client
            .get(&self.config.summary_url)
            .send()
            .await
            .map_err(|e| FeedError::SourceUnavailable(format!("summary request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            event!(Level::WARN, %status, "summary feed returned an error status");
            return Ok(SummaryFetch::failed());
        }

        let body = match response.json::<JsonValue>().await {
            Ok(body) => body,
            Err(err) => {
                event!(Level::WARN, error = %err, "summary feed body is not JSON");
                return Ok(SummaryFetch::failed());
            }
        };
        let Some(rows) = summary_rows(body) else {
            event!(Level::WARN, "summary feed body has an unexpected shape");
            return Ok(SummaryFetch::failed());
        };

        let records = rows
            .iter()
            .filter_map(|row| map_summary_row(row, self.status.as_ref()))
            .filter(|record| self.keep(&record.group_name))
            .collect::<Vec<_>>();
        event!(Level::DEBUG, rows = rows.len(), kept = records.len(), "summary mapped");
        Ok(SummaryFetch::ok(records))
    }

    async fn fetch_detail(&self, id: &str) -> Result<Option<DetailRecord>> {
        let response = self
            .client
            .get(self.config.detail_url(id))
            .send()
            .await
            .map_err(|e| FeedError::SourceUnavailable(format!("detail request failed: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            status if !status.is_success() => {
                return Err(FeedError::SourceUnavailable(format!(
                    "detail for {id} failed ({status})"
                )));
            }
            _ => {}
        }

        let body = response
            .json::<JsonValue>()
            .await
            .map_err(|e| FeedError::Serialization(format!("invalid detail for {id}: {e}")))?;
        Ok(map_detail(&body))
    }
}

/// Creates one [`HttpSourceAdapter`] per detail worker.
pub struct HttpSourceFactory {
    config: Arc<HttpSourceConfig>,
}

impl HttpSourceFactory {
    pub fn new(config: HttpSourceConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl SourceAdapterFactory for HttpSourceFactory {
    async fn create(&self, worker_index: usize) -> Result<Box<dyn SourceAdapter>> {
        event!(Level::DEBUG, worker = worker_index + 1, "creating http adapter");
        Ok(Box::new(HttpSourceAdapter::new(self.config.as_ref().clone())?))
    }
}

//! Source adapter boundary: where live summaries and per-entity details come
//! from.

pub mod http;
pub mod mapper;

pub use http::{HttpSourceAdapter, HttpSourceConfig, HttpSourceFactory};

use crate::core::{DetailRecord, Result, SummaryRecord};
use async_trait::async_trait;

/// Result of one live-summary poll.
///
/// `ok == false` means the source answered but the answer must not be
/// trusted; the caller treats it exactly like a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SummaryFetch {
    pub ok: bool,
    pub records: Vec<SummaryRecord>,
}

impl SummaryFetch {
    pub fn ok(records: Vec<SummaryRecord>) -> Self {
        Self { ok: true, records }
    }

    pub fn failed() -> Self {
        Self {
            ok: false,
            records: Vec::new(),
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Establish whatever session the adapter needs. Called once before use.
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn fetch_live_summary(&self) -> Result<SummaryFetch>;

    /// `Ok(None)` when the source has nothing for this id.
    async fn fetch_detail(&self, id: &str) -> Result<Option<DetailRecord>>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Builds independent adapter instances, one per detail worker.
#[async_trait]
pub trait SourceAdapterFactory: Send + Sync {
    async fn create(&self, worker_index: usize) -> Result<Box<dyn SourceAdapter>>;
}

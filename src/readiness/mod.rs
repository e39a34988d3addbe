use crate::datasource::{DataSourceCatalog, DataSourceStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;

/// Read-side view over the catalog's published watermarks.
///
/// Holds no state of its own, so every reader sees publications in the order
/// the import coordinator made them.
#[derive(Clone)]
pub struct ReadinessTracker {
    catalog: Arc<DataSourceCatalog>,
}

impl ReadinessTracker {
    pub fn new(catalog: Arc<DataSourceCatalog>) -> Self {
        Self { catalog }
    }

    /// True when the data source's table exists and its watermark spans
    /// `[start, end]`. Unknown data sources are never covered.
    pub fn covers(&self, data_source: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        match self.catalog.status(data_source) {
            Some(DataSourceStatus {
                table_exists: true,
                watermark: Some(watermark),
            }) => watermark.covers(start, end),
            _ => false,
        }
    }

    pub fn exists(&self, data_source: &str) -> bool {
        self.catalog
            .status(data_source)
            .map(|s| s.table_exists)
            .unwrap_or(false)
    }

    pub fn status(&self, data_source: &str) -> Option<DataSourceStatus> {
        self.catalog.status(data_source)
    }

    /// The subset of `data_sources` not covering `[start, end]`, in input order.
    pub fn uncovered<'a, I>(&self, data_sources: I, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        data_sources
            .into_iter()
            .filter(|name| !self.covers(name, start, end))
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.catalog.subscribe()
    }
}

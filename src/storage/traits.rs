use crate::datasource::{ImportWatermark, WatermarkRecord};
use crate::error::ErrorClass;
use crate::report::state::Report;
use crate::sample::Sample;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// One result row: column name to value, in query column order.
pub type ResultRow = serde_json::Map<String, serde_json::Value>;

/// Row count and timestamp bounds of a data source table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRange {
    pub rows: u64,
    pub earliest: DateTime<Utc>,
    pub newest: DateTime<Utc>,
}

/// A persisted report and, if it finished, its rows.
#[derive(Debug, Clone)]
pub struct StoredReport {
    pub report: Report,
    pub rows: Option<Vec<ResultRow>>,
}

/// Kinds of user-managed definitions kept alongside the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionKind {
    DataSource,
    ReportQuery,
    ScheduledReport,
}

impl DefinitionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DefinitionKind::DataSource => "datasource",
            DefinitionKind::ReportQuery => "report_query",
            DefinitionKind::ScheduledReport => "scheduled_report",
        }
    }
}

/// The columnar store: persisted samples, watermark metadata, report query
/// execution and report state.
#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn init_schema(&self) -> Result<(), StoreError>;

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError>;

    /// Create `table` if needed and insert the samples whose identity is not
    /// already present, all in one transaction. Returns the number inserted.
    async fn write_samples(&self, table: &str, samples: &[Sample]) -> Result<usize, StoreError>;

    /// `None` when the table is missing or empty.
    async fn table_range(&self, table: &str) -> Result<Option<TableRange>, StoreError>;

    async fn load_watermark(&self, data_source: &str) -> Result<Option<WatermarkRecord>, StoreError>;

    async fn load_watermarks(&self) -> Result<Vec<(String, WatermarkRecord)>, StoreError>;

    /// Write `watermark` only if the stored version equals `expected_version`
    /// (0 meaning no record yet). Returns false on a version mismatch.
    async fn swap_watermark(
        &self,
        data_source: &str,
        expected_version: u64,
        watermark: &ImportWatermark,
    ) -> Result<bool, StoreError>;

    async fn execute_query(&self, sql: &str) -> Result<Vec<ResultRow>, StoreError>;

    async fn save_report(&self, report: &Report, rows: Option<&[ResultRow]>) -> Result<(), StoreError>;

    async fn load_reports(&self) -> Result<Vec<StoredReport>, StoreError>;

    async fn delete_report(&self, name: &str) -> Result<(), StoreError>;

    async fn save_definition(
        &self,
        kind: DefinitionKind,
        name: &str,
        body: &serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn load_definitions(&self, kind: DefinitionKind) -> Result<Vec<serde_json::Value>, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Report query failure, message kept verbatim from the engine.
    #[error("{0}")]
    Query(String),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Database(_) | StoreError::Unavailable(_) => ErrorClass::Transient,
            StoreError::Serialization(_) => ErrorClass::Validation,
            StoreError::Query(_) => ErrorClass::QueryExecution,
        }
    }
}

use crate::config::types::ImportConfig;
use crate::datasource::{
    table_name, DataSourceCatalog, DataSourceDefinition, DataSourceStatus, ImportWatermark,
    WatermarkRecord,
};
use crate::error::ErrorClass;
use crate::sample::{Batch, BatchError, BatchSpan};
use crate::storage::{DefinitionKind, MetricStore, StoreError};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("invalid batch: {0}")]
    Batch(#[from] BatchError),

    #[error("unknown data source '{0}'")]
    UnknownDataSource(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("samples for '{data_source}' were stored but the watermark was not published: {source}")]
    WatermarkPublish {
        data_source: String,
        #[source]
        source: StoreError,
    },

    #[error("watermark for '{data_source}' kept changing underneath, gave up after {attempts} attempts")]
    WatermarkConflict { data_source: String, attempts: usize },
}

impl ImportError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ImportError::Batch(e) => e.class(),
            ImportError::UnknownDataSource(_) => ErrorClass::Validation,
            ImportError::Store(e) => e.class(),
            ImportError::WatermarkPublish { .. } | ImportError::WatermarkConflict { .. } => {
                ErrorClass::Transient
            }
        }
    }
}

/// Result of a successful `store` call.
#[derive(Debug, Clone, Serialize)]
pub struct ImportOutcome {
    /// Samples actually inserted; duplicates are not counted.
    pub stored: usize,
    pub watermark: Option<ImportWatermark>,
}

/// Per data source state, guarded by that data source's mutex.
#[derive(Default)]
struct Slot {
    loaded: bool,
    record: Option<WatermarkRecord>,
    /// Rows may be ahead of the published watermark.
    stale: bool,
}

/// Serializes batch writes per data source, persists them through the store
/// and publishes the resulting watermark to the catalog.
pub struct ImportCoordinator {
    store: Arc<dyn MetricStore>,
    catalog: Arc<DataSourceCatalog>,
    config: ImportConfig,
    slots: std::sync::Mutex<HashMap<String, Arc<Mutex<Slot>>>>,
}

impl ImportCoordinator {
    pub fn new(
        store: Arc<dyn MetricStore>,
        catalog: Arc<DataSourceCatalog>,
        config: ImportConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            config,
            slots: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &Arc<DataSourceCatalog> {
        &self.catalog
    }

    /// Restore persisted definitions and watermarks and publish them.
    pub async fn load(&self) -> Result<(), ImportError> {
        for body in self.store.load_definitions(DefinitionKind::DataSource).await? {
            match serde_json::from_value::<DataSourceDefinition>(body) {
                Ok(definition) => self.catalog.register(definition),
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable data source definition"),
            }
        }

        for (name, record) in self.store.load_watermarks().await? {
            let table_exists = self.store.table_exists(&table_name(&name)).await?;
            let slot = self.slot(&name);
            let mut slot = slot.lock().await;
            slot.loaded = true;
            slot.record = Some(record);
            self.catalog.publish(
                &name,
                DataSourceStatus {
                    table_exists,
                    watermark: Some(record.watermark),
                },
            );
        }

        for definition in self.catalog.definitions() {
            let slot = self.slot(&definition.name);
            let mut slot = slot.lock().await;
            if slot.loaded {
                continue;
            }
            slot.loaded = true;
            // A table without a watermark means a publish failed before the restart
            let table = table_name(&definition.name);
            if self.store.table_exists(&table).await? {
                slot.stale = true;
                self.catalog.publish(
                    &definition.name,
                    DataSourceStatus {
                        table_exists: true,
                        watermark: None,
                    },
                );
            }
        }

        tracing::info!(data_sources = self.catalog.list().len(), "Loaded import state");
        Ok(())
    }

    /// Register or replace a data source definition and persist it.
    pub async fn register(&self, definition: DataSourceDefinition) -> Result<(), ImportError> {
        if definition.name.is_empty() {
            return Err(BatchError::EmptyName.into());
        }
        let body = serde_json::to_value(&definition).map_err(StoreError::from)?;
        self.store
            .save_definition(DefinitionKind::DataSource, &definition.name, &body)
            .await?;
        tracing::info!(data_source = %definition.name, "Registered data source");
        self.catalog.register(definition);
        Ok(())
    }

    /// Persist a batch for `data_source` and advance its watermark.
    ///
    /// Calls for the same data source run one at a time. Samples already
    /// present are dropped and not counted.
    pub async fn store(&self, data_source: &str, batch: Batch) -> Result<ImportOutcome, ImportError> {
        let span = batch.validate(data_source)?;

        if !self.catalog.contains(data_source) {
            if !self.config.auto_register {
                return Err(ImportError::UnknownDataSource(data_source.to_string()));
            }
            self.register(DataSourceDefinition::named(data_source)).await?;
        }

        let slot = self.slot(data_source);
        let mut slot = slot.lock().await;

        if !slot.loaded {
            slot.record = self.store.load_watermark(data_source).await?;
            slot.loaded = true;
        }

        let table = table_name(data_source);
        let stored = self.store.write_samples(&table, batch.samples()).await?;

        tracing::debug!(
            data_source,
            received = batch.len(),
            stored,
            stale = slot.stale,
            "Persisted batch"
        );

        if stored == 0 && !slot.stale {
            return Ok(ImportOutcome {
                stored,
                watermark: slot.record.map(|r| r.watermark),
            });
        }

        match self.advance(data_source, &mut slot, span, &batch, stored).await {
            Ok(watermark) => {
                tracing::info!(
                    data_source,
                    stored,
                    newest = %watermark.newest_imported_time,
                    "Imported samples"
                );
                Ok(ImportOutcome {
                    stored,
                    watermark: Some(watermark),
                })
            }
            Err(e) => {
                slot.stale = true;
                tracing::warn!(data_source, stored, error = %e, "Watermark not published, marked stale");
                Err(e)
            }
        }
    }

    async fn advance(
        &self,
        data_source: &str,
        slot: &mut Slot,
        span: BatchSpan,
        batch: &Batch,
        stored: usize,
    ) -> Result<ImportWatermark, ImportError> {
        let now = Utc::now();
        let publish_err = |source: StoreError| ImportError::WatermarkPublish {
            data_source: data_source.to_string(),
            source,
        };

        let mut base = slot.record.map(|r| r.watermark);
        if slot.stale {
            let range = self
                .store
                .table_range(&table_name(data_source))
                .await
                .map_err(publish_err)?;
            if let Some(range) = range {
                let last_import = base.map(|w| w.last_import_time).unwrap_or(now);
                let rebuilt = ImportWatermark::advance(
                    None,
                    BatchSpan {
                        min: range.earliest,
                        max: range.newest,
                    },
                    None,
                    last_import,
                );
                base = Some(match base {
                    Some(existing) => existing.merge(&rebuilt),
                    None => rebuilt,
                });
            }
        }

        let mut candidate = if stored > 0 {
            ImportWatermark::advance(base.as_ref(), span, batch.window(), now)
        } else {
            // Stale rebuild with nothing new to add
            match base {
                Some(base) => base,
                None => ImportWatermark::advance(None, span, batch.window(), now),
            }
        };
        let mut expected = slot.record.map(|r| r.version).unwrap_or(0);

        let attempts = self.config.max_watermark_retries + 1;
        for attempt in 1..=attempts {
            let swapped = self
                .store
                .swap_watermark(data_source, expected, &candidate)
                .await
                .map_err(publish_err)?;

            if swapped {
                slot.record = Some(WatermarkRecord {
                    watermark: candidate,
                    version: expected + 1,
                });
                slot.stale = false;
                self.catalog.publish(
                    data_source,
                    DataSourceStatus {
                        table_exists: true,
                        watermark: Some(candidate),
                    },
                );
                return Ok(candidate);
            }

            tracing::debug!(data_source, attempt, expected, "Watermark version conflict, reloading");
            match self
                .store
                .load_watermark(data_source)
                .await
                .map_err(publish_err)?
            {
                Some(current) => {
                    candidate = current.watermark.merge(&candidate);
                    expected = current.version;
                }
                None => expected = 0,
            }
        }

        Err(ImportError::WatermarkConflict {
            data_source: data_source.to_string(),
            attempts,
        })
    }

    fn slot(&self, data_source: &str) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.entry(data_source.to_string()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::state::Report;
    use crate::sample::{ImportWindow, Sample};
    use crate::storage::{DuckDbStore, ResultRow, StoredReport, TableRange};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn batch(ds: &str, pods: &[&str], times: &[i64]) -> Batch {
        let mut samples = Vec::new();
        for pod in pods {
            for t in times {
                let labels = BTreeMap::from([("pod".to_string(), pod.to_string())]);
                samples.push(Sample::new(ds, labels, ts(*t), 1.0, 60.0));
            }
        }
        Batch::new(ds, samples)
    }

    async fn setup() -> (Arc<DuckDbStore>, ImportCoordinator) {
        let store = Arc::new(DuckDbStore::in_memory().unwrap());
        store.init_schema().await.unwrap();
        let coordinator = ImportCoordinator::new(
            store.clone(),
            Arc::new(DataSourceCatalog::new()),
            ImportConfig::default(),
        );
        (store, coordinator)
    }

    #[tokio::test]
    async fn test_store_is_idempotent() {
        let (store, coordinator) = setup().await;

        let first = coordinator
            .store("ds", batch("ds", &["a", "b"], &[0, 60, 120]))
            .await
            .unwrap();
        assert_eq!(first.stored, 6);

        let second = coordinator
            .store("ds", batch("ds", &["a", "b"], &[0, 60, 120]))
            .await
            .unwrap();
        assert_eq!(second.stored, 0);
        assert_eq!(second.watermark, first.watermark);

        let range = store.table_range("datasource_ds").await.unwrap().unwrap();
        assert_eq!(range.rows, 6);
    }

    #[tokio::test]
    async fn test_watermark_tracks_out_of_order_batches() {
        let (_store, coordinator) = setup().await;

        coordinator.store("ds", batch("ds", &["a"], &[600])).await.unwrap();
        coordinator.store("ds", batch("ds", &["a"], &[0])).await.unwrap();
        let outcome = coordinator.store("ds", batch("ds", &["a"], &[300])).await.unwrap();

        let wm = outcome.watermark.unwrap();
        assert_eq!(wm.earliest_imported_time, ts(0));
        assert_eq!(wm.newest_imported_time, ts(600));

        let status = coordinator.catalog().status("ds").unwrap();
        assert!(status.table_exists);
        assert_eq!(status.watermark, Some(wm));
    }

    #[tokio::test]
    async fn test_rejects_invalid_batches_before_touching_store() {
        let (store, coordinator) = setup().await;

        let err = coordinator.store("ds", Batch::new("ds", vec![])).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);

        let err = coordinator
            .store("other", batch("ds", &["a"], &[0]))
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Batch(BatchError::TargetMismatch { .. })));

        assert!(!store.table_exists("datasource_ds").await.unwrap());
        assert!(!store.table_exists("datasource_other").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_data_source_rejected_without_auto_register() {
        let store = Arc::new(DuckDbStore::in_memory().unwrap());
        store.init_schema().await.unwrap();
        let coordinator = ImportCoordinator::new(
            store,
            Arc::new(DataSourceCatalog::new()),
            ImportConfig {
                auto_register: false,
                ..ImportConfig::default()
            },
        );

        let err = coordinator.store("ds", batch("ds", &["a"], &[0])).await.unwrap_err();
        assert!(matches!(err, ImportError::UnknownDataSource(_)));

        coordinator.register(DataSourceDefinition::named("ds")).await.unwrap();
        assert_eq!(
            coordinator.store("ds", batch("ds", &["a"], &[0])).await.unwrap().stored,
            1
        );
    }

    #[tokio::test]
    async fn test_window_widens_import_range() {
        let (_store, coordinator) = setup().await;
        let windowed = batch("ds", &["a"], &[60]).with_window(ImportWindow {
            start: ts(0),
            end: ts(300),
        });

        let wm = coordinator.store("ds", windowed).await.unwrap().watermark.unwrap();
        assert_eq!(wm.import_data_start_time, ts(0));
        assert_eq!(wm.import_data_end_time, ts(300));
        assert_eq!(wm.earliest_imported_time, ts(60));
    }

    #[tokio::test]
    async fn test_concurrent_batches_for_one_data_source() {
        let (store, coordinator) = setup().await;
        let coordinator = Arc::new(coordinator);

        let mut handles = Vec::new();
        for i in 0..8i64 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .store("ds", batch("ds", &["a", "b"], &[i * 60, (i + 1) * 60]))
                    .await
                    .unwrap()
            }));
        }
        let total: usize = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().stored)
            .sum();

        // 9 distinct timestamps for 2 pods
        assert_eq!(total, 18);
        let wm = coordinator.catalog().status("ds").unwrap().watermark.unwrap();
        assert_eq!(wm.earliest_imported_time, ts(0));
        assert_eq!(wm.newest_imported_time, ts(480));
        let persisted = store.load_watermark("ds").await.unwrap().unwrap();
        assert_eq!(persisted.watermark, wm);
    }

    #[tokio::test]
    async fn test_load_restores_published_status() {
        let (store, coordinator) = setup().await;
        coordinator.store("ds", batch("ds", &["a"], &[0, 60])).await.unwrap();

        let restarted = ImportCoordinator::new(
            store,
            Arc::new(DataSourceCatalog::new()),
            ImportConfig::default(),
        );
        restarted.load().await.unwrap();

        let status = restarted.catalog().status("ds").unwrap();
        assert!(status.table_exists);
        assert_eq!(status.watermark.unwrap().newest_imported_time, ts(60));

        // Version continues from the persisted record
        restarted.store("ds", batch("ds", &["a"], &[120])).await.unwrap();
    }

    /// Delegates to DuckDB but fails the first `n` watermark swaps.
    struct FlakyWatermarks {
        inner: DuckDbStore,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl MetricStore for FlakyWatermarks {
        async fn init_schema(&self) -> Result<(), StoreError> {
            self.inner.init_schema().await
        }
        async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
            self.inner.table_exists(table).await
        }
        async fn write_samples(&self, table: &str, samples: &[Sample]) -> Result<usize, StoreError> {
            self.inner.write_samples(table, samples).await
        }
        async fn table_range(&self, table: &str) -> Result<Option<TableRange>, StoreError> {
            self.inner.table_range(table).await
        }
        async fn load_watermark(&self, ds: &str) -> Result<Option<WatermarkRecord>, StoreError> {
            self.inner.load_watermark(ds).await
        }
        async fn load_watermarks(&self) -> Result<Vec<(String, WatermarkRecord)>, StoreError> {
            self.inner.load_watermarks().await
        }
        async fn swap_watermark(
            &self,
            ds: &str,
            expected_version: u64,
            watermark: &ImportWatermark,
        ) -> Result<bool, StoreError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("injected".to_string()));
            }
            self.inner.swap_watermark(ds, expected_version, watermark).await
        }
        async fn execute_query(&self, sql: &str) -> Result<Vec<ResultRow>, StoreError> {
            self.inner.execute_query(sql).await
        }
        async fn save_report(&self, report: &Report, rows: Option<&[ResultRow]>) -> Result<(), StoreError> {
            self.inner.save_report(report, rows).await
        }
        async fn load_reports(&self) -> Result<Vec<StoredReport>, StoreError> {
            self.inner.load_reports().await
        }
        async fn delete_report(&self, name: &str) -> Result<(), StoreError> {
            self.inner.delete_report(name).await
        }
        async fn save_definition(
            &self,
            kind: DefinitionKind,
            name: &str,
            body: &serde_json::Value,
        ) -> Result<(), StoreError> {
            self.inner.save_definition(kind, name, body).await
        }
        async fn load_definitions(&self, kind: DefinitionKind) -> Result<Vec<serde_json::Value>, StoreError> {
            self.inner.load_definitions(kind).await
        }
    }

    #[tokio::test]
    async fn test_stale_watermark_rebuilt_on_next_store() {
        let store = FlakyWatermarks {
            inner: DuckDbStore::in_memory().unwrap(),
            failures_left: AtomicUsize::new(1),
        };
        store.init_schema().await.unwrap();
        let coordinator = ImportCoordinator::new(
            Arc::new(store),
            Arc::new(DataSourceCatalog::new()),
            ImportConfig::default(),
        );

        let err = coordinator
            .store("ds", batch("ds", &["a"], &[0, 60, 120]))
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::WatermarkPublish { .. }));
        assert!(err.class().is_retryable());
        assert!(coordinator.catalog().status("ds").unwrap().watermark.is_none());

        // The retry finds only duplicates but still publishes what is on disk
        let outcome = coordinator
            .store("ds", batch("ds", &["a"], &[0, 60, 120]))
            .await
            .unwrap();
        assert_eq!(outcome.stored, 0);
        let wm = outcome.watermark.unwrap();
        assert_eq!(wm.earliest_imported_time, ts(0));
        assert_eq!(wm.newest_imported_time, ts(120));
    }
}

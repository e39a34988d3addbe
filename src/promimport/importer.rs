use super::client::{PrometheusClient, PrometheusClientError, Series};
use crate::config::types::PrometheusConfig;
use crate::datasource::DataSourceDefinition;
use crate::import::{ImportCoordinator, ImportError};
use crate::sample::{Batch, ImportWindow, Sample};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ImporterError {
    #[error("data source '{0}' has no prometheus query")]
    NotConfigured(String),

    #[error("prometheus step and chunk size must be positive and in range")]
    InvalidDuration,

    #[error(transparent)]
    Client(#[from] PrometheusClientError),

    #[error(transparent)]
    Import(#[from] ImportError),
}

/// What one import pass did for a data source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportSummary {
    pub chunks: usize,
    pub received: usize,
    pub stored: usize,
    /// Start of the next pass.
    pub next_start: Option<DateTime<Utc>>,
}

/// Pulls Prometheus range queries for every data source that declares one and
/// hands the results to the import coordinator.
pub struct PrometheusImporter {
    client: PrometheusClient,
    coordinator: Arc<ImportCoordinator>,
    config: PrometheusConfig,
    /// Next start per data source, kept across passes.
    cursors: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl PrometheusImporter {
    pub fn new(
        config: PrometheusConfig,
        coordinator: Arc<ImportCoordinator>,
    ) -> Result<Self, ImporterError> {
        Ok(Self {
            client: PrometheusClient::new(&config)?,
            coordinator,
            config,
            cursors: Mutex::new(HashMap::new()),
        })
    }

    /// Import everything between the data source's cursor and `now - delay`.
    pub async fn import_once(
        &self,
        definition: &DataSourceDefinition,
        now: DateTime<Utc>,
    ) -> Result<ImportSummary, ImporterError> {
        let source = definition
            .prometheus
            .as_ref()
            .ok_or_else(|| ImporterError::NotConfigured(definition.name.clone()))?;
        let step = to_chrono(self.config.step)?;
        let chunk_size = to_chrono(self.config.chunk_size)?;
        let end = now - to_chrono(self.config.delay)?;
        if step <= chrono::Duration::zero() || chunk_size <= chrono::Duration::zero() {
            return Err(ImporterError::InvalidDuration);
        }

        let mut start = self.start_for(definition, now, step, chunk_size).await;
        let mut summary = ImportSummary::default();

        while start <= end {
            let chunk_end = (start + chunk_size).min(end);
            let series = self
                .client
                .query_range_with_retry(&source.query, start, chunk_end, self.config.step)
                .await?;

            let samples = to_samples(&definition.name, series, self.config.step.as_secs_f64());
            summary.chunks += 1;
            summary.received += samples.len();

            if !samples.is_empty() {
                let batch = Batch::new(definition.name.clone(), samples).with_window(ImportWindow {
                    start,
                    end: chunk_end,
                });
                let outcome = self.coordinator.store(&definition.name, batch).await?;
                summary.stored += outcome.stored;
            }

            start = chunk_end + step;
            self.cursors
                .lock()
                .await
                .insert(definition.name.clone(), start);
        }

        summary.next_start = Some(start);
        if summary.chunks > 0 {
            tracing::info!(
                data_source = %definition.name,
                chunks = summary.chunks,
                received = summary.received,
                stored = summary.stored,
                "Prometheus import pass complete"
            );
        }
        Ok(summary)
    }

    async fn start_for(
        &self,
        definition: &DataSourceDefinition,
        now: DateTime<Utc>,
        step: chrono::Duration,
        chunk_size: chrono::Duration,
    ) -> DateTime<Utc> {
        if let Some(cursor) = self.cursors.lock().await.get(&definition.name) {
            return *cursor;
        }
        let newest = self
            .coordinator
            .catalog()
            .status(&definition.name)
            .and_then(|s| s.watermark)
            .map(|w| w.newest_imported_time);
        match (newest, definition.prometheus.as_ref().and_then(|p| p.import_from)) {
            (Some(newest), _) => newest + step,
            (None, Some(import_from)) => import_from,
            (None, None) => now - chunk_size,
        }
    }

    /// Run an import pass for every Prometheus-backed data source each poll
    /// interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(url = %self.client.base_url(), "Prometheus importer started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Prometheus importer stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let definitions: Vec<DataSourceDefinition> = self
                        .coordinator
                        .catalog()
                        .definitions()
                        .into_iter()
                        .filter(|d| d.prometheus.is_some())
                        .collect();

                    let passes = definitions.iter().map(|d| self.import_once(d, now));
                    let results = futures::future::join_all(passes).await;
                    for (definition, result) in definitions.iter().zip(results) {
                        if let Err(e) = result {
                            tracing::warn!(data_source = %definition.name, error = %e, "Prometheus import failed");
                        }
                    }
                }
            }
        }
    }
}

fn to_chrono(duration: std::time::Duration) -> Result<chrono::Duration, ImporterError> {
    chrono::Duration::from_std(duration).map_err(|_| ImporterError::InvalidDuration)
}

fn to_samples(data_source: &str, series: Vec<Series>, step_seconds: f64) -> Vec<Sample> {
    series
        .into_iter()
        .flat_map(|s| {
            let labels = s.labels;
            s.points
                .into_iter()
                .map(move |(ts, value)| Sample::new(data_source, labels.clone(), ts, value, step_seconds))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_to_samples_weights_by_step() {
        let t = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let series = vec![Series {
            labels: BTreeMap::from([("pod".to_string(), "a".to_string())]),
            points: vec![(t, 0.5), (t + chrono::Duration::seconds(60), 0.5)],
        }];

        let samples = to_samples("ds", series, 60.0);
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.step_seconds() == 60.0));
        assert_eq!(samples[0].labels()["pod"], "a");
        assert_ne!(samples[0].identity(), samples[1].identity());
    }
}

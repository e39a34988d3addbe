use crate::datasource::DataSourceDefinition;
use crate::query::ReportQuery;
use crate::report::schedule::ScheduledReportSpec;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub web: WebConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub reports: ReportsConfig,
    #[serde(default)]
    pub prometheus: Option<PrometheusConfig>,
    #[serde(default)]
    pub datasources: Vec<DataSourceDefinition>,
    #[serde(default)]
    pub queries: Vec<ReportQuery>,
    #[serde(default)]
    pub scheduled_reports: Vec<ScheduledReportSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Register unknown data sources on their first import instead of
    /// rejecting the batch.
    #[serde(default = "default_auto_register")]
    pub auto_register: bool,
    #[serde(default = "default_max_watermark_retries")]
    pub max_watermark_retries: usize,
}

fn default_auto_register() -> bool {
    true
}

fn default_max_watermark_retries() -> usize {
    3
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            auto_register: default_auto_register(),
            max_watermark_retries: default_max_watermark_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportsConfig {
    /// How long a report may wait for its data sources before failing.
    #[serde(default = "default_readiness_timeout", with = "humantime_serde")]
    pub readiness_timeout: Duration,
    /// Fallback re-check interval for waiting reports.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_schedule_check_interval", with = "humantime_serde")]
    pub schedule_check_interval: Duration,
}

fn default_readiness_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_schedule_check_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            readiness_timeout: default_readiness_timeout(),
            poll_interval: default_poll_interval(),
            schedule_check_interval: default_schedule_check_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    pub url: String,
    /// Query resolution, also the time weight of every imported sample.
    #[serde(default = "default_step", with = "humantime_serde")]
    pub step: Duration,
    /// Width of a single `query_range` request.
    #[serde(default = "default_chunk_size", with = "humantime_serde")]
    pub chunk_size: Duration,
    #[serde(default = "default_import_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Stay this far behind now so late scrapes are not missed.
    #[serde(default = "default_delay", with = "humantime_serde")]
    pub delay: Duration,
    /// Per-request timeout.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

fn default_step() -> Duration {
    Duration::from_secs(60)
}

fn default_chunk_size() -> Duration {
    Duration::from_secs(300)
}

fn default_import_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_retries() -> usize {
    5
}

impl PrometheusConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            step: default_step(),
            chunk_size: default_chunk_size(),
            poll_interval: default_import_poll_interval(),
            delay: default_delay(),
            timeout: default_request_timeout(),
            retry_interval: default_retry_interval(),
            max_retries: default_max_retries(),
        }
    }
}

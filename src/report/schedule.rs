use super::engine::{ReportEngine, ReportError};
use super::state::{ReportSpec, ReportState};
use crate::error::ErrorClass;
use crate::query::QueryRegistry;
use crate::storage::{DefinitionKind, MetricStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Recurring report definition: one child report per elapsed period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledReportSpec {
    pub name: String,
    #[serde(alias = "query")]
    pub query_name: String,
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    /// Start of the first period.
    pub start: DateTime<Utc>,
    #[serde(default, with = "humantime_serde")]
    pub readiness_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduledReportStatus {
    /// End of the last period a child report was submitted for.
    pub last_report_end: Option<DateTime<Utc>>,
    pub last_report_name: Option<String>,
    pub last_failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledReport {
    #[serde(flatten)]
    pub spec: ScheduledReportSpec,
    #[serde(default)]
    pub status: ScheduledReportStatus,
}

impl ScheduledReport {
    fn next_period(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), ScheduleError> {
        let start = self.status.last_report_end.unwrap_or(self.spec.start);
        let period = chrono::Duration::from_std(self.spec.period)
            .map_err(|_| ScheduleError::InvalidPeriod(self.spec.name.clone()))?;
        let end = start
            .checked_add_signed(period)
            .ok_or_else(|| ScheduleError::InvalidPeriod(self.spec.name.clone()))?;
        Ok((start, end))
    }
}

/// Name of the child report covering the period starting at `start`.
pub fn child_report_name(schedule: &str, start: DateTime<Utc>) -> String {
    format!("{}-{}", schedule, start.format("%Y%m%d%H%M"))
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("scheduled report name cannot be empty")]
    EmptyName,

    #[error("scheduled report '{0}' must have a positive period")]
    InvalidPeriod(String),

    #[error("scheduled report '{0}' already exists")]
    AlreadyExists(String),

    #[error("scheduled report '{name}' uses unknown report query '{query}'")]
    UnknownQuery { name: String, query: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ScheduleError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ScheduleError::EmptyName | ScheduleError::InvalidPeriod(_) => ErrorClass::Validation,
            ScheduleError::AlreadyExists(_) => ErrorClass::Conflict,
            ScheduleError::UnknownQuery { .. } => ErrorClass::Dependency,
            ScheduleError::Store(e) => e.class(),
        }
    }
}

/// Owns scheduled reports and submits their child reports.
pub struct ReportScheduler {
    engine: ReportEngine,
    queries: Arc<QueryRegistry>,
    store: Arc<dyn MetricStore>,
    schedules: Mutex<BTreeMap<String, ScheduledReport>>,
}

impl ReportScheduler {
    pub fn new(engine: ReportEngine, queries: Arc<QueryRegistry>, store: Arc<dyn MetricStore>) -> Self {
        Self {
            engine,
            queries,
            store,
            schedules: Mutex::new(BTreeMap::new()),
        }
    }

    /// Restore persisted schedules with their status.
    pub async fn load(&self) -> Result<usize, ScheduleError> {
        let mut schedules = self.schedules.lock().await;
        for body in self.store.load_definitions(DefinitionKind::ScheduledReport).await? {
            match serde_json::from_value::<ScheduledReport>(body) {
                Ok(schedule) => {
                    schedules.insert(schedule.spec.name.clone(), schedule);
                }
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable scheduled report"),
            }
        }
        Ok(schedules.len())
    }

    /// Add a schedule. An existing schedule with the same name is an error
    /// unless `replace_existing` is set, in which case its status is kept.
    pub async fn create(
        &self,
        spec: ScheduledReportSpec,
        replace_existing: bool,
    ) -> Result<ScheduledReport, ScheduleError> {
        if spec.name.is_empty() {
            return Err(ScheduleError::EmptyName);
        }
        if spec.period.is_zero() {
            return Err(ScheduleError::InvalidPeriod(spec.name));
        }
        if !self.queries.contains(&spec.query_name) {
            return Err(ScheduleError::UnknownQuery {
                name: spec.name,
                query: spec.query_name,
            });
        }

        let mut schedules = self.schedules.lock().await;
        let status = match schedules.get(&spec.name) {
            Some(_) if !replace_existing => return Err(ScheduleError::AlreadyExists(spec.name)),
            Some(existing) => existing.status.clone(),
            None => ScheduledReportStatus::default(),
        };
        let schedule = ScheduledReport { spec, status };
        schedule.next_period()?;

        self.persist(&schedule).await?;
        tracing::info!(
            schedule = %schedule.spec.name,
            query = %schedule.spec.query_name,
            period = ?schedule.spec.period,
            "Scheduled report registered"
        );
        schedules.insert(schedule.spec.name.clone(), schedule.clone());
        Ok(schedule)
    }

    pub async fn list(&self) -> Vec<ScheduledReport> {
        self.schedules.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, name: &str) -> Option<ScheduledReport> {
        self.schedules.lock().await.get(name).cloned()
    }

    /// Submit the next child report of every schedule whose previous child is
    /// terminal and whose next period has fully elapsed by `now`. Returns the
    /// names of submitted reports.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut submitted = Vec::new();
        let mut schedules = self.schedules.lock().await;

        for schedule in schedules.values_mut() {
            if let Some(last) = &schedule.status.last_report_name {
                match self.engine.status(last) {
                    Ok(report) if !report.state.is_terminal() => continue,
                    Ok(report) if report.state == ReportState::Failed => {
                        schedule.status.last_failure = report.failure.map(|f| f.message);
                    }
                    _ => {}
                }
            }

            let (start, end) = match schedule.next_period() {
                Ok(period) => period,
                Err(e) => {
                    tracing::error!(schedule = %schedule.spec.name, error = %e, "Cannot compute next period");
                    continue;
                }
            };
            if end > now {
                continue;
            }

            let name = child_report_name(&schedule.spec.name, start);
            let spec = ReportSpec {
                name: name.clone(),
                query_name: schedule.spec.query_name.clone(),
                start,
                end: Some(end),
                readiness_timeout: schedule.spec.readiness_timeout,
            };

            match self.engine.submit_scheduled(spec, &schedule.spec.name).await {
                // Already submitted before a restart lost the status update
                Ok(_) | Err(ReportError::AlreadyExists(_)) => {
                    tracing::info!(schedule = %schedule.spec.name, report = %name, "Submitted scheduled report");
                    submitted.push(name.clone());
                }
                Err(e) => {
                    tracing::warn!(schedule = %schedule.spec.name, report = %name, error = %e, "Scheduled report submission failed");
                    schedule.status.last_failure = Some(e.to_string());
                }
            }
            // Advance either way so one bad period does not block the schedule
            schedule.status.last_report_end = Some(end);
            schedule.status.last_report_name = Some(name);

            if let Err(e) = self.persist(schedule).await {
                tracing::error!(schedule = %schedule.spec.name, error = %e, "Failed to persist schedule status");
            }
        }

        submitted
    }

    /// Tick every `interval` until cancelled.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Report scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let submitted = self.tick(Utc::now()).await;
                    if !submitted.is_empty() {
                        tracing::debug!(count = submitted.len(), "Scheduler tick submitted reports");
                    }
                }
            }
        }
    }

    async fn persist(&self, schedule: &ScheduledReport) -> Result<(), ScheduleError> {
        let body = serde_json::to_value(schedule).map_err(StoreError::from)?;
        self.store
            .save_definition(DefinitionKind::ScheduledReport, &schedule.spec.name, &body)
            .await?;
        Ok(())
    }
}

use super::results::ReportResultStore;
use super::state::{FailureCause, Report, ReportFailure, ReportSpec, ReportState, TransitionError};
use crate::config::types::ReportsConfig;
use crate::datasource::DataSourceCatalog;
use crate::error::ErrorClass;
use crate::query::{template, QueryRegistry, ResolveError};
use crate::readiness::ReadinessTracker;
use crate::storage::{MetricStore, ResultRow, StoreError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report name cannot be empty")]
    EmptyName,

    #[error("report window start {start} must be before end {end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("report '{0}' already exists")]
    AlreadyExists(String),

    #[error("report '{0}' not found")]
    NotFound(String),

    #[error("report '{name}' is {state}, only finished or failed reports can be {action}")]
    NotTerminal {
        name: String,
        state: ReportState,
        action: &'static str,
    },

    #[error("timed out waiting for report '{name}' (state: {state})")]
    WaitTimeout { name: String, state: ReportState },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ReportError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ReportError::EmptyName | ReportError::InvalidWindow { .. } => ErrorClass::Validation,
            ReportError::AlreadyExists(_)
            | ReportError::NotTerminal { .. }
            | ReportError::Transition(_) => ErrorClass::Conflict,
            ReportError::NotFound(_) => ErrorClass::NotFound,
            ReportError::WaitTimeout { .. } => ErrorClass::NotReady,
            ReportError::Resolve(e) => e.class(),
            ReportError::Store(e) => e.class(),
        }
    }
}

/// Live state of one report. The watch channel carries every transition;
/// the run lock keeps executions of the same report from overlapping.
struct ReportHandle {
    state: watch::Sender<Report>,
    run_lock: Mutex<()>,
    /// Set while the latest transition is not in the store.
    unpersisted: AtomicBool,
}

impl ReportHandle {
    fn new(report: Report) -> Arc<Self> {
        let (state, _) = watch::channel(report);
        Arc::new(Self {
            state,
            run_lock: Mutex::new(()),
            unpersisted: AtomicBool::new(false),
        })
    }

    fn current(&self) -> Report {
        self.state.borrow().clone()
    }
}

const MAX_PERSIST_BACKOFF: Duration = Duration::from_secs(60);

enum Readiness {
    Ready,
    TimedOut(Vec<String>),
    Unresolvable(ResolveError),
    Shutdown,
}

struct EngineInner {
    store: Arc<dyn MetricStore>,
    queries: Arc<QueryRegistry>,
    catalog: Arc<DataSourceCatalog>,
    readiness: ReadinessTracker,
    results: ReportResultStore,
    config: ReportsConfig,
    reports: RwLock<HashMap<String, Arc<ReportHandle>>>,
    shutdown: CancellationToken,
}

/// Drives reports from Pending to a terminal state.
///
/// Each submitted report gets its own worker task which waits for the
/// referenced data sources to cover the report window, runs the rendered
/// query and records the outcome.
#[derive(Clone)]
pub struct ReportEngine {
    inner: Arc<EngineInner>,
}

impl ReportEngine {
    pub fn new(
        store: Arc<dyn MetricStore>,
        queries: Arc<QueryRegistry>,
        catalog: Arc<DataSourceCatalog>,
        config: ReportsConfig,
    ) -> Self {
        let readiness = ReadinessTracker::new(catalog.clone());
        Self {
            inner: Arc::new(EngineInner {
                store,
                queries,
                catalog,
                readiness,
                results: ReportResultStore::new(),
                config,
                reports: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn results(&self) -> &ReportResultStore {
        &self.inner.results
    }

    /// Validate and register a new report, then start its worker.
    pub async fn submit(&self, spec: ReportSpec) -> Result<Report, ReportError> {
        self.submit_inner(spec, None).await
    }

    pub(crate) async fn submit_scheduled(
        &self,
        spec: ReportSpec,
        schedule: &str,
    ) -> Result<Report, ReportError> {
        self.submit_inner(spec, Some(schedule.to_string())).await
    }

    async fn submit_inner(
        &self,
        spec: ReportSpec,
        scheduled_by: Option<String>,
    ) -> Result<Report, ReportError> {
        let inner = &self.inner;
        if spec.name.is_empty() {
            return Err(ReportError::EmptyName);
        }
        let now = Utc::now();
        let end = spec.end.unwrap_or(now);
        if spec.start >= end {
            return Err(ReportError::InvalidWindow {
                start: spec.start,
                end,
            });
        }
        inner.queries.resolve(&spec.query_name, &inner.catalog)?;

        let timeout = spec
            .readiness_timeout
            .unwrap_or(inner.config.readiness_timeout);
        let mut report = Report::new(&spec.name, &spec.query_name, spec.start, end, timeout, now);
        report.scheduled_by = scheduled_by;

        let handle = {
            let mut reports = inner.write_reports();
            if reports.contains_key(&spec.name) {
                return Err(ReportError::AlreadyExists(spec.name));
            }
            let handle = ReportHandle::new(report.clone());
            reports.insert(spec.name.clone(), handle.clone());
            handle
        };

        if let Err(e) = inner.store.save_report(&report, None).await {
            inner.write_reports().remove(&spec.name);
            return Err(e.into());
        }
        inner.results.track(&report.name, report.state);

        tracing::info!(
            report = %report.name,
            query = %report.query_name,
            start = %report.start,
            end = %report.end,
            uid = %report.uid,
            "Report submitted"
        );
        self.spawn_worker(handle);
        Ok(report)
    }

    /// Drive the report to a terminal state in the caller's task and return
    /// it. Terminal reports are returned as they are.
    pub async fn run(&self, name: &str) -> Result<Report, ReportError> {
        let handle = self.handle(name)?;
        Ok(self.inner.drive(&handle).await)
    }

    pub fn status(&self, name: &str) -> Result<Report, ReportError> {
        Ok(self.handle(name)?.current())
    }

    /// Whether the report's current state has been written to the store.
    pub fn is_persisted(&self, name: &str) -> Result<bool, ReportError> {
        Ok(!self.handle(name)?.unpersisted.load(Ordering::SeqCst))
    }

    pub fn list(&self) -> Vec<Report> {
        let mut reports: Vec<Report> = self
            .inner
            .read_reports()
            .values()
            .map(|h| h.current())
            .collect();
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        reports
    }

    /// Wait until the report is terminal or `timeout` elapses. Dropping the
    /// returned future only stops this caller from waiting.
    pub async fn wait(&self, name: &str, timeout: Duration) -> Result<Report, ReportError> {
        let handle = self.handle(name)?;
        let mut rx = handle.state.subscribe();
        let finished = match tokio::time::timeout(timeout, rx.wait_for(|r| r.state.is_terminal())).await {
            Ok(Ok(report)) => Some(report.clone()),
            // The sender lives in the handle, so only a timeout gets here
            _ => None,
        };
        match finished {
            Some(report) => Ok(report),
            None => Err(ReportError::WaitTimeout {
                name: name.to_string(),
                state: rx.borrow().state,
            }),
        }
    }

    /// Clear a terminal report's outcome and run it again.
    pub async fn reset(&self, name: &str) -> Result<Report, ReportError> {
        let handle = self.handle(name)?;
        let report = {
            let _guard = handle.run_lock.lock().await;
            let mut report = handle.current();
            if !report.state.is_terminal() {
                return Err(ReportError::NotTerminal {
                    name: name.to_string(),
                    state: report.state,
                    action: "reset",
                });
            }
            report.reset(Utc::now())?;
            self.inner.store.save_report(&report, None).await?;
            self.inner.results.track(name, report.state);
            handle.state.send_replace(report.clone());
            report
        };

        tracing::info!(report = %name, uid = %report.uid, "Report reset");
        self.spawn_worker(handle);
        Ok(report)
    }

    /// Delete a terminal report and its results.
    pub async fn prune(&self, name: &str) -> Result<(), ReportError> {
        let handle = self.handle(name)?;
        let _guard = handle.run_lock.lock().await;
        let state = handle.current().state;
        if !state.is_terminal() {
            return Err(ReportError::NotTerminal {
                name: name.to_string(),
                state,
                action: "pruned",
            });
        }

        self.inner.store.delete_report(name).await?;
        self.inner.results.prune(name);
        self.inner.write_reports().remove(name);
        tracing::info!(report = %name, "Report pruned");
        Ok(())
    }

    /// Reload persisted reports. Terminal outcomes are restored as they were;
    /// pending reports wait again until their original deadline and running
    /// ones execute their query again.
    pub async fn recover(&self) -> Result<usize, ReportError> {
        let stored = self.inner.store.load_reports().await?;
        let count = stored.len();
        let mut resumed = Vec::new();

        for entry in stored {
            let report = entry.report;
            match (report.state, entry.rows) {
                (ReportState::Finished, Some(rows)) => {
                    self.inner.results.record_finished(&report.name, rows)
                }
                (ReportState::Failed, _) => {
                    let failure = report.failure.clone().unwrap_or_else(|| {
                        ReportFailure::new(FailureCause::Store, "failure details were not persisted")
                    });
                    self.inner.results.record_failed(&report.name, failure);
                }
                (state, _) => self.inner.results.track(&report.name, state),
            }

            let finished_without_rows =
                report.state == ReportState::Finished && self.inner.results.get(&report.name).is_err();
            let handle = ReportHandle::new(report.clone());
            self.inner
                .write_reports()
                .insert(report.name.clone(), handle.clone());

            if finished_without_rows {
                tracing::warn!(report = %report.name, "Finished report has no stored rows, re-running");
                let mut pending = report;
                pending.reset(Utc::now())?;
                self.inner.results.track(&pending.name, pending.state);
                handle.state.send_replace(pending);
                resumed.push(handle);
            } else if !report.state.is_terminal() {
                resumed.push(handle);
            }
        }

        tracing::info!(reports = count, resumed = resumed.len(), "Recovered reports");
        for handle in resumed {
            self.spawn_worker(handle);
        }
        Ok(count)
    }

    /// Stop waiting workers. Reports stay in their current state.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    fn handle(&self, name: &str) -> Result<Arc<ReportHandle>, ReportError> {
        self.inner
            .read_reports()
            .get(name)
            .cloned()
            .ok_or_else(|| ReportError::NotFound(name.to_string()))
    }

    fn spawn_worker(&self, handle: Arc<ReportHandle>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.drive(&handle).await;
        });
    }
}

impl EngineInner {
    async fn drive(&self, handle: &ReportHandle) -> Report {
        let _guard = handle.run_lock.lock().await;
        let mut report = handle.current();

        if report.state == ReportState::Pending {
            match self.wait_ready(&report).await {
                Readiness::Ready => {}
                Readiness::Shutdown => return report,
                Readiness::TimedOut(uncovered) => {
                    tracing::warn!(
                        report = %report.name,
                        uncovered = ?uncovered,
                        "Data sources not ready before deadline"
                    );
                    let message = format!(
                        "timed out waiting for data sources to cover {} - {}: {}",
                        report.start,
                        report.end,
                        uncovered.join(", ")
                    );
                    let failure = ReportFailure::new(FailureCause::NotReady, message);
                    return self.fail(handle, report, failure).await;
                }
                Readiness::Unresolvable(e) => {
                    let failure = ReportFailure::new(FailureCause::Dependency, e.to_string());
                    return self.fail(handle, report, failure).await;
                }
            }

            if let Err(e) = report.mark_running(Utc::now()) {
                tracing::error!(report = %report.name, error = %e, "Unexpected report state");
                return report;
            }
            self.publish(handle, &report, None).await;
            tracing::info!(report = %report.name, "Report running");
        }

        if report.state != ReportState::Running {
            return report;
        }

        let sql = match self.render(&report) {
            Ok(sql) => sql,
            Err(failure) => return self.fail(handle, report, failure).await,
        };
        tracing::debug!(report = %report.name, sql = %sql, "Executing report query");

        match self.store.execute_query(&sql).await {
            Ok(rows) => {
                let row_count = rows.len();
                if let Err(e) = report.mark_finished(row_count, Utc::now()) {
                    tracing::error!(report = %report.name, error = %e, "Unexpected report state");
                    return report;
                }
                self.publish(handle, &report, Some(rows)).await;
                tracing::info!(report = %report.name, rows = row_count, "Report finished");
                report
            }
            Err(e) => {
                let cause = match e {
                    StoreError::Query(_) => FailureCause::QueryExecution,
                    _ => FailureCause::Store,
                };
                let failure = ReportFailure::new(cause, e.to_string());
                self.fail(handle, report, failure).await
            }
        }
    }

    async fn wait_ready(&self, report: &Report) -> Readiness {
        let mut changes = self.readiness.subscribe();
        let remaining = (report.readiness_deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let deadline = Instant::now() + remaining;

        loop {
            let data_sources = match self.queries.resolve(&report.query_name, &self.catalog) {
                Ok(resolved) => resolved.data_sources,
                Err(e) => return Readiness::Unresolvable(e),
            };
            let uncovered = self
                .readiness
                .uncovered(&data_sources, report.start, report.end);
            if uncovered.is_empty() {
                return Readiness::Ready;
            }
            if Instant::now() >= deadline {
                return Readiness::TimedOut(uncovered);
            }

            tracing::debug!(report = %report.name, uncovered = ?uncovered, "Waiting for data");
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = tokio::time::sleep_until(deadline) => {}
                _ = self.shutdown.cancelled() => return Readiness::Shutdown,
            }
        }
    }

    fn render(&self, report: &Report) -> Result<String, ReportFailure> {
        let queries = self.queries.snapshot();
        let query = queries.get(&report.query_name).ok_or_else(|| {
            ReportFailure::new(
                FailureCause::Dependency,
                format!("report query '{}' not found", report.query_name),
            )
        })?;
        template::render(query, &queries, report.start, report.end)
            .map_err(|e| ReportFailure::new(FailureCause::Dependency, e.to_string()))
    }

    async fn fail(&self, handle: &ReportHandle, mut report: Report, failure: ReportFailure) -> Report {
        if let Err(e) = report.mark_failed(failure.clone(), Utc::now()) {
            tracing::error!(report = %report.name, error = %e, "Unexpected report state");
            return report;
        }
        self.publish(handle, &report, None).await;
        tracing::warn!(
            report = %report.name,
            cause = ?failure.cause,
            error = %failure.message,
            "Report failed"
        );
        report
    }

    /// Persist a transition, record its outcome, then make it visible to
    /// waiters. A waiter that sees a terminal state can always read its
    /// outcome from the result store.
    async fn publish(&self, handle: &ReportHandle, report: &Report, rows: Option<Vec<ResultRow>>) {
        let persisted = match self.store.save_report(report, rows.as_deref()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(report = %report.name, error = %e, "Failed to persist report state");
                false
            }
        };
        handle.unpersisted.store(!persisted, Ordering::SeqCst);

        match (report.state, rows, &report.failure) {
            (ReportState::Finished, Some(rows), _) => self.results.record_finished(&report.name, rows),
            (ReportState::Failed, _, Some(failure)) => {
                self.results.record_failed(&report.name, failure.clone())
            }
            (state, _, _) => self.results.track(&report.name, state),
        }
        handle.state.send_replace(report.clone());

        // Intermediate states are overwritten by the terminal save, so only
        // terminal ones are retried here.
        if !persisted && report.state.is_terminal() {
            self.persist_until_saved(handle, report).await;
        }
    }

    /// Retry saving a terminal report with exponential backoff until it is
    /// stored or the engine shuts down.
    async fn persist_until_saved(&self, handle: &ReportHandle, report: &Report) {
        let mut delay = self.config.poll_interval.max(Duration::from_millis(10));
        let mut attempt = 1u32;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => {
                    tracing::warn!(report = %report.name, "Shutting down with unpersisted report state");
                    return;
                }
            }

            let rows = self.results.get(&report.name).ok();
            match self
                .store
                .save_report(report, rows.as_ref().map(|r| r.as_slice()))
                .await
            {
                Ok(()) => {
                    handle.unpersisted.store(false, Ordering::SeqCst);
                    tracing::info!(report = %report.name, attempt, "Persisted report state after retry");
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    tracing::warn!(
                        report = %report.name,
                        attempt,
                        error = %e,
                        "Retrying report state persistence"
                    );
                    delay = (delay * 2).min(MAX_PERSIST_BACKOFF);
                }
            }
        }
    }

    fn read_reports(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<ReportHandle>>> {
        self.reports.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_reports(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<ReportHandle>>> {
        self.reports.write().unwrap_or_else(|p| p.into_inner())
    }
}

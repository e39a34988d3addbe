use crate::error::ErrorClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportState {
    Pending,
    Running,
    Finished,
    Failed,
}

impl ReportState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReportState::Finished | ReportState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReportState::Pending => "pending",
            ReportState::Running => "running",
            ReportState::Finished => "finished",
            ReportState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ReportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a report failed. Readiness timeouts and query errors stay distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    NotReady,
    QueryExecution,
    Dependency,
    Store,
}

impl FailureCause {
    pub fn class(self) -> ErrorClass {
        match self {
            FailureCause::NotReady => ErrorClass::NotReady,
            FailureCause::QueryExecution => ErrorClass::QueryExecution,
            FailureCause::Dependency => ErrorClass::Dependency,
            FailureCause::Store => ErrorClass::Transient,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportFailure {
    pub cause: FailureCause,
    pub message: String,
}

impl ReportFailure {
    pub fn new(cause: FailureCause, message: impl Into<String>) -> Self {
        Self {
            cause,
            message: message.into(),
        }
    }
}

/// A submission request. `end` defaults to now and the readiness timeout to
/// the configured default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSpec {
    pub name: String,
    #[serde(alias = "query")]
    pub query_name: String,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default, with = "humantime_serde")]
    pub readiness_timeout: Option<Duration>,
}

/// One execution of a report query over a time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub name: String,
    pub uid: Uuid,
    pub query_name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub state: ReportState,
    #[serde(with = "humantime_serde")]
    pub readiness_timeout: Duration,
    pub readiness_deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ReportFailure>,
    /// Scheduled report that submitted this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_by: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
#[error("report '{name}' cannot move from {from} to {to}")]
pub struct TransitionError {
    pub name: String,
    pub from: ReportState,
    pub to: ReportState,
}

impl Report {
    pub fn new(
        name: impl Into<String>,
        query_name: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        readiness_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            uid: Uuid::new_v4(),
            query_name: query_name.into(),
            start,
            end,
            state: ReportState::Pending,
            readiness_timeout,
            readiness_deadline: deadline_from(now, readiness_timeout),
            created_at: now,
            updated_at: now,
            row_count: None,
            failure: None,
            scheduled_by: None,
        }
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(ReportState::Running, &[ReportState::Pending], now)
    }

    pub fn mark_finished(&mut self, row_count: usize, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(ReportState::Finished, &[ReportState::Running], now)?;
        self.row_count = Some(row_count);
        Ok(())
    }

    pub fn mark_failed(&mut self, failure: ReportFailure, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(
            ReportState::Failed,
            &[ReportState::Pending, ReportState::Running],
            now,
        )?;
        self.failure = Some(failure);
        Ok(())
    }

    /// Back to Pending with a fresh uid and deadline. Terminal reports only.
    pub fn reset(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(
            ReportState::Pending,
            &[ReportState::Finished, ReportState::Failed],
            now,
        )?;
        self.uid = Uuid::new_v4();
        self.readiness_deadline = deadline_from(now, self.readiness_timeout);
        self.row_count = None;
        self.failure = None;
        Ok(())
    }

    fn transition(
        &mut self,
        to: ReportState,
        allowed_from: &[ReportState],
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !allowed_from.contains(&self.state) {
            return Err(TransitionError {
                name: self.name.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = now.max(self.updated_at);
        Ok(())
    }
}

fn deadline_from(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

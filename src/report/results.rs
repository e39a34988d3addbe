use super::state::{ReportFailure, ReportState};
use crate::error::ErrorClass;
use crate::storage::ResultRow;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ResultError {
    #[error("report '{name}' has no results yet (state: {state})")]
    NotReady { name: String, state: ReportState },

    #[error("report '{name}' failed: {}", .failure.message)]
    Failed { name: String, failure: ReportFailure },

    #[error("report '{0}' not found")]
    NotFound(String),
}

impl ResultError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ResultError::NotReady { .. } => ErrorClass::NotReady,
            ResultError::Failed { failure, .. } => failure.cause.class(),
            ResultError::NotFound(_) => ErrorClass::NotFound,
        }
    }
}

#[derive(Debug, Clone)]
enum Entry {
    InProgress(ReportState),
    Finished(Arc<Vec<ResultRow>>),
    Failed(ReportFailure),
}

/// Last known outcome per report name. Rows are only ever visible as a whole,
/// once the report finished.
#[derive(Default)]
pub struct ReportResultStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl ReportResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a report exists but has not reached a terminal state.
    pub fn track(&self, name: &str, state: ReportState) {
        self.write().insert(name.to_string(), Entry::InProgress(state));
    }

    pub fn record_finished(&self, name: &str, rows: Vec<ResultRow>) {
        self.write()
            .insert(name.to_string(), Entry::Finished(Arc::new(rows)));
    }

    pub fn record_failed(&self, name: &str, failure: ReportFailure) {
        self.write().insert(name.to_string(), Entry::Failed(failure));
    }

    pub fn get(&self, name: &str) -> Result<Arc<Vec<ResultRow>>, ResultError> {
        match self.read().get(name) {
            Some(Entry::Finished(rows)) => Ok(rows.clone()),
            Some(Entry::InProgress(state)) => Err(ResultError::NotReady {
                name: name.to_string(),
                state: *state,
            }),
            Some(Entry::Failed(failure)) => Err(ResultError::Failed {
                name: name.to_string(),
                failure: failure.clone(),
            }),
            None => Err(ResultError::NotFound(name.to_string())),
        }
    }

    /// Forget a report. Returns whether anything was stored.
    pub fn prune(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }
}

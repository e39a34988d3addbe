use serde::{Deserialize, Serialize};

/// Coarse classification shared by every error type in the crate, so callers
/// can tell retryable failures from ones that need a config or input fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Store connectivity or contention. Retry with backoff.
    Transient,
    /// Malformed input, rejected before any state was touched.
    Validation,
    /// Missing or circular query/data source references.
    Dependency,
    /// Data did not arrive in time, or the result is not available yet.
    NotReady,
    /// The store rejected or failed the report query.
    QueryExecution,
    NotFound,
    /// Name collision with an existing object.
    Conflict,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Validation => "validation",
            ErrorClass::Dependency => "dependency",
            ErrorClass::NotReady => "not_ready",
            ErrorClass::QueryExecution => "query_execution",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Conflict => "conflict",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

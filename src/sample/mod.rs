use crate::error::ErrorClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// A single metric observation belonging to one data source.
///
/// Samples are immutable once built: the identity is derived from the data
/// source, the label set and the timestamp, and is what deduplication keys on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    data_source: String,
    labels: BTreeMap<String, String>,
    timestamp: DateTime<Utc>,
    value: f64,
    step_seconds: f64,
    identity: String,
}

impl Sample {
    pub fn new(
        data_source: impl Into<String>,
        labels: BTreeMap<String, String>,
        timestamp: DateTime<Utc>,
        value: f64,
        step_seconds: f64,
    ) -> Self {
        let data_source = data_source.into();
        let identity = sample_identity(&data_source, &labels, timestamp);
        Self {
            data_source,
            labels,
            timestamp,
            value,
            step_seconds,
            identity,
        }
    }

    pub fn data_source(&self) -> &str {
        &self.data_source
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Time weight of the sample in seconds (the scrape/query step).
    pub fn step_seconds(&self) -> f64 {
        self.step_seconds
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

/// Deterministic identity: SHA-256 over data source, sorted labels and the
/// timestamp in microseconds.
pub fn sample_identity(
    data_source: &str,
    labels: &BTreeMap<String, String>,
    timestamp: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data_source.as_bytes());
    hasher.update([0u8]);
    for (key, value) in labels {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(timestamp.timestamp_micros().to_be_bytes());
    format!("{:x}", hasher.finalize())
}

/// Wire form of a sample as accepted by the push API and fixture files.
#[derive(Debug, Clone, Deserialize)]
pub struct SampleInput {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "amount")]
    pub value: f64,
    #[serde(default = "default_step_seconds")]
    pub step_seconds: f64,
}

fn default_step_seconds() -> f64 {
    1.0
}

/// Time range a producer queried when building a batch. May be wider than
/// the samples it actually returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Earliest and latest sample timestamps of a validated batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSpan {
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq)]
pub enum BatchError {
    #[error("data source name cannot be empty")]
    EmptyName,

    #[error("batch for data source '{0}' contains no samples")]
    Empty(String),

    #[error("batch is for data source '{batch}' but was submitted to '{target}'")]
    TargetMismatch { target: String, batch: String },

    #[error("sample {index} belongs to data source '{found}', expected '{expected}'")]
    Heterogeneous {
        index: usize,
        expected: String,
        found: String,
    },

    #[error("sample {index} has invalid step {step} (must be a positive number of seconds)")]
    InvalidStep { index: usize, step: f64 },

    #[error("import window start {start} is after end {end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl BatchError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Validation
    }
}

/// Ordered samples destined for a single data source.
#[derive(Debug, Clone)]
pub struct Batch {
    data_source: String,
    samples: Vec<Sample>,
    window: Option<ImportWindow>,
}

impl Batch {
    pub fn new(data_source: impl Into<String>, samples: Vec<Sample>) -> Self {
        Self {
            data_source: data_source.into(),
            samples,
            window: None,
        }
    }

    /// Build a batch from wire samples, stamping each with the data source.
    pub fn from_inputs(data_source: impl Into<String>, inputs: Vec<SampleInput>) -> Self {
        let data_source = data_source.into();
        let samples = inputs
            .into_iter()
            .map(|input| {
                Sample::new(
                    data_source.clone(),
                    input.labels,
                    input.timestamp,
                    input.value,
                    input.step_seconds,
                )
            })
            .collect();
        Self::new(data_source, samples)
    }

    pub fn with_window(mut self, window: ImportWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn data_source(&self) -> &str {
        &self.data_source
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn window(&self) -> Option<ImportWindow> {
        self.window
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Check the batch is well formed for `target` and return its time span.
    pub fn validate(&self, target: &str) -> Result<BatchSpan, BatchError> {
        if target.is_empty() || self.data_source.is_empty() {
            return Err(BatchError::EmptyName);
        }
        if self.data_source != target {
            return Err(BatchError::TargetMismatch {
                target: target.to_string(),
                batch: self.data_source.clone(),
            });
        }
        if let Some(window) = self.window {
            if window.start > window.end {
                return Err(BatchError::InvalidWindow {
                    start: window.start,
                    end: window.end,
                });
            }
        }

        let mut span: Option<BatchSpan> = None;
        for (index, sample) in self.samples.iter().enumerate() {
            if sample.data_source != self.data_source {
                return Err(BatchError::Heterogeneous {
                    index,
                    expected: self.data_source.clone(),
                    found: sample.data_source.clone(),
                });
            }
            if !sample.step_seconds.is_finite() || sample.step_seconds <= 0.0 {
                return Err(BatchError::InvalidStep {
                    index,
                    step: sample.step_seconds,
                });
            }
            span = Some(match span {
                None => BatchSpan {
                    min: sample.timestamp,
                    max: sample.timestamp,
                },
                Some(s) => BatchSpan {
                    min: s.min.min(sample.timestamp),
                    max: s.max.max(sample.timestamp),
                },
            });
        }

        span.ok_or_else(|| BatchError::Empty(self.data_source.clone()))
    }
}

use crate::sample::{BatchSpan, ImportWindow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What has been durably imported for a data source.
///
/// Serialized with the camelCase field names the status surface exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportWatermark {
    pub import_data_start_time: DateTime<Utc>,
    pub import_data_end_time: DateTime<Utc>,
    pub earliest_imported_time: DateTime<Utc>,
    pub newest_imported_time: DateTime<Utc>,
    pub last_import_time: DateTime<Utc>,
}

impl ImportWatermark {
    /// Fold a newly persisted batch into an existing watermark.
    ///
    /// Earliest only moves back, newest and last import only move forward,
    /// whatever order batches arrive in.
    pub fn advance(
        existing: Option<&ImportWatermark>,
        span: BatchSpan,
        window: Option<ImportWindow>,
        now: DateTime<Utc>,
    ) -> ImportWatermark {
        let window_start = window.map(|w| w.start.min(span.min)).unwrap_or(span.min);
        let window_end = window.map(|w| w.end.max(span.max)).unwrap_or(span.max);

        match existing {
            None => ImportWatermark {
                import_data_start_time: window_start,
                import_data_end_time: window_end,
                earliest_imported_time: span.min,
                newest_imported_time: span.max,
                last_import_time: now,
            },
            Some(prev) => ImportWatermark {
                import_data_start_time: prev.import_data_start_time.min(window_start),
                import_data_end_time: prev.import_data_end_time.max(window_end),
                earliest_imported_time: prev.earliest_imported_time.min(span.min),
                newest_imported_time: prev.newest_imported_time.max(span.max),
                last_import_time: prev.last_import_time.max(now),
            },
        }
    }

    /// Merge two watermarks describing the same data source.
    pub fn merge(&self, other: &ImportWatermark) -> ImportWatermark {
        ImportWatermark {
            import_data_start_time: self.import_data_start_time.min(other.import_data_start_time),
            import_data_end_time: self.import_data_end_time.max(other.import_data_end_time),
            earliest_imported_time: self.earliest_imported_time.min(other.earliest_imported_time),
            newest_imported_time: self.newest_imported_time.max(other.newest_imported_time),
            last_import_time: self.last_import_time.max(other.last_import_time),
        }
    }

    /// Conservative completeness check: data at or before `start` and at or
    /// after `end` has been seen. Gaps inside the range are not detected.
    pub fn covers(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.earliest_imported_time <= start && self.newest_imported_time >= end
    }
}

/// Watermark plus the version used for compare-and-swap publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkRecord {
    pub watermark: ImportWatermark,
    pub version: u64,
}

pub mod engine;
pub mod results;
pub mod schedule;
pub mod state;

pub use engine::{ReportEngine, ReportError};
pub use results::{ReportResultStore, ResultError};
pub use schedule::{ReportScheduler, ScheduleError, ScheduledReport, ScheduledReportSpec};
pub use state::{FailureCause, Report, ReportFailure, ReportSpec, ReportState};

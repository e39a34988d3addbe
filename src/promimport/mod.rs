pub mod client;
pub mod importer;

pub use client::{PrometheusClient, PrometheusClientError, Series};
pub use importer::{ImportSummary, ImporterError, PrometheusImporter};

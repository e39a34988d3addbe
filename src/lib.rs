pub mod api;
pub mod cli;
pub mod config;
pub mod datasource;
pub mod error;
pub mod import;
pub mod promimport;
pub mod query;
pub mod readiness;
pub mod report;
pub mod sample;
pub mod storage;

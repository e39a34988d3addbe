pub mod traits;
pub mod duckdb;

pub use self::duckdb::DuckDbStore;
pub use traits::{DefinitionKind, MetricStore, ResultRow, StoreError, StoredReport, TableRange};

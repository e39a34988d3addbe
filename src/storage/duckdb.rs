use super::traits::{DefinitionKind, MetricStore, ResultRow, StoreError, StoredReport, TableRange};
use crate::datasource::{ImportWatermark, WatermarkRecord};
use crate::report::state::Report;
use crate::sample::Sample;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::types::{TimeUnit, Value};
use duckdb::Connection;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

impl From<duckdb::Error> for StoreError {
    fn from(e: duckdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Check if a process with the given PID is still running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        std::process::Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Extract the lock holder's PID from a DuckDB "Could not set lock" message
fn extract_pid_from_lock_error(error_msg: &str) -> Option<u32> {
    let start = error_msg.find("(PID ")? + "(PID ".len();
    let end = error_msg[start..].find(')')?;
    error_msg[start..start + end].parse().ok()
}

fn remove_lock_files(db_path: &Path) -> std::io::Result<()> {
    for suffix in ["wal", "lock"] {
        let path = PathBuf::from(format!("{}.{}", db_path.display(), suffix));
        if path.exists() {
            std::fs::remove_file(&path)?;
            tracing::info!(path = %path.display(), "Removed stale DuckDB file");
        }
    }
    Ok(())
}

fn micros_to_datetime(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Database(format!("timestamp out of range: {}", micros)))
}

/// Samples table: identity is the dedup key, timestamps are UTC.
fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" (
            identity VARCHAR PRIMARY KEY,
            timestamp TIMESTAMP NOT NULL,
            value DOUBLE NOT NULL,
            step_seconds DOUBLE NOT NULL,
            labels JSON NOT NULL
        )",
        table
    )
}

fn table_exists_in(conn: &Connection, table: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM information_schema.tables WHERE table_name = ?",
        duckdb::params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn value_to_json(value: Value) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        Value::Null => Json::Null,
        Value::Boolean(b) => Json::Bool(b),
        Value::TinyInt(v) => Json::from(v),
        Value::SmallInt(v) => Json::from(v),
        Value::Int(v) => Json::from(v),
        Value::BigInt(v) => Json::from(v),
        Value::UTinyInt(v) => Json::from(v),
        Value::USmallInt(v) => Json::from(v),
        Value::UInt(v) => Json::from(v),
        Value::UBigInt(v) => Json::from(v),
        Value::HugeInt(v) => match i64::try_from(v) {
            Ok(v) => Json::from(v),
            Err(_) => Json::String(v.to_string()),
        },
        Value::Float(v) => serde_json::Number::from_f64(v as f64)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Double(v) => serde_json::Number::from_f64(v)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Text(s) => Json::String(s),
        Value::Timestamp(unit, v) => {
            let micros = match unit {
                TimeUnit::Second => v.saturating_mul(1_000_000),
                TimeUnit::Millisecond => v.saturating_mul(1_000),
                TimeUnit::Microsecond => v,
                TimeUnit::Nanosecond => v / 1_000,
            };
            match DateTime::from_timestamp_micros(micros) {
                Some(ts) => Json::String(ts.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)),
                None => Json::from(v),
            }
        }
        Value::Date32(days) => match DateTime::from_timestamp(i64::from(days) * 86_400, 0) {
            Some(ts) => Json::String(ts.date_naive().to_string()),
            None => Json::from(days),
        },
        Value::List(items) => Json::Array(items.into_iter().map(value_to_json).collect()),
        other => Json::String(format!("{:?}", other)),
    }
}

/// DuckDB implementation of the MetricStore trait
pub struct DuckDbStore {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStore {
    /// Open (or create) a database file, clearing lock files left behind by a
    /// process that no longer exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("{}: {}", parent.display(), e)))?;
            }
        }

        match Connection::open(path) {
            Ok(conn) => Ok(Self::from_connection(conn)),
            Err(e) => {
                let error_msg = e.to_string();
                if !error_msg.contains("Could not set lock") {
                    return Err(e.into());
                }

                tracing::warn!(error = %error_msg, "Database lock detected");
                let Some(pid) = extract_pid_from_lock_error(&error_msg) else {
                    return Err(e.into());
                };
                if is_process_running(pid) {
                    tracing::error!(pid, "Lock holder is still running, cannot open database");
                    return Err(e.into());
                }

                tracing::warn!(pid, "Lock holder is gone, removing stale lock files");
                remove_lock_files(path)
                    .map_err(|io_err| StoreError::Unavailable(io_err.to_string()))?;
                let conn = Connection::open(path)?;
                Ok(Self::from_connection(conn))
            }
        }
    }

    /// In-memory database (for testing)
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` on the shared connection in the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("Task join error: {}", e)))?
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock()
        .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
}

#[async_trait]
impl MetricStore for DuckDbStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS datasource_watermarks (
                    data_source VARCHAR PRIMARY KEY,
                    version UBIGINT NOT NULL,
                    import_data_start_us BIGINT NOT NULL,
                    import_data_end_us BIGINT NOT NULL,
                    earliest_imported_us BIGINT NOT NULL,
                    newest_imported_us BIGINT NOT NULL,
                    last_import_us BIGINT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS reports (
                    name VARCHAR PRIMARY KEY,
                    report_json VARCHAR NOT NULL,
                    rows_json VARCHAR,
                    updated_us BIGINT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS definitions (
                    kind VARCHAR NOT NULL,
                    name VARCHAR NOT NULL,
                    body VARCHAR NOT NULL,
                    PRIMARY KEY (kind, name)
                );",
            )?;
            Ok(())
        })
        .await
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let table = table.to_string();
        self.with_conn(move |conn| table_exists_in(conn, &table)).await
    }

    async fn write_samples(&self, table: &str, samples: &[Sample]) -> Result<usize, StoreError> {
        let table = table.to_string();
        let samples = samples.to_vec();

        self.with_conn(move |conn| {
            let (Some(min), Some(max)) = (
                samples.iter().map(|s| s.timestamp()).min(),
                samples.iter().map(|s| s.timestamp()).max(),
            ) else {
                return Ok(0);
            };

            let tx = conn.transaction()?;
            tx.execute_batch(&create_table_sql(&table))?;

            // Identities already stored around the batch's time range. The
            // range is padded so sub-second rounding cannot hide an edge row.
            let mut existing = HashSet::new();
            {
                let mut stmt = tx.prepare(&format!(
                    "SELECT identity FROM \"{}\" WHERE epoch_us(timestamp) BETWEEN ? AND ?",
                    table
                ))?;
                let rows = stmt.query_map(
                    duckdb::params![
                        min.timestamp_micros() - 1_000_000,
                        max.timestamp_micros() + 1_000_000
                    ],
                    |row| row.get::<_, String>(0),
                )?;
                for row in rows {
                    existing.insert(row?);
                }
            }

            let mut stored = 0usize;
            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO \"{}\" (identity, timestamp, value, step_seconds, labels)
                     VALUES (?, make_timestamp(?), ?, ?, ?)",
                    table
                ))?;
                for sample in &samples {
                    // `insert` also drops repeats inside the batch itself
                    if !existing.insert(sample.identity().to_string()) {
                        continue;
                    }
                    let labels = serde_json::to_string(sample.labels())?;
                    stmt.execute(duckdb::params![
                        sample.identity(),
                        sample.timestamp().timestamp_micros(),
                        sample.value(),
                        sample.step_seconds(),
                        labels,
                    ])?;
                    stored += 1;
                }
            }

            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    async fn table_range(&self, table: &str) -> Result<Option<TableRange>, StoreError> {
        let table = table.to_string();
        self.with_conn(move |conn| {
            if !table_exists_in(conn, &table)? {
                return Ok(None);
            }
            let (rows, earliest, newest): (i64, Option<i64>, Option<i64>) = conn.query_row(
                &format!(
                    "SELECT count(*), min(epoch_us(timestamp)), max(epoch_us(timestamp)) FROM \"{}\"",
                    table
                ),
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            match (earliest, newest) {
                (Some(earliest), Some(newest)) => Ok(Some(TableRange {
                    rows: rows as u64,
                    earliest: micros_to_datetime(earliest)?,
                    newest: micros_to_datetime(newest)?,
                })),
                _ => Ok(None),
            }
        })
        .await
    }

    async fn load_watermark(&self, data_source: &str) -> Result<Option<WatermarkRecord>, StoreError> {
        let data_source = data_source.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT version, import_data_start_us, import_data_end_us, earliest_imported_us,
                        newest_imported_us, last_import_us
                 FROM datasource_watermarks WHERE data_source = ?",
            )?;
            let mut rows = stmt.query(duckdb::params![data_source])?;
            match rows.next()? {
                Some(row) => Ok(Some(watermark_from_row(row, 0)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn load_watermarks(&self) -> Result<Vec<(String, WatermarkRecord)>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT data_source, version, import_data_start_us, import_data_end_us,
                        earliest_imported_us, newest_imported_us, last_import_us
                 FROM datasource_watermarks ORDER BY data_source",
            )?;
            let mut rows = stmt.query([])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                let name: String = row.get(0)?;
                records.push((name, watermark_from_row(row, 1)?));
            }
            Ok(records)
        })
        .await
    }

    async fn swap_watermark(
        &self,
        data_source: &str,
        expected_version: u64,
        watermark: &ImportWatermark,
    ) -> Result<bool, StoreError> {
        let data_source = data_source.to_string();
        let wm = *watermark;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let current: Option<u64> = {
                let mut stmt =
                    tx.prepare("SELECT version FROM datasource_watermarks WHERE data_source = ?")?;
                let mut rows = stmt.query(duckdb::params![data_source])?;
                match rows.next()? {
                    Some(row) => Some(row.get(0)?),
                    None => None,
                }
            };

            if current.unwrap_or(0) != expected_version {
                return Ok(false);
            }

            tx.execute(
                "INSERT OR REPLACE INTO datasource_watermarks
                    (data_source, version, import_data_start_us, import_data_end_us,
                     earliest_imported_us, newest_imported_us, last_import_us)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                duckdb::params![
                    data_source,
                    expected_version + 1,
                    wm.import_data_start_time.timestamp_micros(),
                    wm.import_data_end_time.timestamp_micros(),
                    wm.earliest_imported_time.timestamp_micros(),
                    wm.newest_imported_time.timestamp_micros(),
                    wm.last_import_time.timestamp_micros(),
                ],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn execute_query(&self, sql: &str) -> Result<Vec<ResultRow>, StoreError> {
        // Queries get their own connection so reports do not queue behind
        // each other or behind imports.
        let conn = lock(&self.conn)?.try_clone()?;
        let sql = sql.to_string();

        tokio::task::spawn_blocking(move || {
            let query_err = |e: duckdb::Error| StoreError::Query(e.to_string());

            let mut stmt = conn.prepare(&sql).map_err(query_err)?;
            let mut rows = stmt.query([]).map_err(query_err)?;
            let mut columns: Option<Vec<String>> = None;
            let mut results = Vec::new();

            while let Some(row) = rows.next().map_err(query_err)? {
                let names = columns.get_or_insert_with(|| {
                    let stmt_ref: &duckdb::Statement<'_> = row.as_ref();
                    stmt_ref.column_names()
                });
                let mut out = ResultRow::new();
                for (idx, name) in names.iter().enumerate() {
                    let value: Value = row.get(idx).map_err(query_err)?;
                    out.insert(name.clone(), value_to_json(value));
                }
                results.push(out);
            }
            Ok(results)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("Task join error: {}", e)))?
    }

    async fn save_report(&self, report: &Report, rows: Option<&[ResultRow]>) -> Result<(), StoreError> {
        let name = report.name.clone();
        let report_json = serde_json::to_string(report)?;
        let rows_json = rows.map(serde_json::to_string).transpose()?;
        let updated_us = report.updated_at.timestamp_micros();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO reports (name, report_json, rows_json, updated_us)
                 VALUES (?, ?, ?, ?)",
                duckdb::params![name, report_json, rows_json, updated_us],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_reports(&self) -> Result<Vec<StoredReport>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT report_json, rows_json FROM reports ORDER BY name")?;
            let mut rows = stmt.query([])?;
            let mut reports = Vec::new();
            while let Some(row) = rows.next()? {
                let report_json: String = row.get(0)?;
                let rows_json: Option<String> = row.get(1)?;
                reports.push(StoredReport {
                    report: serde_json::from_str(&report_json)?,
                    rows: rows_json.map(|j| serde_json::from_str(&j)).transpose()?,
                });
            }
            Ok(reports)
        })
        .await
    }

    async fn delete_report(&self, name: &str) -> Result<(), StoreError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM reports WHERE name = ?", duckdb::params![name])?;
            Ok(())
        })
        .await
    }

    async fn save_definition(
        &self,
        kind: DefinitionKind,
        name: &str,
        body: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let name = name.to_string();
        let body = serde_json::to_string(body)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO definitions (kind, name, body) VALUES (?, ?, ?)",
                duckdb::params![kind.as_str(), name, body],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_definitions(&self, kind: DefinitionKind) -> Result<Vec<serde_json::Value>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT body FROM definitions WHERE kind = ? ORDER BY name")?;
            let rows = stmt.query_map(duckdb::params![kind.as_str()], |row| row.get::<_, String>(0))?;
            let mut bodies = Vec::new();
            for row in rows {
                bodies.push(serde_json::from_str(&row?)?);
            }
            Ok(bodies)
        })
        .await
    }
}

fn watermark_from_row(row: &duckdb::Row<'_>, offset: usize) -> Result<WatermarkRecord, StoreError> {
    let version: u64 = row.get(offset)?;
    let ts = |idx: usize| -> Result<DateTime<Utc>, StoreError> {
        micros_to_datetime(row.get::<_, i64>(offset + idx)?)
    };
    Ok(WatermarkRecord {
        version,
        watermark: ImportWatermark {
            import_data_start_time: ts(1)?,
            import_data_end_time: ts(2)?,
            earliest_imported_time: ts(3)?,
            newest_imported_time: ts(4)?,
            last_import_time: ts(5)?,
        },
    })
}

pub mod watermark;

pub use watermark::{ImportWatermark, WatermarkRecord};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use tokio::sync::watch;

/// Prometheus pull settings for a data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrometheusSource {
    pub query: String,
    #[serde(default)]
    pub import_from: Option<chrono::DateTime<chrono::Utc>>,
}

/// Declared attributes of a data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub prometheus: Option<PrometheusSource>,
}

impl DataSourceDefinition {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            prometheus: None,
        }
    }
}

/// Published state of a data source's backing table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSourceStatus {
    pub table_exists: bool,
    pub watermark: Option<ImportWatermark>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataSourceView {
    pub table_name: String,
    #[serde(flatten)]
    pub definition: DataSourceDefinition,
    #[serde(flatten)]
    pub status: DataSourceStatus,
}

/// Table backing a data source: `datasource_` followed by the name with every
/// character outside `[a-z0-9_]` replaced by `_`.
pub fn table_name(data_source: &str) -> String {
    let sanitized: String = data_source
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("datasource_{}", sanitized)
}

/// Double-quoted identifier for use in SQL text.
pub fn quoted_table_name(data_source: &str) -> String {
    format!("\"{}\"", table_name(data_source))
}

struct CatalogEntry {
    definition: DataSourceDefinition,
    status: DataSourceStatus,
}

/// Registry of known data sources and the status board readers poll.
///
/// Status is published only by the import coordinator. Every publication bumps
/// a counter on a watch channel so waiting reports wake up on change.
pub struct DataSourceCatalog {
    entries: RwLock<BTreeMap<String, CatalogEntry>>,
    changes: watch::Sender<u64>,
}

impl Default for DataSourceCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSourceCatalog {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            entries: RwLock::new(BTreeMap::new()),
            changes,
        }
    }

    /// Register or replace a definition. Published status is kept.
    pub fn register(&self, definition: DataSourceDefinition) {
        let mut entries = self.write_entries();
        match entries.get_mut(&definition.name) {
            Some(entry) => entry.definition = definition,
            None => {
                entries.insert(
                    definition.name.clone(),
                    CatalogEntry {
                        definition,
                        status: DataSourceStatus::default(),
                    },
                );
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read_entries().contains_key(name)
    }

    pub fn definition(&self, name: &str) -> Option<DataSourceDefinition> {
        self.read_entries().get(name).map(|e| e.definition.clone())
    }

    pub fn status(&self, name: &str) -> Option<DataSourceStatus> {
        self.read_entries().get(name).map(|e| e.status.clone())
    }

    pub fn view(&self, name: &str) -> Option<DataSourceView> {
        self.read_entries().get(name).map(|e| DataSourceView {
            table_name: table_name(name),
            definition: e.definition.clone(),
            status: e.status.clone(),
        })
    }

    pub fn list(&self) -> Vec<DataSourceView> {
        self.read_entries()
            .iter()
            .map(|(name, e)| DataSourceView {
                table_name: table_name(name),
                definition: e.definition.clone(),
                status: e.status.clone(),
            })
            .collect()
    }

    pub fn definitions(&self) -> Vec<DataSourceDefinition> {
        self.read_entries()
            .values()
            .map(|e| e.definition.clone())
            .collect()
    }

    /// Replace the published status of a data source, registering it if
    /// unknown, and notify subscribers.
    pub fn publish(&self, name: &str, status: DataSourceStatus) {
        {
            let mut entries = self.write_entries();
            match entries.get_mut(name) {
                Some(entry) => entry.status = status,
                None => {
                    entries.insert(
                        name.to_string(),
                        CatalogEntry {
                            definition: DataSourceDefinition::named(name),
                            status,
                        },
                    );
                }
            }
        }
        self.changes.send_modify(|generation| *generation += 1);
    }

    /// Receiver that changes whenever any status is published.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, CatalogEntry>> {
        // Entries are plain data; a panicked writer cannot leave them half-updated
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, CatalogEntry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::BatchSpan;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_table_name_sanitizes() {
        assert_eq!(table_name("pod-request-cpu-cores"), "datasource_pod_request_cpu_cores");
        assert_eq!(table_name("Node.Mem"), "datasource_node_mem");
        assert_eq!(quoted_table_name("a b"), "\"datasource_a_b\"");
    }

    #[test]
    fn test_register_keeps_status() {
        let catalog = DataSourceCatalog::new();
        catalog.register(DataSourceDefinition::named("ds"));
        catalog.publish(
            "ds",
            DataSourceStatus {
                table_exists: true,
                watermark: None,
            },
        );

        let mut updated = DataSourceDefinition::named("ds");
        updated.description = Some("updated".to_string());
        catalog.register(updated);

        assert!(catalog.status("ds").unwrap().table_exists);
        assert_eq!(
            catalog.definition("ds").unwrap().description.as_deref(),
            Some("updated")
        );
    }

    #[tokio::test]
    async fn test_publish_notifies_subscribers() {
        let catalog = DataSourceCatalog::new();
        let mut rx = catalog.subscribe();
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        catalog.publish(
            "ds",
            DataSourceStatus {
                table_exists: true,
                watermark: Some(ImportWatermark::advance(
                    None,
                    BatchSpan { min: t, max: t },
                    None,
                    t,
                )),
            },
        );

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
        assert!(catalog.contains("ds"));
        assert_eq!(catalog.list().len(), 1);
    }
}

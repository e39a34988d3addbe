pub mod resolver;
pub mod template;

pub use resolver::{resolve, ResolveError, ResolvedDependencies};
pub use template::TemplateError;

use crate::datasource::DataSourceCatalog;
use crate::error::ErrorClass;
use crate::storage::{DefinitionKind, MetricStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use thiserror::Error;

/// A named SQL template aggregating one or more data sources, possibly on top
/// of other report queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportQuery {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub data_sources: Vec<String>,
    #[serde(default)]
    pub report_queries: Vec<String>,
    pub query: String,
}

impl ReportQuery {
    /// Shape checks that do not depend on other queries.
    pub fn validate(&self) -> Result<(), QueryError> {
        if self.name.is_empty() {
            return Err(QueryError::EmptyName);
        }
        if self.query.trim().is_empty() {
            return Err(QueryError::EmptyBody(self.name.clone()));
        }
        template::validate(self).map_err(|source| QueryError::Template {
            name: self.name.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("report query name cannot be empty")]
    EmptyName,

    #[error("report query '{0}' has an empty body")]
    EmptyBody(String),

    #[error("report query '{name}': {source}")]
    Template {
        name: String,
        #[source]
        source: TemplateError,
    },

    #[error("report query '{0}' not found")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl QueryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            QueryError::EmptyName | QueryError::EmptyBody(_) | QueryError::Template { .. } => {
                ErrorClass::Validation
            }
            QueryError::NotFound(_) => ErrorClass::NotFound,
            QueryError::Store(e) => e.class(),
        }
    }
}

/// Registered report queries.
#[derive(Default)]
pub struct QueryRegistry {
    queries: RwLock<BTreeMap<String, ReportQuery>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a query after validating it. Returns the replaced
    /// query, if any.
    pub fn insert(&self, query: ReportQuery) -> Result<Option<ReportQuery>, QueryError> {
        query.validate()?;
        let mut queries = self.queries.write().unwrap_or_else(|p| p.into_inner());
        Ok(queries.insert(query.name.clone(), query))
    }

    /// Validate, persist and insert.
    pub async fn save(&self, store: &dyn MetricStore, query: ReportQuery) -> Result<(), QueryError> {
        query.validate()?;
        let body = serde_json::to_value(&query).map_err(StoreError::from)?;
        store
            .save_definition(DefinitionKind::ReportQuery, &query.name, &body)
            .await?;
        tracing::info!(query = %query.name, "Saved report query");
        self.insert(query)?;
        Ok(())
    }

    /// Restore persisted queries, replacing registered entries of the same
    /// name. Call before applying config definitions so those take
    /// precedence.
    pub async fn load(&self, store: &dyn MetricStore) -> Result<usize, QueryError> {
        let mut loaded = 0;
        for body in store.load_definitions(DefinitionKind::ReportQuery).await? {
            let query = match serde_json::from_value::<ReportQuery>(body) {
                Ok(query) => query,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable report query");
                    continue;
                }
            };
            match self.insert(query) {
                Ok(_) => loaded += 1,
                Err(e) => tracing::warn!(error = %e, "Skipping invalid report query"),
            }
        }
        Ok(loaded)
    }

    pub fn get(&self, name: &str) -> Option<ReportQuery> {
        self.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<ReportQuery> {
        self.read().values().cloned().collect()
    }

    /// Point-in-time copy used for resolution and rendering.
    pub fn snapshot(&self) -> BTreeMap<String, ReportQuery> {
        self.read().clone()
    }

    pub fn resolve(
        &self,
        name: &str,
        catalog: &DataSourceCatalog,
    ) -> Result<ResolvedDependencies, ResolveError> {
        resolver::resolve(&self.read(), |ds| catalog.contains(ds), name)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, ReportQuery>> {
        self.queries.read().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::DataSourceDefinition;
    use crate::storage::DuckDbStore;

    fn query(name: &str, body: &str) -> ReportQuery {
        ReportQuery {
            name: name.to_string(),
            description: None,
            data_sources: vec!["ds".to_string()],
            report_queries: vec![],
            query: body.to_string(),
        }
    }

    #[test]
    fn test_insert_validates() {
        let registry = QueryRegistry::new();
        assert!(matches!(
            registry.insert(query("", "SELECT 1")),
            Err(QueryError::EmptyName)
        ));
        assert!(matches!(
            registry.insert(query("q", "  ")),
            Err(QueryError::EmptyBody(_))
        ));
        let err = registry
            .insert(query("q", r#"SELECT * FROM {{ datasource "nope" }}"#))
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(!registry.contains("q"));

        assert!(registry.insert(query("q", "SELECT 1")).unwrap().is_none());
        assert!(registry.insert(query("q", "SELECT 2")).unwrap().is_some());
        assert_eq!(registry.get("q").unwrap().query, "SELECT 2");
    }

    #[test]
    fn test_resolve_checks_catalog() {
        let registry = QueryRegistry::new();
        registry.insert(query("q", "SELECT 1")).unwrap();
        let catalog = DataSourceCatalog::new();

        assert!(matches!(
            registry.resolve("q", &catalog),
            Err(ResolveError::DataSourceNotFound { .. })
        ));

        catalog.register(DataSourceDefinition::named("ds"));
        assert_eq!(registry.resolve("q", &catalog).unwrap().data_sources, vec!["ds"]);
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let store = DuckDbStore::in_memory().unwrap();
        store.init_schema().await.unwrap();

        let registry = QueryRegistry::new();
        registry.save(&store, query("q", "SELECT 1")).await.unwrap();

        let restored = QueryRegistry::new();
        assert_eq!(restored.load(&store).await.unwrap(), 1);
        assert_eq!(restored.get("q"), registry.get("q"));
    }
}

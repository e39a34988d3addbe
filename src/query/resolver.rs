use super::ReportQuery;
use crate::error::ErrorClass;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ResolveError {
    #[error("report query '{name}' not found{}", .referenced_by.as_ref().map(|r| format!(" (referenced by '{}')", r)).unwrap_or_default())]
    QueryNotFound {
        name: String,
        referenced_by: Option<String>,
    },

    #[error("data source '{name}' not found (referenced by '{referenced_by}')")]
    DataSourceNotFound { name: String, referenced_by: String },

    #[error("circular query dependency: {}", .cycle.join(" -> "))]
    Circular { cycle: Vec<String> },
}

impl ResolveError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ResolveError::QueryNotFound {
                referenced_by: None,
                ..
            } => ErrorClass::NotFound,
            _ => ErrorClass::Dependency,
        }
    }
}

/// Transitive dependencies of a report query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolvedDependencies {
    /// Every data source reached, de-duplicated, in first-visit order.
    pub data_sources: Vec<String>,
    /// Dependency queries in post-order, so each appears after its own
    /// dependencies. The root query is not included.
    pub queries: Vec<String>,
}

/// Walk the query graph from `root` depth first, in declared order.
///
/// `data_source_known` decides whether a referenced data source exists.
pub fn resolve<F>(
    queries: &BTreeMap<String, ReportQuery>,
    data_source_known: F,
    root: &str,
) -> Result<ResolvedDependencies, ResolveError>
where
    F: Fn(&str) -> bool,
{
    if !queries.contains_key(root) {
        return Err(ResolveError::QueryNotFound {
            name: root.to_string(),
            referenced_by: None,
        });
    }

    let mut walk = Walk {
        queries,
        data_source_known: &data_source_known,
        path: Vec::new(),
        finished: HashSet::new(),
        seen_sources: HashSet::new(),
        resolved: ResolvedDependencies::default(),
    };
    walk.visit(root, None)?;

    let mut resolved = walk.resolved;
    resolved.queries.retain(|q| q != root);
    Ok(resolved)
}

struct Walk<'a> {
    queries: &'a BTreeMap<String, ReportQuery>,
    data_source_known: &'a dyn Fn(&str) -> bool,
    path: Vec<String>,
    finished: HashSet<String>,
    seen_sources: HashSet<String>,
    resolved: ResolvedDependencies,
}

impl Walk<'_> {
    fn visit(&mut self, name: &str, parent: Option<&str>) -> Result<(), ResolveError> {
        if let Some(pos) = self.path.iter().position(|p| p == name) {
            let mut cycle = self.path[pos..].to_vec();
            cycle.push(name.to_string());
            return Err(ResolveError::Circular { cycle });
        }
        if self.finished.contains(name) {
            return Ok(());
        }

        let query = self
            .queries
            .get(name)
            .ok_or_else(|| ResolveError::QueryNotFound {
                name: name.to_string(),
                referenced_by: parent.map(str::to_string),
            })?;

        for data_source in &query.data_sources {
            if !(self.data_source_known)(data_source) {
                return Err(ResolveError::DataSourceNotFound {
                    name: data_source.clone(),
                    referenced_by: name.to_string(),
                });
            }
            if self.seen_sources.insert(data_source.clone()) {
                self.resolved.data_sources.push(data_source.clone());
            }
        }

        self.path.push(name.to_string());
        for dependency in &query.report_queries {
            self.visit(dependency, Some(name))?;
        }
        self.path.pop();

        self.finished.insert(name.to_string());
        self.resolved.queries.push(name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(entries: &[(&str, &[&str], &[&str])]) -> BTreeMap<String, ReportQuery> {
        entries
            .iter()
            .map(|(name, sources, deps)| {
                (
                    name.to_string(),
                    ReportQuery {
                        name: name.to_string(),
                        description: None,
                        data_sources: sources.iter().map(|s| s.to_string()).collect(),
                        report_queries: deps.iter().map(|s| s.to_string()).collect(),
                        query: "SELECT 1".to_string(),
                    },
                )
            })
            .collect()
    }

    fn all_known(_: &str) -> bool {
        true
    }

    #[test]
    fn test_resolves_diamond_in_declared_order() {
        let queries = registry(&[
            ("top", &["ds-top"], &["left", "right"]),
            ("left", &["ds-a", "ds-shared"], &["base"]),
            ("right", &["ds-shared", "ds-b"], &["base"]),
            ("base", &["ds-base"], &[]),
        ]);

        let resolved = resolve(&queries, all_known, "top").unwrap();
        assert_eq!(
            resolved.data_sources,
            vec!["ds-top", "ds-a", "ds-shared", "ds-base", "ds-b"]
        );
        assert_eq!(resolved.queries, vec!["base", "left", "right"]);
    }

    #[test]
    fn test_cycle_rejected_from_either_end() {
        let queries = registry(&[("a", &[], &["b"]), ("b", &[], &["a"])]);

        let err = resolve(&queries, all_known, "a").unwrap_err();
        assert_eq!(
            err,
            ResolveError::Circular {
                cycle: vec!["a".into(), "b".into(), "a".into()]
            }
        );
        assert_eq!(err.to_string(), "circular query dependency: a -> b -> a");

        let err = resolve(&queries, all_known, "b").unwrap_err();
        assert!(matches!(err, ResolveError::Circular { .. }));
        assert_eq!(err.class(), ErrorClass::Dependency);
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let queries = registry(&[("a", &[], &["a"])]);
        assert!(matches!(
            resolve(&queries, all_known, "a"),
            Err(ResolveError::Circular { .. })
        ));
    }

    #[test]
    fn test_missing_references() {
        let queries = registry(&[("a", &["ds"], &["missing"])]);

        let err = resolve(&queries, all_known, "nope").unwrap_err();
        assert_eq!(err.class(), ErrorClass::NotFound);

        let err = resolve(&queries, all_known, "a").unwrap_err();
        assert_eq!(
            err,
            ResolveError::QueryNotFound {
                name: "missing".into(),
                referenced_by: Some("a".into())
            }
        );
        assert_eq!(err.class(), ErrorClass::Dependency);

        let err = resolve(&queries, |ds| ds != "ds", "a").unwrap_err();
        assert!(matches!(err, ResolveError::DataSourceNotFound { .. }));
    }
}

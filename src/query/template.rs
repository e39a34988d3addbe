//! Placeholder rendering for report query bodies.
//!
//! Supported placeholders:
//!
//! - `{{ start }}` / `{{ end }}`: the report window bounds as DuckDB timestamps
//! - `{{ datasource "name" }}`: the quoted table backing a data source
//! - `{{ query "name" }}`: another report query, rendered inline as a subquery

use super::ReportQuery;
use crate::datasource::quoted_table_name;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("unknown placeholder '{0}'")]
    UnknownPlaceholder(String),

    #[error("placeholder '{0}' requires a quoted name argument")]
    MissingArgument(String),

    #[error("placeholder '{0}' takes no argument")]
    UnexpectedArgument(String),

    #[error("unterminated or malformed placeholder near '{0}'")]
    Malformed(String),

    #[error("query '{query}' uses data source '{name}' without declaring it")]
    UndeclaredDataSource { query: String, name: String },

    #[error("query '{query}' uses query '{name}' without declaring it")]
    UndeclaredQuery { query: String, name: String },

    #[error("query '{0}' not found while rendering")]
    MissingQuery(String),

    #[error("query '{0}' includes itself")]
    Recursive(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment<'a> {
    Literal(&'a str),
    Start,
    End,
    DataSource(&'a str),
    Query(&'a str),
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\{\{\s*([A-Za-z_]+)(?:\s+"([^"]*)")?\s*\}\}"#).unwrap())
}

fn parse(body: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let mut segments = Vec::new();
    let mut last = 0;

    for caps in placeholder_regex().captures_iter(body) {
        let (Some(whole), Some(kind)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        check_literal(&body[last..whole.start()])?;
        if whole.start() > last {
            segments.push(Segment::Literal(&body[last..whole.start()]));
        }

        let arg = caps.get(2).map(|m| m.as_str());
        let segment = match (kind.as_str(), arg) {
            ("start", None) => Segment::Start,
            ("end", None) => Segment::End,
            ("start" | "end", Some(_)) => {
                return Err(TemplateError::UnexpectedArgument(kind.as_str().to_string()))
            }
            ("datasource", Some(name)) => Segment::DataSource(name),
            ("query", Some(name)) => Segment::Query(name),
            ("datasource" | "query", None) => {
                return Err(TemplateError::MissingArgument(kind.as_str().to_string()))
            }
            (other, _) => return Err(TemplateError::UnknownPlaceholder(other.to_string())),
        };
        segments.push(segment);
        last = whole.end();
    }

    check_literal(&body[last..])?;
    if last < body.len() {
        segments.push(Segment::Literal(&body[last..]));
    }
    Ok(segments)
}

fn check_literal(text: &str) -> Result<(), TemplateError> {
    match text.find("{{") {
        Some(pos) => {
            let snippet: String = text[pos..].chars().take(24).collect();
            Err(TemplateError::Malformed(snippet))
        }
        None => Ok(()),
    }
}

/// Check placeholder syntax and that every reference is declared.
pub fn validate(query: &ReportQuery) -> Result<(), TemplateError> {
    for segment in parse(&query.query)? {
        match segment {
            Segment::DataSource(name) if !query.data_sources.iter().any(|d| d == name) => {
                return Err(TemplateError::UndeclaredDataSource {
                    query: query.name.clone(),
                    name: name.to_string(),
                })
            }
            Segment::Query(name) if !query.report_queries.iter().any(|q| q == name) => {
                return Err(TemplateError::UndeclaredQuery {
                    query: query.name.clone(),
                    name: name.to_string(),
                })
            }
            _ => {}
        }
    }
    Ok(())
}

/// DuckDB expression for an exact UTC timestamp.
pub fn timestamp_literal(ts: DateTime<Utc>) -> String {
    format!("make_timestamp({})", ts.timestamp_micros())
}

/// Render `query` for the window `[start, end)`.
pub fn render(
    query: &ReportQuery,
    queries: &BTreeMap<String, ReportQuery>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<String, TemplateError> {
    let mut stack = Vec::new();
    render_inner(query, queries, start, end, &mut stack)
}

fn render_inner<'q>(
    query: &'q ReportQuery,
    queries: &'q BTreeMap<String, ReportQuery>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    stack: &mut Vec<&'q str>,
) -> Result<String, TemplateError> {
    if stack.contains(&query.name.as_str()) {
        return Err(TemplateError::Recursive(query.name.clone()));
    }
    validate(query)?;
    stack.push(&query.name);

    let mut out = String::with_capacity(query.query.len());
    for segment in parse(&query.query)? {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Start => out.push_str(&timestamp_literal(start)),
            Segment::End => out.push_str(&timestamp_literal(end)),
            Segment::DataSource(name) => out.push_str(&quoted_table_name(name)),
            Segment::Query(name) => {
                let dependency = queries
                    .get(name)
                    .ok_or_else(|| TemplateError::MissingQuery(name.to_string()))?;
                let rendered = render_inner(dependency, queries, start, end, stack)?;
                out.push('(');
                out.push_str(rendered.trim().trim_end_matches(';'));
                out.push(')');
            }
        }
    }

    stack.pop();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn query(name: &str, body: &str, data_sources: &[&str], deps: &[&str]) -> ReportQuery {
        ReportQuery {
            name: name.to_string(),
            description: None,
            data_sources: data_sources.iter().map(|s| s.to_string()).collect(),
            report_queries: deps.iter().map(|s| s.to_string()).collect(),
            query: body.to_string(),
        }
    }

    #[test]
    fn test_render_window_and_table() {
        let q = query(
            "q",
            r#"SELECT * FROM {{ datasource "pod-cpu" }} WHERE timestamp >= {{start}} AND timestamp < {{ end }}"#,
            &["pod-cpu"],
            &[],
        );
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let end = Utc.timestamp_opt(1_700_003_600, 0).unwrap();

        let sql = render(&q, &BTreeMap::new(), start, end).unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM \"datasource_pod_cpu\" WHERE timestamp >= make_timestamp(1700000000000000) \
             AND timestamp < make_timestamp(1700003600000000)"
        );
    }

    #[test]
    fn test_render_inlines_dependencies() {
        let base = query("base", "SELECT 1 AS x;\n", &[], &[]);
        let top = query("top", r#"SELECT x FROM {{ query "base" }} b"#, &[], &["base"]);
        let queries = BTreeMap::from([("base".to_string(), base)]);
        let t = Utc.timestamp_opt(0, 0).unwrap();

        let sql = render(&top, &queries, t, t).unwrap();
        assert_eq!(sql, "SELECT x FROM (SELECT 1 AS x) b");
    }

    #[test]
    fn test_validate_rejects_undeclared_references() {
        let q = query("q", r#"SELECT * FROM {{ datasource "other" }}"#, &["ds"], &[]);
        assert!(matches!(
            validate(&q),
            Err(TemplateError::UndeclaredDataSource { .. })
        ));

        let q = query("q", r#"SELECT * FROM {{ query "other" }}"#, &[], &[]);
        assert!(matches!(validate(&q), Err(TemplateError::UndeclaredQuery { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_placeholders() {
        let cases = [
            ("SELECT {{ now }}", TemplateError::UnknownPlaceholder("now".to_string())),
            ("SELECT {{ datasource }}", TemplateError::MissingArgument("datasource".to_string())),
            (r#"SELECT {{ start "x" }}"#, TemplateError::UnexpectedArgument("start".to_string())),
        ];
        for (body, expected) in cases {
            assert_eq!(validate(&query("q", body, &[], &[])), Err(expected), "{}", body);
        }
        assert!(matches!(
            validate(&query("q", "SELECT {{ start", &[], &[])),
            Err(TemplateError::Malformed(_))
        ));
    }

    #[test]
    fn test_render_detects_self_inclusion() {
        let q = query("loop", r#"SELECT * FROM {{ query "loop" }}"#, &[], &["loop"]);
        let queries = BTreeMap::from([("loop".to_string(), q.clone())]);
        let t = Utc.timestamp_opt(0, 0).unwrap();
        assert_eq!(
            render(&q, &queries, t, t),
            Err(TemplateError::Recursive("loop".to_string()))
        );
    }
}

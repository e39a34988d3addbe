pub mod handlers;
pub mod server;

pub use handlers::{ApiError, AppState};
pub use server::{router, run_server};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{ImportConfig, ReportsConfig};
    use crate::datasource::DataSourceCatalog;
    use crate::import::ImportCoordinator;
    use crate::query::QueryRegistry;
    use crate::report::{ReportEngine, ReportScheduler};
    use crate::storage::{DuckDbStore, MetricStore};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_app() -> (Router, ReportEngine) {
        let store: Arc<dyn MetricStore> = Arc::new(DuckDbStore::in_memory().unwrap());
        store.init_schema().await.unwrap();
        let catalog = Arc::new(DataSourceCatalog::new());
        let importer = Arc::new(ImportCoordinator::new(
            store.clone(),
            catalog.clone(),
            ImportConfig::default(),
        ));
        let queries = Arc::new(QueryRegistry::new());
        let config = ReportsConfig {
            poll_interval: Duration::from_millis(50),
            ..ReportsConfig::default()
        };
        let engine = ReportEngine::new(store.clone(), queries.clone(), catalog, config);
        let scheduler = Arc::new(ReportScheduler::new(engine.clone(), queries.clone(), store.clone()));
        let state = Arc::new(AppState::new(store, importer, queries, engine.clone(), scheduler));
        (router(state), engine)
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = test_app().await;
        let (status, body) = send(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!("OK"));
    }

    #[tokio::test]
    async fn test_import_then_coverage() {
        let (app, _) = test_app().await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/datasources/cpu/samples",
            Some(json!({
                "samples": [
                    {"labels": {"pod": "a"}, "timestamp": "2024-01-01T00:00:00Z", "value": 1.0, "step_seconds": 60.0},
                    {"labels": {"pod": "a"}, "timestamp": "2024-01-01T00:01:00Z", "value": 1.0, "step_seconds": 60.0}
                ]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stored"], 2);

        let (status, body) = send(
            &app,
            Method::GET,
            "/api/v1/datasources/cpu/coverage?start=2024-01-01T00:00:00Z&end=2024-01-01T00:01:00Z",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["covered"], true);
        assert_eq!(body["table_exists"], true);

        let (status, body) = send(
            &app,
            Method::GET,
            "/api/v1/datasources/cpu/coverage?start=2024-01-01T00:00:00Z&end=2024-01-01T01:00:00Z",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["covered"], false);

        let (status, body) = send(&app, Method::GET, "/api/v1/datasources/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["class"], "not_found");
    }

    #[tokio::test]
    async fn test_invalid_batch_is_bad_request() {
        let (app, _) = test_app().await;
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/datasources/cpu/samples",
            Some(json!({
                "samples": [{"timestamp": "2024-01-01T00:00:00Z", "value": 1.0, "step_seconds": 0.0}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["class"], "validation");
    }

    #[tokio::test]
    async fn test_query_dependencies_and_cycles() {
        let (app, _) = test_app().await;
        send(&app, Method::PUT, "/api/v1/datasources/cpu", Some(json!({}))).await;

        let (status, _) = send(
            &app,
            Method::PUT,
            "/api/v1/queries/base",
            Some(json!({
                "name": "base",
                "data_sources": ["cpu"],
                "query": "SELECT * FROM {{ datasource \"cpu\" }}"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &app,
            Method::PUT,
            "/api/v1/queries/top",
            Some(json!({
                "report_queries": ["base"],
                "query": "SELECT count(*) AS n FROM {{ query \"base\" }}"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, Method::GET, "/api/v1/queries/top/dependencies", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data_sources"], json!(["cpu"]));
        assert_eq!(body["queries"], json!(["base"]));

        let (status, body) = send(
            &app,
            Method::PUT,
            "/api/v1/queries/other",
            Some(json!({"name": "different", "query": "SELECT 1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("does not match"));

        let (status, _) = send(&app, Method::GET, "/api/v1/queries/nope/dependencies", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_report_lifecycle() {
        let (app, engine) = test_app().await;

        send(
            &app,
            Method::POST,
            "/api/v1/datasources/cpu/samples",
            Some(json!({
                "samples": [
                    {"labels": {"pod": "a"}, "timestamp": "2024-01-01T00:00:00Z", "value": 2.0, "step_seconds": 60.0},
                    {"labels": {"pod": "a"}, "timestamp": "2024-01-01T00:01:00Z", "value": 2.0, "step_seconds": 60.0}
                ]
            })),
        )
        .await;
        send(
            &app,
            Method::PUT,
            "/api/v1/queries/total",
            Some(json!({
                "data_sources": ["cpu"],
                "query": "SELECT sum(value * step_seconds) AS total FROM {{ datasource \"cpu\" }} WHERE timestamp >= {{ start }} AND timestamp <= {{ end }}"
            })),
        )
        .await;

        // Results are not available before the report exists
        let (status, _) = send(&app, Method::GET, "/api/v1/reports/r1/results", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/reports",
            Some(json!({
                "name": "r1",
                "query": "total",
                "start": "2024-01-01T00:00:00Z",
                "end": "2024-01-01T00:01:00Z"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["name"], "r1");

        let report = engine.wait("r1", Duration::from_secs(10)).await.unwrap();
        assert_eq!(report.state.as_str(), "finished");

        let (status, body) = send(&app, Method::GET, "/api/v1/reports/r1/results", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["row_count"], 1);
        assert_eq!(body["rows"][0]["total"], json!(240.0));

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/v1/reports",
            Some(json!({
                "name": "r1",
                "query": "total",
                "start": "2024-01-01T00:00:00Z",
                "end": "2024-01-01T00:01:00Z"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(&app, Method::GET, "/api/v1/reports", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = send(&app, Method::DELETE, "/api/v1/reports/r1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, Method::GET, "/api/v1/reports/r1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_report_with_unknown_query_is_not_found() {
        let (app, _) = test_app().await;
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/reports",
            Some(json!({"name": "r", "query": "nope", "start": "2024-01-01T00:00:00Z", "end": "2024-01-02T00:00:00Z"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["class"], "not_found");
    }

    #[tokio::test]
    async fn test_scheduled_reports() {
        let (app, _) = test_app().await;
        send(&app, Method::PUT, "/api/v1/queries/q", Some(json!({"query": "SELECT 1 AS one"}))).await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/scheduledreports",
            Some(json!({"name": "hourly", "query": "q", "period": "1h", "start": "2024-01-01T00:00:00Z"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["period"], "1h");

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/v1/scheduledreports",
            Some(json!({"name": "hourly", "query": "q", "period": "1h", "start": "2024-01-01T00:00:00Z"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(&app, Method::GET, "/api/v1/scheduledreports/hourly", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["query_name"], "q");

        let (status, body) = send(&app, Method::GET, "/api/v1/scheduledreports", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }
}

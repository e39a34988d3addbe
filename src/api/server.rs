use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::handlers::{
    create_scheduled_report, delete_report, get_coverage, get_datasource, get_query,
    get_query_dependencies, get_report, get_report_results, get_scheduled_report, health_check,
    import_samples, list_datasources, list_queries, list_reports, list_scheduled_reports,
    put_datasource, put_query, reset_report, submit_report, AppState,
};

/// Build the API router over `state`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/datasources", get(list_datasources))
        .route("/api/v1/datasources/:name", get(get_datasource).put(put_datasource))
        .route("/api/v1/datasources/:name/samples", post(import_samples))
        .route("/api/v1/datasources/:name/coverage", get(get_coverage))
        .route("/api/v1/queries", get(list_queries))
        .route("/api/v1/queries/:name", get(get_query).put(put_query))
        .route("/api/v1/queries/:name/dependencies", get(get_query_dependencies))
        .route("/api/v1/reports", get(list_reports).post(submit_report))
        .route("/api/v1/reports/:name", get(get_report).delete(delete_report))
        .route("/api/v1/reports/:name/results", get(get_report_results))
        .route("/api/v1/reports/:name/reset", post(reset_report))
        .route(
            "/api/v1/scheduledreports",
            get(list_scheduled_reports).post(create_scheduled_report),
        )
        .route("/api/v1/scheduledreports/:name", get(get_scheduled_report))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `listen` until `shutdown` is cancelled.
pub async fn run_server(
    state: Arc<AppState>,
    listen: &str,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!("API server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            tracing::info!("API server shutting down");
        })
        .await?;

    Ok(())
}

use crate::datasource::{DataSourceCatalog, DataSourceDefinition, DataSourceView, ImportWatermark, PrometheusSource};
use crate::error::ErrorClass;
use crate::import::{ImportCoordinator, ImportError, ImportOutcome};
use crate::query::{QueryError, QueryRegistry, ReportQuery, ResolveError, ResolvedDependencies};
use crate::readiness::ReadinessTracker;
use crate::report::{
    Report, ReportEngine, ReportError, ReportScheduler, ReportSpec, ResultError, ScheduleError,
    ScheduledReport, ScheduledReportSpec,
};
use crate::sample::{Batch, ImportWindow, SampleInput};
use crate::storage::{MetricStore, ResultRow};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared state for the HTTP API
pub struct AppState {
    pub store: Arc<dyn MetricStore>,
    pub catalog: Arc<DataSourceCatalog>,
    pub importer: Arc<ImportCoordinator>,
    pub readiness: ReadinessTracker,
    pub queries: Arc<QueryRegistry>,
    pub engine: ReportEngine,
    pub scheduler: Arc<ReportScheduler>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn MetricStore>,
        importer: Arc<ImportCoordinator>,
        queries: Arc<QueryRegistry>,
        engine: ReportEngine,
        scheduler: Arc<ReportScheduler>,
    ) -> Self {
        let catalog = importer.catalog().clone();
        Self {
            store,
            readiness: ReadinessTracker::new(catalog.clone()),
            catalog,
            importer,
            queries,
            engine,
            scheduler,
        }
    }
}

// API request/response types

#[derive(Debug, Deserialize)]
pub struct DataSourceBody {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub prometheus: Option<PrometheusSource>,
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub samples: Vec<SampleInput>,
    #[serde(default)]
    pub window: Option<ImportWindow>,
}

#[derive(Debug, Deserialize)]
pub struct CoverageQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct CoverageResponse {
    pub data_source: String,
    pub covered: bool,
    pub table_exists: bool,
    pub watermark: Option<ImportWatermark>,
}

#[derive(Debug, Serialize)]
pub struct ResultsResponse {
    pub name: String,
    pub row_count: usize,
    pub rows: Vec<ResultRow>,
}

/// GET /health
pub async fn health_check() -> &'static str {
    "OK"
}

/// GET /api/v1/datasources
pub async fn list_datasources(State(state): State<Arc<AppState>>) -> Json<Vec<DataSourceView>> {
    Json(state.catalog.list())
}

/// GET /api/v1/datasources/:name
pub async fn get_datasource(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<DataSourceView>, ApiError> {
    state
        .catalog
        .view(&name)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("data source '{}' not found", name)))
}

/// PUT /api/v1/datasources/:name
pub async fn put_datasource(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<DataSourceBody>,
) -> Result<Json<DataSourceView>, ApiError> {
    let definition = DataSourceDefinition {
        name: name.clone(),
        description: body.description,
        prometheus: body.prometheus,
    };
    state.importer.register(definition).await?;
    state
        .catalog
        .view(&name)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("data source '{}' not found", name)))
}

/// POST /api/v1/datasources/:name/samples
pub async fn import_samples(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<ImportRequest>,
) -> Result<Json<ImportOutcome>, ApiError> {
    let mut batch = Batch::from_inputs(name.clone(), request.samples);
    if let Some(window) = request.window {
        batch = batch.with_window(window);
    }
    let outcome = state.importer.store(&name, batch).await?;
    Ok(Json(outcome))
}

/// GET /api/v1/datasources/:name/coverage?start=..&end=..
pub async fn get_coverage(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<CoverageQuery>,
) -> Result<Json<CoverageResponse>, ApiError> {
    let status = state
        .readiness
        .status(&name)
        .ok_or_else(|| ApiError::not_found(format!("data source '{}' not found", name)))?;

    Ok(Json(CoverageResponse {
        covered: state.readiness.covers(&name, query.start, query.end),
        table_exists: status.table_exists,
        watermark: status.watermark,
        data_source: name,
    }))
}

/// GET /api/v1/queries
pub async fn list_queries(State(state): State<Arc<AppState>>) -> Json<Vec<ReportQuery>> {
    Json(state.queries.list())
}

/// GET /api/v1/queries/:name
pub async fn get_query(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ReportQuery>, ApiError> {
    state
        .queries
        .get(&name)
        .map(Json)
        .ok_or_else(|| QueryError::NotFound(name).into())
}

/// PUT /api/v1/queries/:name
pub async fn put_query(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(mut query): Json<ReportQuery>,
) -> Result<Json<ReportQuery>, ApiError> {
    if query.name.is_empty() {
        query.name = name.clone();
    }
    if query.name != name {
        return Err(ApiError::new(
            ErrorClass::Validation,
            format!("query name '{}' does not match path '{}'", query.name, name),
        ));
    }
    state.queries.save(state.store.as_ref(), query.clone()).await?;
    Ok(Json(query))
}

/// GET /api/v1/queries/:name/dependencies
pub async fn get_query_dependencies(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ResolvedDependencies>, ApiError> {
    let resolved = state.queries.resolve(&name, &state.catalog)?;
    Ok(Json(resolved))
}

/// GET /api/v1/reports
pub async fn list_reports(State(state): State<Arc<AppState>>) -> Json<Vec<Report>> {
    Json(state.engine.list())
}

/// POST /api/v1/reports
pub async fn submit_report(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<ReportSpec>,
) -> Result<(StatusCode, Json<Report>), ApiError> {
    let report = state.engine.submit(spec).await?;
    Ok((StatusCode::CREATED, Json(report)))
}

/// GET /api/v1/reports/:name
pub async fn get_report(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Report>, ApiError> {
    Ok(Json(state.engine.status(&name)?))
}

/// DELETE /api/v1/reports/:name
pub async fn delete_report(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.prune(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/reports/:name/results
pub async fn get_report_results(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ResultsResponse>, ApiError> {
    let rows = state.engine.results().get(&name)?;
    Ok(Json(ResultsResponse {
        name,
        row_count: rows.len(),
        rows: rows.as_ref().clone(),
    }))
}

/// POST /api/v1/reports/:name/reset
pub async fn reset_report(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Report>, ApiError> {
    Ok(Json(state.engine.reset(&name).await?))
}

/// GET /api/v1/scheduledreports
pub async fn list_scheduled_reports(State(state): State<Arc<AppState>>) -> Json<Vec<ScheduledReport>> {
    Json(state.scheduler.list().await)
}

/// GET /api/v1/scheduledreports/:name
pub async fn get_scheduled_report(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ScheduledReport>, ApiError> {
    state
        .scheduler
        .get(&name)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("scheduled report '{}' not found", name)))
}

/// POST /api/v1/scheduledreports
pub async fn create_scheduled_report(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<ScheduledReportSpec>,
) -> Result<(StatusCode, Json<ScheduledReport>), ApiError> {
    let schedule = state.scheduler.create(spec, false).await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

// Error handling

/// Error body `{"error": message, "class": error_class}` with a status code
/// derived from the class.
#[derive(Debug)]
pub struct ApiError {
    pub class: ErrorClass,
    pub message: String,
}

impl ApiError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::NotFound, message)
    }

    pub fn status(&self) -> StatusCode {
        match self.class {
            ErrorClass::Validation => StatusCode::BAD_REQUEST,
            ErrorClass::NotFound => StatusCode::NOT_FOUND,
            ErrorClass::Conflict | ErrorClass::NotReady => StatusCode::CONFLICT,
            ErrorClass::Dependency => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorClass::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorClass::QueryExecution => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(class = %self.class, error = %self.message, "Request failed");
        }
        (
            status,
            Json(serde_json::json!({ "error": self.message, "class": self.class })),
        )
            .into_response()
    }
}

macro_rules! classified_error {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for ApiError {
                fn from(e: $ty) -> Self {
                    ApiError::new(e.class(), e.to_string())
                }
            }
        )*
    };
}

classified_error!(
    ImportError,
    QueryError,
    ResolveError,
    ReportError,
    ResultError,
    ScheduleError,
);

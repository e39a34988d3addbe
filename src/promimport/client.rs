use crate::config::types::PrometheusConfig;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrometheusClientError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Prometheus returned error status {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("Prometheus query failed ({error_type}): {message}")]
    QueryError { error_type: String, message: String },

    #[error("Unexpected result type '{0}', expected 'matrix'")]
    UnexpectedResultType(String),

    #[error("Malformed sample {value:?} at {timestamp}")]
    MalformedSample { timestamp: f64, value: String },

    #[error("Max retries exceeded")]
    MaxRetriesExceeded,
}

pub type Result<T> = std::result::Result<T, PrometheusClientError>;

/// One labelled series returned by a range query.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub labels: BTreeMap<String, String>,
    pub points: Vec<(DateTime<Utc>, f64)>,
}

/// HTTP client for the Prometheus range query API
#[derive(Debug)]
pub struct PrometheusClient {
    base_url: String,
    client: reqwest::Client,
    retry_interval: Duration,
    max_retries: usize,
}

impl PrometheusClient {
    pub fn new(config: &PrometheusConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            client,
            retry_interval: config.retry_interval,
            max_retries: config.max_retries,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run `query` over `[start, end]` at `step` resolution.
    pub async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Vec<Series>> {
        let url = format!("{}/api/v1/query_range", self.base_url);
        let params = [
            ("query", query.to_string()),
            ("start", format_timestamp(start)),
            ("end", format_timestamp(end)),
            ("step", format!("{}s", step.as_secs_f64())),
        ];
        let response = self.client.get(&url).query(&params).send().await?;

        let status = response.status();
        // Prometheus reports query errors as 400/422 with a JSON body
        let body = response.text().await?;
        match serde_json::from_str::<QueryRangeResponse>(&body) {
            Ok(parsed) => parse_response(parsed),
            Err(_) if !status.is_success() => Err(PrometheusClientError::ServerError {
                status: status.as_u16(),
                message: body,
            }),
            Err(e) => Err(PrometheusClientError::ServerError {
                status: status.as_u16(),
                message: format!("invalid response body: {}", e),
            }),
        }
    }

    /// `query_range` with retries.
    pub async fn query_range_with_retry(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Vec<Series>> {
        self.with_retry(|| self.query_range(query, start, end, step), self.max_retries)
            .await
    }

    /// Retry a request with exponential backoff
    pub async fn with_retry<F, Fut, T>(&self, mut operation: F, max_retries: usize) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        let mut backoff = self.retry_interval;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                // Bad queries will not get better
                Err(e @ PrometheusClientError::QueryError { .. }) => return Err(e),
                Err(e) => {
                    attempts += 1;
                    if attempts >= max_retries {
                        tracing::error!(
                            url = %self.base_url,
                            attempts = attempts,
                            error = %e,
                            "Max retries exceeded"
                        );
                        return Err(PrometheusClientError::MaxRetriesExceeded);
                    }

                    tracing::warn!(
                        url = %self.base_url,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis(),
                        error = %e,
                        "Request failed, retrying"
                    );

                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, Duration::from_secs(60));
                }
            }
        }
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    format!("{:.3}", ts.timestamp_millis() as f64 / 1000.0)
}

// ===== Response Types =====

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryRangeResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryRangeData>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryRangeData {
    result_type: String,
    #[serde(default)]
    result: Vec<MatrixSeries>,
}

#[derive(Debug, Deserialize)]
struct MatrixSeries {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

fn parse_response(response: QueryRangeResponse) -> Result<Vec<Series>> {
    if response.status != "success" {
        return Err(PrometheusClientError::QueryError {
            error_type: response.error_type.unwrap_or_else(|| "unknown".to_string()),
            message: response.error.unwrap_or_default(),
        });
    }
    let Some(data) = response.data else {
        return Ok(Vec::new());
    };
    if data.result_type != "matrix" {
        return Err(PrometheusClientError::UnexpectedResultType(data.result_type));
    }

    let mut series = Vec::with_capacity(data.result.len());
    for raw in data.result {
        let mut points = Vec::with_capacity(raw.values.len());
        for (timestamp, value) in raw.values {
            let malformed = || PrometheusClientError::MalformedSample {
                timestamp,
                value: value.clone(),
            };
            let parsed: f64 = value.parse().map_err(|_| malformed())?;
            // Stale markers and NaN carry no usable amount
            if !parsed.is_finite() {
                continue;
            }
            let micros = (timestamp * 1_000_000.0).round() as i64;
            let ts = DateTime::from_timestamp_micros(micros).ok_or_else(malformed)?;
            points.push((ts, parsed));
        }

        let mut labels = raw.metric;
        labels.remove("__name__");
        series.push(Series { labels, points });
    }
    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn parse(json: &str) -> Result<Vec<Series>> {
        parse_response(serde_json::from_str(json).unwrap())
    }

    #[test]
    fn test_parse_matrix() {
        let series = parse(
            r#"{"status":"success","data":{"resultType":"matrix","result":[
                {"metric":{"__name__":"kube_pod_container_resource_requests","pod":"a","namespace":"x"},
                 "values":[[1700000000,"0.25"],[1700000060.5,"0.5"],[1700000120,"NaN"]]}
            ]}}"#,
        )
        .unwrap();

        assert_eq!(series.len(), 1);
        assert_eq!(series[0].labels.len(), 2);
        assert!(!series[0].labels.contains_key("__name__"));
        assert_eq!(
            series[0].points,
            vec![
                (Utc.timestamp_opt(1_700_000_000, 0).unwrap(), 0.25),
                (Utc.timestamp_opt(1_700_000_060, 500_000_000).unwrap(), 0.5),
            ]
        );
    }

    #[test]
    fn test_parse_error_response() {
        let err = parse(r#"{"status":"error","errorType":"bad_data","error":"parse error at char 3"}"#)
            .unwrap_err();
        assert!(matches!(err, PrometheusClientError::QueryError { ref error_type, .. } if error_type == "bad_data"));
    }

    #[test]
    fn test_parse_rejects_non_matrix_and_bad_values() {
        let err = parse(r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#).unwrap_err();
        assert!(matches!(err, PrometheusClientError::UnexpectedResultType(_)));

        let err = parse(
            r#"{"status":"success","data":{"resultType":"matrix","result":[{"metric":{},"values":[[1,"abc"]]}]}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, PrometheusClientError::MalformedSample { .. }));
    }

    #[test]
    fn test_format_timestamp() {
        let ts = Utc.timestamp_opt(1_700_000_000, 250_000_000).unwrap();
        assert_eq!(format_timestamp(ts), "1700000000.250");
    }

    #[tokio::test]
    async fn test_with_retry_gives_up() {
        let mut config = PrometheusConfig::with_url("http://127.0.0.1:1");
        config.retry_interval = Duration::from_millis(1);
        let client = PrometheusClient::new(&config).unwrap();

        let mut calls = 0;
        let result: Result<()> = client
            .with_retry(
                || {
                    calls += 1;
                    async {
                        Err(PrometheusClientError::ServerError {
                            status: 503,
                            message: "unavailable".to_string(),
                        })
                    }
                },
                3,
            )
            .await;

        assert!(matches!(result, Err(PrometheusClientError::MaxRetriesExceeded)));
        assert_eq!(calls, 3);
    }
}

pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# METERING CONFIGURATION
# =============================================================================
# This file configures storage, the HTTP API, metric import and the report
# queries available to reports.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/metering/config.yml
#   3. /etc/metering/config.yml
#
# Any value may reference an environment variable as $env{NAME}.

# =============================================================================
# STORAGE
# =============================================================================
# DuckDB database holding data source tables, watermarks, reports and
# definitions created through the API.

storage:
  path: ~/.local/share/metering/metering.duckdb

# =============================================================================
# WEB
# =============================================================================

web:
  listen: 127.0.0.1:8080

# =============================================================================
# IMPORT
# =============================================================================

import:
  # Register data sources on their first pushed batch
  auto_register: true
  # Attempts to publish a watermark when another writer got there first
  max_watermark_retries: 3

# =============================================================================
# REPORTS
# =============================================================================

reports:
  # Reports fail as not ready if their data sources do not cover the report
  # window in time
  readiness_timeout: 5m
  poll_interval: 5s
  schedule_check_interval: 30s

# =============================================================================
# PROMETHEUS (optional)
# =============================================================================
# Pulls every data source that declares a prometheus query. Remove this
# section and the prometheus blocks below to import by push only.

prometheus:
  url: http://localhost:9090
  step: 1m
  chunk_size: 5m
  poll_interval: 1m
  # Stay behind now so late scrapes are included
  delay: 1m
  timeout: 30s
  retry_interval: 1s
  max_retries: 5

# =============================================================================
# DATA SOURCES
# =============================================================================
# Each data source is stored in its own table. Samples carry labels, a
# timestamp, a value and the number of seconds the value stands for.

datasources:
  - name: pod-request-cpu-cores
    description: CPU cores requested per pod
    prometheus:
      query: 'sum(kube_pod_container_resource_requests{resource="cpu", unit="core"}) by (pod, namespace, node)'

  - name: pod-usage-cpu-cores
    description: CPU cores used per pod
    prometheus:
      query: 'sum(rate(container_cpu_usage_seconds_total{container!="POD", container!=""}[1m])) by (pod, namespace, node)'

  - name: pod-request-memory-bytes
    description: Memory bytes requested per pod
    prometheus:
      query: 'sum(kube_pod_container_resource_requests{resource="memory", unit="byte"}) by (pod, namespace, node)'

  - name: pod-usage-memory-bytes
    description: Memory bytes used per pod
    prometheus:
      query: 'sum(container_memory_usage_bytes{container!="POD", container!=""}) by (pod, namespace, node)'

  - name: node-allocatable-cpu-cores
    description: CPU cores allocatable to pods per node
    prometheus:
      query: 'sum(kube_node_status_allocatable{resource="cpu", unit="core"}) by (node)'

  - name: node-allocatable-memory-bytes
    description: Memory bytes allocatable to pods per node
    prometheus:
      query: 'sum(kube_node_status_allocatable{resource="memory", unit="byte"}) by (node)'

  - name: persistentvolumeclaim-phase
    description: 1 while a claim is in the phase named by its phase label
    prometheus:
      query: 'kube_persistentvolumeclaim_status_phase == 1'

  - name: persistentvolumeclaim-usage-bytes
    description: Bytes used per persistent volume claim
    prometheus:
      query: 'sum(kubelet_volume_stats_used_bytes) by (namespace, persistentvolumeclaim)'

  - name: persistentvolumeclaim-capacity-bytes
    description: Capacity in bytes per persistent volume claim
    prometheus:
      query: 'sum(kubelet_volume_stats_capacity_bytes) by (namespace, persistentvolumeclaim)'

# =============================================================================
# REPORT QUERIES
# =============================================================================
# Placeholders:
#   {{ start }} / {{ end }}     report window bounds
#   {{ datasource "name" }}     table of a data source listed in data_sources
#   {{ query "name" }}          another report query listed in report_queries,
#                               inlined as a subquery over the same window

queries:
  - name: pod-cpu-request
    description: CPU core seconds requested per pod
    data_sources: [pod-request-cpu-cores]
    query: |
      SELECT
        json_extract_string(labels, '$.namespace') AS namespace,
        json_extract_string(labels, '$.pod') AS pod,
        json_extract_string(labels, '$.node') AS node,
        sum(value * step_seconds) AS pod_request_cpu_core_seconds
      FROM {{ datasource "pod-request-cpu-cores" }}
      WHERE timestamp >= {{ start }} AND timestamp < {{ end }}
      GROUP BY ALL
      ORDER BY namespace, pod, node

  - name: namespace-cpu-request
    description: CPU core seconds requested per namespace
    report_queries: [pod-cpu-request]
    query: |
      SELECT
        namespace,
        sum(pod_request_cpu_core_seconds) AS pod_request_cpu_core_seconds
      FROM {{ query "pod-cpu-request" }}
      GROUP BY namespace
      ORDER BY namespace

  - name: pod-cpu-usage
    description: CPU core seconds used per pod
    data_sources: [pod-usage-cpu-cores]
    query: |
      SELECT
        json_extract_string(labels, '$.namespace') AS namespace,
        json_extract_string(labels, '$.pod') AS pod,
        json_extract_string(labels, '$.node') AS node,
        sum(value * step_seconds) AS pod_usage_cpu_core_seconds
      FROM {{ datasource "pod-usage-cpu-cores" }}
      WHERE timestamp >= {{ start }} AND timestamp < {{ end }}
      GROUP BY ALL
      ORDER BY namespace, pod, node

  - name: namespace-cpu-usage
    description: CPU core seconds used per namespace
    report_queries: [pod-cpu-usage]
    query: |
      SELECT
        namespace,
        sum(pod_usage_cpu_core_seconds) AS pod_usage_cpu_core_seconds
      FROM {{ query "pod-cpu-usage" }}
      GROUP BY namespace
      ORDER BY namespace

  - name: pod-memory-request
    description: Memory byte seconds requested per pod
    data_sources: [pod-request-memory-bytes]
    query: |
      SELECT
        json_extract_string(labels, '$.namespace') AS namespace,
        json_extract_string(labels, '$.pod') AS pod,
        json_extract_string(labels, '$.node') AS node,
        sum(value * step_seconds) AS pod_request_memory_byte_seconds
      FROM {{ datasource "pod-request-memory-bytes" }}
      WHERE timestamp >= {{ start }} AND timestamp < {{ end }}
      GROUP BY ALL
      ORDER BY namespace, pod, node

  - name: namespace-memory-request
    description: Memory byte seconds requested per namespace
    report_queries: [pod-memory-request]
    query: |
      SELECT
        namespace,
        sum(pod_request_memory_byte_seconds) AS pod_request_memory_byte_seconds
      FROM {{ query "pod-memory-request" }}
      GROUP BY namespace
      ORDER BY namespace

  - name: pod-memory-usage
    description: Memory byte seconds used per pod
    data_sources: [pod-usage-memory-bytes]
    query: |
      SELECT
        json_extract_string(labels, '$.namespace') AS namespace,
        json_extract_string(labels, '$.pod') AS pod,
        json_extract_string(labels, '$.node') AS node,
        sum(value * step_seconds) AS pod_usage_memory_byte_seconds
      FROM {{ datasource "pod-usage-memory-bytes" }}
      WHERE timestamp >= {{ start }} AND timestamp < {{ end }}
      GROUP BY ALL
      ORDER BY namespace, pod, node

  - name: namespace-memory-usage
    description: Memory byte seconds used per namespace
    report_queries: [pod-memory-usage]
    query: |
      SELECT
        namespace,
        sum(pod_usage_memory_byte_seconds) AS pod_usage_memory_byte_seconds
      FROM {{ query "pod-memory-usage" }}
      GROUP BY namespace
      ORDER BY namespace

  - name: node-cpu-utilization
    description: Share of allocatable cpu requested by pods per node
    data_sources: [node-allocatable-cpu-cores, pod-request-cpu-cores]
    query: |
      WITH allocatable AS (
        SELECT
          json_extract_string(labels, '$.node') AS node,
          sum(value * step_seconds) AS node_allocatable_cpu_core_seconds
        FROM {{ datasource "node-allocatable-cpu-cores" }}
        WHERE timestamp >= {{ start }} AND timestamp < {{ end }}
        GROUP BY ALL
      ), requested AS (
        SELECT
          json_extract_string(labels, '$.node') AS node,
          sum(value * step_seconds) AS pod_request_cpu_core_seconds
        FROM {{ datasource "pod-request-cpu-cores" }}
        WHERE timestamp >= {{ start }} AND timestamp < {{ end }}
        GROUP BY ALL
      )
      SELECT
        a.node,
        a.node_allocatable_cpu_core_seconds,
        coalesce(r.pod_request_cpu_core_seconds, 0) AS pod_request_cpu_core_seconds,
        coalesce(r.pod_request_cpu_core_seconds, 0) * 100
          / nullif(a.node_allocatable_cpu_core_seconds, 0) AS cpu_used_percent,
        100 - coalesce(r.pod_request_cpu_core_seconds, 0) * 100
          / nullif(a.node_allocatable_cpu_core_seconds, 0) AS cpu_unused_percent
      FROM allocatable a
      LEFT JOIN requested r ON r.node = a.node
      ORDER BY a.node

  - name: node-memory-utilization
    description: Share of allocatable memory requested by pods per node
    data_sources: [node-allocatable-memory-bytes, pod-request-memory-bytes]
    query: |
      WITH allocatable AS (
        SELECT
          json_extract_string(labels, '$.node') AS node,
          sum(value * step_seconds) AS node_allocatable_memory_byte_seconds
        FROM {{ datasource "node-allocatable-memory-bytes" }}
        WHERE timestamp >= {{ start }} AND timestamp < {{ end }}
        GROUP BY ALL
      ), requested AS (
        SELECT
          json_extract_string(labels, '$.node') AS node,
          sum(value * step_seconds) AS pod_request_memory_byte_seconds
        FROM {{ datasource "pod-request-memory-bytes" }}
        WHERE timestamp >= {{ start }} AND timestamp < {{ end }}
        GROUP BY ALL
      )
      SELECT
        a.node,
        a.node_allocatable_memory_byte_seconds,
        coalesce(r.pod_request_memory_byte_seconds, 0) AS pod_request_memory_byte_seconds,
        coalesce(r.pod_request_memory_byte_seconds, 0) * 100
          / nullif(a.node_allocatable_memory_byte_seconds, 0) AS memory_used_percent,
        100 - coalesce(r.pod_request_memory_byte_seconds, 0) * 100
          / nullif(a.node_allocatable_memory_byte_seconds, 0) AS memory_unused_percent
      FROM allocatable a
      LEFT JOIN requested r ON r.node = a.node
      ORDER BY a.node

  - name: persistentvolumeclaim-usage
    description: Average bytes used per bound persistent volume claim
    data_sources: [persistentvolumeclaim-phase, persistentvolumeclaim-usage-bytes]
    query: |
      SELECT
        json_extract_string(u.labels, '$.namespace') AS namespace,
        json_extract_string(u.labels, '$.persistentvolumeclaim') AS persistentvolumeclaim,
        avg(u.value) AS persistentvolumeclaim_usage_bytes
      FROM {{ datasource "persistentvolumeclaim-usage-bytes" }} u
      JOIN {{ datasource "persistentvolumeclaim-phase" }} p
        ON p.timestamp = u.timestamp
        AND json_extract_string(p.labels, '$.namespace') = json_extract_string(u.labels, '$.namespace')
        AND json_extract_string(p.labels, '$.persistentvolumeclaim') = json_extract_string(u.labels, '$.persistentvolumeclaim')
      WHERE u.timestamp >= {{ start }} AND u.timestamp < {{ end }}
        AND json_extract_string(p.labels, '$.phase') = 'Bound'
        AND p.value = 1
      GROUP BY ALL
      ORDER BY namespace, persistentvolumeclaim

  - name: namespace-persistentvolumeclaim-usage
    description: Bytes used by bound persistent volume claims per namespace
    report_queries: [persistentvolumeclaim-usage]
    query: |
      SELECT
        namespace,
        sum(persistentvolumeclaim_usage_bytes) AS persistentvolumeclaim_usage_bytes
      FROM {{ query "persistentvolumeclaim-usage" }}
      GROUP BY namespace
      ORDER BY namespace

  - name: persistentvolumeclaim-capacity
    description: Average capacity in bytes per persistent volume claim
    data_sources: [persistentvolumeclaim-capacity-bytes]
    query: |
      SELECT
        json_extract_string(labels, '$.namespace') AS namespace,
        json_extract_string(labels, '$.persistentvolumeclaim') AS persistentvolumeclaim,
        avg(value) AS persistentvolumeclaim_capacity_bytes
      FROM {{ datasource "persistentvolumeclaim-capacity-bytes" }}
      WHERE timestamp >= {{ start }} AND timestamp < {{ end }}
      GROUP BY ALL
      ORDER BY namespace, persistentvolumeclaim

# =============================================================================
# SCHEDULED REPORTS (optional)
# =============================================================================
# One child report is submitted per elapsed period, named
# <name>-<YYYYMMDDHHMM of the period start>.
#
# scheduled_reports:
#   - name: namespace-cpu-request-hourly
#     query: namespace-cpu-request
#     period: 1h
#     start: 2024-01-01T00:00:00Z
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::query::resolve;
    use crate::query::template::render;
    use chrono::{TimeZone, Utc};
    use std::collections::{BTreeMap, BTreeSet};

    #[test]
    fn test_starter_config_is_valid() {
        let config = parse_config(&generate_starter_config()).unwrap();
        assert_eq!(config.datasources.len(), 9);
        assert_eq!(config.queries.len(), 13);
        assert!(config.prometheus.is_some());
        assert!(config.scheduled_reports.is_empty());
    }

    #[test]
    fn test_namespace_queries_build_on_pod_queries() {
        let config = parse_config(&generate_starter_config()).unwrap();
        let queries: BTreeMap<_, _> = config
            .queries
            .iter()
            .map(|q| (q.name.clone(), q.clone()))
            .collect();
        let known: Vec<_> = config.datasources.iter().map(|d| d.name.clone()).collect();

        let resolved = resolve(&queries, |name| known.iter().any(|k| k == name), "namespace-cpu-request").unwrap();
        assert_eq!(resolved.queries, vec!["pod-cpu-request".to_string()]);
        assert_eq!(resolved.data_sources, vec!["pod-request-cpu-cores".to_string()]);
    }

    #[test]
    fn test_every_builtin_query_resolves_and_renders() {
        let config = parse_config(&generate_starter_config()).unwrap();
        let queries: BTreeMap<_, _> = config
            .queries
            .iter()
            .map(|q| (q.name.clone(), q.clone()))
            .collect();
        let known: Vec<_> = config.datasources.iter().map(|d| d.name.clone()).collect();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        let mut used = BTreeSet::new();
        for name in queries.keys() {
            let resolved = resolve(&queries, |ds| known.iter().any(|k| k == ds), name)
                .unwrap_or_else(|e| panic!("{}: {}", name, e));
            used.extend(resolved.data_sources);

            let sql = render(&queries[name], &queries, start, end).unwrap();
            assert!(!sql.contains("{{"), "{} left a placeholder", name);
        }
        // Every built-in data source feeds some query
        assert_eq!(used.len(), known.len());
    }

    #[test]
    fn test_builtin_join_queries_depend_on_both_sources() {
        let config = parse_config(&generate_starter_config()).unwrap();
        let queries: BTreeMap<_, _> = config
            .queries
            .iter()
            .map(|q| (q.name.clone(), q.clone()))
            .collect();

        let resolved = resolve(&queries, |_| true, "node-cpu-utilization").unwrap();
        assert_eq!(
            resolved.data_sources,
            vec!["node-allocatable-cpu-cores".to_string(), "pod-request-cpu-cores".to_string()]
        );

        let resolved = resolve(&queries, |_| true, "namespace-persistentvolumeclaim-usage").unwrap();
        assert_eq!(resolved.queries, vec!["persistentvolumeclaim-usage".to_string()]);
        assert_eq!(
            resolved.data_sources,
            vec![
                "persistentvolumeclaim-phase".to_string(),
                "persistentvolumeclaim-usage-bytes".to_string()
            ]
        );
    }
}

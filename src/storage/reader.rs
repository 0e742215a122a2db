// Copyright 2024-Present The Spanstore Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use sea_query::{Expr, MysqlQueryBuilder, Order, Query, SelectStatement};
use sea_query_binder::SqlxBinder;
use sqlx::MySqlPool;
use tracing::{debug, warn};

use super::cache::NameCache;
use super::dbmodel::{to_domain, SpanRow, Traces, TRACES_COLUMNS};
use crate::error::{StorageError, StorageResult};
use crate::model::{duration_micros, epoch_micros, Span, Trace, TraceId, TraceQuery};
use crate::SpanReader;

const HTTP_STATUS_CODE_TAG: &str = "http.status_code";
const ERROR_TAG: &str = "error";

/// Applied when a query does not specify a positive `num_traces`.
const DEFAULT_NUM_TRACES: u64 = 20;

/// Reconstructs traces from the database and translates structured search
/// parameters into filtered queries. Query failures surface as errors; rows
/// that fail to decode are logged and skipped.
pub struct MysqlSpanReader {
    pool: MySqlPool,
    cache: Arc<NameCache>,
}

impl MysqlSpanReader {
    pub(super) fn new(pool: MySqlPool, cache: Arc<NameCache>) -> Self {
        Self { pool, cache }
    }

    async fn fetch_spans(&self, statement: &SelectStatement) -> StorageResult<Vec<SpanRow>> {
        let (sql, values) = statement.build_sqlx(MysqlQueryBuilder);
        let rows: Vec<SpanRow> = sqlx::query_as_with::<_, SpanRow, _>(&sql, values)
            .fetch_all(&self.pool)
            .await
            .map_err(convert_sqlx_err)?;
        Ok(rows)
    }
}

#[async_trait]
impl SpanReader for MysqlSpanReader {
    async fn get_trace(&self, trace_id: TraceId) -> StorageResult<Trace> {
        let mut statement = Query::select();
        statement
            .columns(TRACES_COLUMNS)
            .from(Traces::Table)
            .and_where(Expr::col(Traces::TraceId).eq(trace_id.to_string()));
        let rows = self.fetch_spans(&statement).await?;

        let spans: Vec<Span> = rows
            .iter()
            .filter_map(|row| decode_row_or_skip(row))
            .collect();
        Ok(Trace { spans })
    }

    async fn get_services(&self) -> StorageResult<Vec<String>> {
        self.cache.load_services().await
    }

    async fn get_operations(&self, service: &str) -> StorageResult<Vec<String>> {
        self.cache.load_operations(service).await
    }

    async fn find_trace_ids(&self, query: &TraceQuery) -> StorageResult<Vec<TraceId>> {
        let statement = build_find_trace_ids_query(query);
        let (sql, values) = statement.build_sqlx(MysqlQueryBuilder);
        debug!(sql=%sql, "find trace ids");

        let raw_trace_ids: Vec<String> = sqlx::query_scalar_with(&sql, values)
            .fetch_all(&self.pool)
            .await
            .map_err(convert_sqlx_err)?;
        let trace_ids = raw_trace_ids
            .into_iter()
            .filter_map(|raw_trace_id| match raw_trace_id.parse::<TraceId>() {
                Ok(trace_id) => Some(trace_id),
                Err(parse_error) => {
                    warn!(trace_id=%raw_trace_id, error=%parse_error, "skipping malformed trace id");
                    None
                }
            })
            .collect();
        Ok(trace_ids)
    }

    async fn find_traces(&self, query: &TraceQuery) -> StorageResult<Vec<Trace>> {
        let trace_ids = self.find_trace_ids(query).await?;
        if trace_ids.is_empty() {
            debug!("no trace matched the query");
            return Ok(Vec::new());
        }
        let trace_id_strings: Vec<String> = trace_ids
            .iter()
            .map(|trace_id| trace_id.to_string())
            .collect();

        let mut statement = Query::select();
        statement
            .columns(TRACES_COLUMNS)
            .from(Traces::Table)
            .and_where(Expr::col(Traces::TraceId).is_in(trace_id_strings));
        let rows = self.fetch_spans(&statement).await?;

        let mut spans_by_trace_id: HashMap<String, Vec<Span>> = HashMap::new();
        for row in &rows {
            if let Some(span) = decode_row_or_skip(row) {
                spans_by_trace_id
                    .entry(row.trace_id.clone())
                    .or_default()
                    .push(span);
            }
        }
        let traces = spans_by_trace_id
            .into_iter()
            .sorted_by(|(left, _), (right, _)| left.cmp(right))
            .map(|(_, spans)| Trace { spans })
            .collect();
        Ok(traces)
    }
}

/// Read-path queries surface driver failures as `QueryFailed`.
fn convert_sqlx_err(query_error: sqlx::Error) -> StorageError {
    StorageError::QueryFailed {
        message: query_error.to_string(),
    }
}

fn decode_row_or_skip(row: &SpanRow) -> Option<Span> {
    match to_domain(row) {
        Ok(span) => Some(span),
        Err(decode_error) => {
            warn!(trace_id=%row.trace_id, error=%decode_error, "skipping undecodable span row");
            None
        }
    }
}

/// Translates structured search parameters into a filtered, ordered, limited
/// SELECT over trace ids. Every value is a bound parameter.
fn build_find_trace_ids_query(query: &TraceQuery) -> SelectStatement {
    let mut statement = Query::select();
    statement.column(Traces::TraceId).from(Traces::Table);

    if !query.service_name.is_empty() {
        statement.and_where(Expr::col(Traces::ServiceName).eq(query.service_name.clone()));
    }
    if !query.operation_name.is_empty() {
        statement.and_where(Expr::col(Traces::OperationName).eq(query.operation_name.clone()));
    }
    if let Some(start_time_max) = query.start_time_max {
        statement.and_where(Expr::col(Traces::StartTime).lte(epoch_micros(start_time_max)));
    }
    if let Some(start_time_min) = query.start_time_min {
        statement.and_where(Expr::col(Traces::StartTime).gte(epoch_micros(start_time_min)));
    }
    if let Some(duration_max) = query.duration_max {
        statement.and_where(Expr::col(Traces::Duration).lte(duration_micros(duration_max)));
    }
    if let Some(duration_min) = query.duration_min {
        statement.and_where(Expr::col(Traces::Duration).gte(duration_micros(duration_min)));
    }
    if let Some(http_code) = query.tags.get(HTTP_STATUS_CODE_TAG) {
        match http_code.parse::<i64>() {
            Ok(http_code) => {
                statement.and_where(Expr::col(Traces::HttpCode).eq(http_code));
            }
            Err(_) => {
                warn!(value=%http_code, "ignoring unparseable http.status_code filter");
            }
        }
    }
    if let Some(is_error) = query.tags.get(ERROR_TAG) {
        match is_error.parse::<bool>() {
            Ok(is_error) => {
                statement.and_where(Expr::col(Traces::Error).eq(is_error));
            }
            Err(_) => {
                warn!(value=%is_error, "ignoring unparseable error filter");
            }
        }
    }

    statement.order_by(Traces::StartTime, Order::Desc);
    let limit = if query.num_traces > 0 {
        query.num_traces as u64
    } else {
        DEFAULT_NUM_TRACES
    };
    statement.limit(limit);
    statement
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sea_query::Value;

    use super::*;
    use crate::model::time_from_epoch_micros;

    fn build(query: &TraceQuery) -> (String, Vec<Value>) {
        let (sql, values) = build_find_trace_ids_query(query).build(MysqlQueryBuilder);
        (sql, values.0)
    }

    #[test]
    fn test_query_translation_all_parameters() {
        let query = TraceQuery {
            service_name: "s".to_string(),
            operation_name: "op".to_string(),
            start_time_min: Some(time_from_epoch_micros(1_000_000_000_000_000)),
            duration_min: Some(Duration::from_micros(1_000)),
            tags: HashMap::from_iter([("error".to_string(), "true".to_string())]),
            num_traces: 5,
            ..Default::default()
        };
        let (sql, values) = build(&query);
        assert_eq!(
            sql,
            "SELECT `trace_id` FROM `traces` \
             WHERE `service_name` = ? AND `operation_name` = ? \
             AND `start_time` >= ? AND `duration` >= ? AND `error` = ? \
             ORDER BY `start_time` DESC LIMIT ?"
        );
        assert_eq!(
            values,
            vec![
                Value::from("s"),
                Value::from("op"),
                Value::from(1_000_000_000_000_000i64),
                Value::from(1_000i64),
                Value::from(true),
                Value::from(5u64),
            ]
        );
    }

    #[test]
    fn test_query_translation_defaults_to_limit_20() {
        let query = TraceQuery::default();
        let (sql, values) = build(&query);
        assert_eq!(
            sql,
            "SELECT `trace_id` FROM `traces` ORDER BY `start_time` DESC LIMIT ?"
        );
        assert_eq!(values, vec![Value::from(20u64)]);
    }

    #[test]
    fn test_query_translation_time_and_duration_bounds() {
        let query = TraceQuery {
            start_time_min: Some(time_from_epoch_micros(1_000)),
            start_time_max: Some(time_from_epoch_micros(2_000)),
            duration_min: Some(Duration::from_micros(10)),
            duration_max: Some(Duration::from_micros(20)),
            ..Default::default()
        };
        let (sql, values) = build(&query);
        assert_eq!(
            sql,
            "SELECT `trace_id` FROM `traces` \
             WHERE `start_time` <= ? AND `start_time` >= ? \
             AND `duration` <= ? AND `duration` >= ? \
             ORDER BY `start_time` DESC LIMIT ?"
        );
        assert_eq!(
            values,
            vec![
                Value::from(2_000i64),
                Value::from(1_000i64),
                Value::from(20i64),
                Value::from(10i64),
                Value::from(20u64),
            ]
        );
    }

    #[test]
    fn test_query_translation_http_status_code_tag() {
        let query = TraceQuery {
            tags: HashMap::from_iter([("http.status_code".to_string(), "404".to_string())]),
            num_traces: 1,
            ..Default::default()
        };
        let (sql, values) = build(&query);
        assert_eq!(
            sql,
            "SELECT `trace_id` FROM `traces` WHERE `http_code` = ? \
             ORDER BY `start_time` DESC LIMIT ?"
        );
        assert_eq!(values, vec![Value::from(404i64), Value::from(1u64)]);
    }

    #[test]
    fn test_query_translation_skips_unparseable_tag_filters() {
        let query = TraceQuery {
            tags: HashMap::from_iter([
                ("http.status_code".to_string(), "not-a-number".to_string()),
                ("error".to_string(), "not-a-bool".to_string()),
            ]),
            ..Default::default()
        };
        let (sql, _) = build(&query);
        assert_eq!(
            sql,
            "SELECT `trace_id` FROM `traces` ORDER BY `start_time` DESC LIMIT ?"
        );
    }
}

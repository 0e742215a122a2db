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

use sea_query::Iden;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};
use crate::model::{
    duration_from_micros, duration_micros, epoch_micros, maybe_add_parent_span_id,
    time_from_epoch_micros, KeyValue, Log, Process, RefType, Span, SpanId, SpanRef, TraceId,
};

const HTTP_STATUS_CODE_TAG: &str = "http.status_code";
const ERROR_TAG: &str = "error";

/// Columns of the `traces` table.
#[derive(Iden, Clone, Copy)]
pub(super) enum Traces {
    Table,
    TraceId,
    SpanId,
    SpanHash,
    ParentId,
    OperationName,
    Flags,
    StartTime,
    Duration,
    Tags,
    Logs,
    Refs,
    Process,
    ServiceName,
    HttpCode,
    Error,
}

pub(super) const TRACES_COLUMNS: [Traces; 15] = [
    Traces::TraceId,
    Traces::SpanId,
    Traces::SpanHash,
    Traces::ParentId,
    Traces::OperationName,
    Traces::Flags,
    Traces::StartTime,
    Traces::Duration,
    Traces::Tags,
    Traces::Logs,
    Traces::Refs,
    Traces::Process,
    Traces::ServiceName,
    Traces::HttpCode,
    Traces::Error,
];

/// Database representation of a span. Span and parent ids are bit-for-bit
/// reinterpretations of the unsigned domain ids; nested fields are stored as
/// JSON strings; times are microseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SpanRow {
    pub trace_id: String,
    pub span_id: i64,
    pub span_hash: i64,
    pub parent_id: i64,
    pub operation_name: String,
    pub flags: i32,
    pub start_time: i64,
    pub duration: i64,
    pub tags: String,
    pub logs: String,
    pub refs: String,
    pub process: String,
    pub service_name: String,
    pub http_code: i64,
    pub error: bool,
}

/// Element of the JSON array stored in the `refs` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpanRefRow {
    ref_type: RefType,
    trace_id: String,
    span_id: i64,
}

/// Converts a domain span into its row representation.
pub fn from_domain(span: &Span) -> SpanRow {
    let (refs, parent_id) = encode_refs(&span.references);
    SpanRow {
        trace_id: span.trace_id.to_string(),
        span_id: span.span_id.0 as i64,
        span_hash: span.hash_code() as i64,
        parent_id,
        operation_name: span.operation_name.clone(),
        flags: span.flags as i32,
        start_time: epoch_micros(span.start_time),
        duration: duration_micros(span.duration),
        tags: to_json(&span.tags),
        logs: to_json(&span.logs),
        refs,
        process: to_json(&span.process),
        service_name: span.process.service_name.clone(),
        http_code: extract_http_code(&span.tags),
        error: span.tags.iter().any(|tag| tag.key == ERROR_TAG),
    }
}

/// Reconstructs a domain span from its row representation.
pub fn to_domain(row: &SpanRow) -> StorageResult<Span> {
    let trace_id: TraceId = row.trace_id.parse()?;
    let ref_rows: Vec<SpanRefRow> = decode_json("refs", &row.refs)?;
    let tags: Vec<KeyValue> = decode_json("tags", &row.tags)?;
    let logs: Vec<Log> = decode_json("logs", &row.logs)?;
    let process: Process = decode_json("process", &row.process)?;

    let references: Vec<SpanRef> = ref_rows
        .into_iter()
        .map(|ref_row| SpanRef {
            ref_type: ref_row.ref_type,
            trace_id,
            span_id: SpanId(ref_row.span_id as u64),
        })
        .collect();
    let references =
        maybe_add_parent_span_id(trace_id, SpanId(row.parent_id as u64), references);

    Ok(Span {
        trace_id,
        span_id: SpanId(row.span_id as u64),
        operation_name: row.operation_name.clone(),
        references,
        flags: row.flags as u32,
        start_time: time_from_epoch_micros(row.start_time),
        duration: duration_from_micros(row.duration),
        tags,
        logs,
        process,
    })
}

/// Encodes the reference list and derives `parent_id`: the span id of the
/// last reference typed `child-of`, zero when there is none.
fn encode_refs(references: &[SpanRef]) -> (String, i64) {
    let mut parent_id = 0i64;
    let ref_rows: Vec<SpanRefRow> = references
        .iter()
        .map(|reference| {
            if reference.ref_type == RefType::ChildOf {
                parent_id = reference.span_id.0 as i64;
            }
            SpanRefRow {
                ref_type: reference.ref_type,
                trace_id: reference.trace_id.to_string(),
                span_id: reference.span_id.0 as i64,
            }
        })
        .collect();
    (to_json(&ref_rows), parent_id)
}

/// The value of the first `http.status_code` tag, zero when absent or not an
/// integer.
fn extract_http_code(tags: &[KeyValue]) -> i64 {
    tags.iter()
        .find(|tag| tag.key == HTTP_STATUS_CODE_TAG)
        .and_then(KeyValue::as_i64)
        .unwrap_or(0)
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).expect("tag/log/ref/process values are always serializable")
}

fn decode_json<T: DeserializeOwned>(column: &str, raw: &str) -> StorageResult<T> {
    serde_json::from_str(raw).map_err(|error| StorageError::MalformedJson {
        column: column.to_string(),
        cause: error.to_string(),
    })
}

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

//! Tracing domain model: spans, traces, ids and the tag/log/process value
//! types the storage layer persists.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::StorageError;

/// A 128-bit trace id. Its canonical hex form is 16 lowercase hex chars when
/// the high half is zero, 32 otherwise.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TraceId {
    pub high: u64,
    pub low: u64,
}

impl TraceId {
    pub fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.high == 0 {
            write!(f, "{:016x}", self.low)
        } else {
            write!(f, "{:032x}", ((self.high as u128) << 64) | self.low as u128)
        }
    }
}

impl FromStr for TraceId {
    type Err = StorageError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.is_empty() || raw.len() > 32 || !raw.bytes().all(|byte| byte.is_ascii_hexdigit()) {
            return Err(StorageError::MalformedTraceId {
                trace_id: raw.to_string(),
            });
        }
        let value = u128::from_str_radix(raw, 16).map_err(|_| StorageError::MalformedTraceId {
            trace_id: raw.to_string(),
        })?;
        Ok(TraceId {
            high: (value >> 64) as u64,
            low: value as u64,
        })
    }
}

/// A 64-bit span id, unique within a trace.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SpanId(pub u64);

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// The type of a reference linking one span to another.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum RefType {
    #[serde(rename = "child-of")]
    ChildOf,
    #[serde(rename = "follows-from")]
    FollowsFrom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanRef {
    pub ref_type: RefType,
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

/// A typed tag value. Serialized as adjacent `type`/`value` fields so the
/// JSON encoding is stable and self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TagValue {
    String(String),
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    #[serde(flatten)]
    pub value: TagValue,
}

impl KeyValue {
    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: TagValue::String(value.into()),
        }
    }

    pub fn bool(key: impl Into<String>, value: bool) -> Self {
        Self {
            key: key.into(),
            value: TagValue::Bool(value),
        }
    }

    pub fn int64(key: impl Into<String>, value: i64) -> Self {
        Self {
            key: key.into(),
            value: TagValue::Int64(value),
        }
    }

    pub fn float64(key: impl Into<String>, value: f64) -> Self {
        Self {
            key: key.into(),
            value: TagValue::Float64(value),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match &self.value {
            TagValue::Int64(value) => Some(*value),
            _ => None,
        }
    }
}

/// A timed event attached to a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    /// Microseconds since the Unix epoch.
    pub timestamp: i64,
    pub fields: Vec<KeyValue>,
}

/// The process that emitted a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub service_name: String,
    pub tags: Vec<KeyValue>,
}

impl Process {
    pub fn new(service_name: impl Into<String>, tags: Vec<KeyValue>) -> Self {
        Self {
            service_name: service_name.into(),
            tags,
        }
    }
}

/// A single timed operation within a distributed trace.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub operation_name: String,
    pub references: Vec<SpanRef>,
    pub flags: u32,
    pub start_time: OffsetDateTime,
    pub duration: Duration,
    pub tags: Vec<KeyValue>,
    pub logs: Vec<Log>,
    pub process: Process,
}

impl Span {
    /// Deterministic content hash over every span field. Stable within a
    /// build of the crate, not across builds.
    pub fn hash_code(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.trace_id.high.hash(&mut hasher);
        self.trace_id.low.hash(&mut hasher);
        self.span_id.0.hash(&mut hasher);
        self.operation_name.hash(&mut hasher);
        for reference in &self.references {
            (reference.ref_type as u8).hash(&mut hasher);
            reference.trace_id.high.hash(&mut hasher);
            reference.trace_id.low.hash(&mut hasher);
            reference.span_id.0.hash(&mut hasher);
        }
        self.flags.hash(&mut hasher);
        epoch_micros(self.start_time).hash(&mut hasher);
        duration_micros(self.duration).hash(&mut hasher);
        for tag in &self.tags {
            hash_key_value(tag, &mut hasher);
        }
        for log in &self.logs {
            log.timestamp.hash(&mut hasher);
            for field in &log.fields {
                hash_key_value(field, &mut hasher);
            }
        }
        self.process.service_name.hash(&mut hasher);
        for tag in &self.process.tags {
            hash_key_value(tag, &mut hasher);
        }
        hasher.finish()
    }

    /// The span id of the last `child-of` reference, if any.
    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.references
            .iter()
            .filter(|reference| reference.ref_type == RefType::ChildOf)
            .next_back()
            .map(|reference| reference.span_id)
    }
}

fn hash_key_value(key_value: &KeyValue, hasher: &mut DefaultHasher) {
    key_value.key.hash(hasher);
    match &key_value.value {
        TagValue::String(value) => value.hash(hasher),
        TagValue::Bool(value) => value.hash(hasher),
        TagValue::Int64(value) => value.hash(hasher),
        TagValue::Float64(value) => value.to_bits().hash(hasher),
        TagValue::Binary(value) => value.hash(hasher),
    }
}

/// Prepends a synthetic `child-of` reference for `parent_span_id` unless it
/// is zero or an existing reference already points at it.
pub fn maybe_add_parent_span_id(
    trace_id: TraceId,
    parent_span_id: SpanId,
    references: Vec<SpanRef>,
) -> Vec<SpanRef> {
    if parent_span_id.0 == 0
        || references
            .iter()
            .any(|reference| reference.span_id == parent_span_id)
    {
        return references;
    }
    let mut with_parent = Vec::with_capacity(references.len() + 1);
    with_parent.push(SpanRef {
        ref_type: RefType::ChildOf,
        trace_id,
        span_id: parent_span_id,
    });
    with_parent.extend(references);
    with_parent
}

pub fn epoch_micros(time: OffsetDateTime) -> i64 {
    (time.unix_timestamp_nanos() / 1_000) as i64
}

pub fn time_from_epoch_micros(micros: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(micros as i128 * 1_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

pub fn duration_micros(duration: Duration) -> i64 {
    duration.as_micros() as i64
}

pub fn duration_from_micros(micros: i64) -> Duration {
    Duration::from_micros(micros.max(0) as u64)
}

/// The multiset of spans sharing a trace id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trace {
    pub spans: Vec<Span>,
}

/// Structured trace-search parameters.
#[derive(Debug, Clone, Default)]
pub struct TraceQuery {
    pub service_name: String,
    pub operation_name: String,
    pub start_time_min: Option<OffsetDateTime>,
    pub start_time_max: Option<OffsetDateTime>,
    pub duration_min: Option<Duration>,
    pub duration_max: Option<Duration>,
    pub tags: HashMap<String, String>,
    /// Maximum number of trace ids to return; non-positive falls back to the
    /// server default.
    pub num_traces: i32,
}

/// A directed call edge between two services, aggregated over a time window.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct DependencyLink {
    pub parent: String,
    pub child: String,
    pub call_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_canonical_form() {
        let trace_id = TraceId::new(0, 0x1234);
        assert_eq!(trace_id.to_string(), "0000000000001234");

        let trace_id = TraceId::new(1, 0x1234);
        assert_eq!(trace_id.to_string(), "00000000000000010000000000001234");
    }

    #[test]
    fn test_trace_id_parse() {
        let trace_id: TraceId = "0000000000001234".parse().unwrap();
        assert_eq!(trace_id, TraceId::new(0, 0x1234));

        let trace_id: TraceId = "00000000000000010000000000001234".parse().unwrap();
        assert_eq!(trace_id, TraceId::new(1, 0x1234));

        // Short forms zero-extend.
        let trace_id: TraceId = "abc".parse().unwrap();
        assert_eq!(trace_id, TraceId::new(0, 0xabc));

        for raw in ["", "xyz", "+123", "123456789012345678901234567890123"] {
            let error = raw.parse::<TraceId>().unwrap_err();
            assert!(matches!(error, StorageError::MalformedTraceId { .. }));
        }
    }

    #[test]
    fn test_trace_id_round_trip() {
        for trace_id in [
            TraceId::new(0, 1),
            TraceId::new(0, u64::MAX),
            TraceId::new(42, 42),
            TraceId::new(u64::MAX, 0),
        ] {
            let reparsed: TraceId = trace_id.to_string().parse().unwrap();
            assert_eq!(reparsed, trace_id);
        }
    }

    #[test]
    fn test_key_value_json_shape() {
        let tag = KeyValue::int64("http.status_code", 404);
        assert_eq!(
            serde_json::to_string(&tag).unwrap(),
            r#"{"key":"http.status_code","type":"int64","value":404}"#
        );

        let tag = KeyValue::string("peer.service", "frontend");
        assert_eq!(
            serde_json::to_string(&tag).unwrap(),
            r#"{"key":"peer.service","type":"string","value":"frontend"}"#
        );

        let decoded: KeyValue =
            serde_json::from_str(r#"{"key":"error","type":"bool","value":true}"#).unwrap();
        assert_eq!(decoded, KeyValue::bool("error", true));
    }

    #[test]
    fn test_maybe_add_parent_span_id() {
        let trace_id = TraceId::new(0, 7);
        let parent = SpanId(3);

        // Zero parent id adds nothing.
        let references = maybe_add_parent_span_id(trace_id, SpanId(0), Vec::new());
        assert!(references.is_empty());

        // A missing parent reference is prepended.
        let references = maybe_add_parent_span_id(trace_id, parent, Vec::new());
        assert_eq!(references.len(), 1);
        assert_eq!(references[0].ref_type, RefType::ChildOf);
        assert_eq!(references[0].span_id, parent);

        // An existing reference to the parent is left alone.
        let existing = vec![SpanRef {
            ref_type: RefType::FollowsFrom,
            trace_id,
            span_id: parent,
        }];
        let references = maybe_add_parent_span_id(trace_id, parent, existing.clone());
        assert_eq!(references, existing);
    }

    #[test]
    fn test_span_hash_code_is_deterministic_and_content_sensitive() {
        let span = sample_span();
        assert_eq!(span.hash_code(), sample_span().hash_code());

        let mut renamed = sample_span();
        renamed.operation_name = "something-else".to_string();
        assert_ne!(span.hash_code(), renamed.hash_code());
    }

    #[test]
    fn test_parent_span_id_last_child_of_wins() {
        let mut span = sample_span();
        let trace_id = span.trace_id;
        span.references = vec![
            SpanRef {
                ref_type: RefType::ChildOf,
                trace_id,
                span_id: SpanId(1),
            },
            SpanRef {
                ref_type: RefType::FollowsFrom,
                trace_id,
                span_id: SpanId(2),
            },
            SpanRef {
                ref_type: RefType::ChildOf,
                trace_id,
                span_id: SpanId(3),
            },
        ];
        assert_eq!(span.parent_span_id(), Some(SpanId(3)));

        span.references.clear();
        assert_eq!(span.parent_span_id(), None);
    }

    fn sample_span() -> Span {
        Span {
            trace_id: TraceId::new(0, 0xdead_beef),
            span_id: SpanId(0x42),
            operation_name: "GET /api/users".to_string(),
            references: vec![SpanRef {
                ref_type: RefType::ChildOf,
                trace_id: TraceId::new(0, 0xdead_beef),
                span_id: SpanId(0x41),
            }],
            flags: 1,
            start_time: time_from_epoch_micros(1_700_000_000_000_000),
            duration: Duration::from_micros(1_500),
            tags: vec![
                KeyValue::int64("http.status_code", 200),
                KeyValue::string("peer.service", "frontend"),
            ],
            logs: vec![Log {
                timestamp: 1_700_000_000_000_100,
                fields: vec![KeyValue::string("event", "cache-miss")],
            }],
            process: Process::new("user-service", vec![KeyValue::string("host", "web-1")]),
        }
    }
}

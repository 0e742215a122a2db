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

//! MySQL-backed span storage for a distributed tracing collector.
//!
//! Spans accepted through [`SpanWriter`] flow into a bounded in-memory queue
//! drained by batching workers that coalesce them into multi-row inserts.
//! [`SpanReader`] reconstructs traces from the database and translates
//! structured search parameters into filtered queries. A retention task
//! deletes aged rows in bounded chunks. Delivery is best effort: when the
//! queue is full, spans are dropped and counted rather than blocking the
//! instrumented application.

use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
mod storage;

pub use config::MysqlStorageConfig;
pub use error::{StorageError, StorageResult};
pub use model::{DependencyLink, Span, Trace, TraceId, TraceQuery};
pub use storage::{MysqlDependencyReader, MysqlSpanReader, MysqlSpanWriter, MysqlTraceStorage};

/// Read access to stored traces.
#[async_trait]
pub trait SpanReader: Send + Sync {
    /// Returns the trace with the given id. A trace with no stored spans
    /// comes back empty, not as an error.
    async fn get_trace(&self, trace_id: TraceId) -> StorageResult<Trace>;

    /// Lists every service name ever observed.
    async fn get_services(&self) -> StorageResult<Vec<String>>;

    /// Lists the operation names observed for a service.
    async fn get_operations(&self, service: &str) -> StorageResult<Vec<String>>;

    /// Returns the ids of the traces matching `query`.
    async fn find_trace_ids(&self, query: &TraceQuery) -> StorageResult<Vec<TraceId>>;

    /// Returns the traces matching `query`, spans included.
    async fn find_traces(&self, query: &TraceQuery) -> StorageResult<Vec<Trace>>;
}

/// Write access to the span store.
#[async_trait]
pub trait SpanWriter: Send + Sync {
    /// Accepts a span for asynchronous persistence. Always succeeds: spans
    /// that cannot be enqueued are dropped and surface through the
    /// `mysql_span_drop_count` counter only.
    async fn write_span(&self, span: &Span) -> StorageResult<()>;
}

/// Derives service dependency edges from stored traces.
#[async_trait]
pub trait DependencyReader: Send + Sync {
    /// Aggregates caller -> callee call counts over spans whose start time
    /// falls within `[end_time - lookback, end_time]`.
    async fn get_dependencies(
        &self,
        end_time: OffsetDateTime,
        lookback: Duration,
    ) -> StorageResult<Vec<DependencyLink>>;
}

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
use std::time::Duration;

use async_trait::async_trait;
use itertools::Itertools;
use time::OffsetDateTime;
use tracing::warn;

use super::reader::MysqlSpanReader;
use crate::error::StorageResult;
use crate::model::{DependencyLink, SpanId, Trace, TraceQuery};
use crate::{DependencyReader, SpanReader};

/// Upper bound on traces scanned per dependency query.
const DEPENDENCY_SCAN_NUM_TRACES: i32 = 1_000;

/// Derives service dependency edges from stored traces: for every span with
/// a resolvable parent, the parent's service called the span's service once.
pub struct MysqlDependencyReader {
    reader: MysqlSpanReader,
}

impl MysqlDependencyReader {
    pub(super) fn new(reader: MysqlSpanReader) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl DependencyReader for MysqlDependencyReader {
    async fn get_dependencies(
        &self,
        end_time: OffsetDateTime,
        lookback: Duration,
    ) -> StorageResult<Vec<DependencyLink>> {
        let query = TraceQuery {
            start_time_min: Some(end_time - lookback),
            start_time_max: Some(end_time),
            num_traces: DEPENDENCY_SCAN_NUM_TRACES,
            ..Default::default()
        };
        let traces = self.reader.find_traces(&query).await?;
        if traces.len() == DEPENDENCY_SCAN_NUM_TRACES as usize {
            warn!(
                num_traces = traces.len(),
                "dependency scan hit the trace cap, call counts may be truncated"
            );
        }
        Ok(aggregate_dependencies(&traces))
    }
}

fn aggregate_dependencies(traces: &[Trace]) -> Vec<DependencyLink> {
    let mut call_counts: HashMap<(String, String), u64> = HashMap::new();
    for trace in traces {
        let service_by_span_id: HashMap<SpanId, &str> = trace
            .spans
            .iter()
            .map(|span| (span.span_id, span.process.service_name.as_str()))
            .collect();
        for span in &trace.spans {
            let Some(parent_span_id) = span.parent_span_id() else {
                continue;
            };
            // Parents outside the trace (orphaned rows) contribute nothing.
            let Some(parent_service) = service_by_span_id.get(&parent_span_id) else {
                continue;
            };
            let edge = (
                parent_service.to_string(),
                span.process.service_name.clone(),
            );
            *call_counts.entry(edge).or_default() += 1;
        }
    }
    call_counts
        .into_iter()
        .sorted()
        .map(|((parent, child), call_count)| DependencyLink {
            parent,
            child,
            call_count,
        })
        .collect()
}

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

use std::sync::Arc;

use async_trait::async_trait;
use flume::TrySendError;
use prometheus::IntCounter;
use tracing::debug;

use super::cache::NameCache;
use super::dbmodel::{from_domain, SpanRow};
use crate::error::StorageResult;
use crate::model::Span;
use crate::SpanWriter;

/// Accepts spans and hands them to the batching workers through the bounded
/// queue. The enqueue never waits: a full queue drops the span and bumps
/// `mysql_span_drop_count`.
pub struct MysqlSpanWriter {
    queue_tx: flume::Sender<SpanRow>,
    cache: Arc<NameCache>,
    span_drop_count: IntCounter,
}

impl MysqlSpanWriter {
    pub(super) fn new(
        queue_tx: flume::Sender<SpanRow>,
        cache: Arc<NameCache>,
        span_drop_count: IntCounter,
    ) -> Self {
        Self {
            queue_tx,
            cache,
            span_drop_count,
        }
    }
}

#[async_trait]
impl SpanWriter for MysqlSpanWriter {
    async fn write_span(&self, span: &Span) -> StorageResult<()> {
        let row = from_domain(span);
        let service_name = row.service_name.clone();
        let operation_name = row.operation_name.clone();

        match self.queue_tx.try_send(row) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("ingest queue full, dropping span");
                self.span_drop_count.inc();
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("ingest queue closed, dropping span");
                self.span_drop_count.inc();
            }
        }

        self.cache.update_caches(&service_name, &operation_name).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sqlx::mysql::MySqlPoolOptions;
    use sqlx::MySqlPool;

    use super::*;
    use crate::model::{KeyValue, Process, SpanId, TraceId};

    fn unreachable_pool() -> MySqlPool {
        MySqlPoolOptions::new()
            .acquire_timeout(Duration::from_millis(50))
            .connect_lazy("mysql://root:@127.0.0.1:1/unreachable")
            .unwrap()
    }

    fn make_span(index: u64) -> Span {
        Span {
            trace_id: TraceId::new(0, index + 1),
            span_id: SpanId(index + 1),
            operation_name: "op".to_string(),
            references: Vec::new(),
            flags: 0,
            start_time: crate::model::time_from_epoch_micros(1_700_000_000_000_000),
            duration: Duration::from_micros(100),
            tags: vec![KeyValue::int64("http.status_code", 200)],
            logs: Vec::new(),
            process: Process::new("s", Vec::new()),
        }
    }

    #[tokio::test]
    async fn test_write_span_drops_on_full_queue() {
        let (queue_tx, queue_rx) = flume::bounded(4);
        let span_drop_count =
            IntCounter::new("test_span_drop_count", "test counter").unwrap();
        let cache = Arc::new(NameCache::new(unreachable_pool()));
        let writer = MysqlSpanWriter::new(queue_tx, cache, span_drop_count.clone());

        // No worker drains the queue: the first 4 spans fill it, the
        // remaining 6 are dropped, and every call still reports success.
        for index in 0..10 {
            writer.write_span(&make_span(index)).await.unwrap();
        }
        assert_eq!(span_drop_count.get(), 6);
        assert_eq!(queue_rx.len(), 4);
    }

    #[tokio::test]
    async fn test_write_span_counts_disconnected_queue_as_drop() {
        let (queue_tx, queue_rx) = flume::bounded(4);
        drop(queue_rx);
        let span_drop_count =
            IntCounter::new("test_span_drop_disconnected", "test counter").unwrap();
        let cache = Arc::new(NameCache::new(unreachable_pool()));
        let writer = MysqlSpanWriter::new(queue_tx, cache, span_drop_count.clone());

        writer.write_span(&make_span(0)).await.unwrap();
        assert_eq!(span_drop_count.get(), 1);
    }
}

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
use std::time::Duration;

use prometheus::IntCounter;
use sea_query::{MysqlQueryBuilder, Query};
use sea_query_binder::SqlxBinder;
use sqlx::MySqlPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

use super::dbmodel::{SpanRow, Traces, TRACES_COLUMNS};
use crate::error::{StorageError, StorageResult};

/// Drains the ingest queue with a pool of batching workers.
///
/// Each worker coalesces spans into a local buffer and flushes it as one
/// multi-row INSERT when it reaches `batch_size`, or after `linger` once the
/// first span arrived. A failed insert is logged, counted, and its batch
/// dropped; there is no retry.
pub(super) struct BatchIngester {
    pool: MySqlPool,
    queue_rx: flume::Receiver<SpanRow>,
    batch_size: usize,
    linger: Duration,
    insert_error_count: IntCounter,
}

impl BatchIngester {
    pub fn new(
        pool: MySqlPool,
        queue_rx: flume::Receiver<SpanRow>,
        batch_size: usize,
        linger: Duration,
        insert_error_count: IntCounter,
    ) -> Self {
        Self {
            pool,
            queue_rx,
            batch_size,
            linger,
            insert_error_count,
        }
    }

    pub fn spawn_workers(
        self: Arc<Self>,
        num_workers: usize,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..num_workers)
            .map(|worker_id| {
                let ingester = self.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move { ingester.run_worker(worker_id, shutdown_rx).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker_id: usize, mut shutdown_rx: watch::Receiver<bool>) {
        debug!(worker_id, "batch worker started");
        let mut batch: Vec<SpanRow> = Vec::with_capacity(self.batch_size);
        // Armed only while the batch is non-empty, on the 0 -> 1 transition.
        let mut linger_deadline = Instant::now();

        loop {
            if batch.is_empty() {
                tokio::select! {
                    recv_result = self.queue_rx.recv_async() => match recv_result {
                        Ok(span) => {
                            linger_deadline = Instant::now() + self.linger;
                            batch.push(span);
                            if batch.len() == self.batch_size {
                                self.flush(&mut batch).await;
                            }
                        }
                        Err(_) => break,
                    },
                    _ = shutdown_rx.changed() => break,
                }
            } else {
                tokio::select! {
                    recv_result = self.queue_rx.recv_async() => match recv_result {
                        Ok(span) => {
                            batch.push(span);
                            if batch.len() == self.batch_size {
                                self.flush(&mut batch).await;
                            }
                        }
                        Err(_) => break,
                    },
                    _ = tokio::time::sleep_until(linger_deadline) => {
                        self.flush(&mut batch).await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        }

        // Accepted spans still in the queue are drained before exiting.
        while let Ok(span) = self.queue_rx.try_recv() {
            batch.push(span);
            if batch.len() == self.batch_size {
                self.flush(&mut batch).await;
            }
        }
        self.flush(&mut batch).await;
        debug!(worker_id, "batch worker stopped");
    }

    async fn flush(&self, batch: &mut Vec<SpanRow>) {
        if batch.is_empty() {
            return;
        }
        let num_spans = batch.len();
        match self.batch_insert(batch).await {
            Ok(()) => debug!(num_spans, "flushed span batch"),
            Err(insert_error) => {
                error!(error=%insert_error, num_spans, "batch insert failed, dropping batch");
                self.insert_error_count.inc();
            }
        }
        batch.clear();
    }

    async fn batch_insert(&self, batch: &[SpanRow]) -> StorageResult<()> {
        let mut statement = Query::insert();
        statement.into_table(Traces::Table).columns(TRACES_COLUMNS);
        for span in batch {
            statement
                .values([
                    span.trace_id.clone().into(),
                    span.span_id.into(),
                    span.span_hash.into(),
                    span.parent_id.into(),
                    span.operation_name.clone().into(),
                    span.flags.into(),
                    span.start_time.into(),
                    span.duration.into(),
                    span.tags.clone().into(),
                    span.logs.clone().into(),
                    span.refs.clone().into(),
                    span.process.clone().into(),
                    span.service_name.clone().into(),
                    span.http_code.into(),
                    span.error.into(),
                ])
                .map_err(|build_error| StorageError::Internal {
                    message: build_error.to_string(),
                })?;
        }
        let (sql, values) = statement.build_sqlx(MysqlQueryBuilder);
        sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(())
    }
}

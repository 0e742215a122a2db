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

mod cache;
mod dbmodel;
mod dependencies;
mod ingest;
mod migrator;
mod reader;
mod retention;
mod writer;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::MySqlPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub use self::dependencies::MysqlDependencyReader;
pub use self::reader::MysqlSpanReader;
pub use self::writer::MysqlSpanWriter;
use self::cache::NameCache;
use self::dbmodel::SpanRow;
use self::ingest::BatchIngester;
use self::migrator::run_migrations;
use self::retention::RetentionExecutor;
use crate::config::MysqlStorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::metrics::STORAGE_METRICS;

const ACQUIRE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Wires the span storage backend: connection pool, warm name cache,
/// bounded ingest queue, batching workers, and the retention loop.
pub struct MysqlTraceStorage {
    pool: MySqlPool,
    cache: Arc<NameCache>,
    queue_tx: flume::Sender<SpanRow>,
    shutdown_tx: watch::Sender<bool>,
    worker_handles: Vec<JoinHandle<()>>,
    retention_handle: JoinHandle<()>,
}

impl MysqlTraceStorage {
    /// Initializes the storage backend: connects, migrates, warms the name
    /// cache, and starts the batching workers and the retention loop.
    pub async fn new(config: &MysqlStorageConfig) -> StorageResult<Self> {
        config
            .validate()
            .map_err(|validation_error| StorageError::Internal {
                message: validation_error.to_string(),
            })?;

        let pool = establish_connection(
            &config.connection_url(),
            config.max_connections.get() as u32,
        )
        .await?;
        run_migrations(&pool).await?;

        let cache = Arc::new(NameCache::new(pool.clone()));
        cache.initialize().await;

        let (queue_tx, queue_rx) = flume::bounded(config.queue_length);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ingester = Arc::new(BatchIngester::new(
            pool.clone(),
            queue_rx,
            config.batch_size,
            config.linger_time(),
            STORAGE_METRICS.batch_insert_error_count.clone(),
        ));
        let worker_handles = ingester.spawn_workers(config.workers, &shutdown_rx);

        let retention_handle =
            RetentionExecutor::new(pool.clone(), config.expired_days, config.retention_interval())
                .spawn(shutdown_rx);

        info!(
            num_workers = config.workers,
            queue_length = config.queue_length,
            batch_size = config.batch_size,
            "mysql span storage initialized"
        );
        Ok(Self {
            pool,
            cache,
            queue_tx,
            shutdown_tx,
            worker_handles,
            retention_handle,
        })
    }

    pub fn span_reader(&self) -> MysqlSpanReader {
        MysqlSpanReader::new(self.pool.clone(), self.cache.clone())
    }

    pub fn span_writer(&self) -> MysqlSpanWriter {
        MysqlSpanWriter::new(
            self.queue_tx.clone(),
            self.cache.clone(),
            STORAGE_METRICS.span_drop_count.clone(),
        )
    }

    pub fn dependency_reader(&self) -> MysqlDependencyReader {
        MysqlDependencyReader::new(self.span_reader())
    }

    /// Shuts the backend down: signals the workers and the retention loop,
    /// waits for the workers to drain the queue, and closes the pool. Spans
    /// written after this point are dropped.
    pub async fn close(self) {
        let _ = self.shutdown_tx.send(true);
        for worker_handle in self.worker_handles {
            if let Err(join_error) = worker_handle.await {
                error!(error=%join_error, "batch worker panicked");
            }
        }
        if let Err(join_error) = self.retention_handle.await {
            error!(error=%join_error, "retention loop panicked");
        }
        self.pool.close().await;
        info!("mysql span storage closed");
    }
}

async fn establish_connection(
    connection_url: &str,
    max_connections: u32,
) -> StorageResult<MySqlPool> {
    let connect_options = MySqlConnectOptions::from_str(connection_url).map_err(
        |parse_error| StorageError::Connection {
            message: parse_error.to_string(),
        },
    )?;
    MySqlPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_CONNECTION_TIMEOUT)
        .connect_with(connect_options)
        .await
        .map_err(|connect_error| {
            error!(error=%connect_error, "failed to establish connection to database");
            StorageError::Connection {
                message: connect_error.to_string(),
            }
        })
}

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

use std::time::Duration;

use sea_query::{Expr, MysqlQueryBuilder, Query};
use sea_query_binder::SqlxBinder;
use sqlx::MySqlPool;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use super::dbmodel::Traces;

/// Rows deleted per DELETE statement.
const DELETE_CHUNK_SIZE: u64 = 1_000;

/// Pause between consecutive DELETE chunks within one retention pass.
const DELETE_CHUNK_PAUSE: Duration = Duration::from_secs(1);

const SECONDS_PER_DAY: i64 = 86_400;
const MICROS_PER_SECOND: i64 = 1_000_000;

/// Periodically deletes trace rows older than the retention threshold.
pub(super) struct RetentionExecutor {
    pool: MySqlPool,
    expired_days: u64,
    interval: Duration,
}

impl RetentionExecutor {
    pub fn new(pool: MySqlPool, expired_days: u64, interval: Duration) -> Self {
        Self {
            pool,
            expired_days,
            interval,
        }
    }

    pub fn spawn(self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown_rx))
    }

    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            expired_days = self.expired_days,
            interval_secs = self.interval.as_secs(),
            "trace retention loop started"
        );
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_retention_pass().await,
                _ = shutdown_rx.changed() => {
                    info!("trace retention loop stopped");
                    return;
                }
            }
        }
    }

    /// Deletes expired rows in bounded chunks until a chunk comes back
    /// short. Errors abandon the pass; the next tick retries.
    async fn run_retention_pass(&self) {
        let cutoff_micros = delete_cutoff_micros(OffsetDateTime::now_utc(), self.expired_days);
        let mut statement = Query::delete();
        statement
            .from_table(Traces::Table)
            .and_where(Expr::col(Traces::StartTime).lte(cutoff_micros))
            .limit(DELETE_CHUNK_SIZE);

        let mut num_deleted_rows = 0u64;
        loop {
            let (sql, values) = statement.build_sqlx(MysqlQueryBuilder);
            match sqlx::query_with(&sql, values).execute(&self.pool).await {
                Ok(query_result) => {
                    num_deleted_rows += query_result.rows_affected();
                    if query_result.rows_affected() < DELETE_CHUNK_SIZE {
                        break;
                    }
                }
                Err(delete_error) => {
                    warn!(error=%delete_error, "failed to delete expired trace rows");
                    break;
                }
            }
            tokio::time::sleep(DELETE_CHUNK_PAUSE).await;
        }
        info!(num_deleted_rows, cutoff_micros, "trace retention pass complete");
    }
}

/// The microsecond timestamp below which rows are eligible for deletion:
/// `expired_days` before `now`, truncated to whole seconds.
fn delete_cutoff_micros(now: OffsetDateTime, expired_days: u64) -> i64 {
    (now.unix_timestamp() - expired_days as i64 * SECONDS_PER_DAY) * MICROS_PER_SECOND
}

#[cfg(test)]
mod tests {
    use sqlx::mysql::MySqlPoolOptions;

    use super::*;

    #[test]
    fn test_delete_cutoff_micros() {
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        assert_eq!(
            delete_cutoff_micros(now, 7),
            (1_700_000_000 - 604_800) * 1_000_000
        );
        assert_eq!(delete_cutoff_micros(now, 0), 1_700_000_000 * 1_000_000);
    }

    #[tokio::test]
    async fn test_retention_loop_stops_on_shutdown() {
        let pool = MySqlPoolOptions::new()
            .acquire_timeout(Duration::from_millis(50))
            .connect_lazy("mysql://root:@127.0.0.1:1/unreachable")
            .unwrap();
        let executor = RetentionExecutor::new(pool, 7, Duration::from_secs(1_800));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = executor.spawn(shutdown_rx);
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("retention loop should stop promptly")
            .unwrap();
    }
}

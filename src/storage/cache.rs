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

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use sqlx::MySqlPool;
use tracing::{error, info, warn};

use crate::error::StorageResult;

const INSERT_SERVICE_NAME: &str =
    "INSERT IGNORE INTO service_names (service_name) VALUES (?)";
const INSERT_OPERATION_NAME: &str =
    "INSERT IGNORE INTO operation_names (service_name, operation_name) VALUES (?, ?)";
const QUERY_SERVICE_NAMES: &str = "SELECT service_name FROM service_names";
const QUERY_OPERATION_NAMES: &str =
    "SELECT operation_name FROM operation_names WHERE service_name = ?";

/// Which name-table rows a newly observed (service, operation) pair needs.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum NameInsert {
    ServiceAndOperation,
    Operation,
    None,
}

/// In-memory mirror of the `service_names`/`operation_names` tables.
///
/// The cache suppresses redundant inserts on the hot write path; it does not
/// serve reads. `load_services`/`load_operations` always go to the database,
/// surfacing out-of-band insertions. The mirror is lossy: `INSERT IGNORE`
/// and the tables' primary keys absorb both races between writers and
/// swallowed insert failures.
pub(super) struct NameCache {
    pool: MySqlPool,
    inner: Mutex<HashMap<String, HashSet<String>>>,
}

impl NameCache {
    pub fn new(pool: MySqlPool) -> Self {
        Self {
            pool,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Warm-loads the cache from the name tables. Failures are logged and
    /// whatever loaded so far is kept; initialization itself never fails.
    pub async fn initialize(&self) {
        let service_names = match self.load_services().await {
            Ok(service_names) => service_names,
            Err(load_error) => {
                error!(error=%load_error, "failed to load service names, starting with a cold cache");
                return;
            }
        };
        let mut loaded: HashMap<String, HashSet<String>> = HashMap::new();
        for service_name in service_names {
            let operation_names = match self.load_operations(&service_name).await {
                Ok(operation_names) => operation_names,
                Err(load_error) => {
                    error!(service=%service_name, error=%load_error, "failed to load operation names");
                    Vec::new()
                }
            };
            loaded.insert(service_name, operation_names.into_iter().collect());
        }
        let num_services = loaded.len();
        *self.inner.lock().unwrap() = loaded;
        info!(num_services, "warmed service/operation name cache");
    }

    /// Records a (service, operation) pair, mirroring first observations to
    /// the name tables. Database errors are logged and swallowed; the
    /// in-memory cache reflects the pair either way.
    pub async fn update_caches(&self, service: &str, operation: &str) {
        // The decision happens under the lock; the inserts run outside it.
        // The mutex is never held across database I/O.
        let pending_insert = self.note_pair(service, operation);
        match pending_insert {
            NameInsert::ServiceAndOperation => {
                if let Err(insert_error) = sqlx::query(INSERT_SERVICE_NAME)
                    .bind(service)
                    .execute(&self.pool)
                    .await
                {
                    warn!(service, error=%insert_error, "failed to insert service name");
                }
                self.insert_operation_name(service, operation).await;
            }
            NameInsert::Operation => {
                self.insert_operation_name(service, operation).await;
            }
            NameInsert::None => {}
        }
    }

    /// Lists all service names from the database.
    pub async fn load_services(&self) -> StorageResult<Vec<String>> {
        let service_names: Vec<String> = sqlx::query_scalar(QUERY_SERVICE_NAMES)
            .fetch_all(&self.pool)
            .await?;
        Ok(service_names)
    }

    /// Lists the operation names of a service from the database.
    pub async fn load_operations(&self, service: &str) -> StorageResult<Vec<String>> {
        let operation_names: Vec<String> = sqlx::query_scalar(QUERY_OPERATION_NAMES)
            .bind(service)
            .fetch_all(&self.pool)
            .await?;
        Ok(operation_names)
    }

    fn note_pair(&self, service: &str, operation: &str) -> NameInsert {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(service) {
            None => {
                let mut operations = HashSet::new();
                operations.insert(operation.to_string());
                inner.insert(service.to_string(), operations);
                NameInsert::ServiceAndOperation
            }
            Some(operations) => {
                if operations.insert(operation.to_string()) {
                    NameInsert::Operation
                } else {
                    NameInsert::None
                }
            }
        }
    }

    async fn insert_operation_name(&self, service: &str, operation: &str) {
        if let Err(insert_error) = sqlx::query(INSERT_OPERATION_NAME)
            .bind(service)
            .bind(operation)
            .execute(&self.pool)
            .await
        {
            warn!(service, operation, error=%insert_error, "failed to insert operation name");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sqlx::mysql::MySqlPoolOptions;

    use super::*;

    /// A pool pointing at nothing, with a short acquire timeout so swallowed
    /// errors come back quickly.
    fn unreachable_pool() -> MySqlPool {
        MySqlPoolOptions::new()
            .acquire_timeout(Duration::from_millis(50))
            .connect_lazy("mysql://root:@127.0.0.1:1/unreachable")
            .unwrap()
    }

    #[tokio::test]
    async fn test_note_pair_transitions() {
        let cache = NameCache::new(unreachable_pool());

        assert_eq!(cache.note_pair("s", "op"), NameInsert::ServiceAndOperation);
        assert_eq!(cache.note_pair("s", "op"), NameInsert::None);
        assert_eq!(cache.note_pair("s", "op2"), NameInsert::Operation);
        assert_eq!(cache.note_pair("s", "op2"), NameInsert::None);
        assert_eq!(cache.note_pair("t", "op"), NameInsert::ServiceAndOperation);
    }

    #[tokio::test]
    async fn test_update_caches_survives_database_failures() {
        let cache = NameCache::new(unreachable_pool());

        // The insert fails (nothing is listening) but the in-memory cache
        // still reflects the pair, so the second observation is a no-op.
        cache.update_caches("s", "op").await;
        assert_eq!(cache.note_pair("s", "op"), NameInsert::None);
    }

    #[tokio::test]
    async fn test_initialize_with_unreachable_database_keeps_cold_cache() {
        let cache = NameCache::new(unreachable_pool());
        cache.initialize().await;
        assert_eq!(cache.note_pair("s", "op"), NameInsert::ServiceAndOperation);
    }
}

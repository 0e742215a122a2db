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

use sqlx::migrate::Migrator;
use sqlx::MySqlPool;
use tracing::error;

use crate::error::{StorageError, StorageResult};

static MIGRATOR: Migrator = sqlx::migrate!("migrations/mysql");

/// Applies the SQL migrations stored in the `migrations/mysql` directory.
pub(super) async fn run_migrations(pool: &MySqlPool) -> StorageResult<()> {
    if let Err(migrate_error) = MIGRATOR.run(pool).await {
        error!(error=%migrate_error, "failed to run MySQL migrations");
        return Err(StorageError::Db {
            message: format!("failed to run MySQL migrations: {migrate_error}"),
        });
    }
    Ok(())
}

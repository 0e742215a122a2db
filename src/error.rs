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

pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by the storage backend.
///
/// The write path never returns these to callers: dropped spans and failed
/// batch inserts are only observable through the `mysql_*` counters. The read
/// path surfaces `QueryFailed` but swallows row-level decode failures.
/// Driver failures elsewhere (cache loads, batch inserts, migrations) carry
/// the `Db` variant.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StorageError {
    #[error("connection error: {message}")]
    Connection { message: String },

    #[error("database error: {message}")]
    Db { message: String },

    #[error("query failed: {message}")]
    QueryFailed { message: String },

    #[error("malformed trace id `{trace_id}`")]
    MalformedTraceId { trace_id: String },

    #[error("malformed JSON in column `{column}`: {cause}")]
    MalformedJson { column: String, cause: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl From<sqlx::Error> for StorageError {
    fn from(error: sqlx::Error) -> Self {
        StorageError::Db {
            message: error.to_string(),
        }
    }
}

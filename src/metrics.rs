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

use once_cell::sync::Lazy;
use prometheus::{IntCounter, Opts};

pub fn new_counter(name: &str, description: &str, namespace: &str) -> IntCounter {
    let counter_opts = Opts::new(name, description).namespace(namespace);
    let counter = IntCounter::with_opts(counter_opts).expect("failed to create counter");
    prometheus::register(Box::new(counter.clone())).expect("failed to register counter");
    counter
}

pub struct StorageMetrics {
    /// Incremented once per span dropped on ingest queue overflow.
    pub span_drop_count: IntCounter,
    /// Incremented once per failed batch INSERT into the `traces` table.
    pub batch_insert_error_count: IntCounter,
}

impl Default for StorageMetrics {
    fn default() -> Self {
        Self {
            span_drop_count: new_counter(
                "span_drop_count",
                "Number of spans dropped because the ingest queue was full.",
                "mysql",
            ),
            batch_insert_error_count: new_counter(
                "batch_insert_error_count",
                "Number of failed batch inserts into the traces table.",
                "mysql",
            ),
        }
    }
}

pub static STORAGE_METRICS: Lazy<StorageMetrics> = Lazy::new(StorageMetrics::default);

// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tracer configuration.
//!
//! Plain data with sensible defaults; loading these values from files or
//! the environment is the host application's job.

use std::time::Duration;

/// Configuration for a [`Tracer`](crate::tracer::Tracer) instance.
#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// Default `agent_id` stamped on every span this tracer opens.
    pub agent_id: Option<String>,

    /// Capacity of the bounded export queue. When full, newly submitted
    /// spans are dropped (see the exporter's backpressure policy).
    pub queue_capacity: usize,

    /// Flush a batch to storage once it reaches this many spans.
    pub batch_max_spans: usize,

    /// Flush a partial batch after this long, bounding end-to-end
    /// visibility latency.
    pub flush_interval: Duration,

    /// How many times a failed batch write is retried before the batch
    /// is dropped.
    pub export_max_retries: u32,

    /// Base delay between batch-write retries; grows linearly per attempt.
    pub export_retry_backoff: Duration,

    /// Deadline for the final flush during shutdown; spans still queued
    /// after this are discarded with a warning.
    pub shutdown_timeout: Duration,

    /// Delete traces whose root span is older than this many days.
    /// `None` disables automatic deletion.
    pub retention_days: Option<u32>,

    /// How often the retention sweep runs when `retention_days` is set.
    pub retention_sweep_interval: Duration,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            agent_id: None,
            queue_capacity: 2048,
            batch_max_spans: 64,
            flush_interval: Duration::from_millis(250),
            export_max_retries: 3,
            export_retry_backoff: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(5),
            retention_days: None,
            retention_sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl TracerConfig {
    /// Config for tests and local development: tiny batches, fast flushes.
    pub fn development() -> Self {
        Self {
            batch_max_spans: 8,
            flush_interval: Duration::from_millis(20),
            ..Self::default()
        }
    }

    /// Set the default agent id.
    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Set the export queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set the batch size threshold.
    pub fn with_batch_max_spans(mut self, max: usize) -> Self {
        self.batch_max_spans = max.max(1);
        self
    }

    /// Set the time-based flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the retention window in days. `None` disables deletion.
    pub fn with_retention_days(mut self, days: Option<u32>) -> Self {
        self.retention_days = days;
        self
    }
}

// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Retention enforcement.
//!
//! When a retention window is configured, a background task periodically
//! deletes traces whose root span started before `now - days`. Without a
//! window, nothing is ever deleted automatically.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::store::TraceStore;

/// Background sweep deleting traces older than the retention window.
pub struct RetentionTask {
    handle: JoinHandle<()>,
}

impl RetentionTask {
    /// Spawn the sweep task. The first sweep runs immediately, then every
    /// `sweep_interval`. Must be called from within a tokio runtime.
    pub fn start(store: Arc<dyn TraceStore>, days: u32, sweep_interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let cutoff = Utc::now() - chrono::Duration::days(days as i64);
                let store = Arc::clone(&store);

                match tokio::task::spawn_blocking(move || store.delete_before(cutoff)).await {
                    Ok(Ok(0)) => debug!("Retention sweep found nothing to delete"),
                    Ok(Ok(removed)) => {
                        info!(removed, retention_days = days, "Retention sweep deleted old traces")
                    }
                    Ok(Err(err)) => warn!(error = %err, "Retention sweep failed"),
                    Err(err) => warn!(error = %err, "Retention sweep task failed"),
                }
            }
        });

        Self { handle }
    }

    /// Stop the sweep. Any in-flight delete finishes on the blocking pool.
    pub fn stop(self) {
        self.handle.abort();
    }
}

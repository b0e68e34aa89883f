//! Extraction worker
//!
//! Drains pending responses in batches. Each response is claimed through
//! the pending->processing CAS inside `process_response`, so any number
//! of workers (or a worker racing a manual RPC trigger) stays safe; the
//! shared LLM semaphore bounds actual endpoint concurrency.

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::core::checkin_control::CheckinControl;

pub struct ExtractionWorker {
    control: Arc<CheckinControl>,
    batch_size: i64,
}

impl ExtractionWorker {
    pub fn new(control: Arc<CheckinControl>, batch_size: i64) -> Self {
        Self { control, batch_size }
    }

    /// One drain pass. Returns how many responses completed successfully.
    pub async fn run_once(&self) -> Result<usize> {
        let pending = self.control.db().pending_responses(self.batch_size)?;
        if pending.is_empty() {
            return Ok(0);
        }
        debug!(count = pending.len(), "Extraction worker picked up pending responses");

        let mut tasks = JoinSet::new();
        for response in pending {
            let control = self.control.clone();
            tasks.spawn(async move {
                match control.process_response(&response.id).await {
                    Ok(done) => done,
                    Err(e) => {
                        warn!(response_id = %response.id, error = %e, "Extraction task failed");
                        false
                    }
                }
            });
        }

        let mut completed = 0;
        while let Some(result) = tasks.join_next().await {
            if matches!(result, Ok(true)) {
                completed += 1;
            }
        }
        Ok(completed)
    }
}

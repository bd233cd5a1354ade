use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::ingest::{Ingestor, RunOptions, RunResult};

const SUSPENDED_DELAY: Duration = Duration::from_secs(1);
const ERROR_DELAY_START: Duration = Duration::from_secs(10);
const ERROR_DELAY_MAX: Duration = Duration::from_secs(120);

/// Picks the pause before the next scheduled run
#[derive(Debug, Clone)]
pub struct Schedule {
    poll_interval: Duration,
    retry_delay: Duration, // error backoff
}

impl Schedule {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            retry_delay: ERROR_DELAY_START,
        }
    }

    pub fn next_delay(&mut self, result: &RunResult) -> Duration {
        if !matches!(result, RunResult::Error { .. }) {
            self.retry_delay = ERROR_DELAY_START;
        }

        match result {
            RunResult::Done(_) | RunResult::AlreadyRunning => self.poll_interval,
            RunResult::Suspended { .. } => SUSPENDED_DELAY,
            RunResult::Cooldown { retry_after_ms, .. } => Duration::from_millis(*retry_after_ms),
            RunResult::Error { .. } => {
                let delay = self.retry_delay;
                self.retry_delay = (self.retry_delay * 2).min(ERROR_DELAY_MAX);
                delay
            }
        }
    }
}

/// Run ingestion forever, backing off according to each result
pub async fn run(ingestor: Arc<Ingestor>, options: RunOptions, poll_interval: Duration) -> eyre::Result<()> {
    let mut schedule = Schedule::new(poll_interval);
    info!(
        "Indexer started (page size {}, budget {:?}, poll every {:?})",
        options.page_size, options.time_budget, poll_interval
    );

    loop {
        let result = ingestor.run(options).await;
        let delay = schedule.next_delay(&result);

        match &result {
            RunResult::Error { message, .. } => {
                warn!("Run failed: {}. Retrying in {:?}", message, delay)
            }
            other => {
                let ledger_size = ingestor.ledger().len();
                info!(
                    "Run {} ({} transactions in ledger), next in {:?}",
                    other.label(),
                    ledger_size,
                    delay
                );
            }
        }

        sleep(delay).await;
    }
}

//! Retention scanner
//!
//! Background task that walks every mailbox and deletes messages older than
//! the retention window. Passes run at most once a minute, with a short pause
//! after each mailbox to spread the I/O.

use crate::error::Result;
use crate::metrics::Metrics;
use crate::storage::DataStore;
use chrono::{DateTime, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, trace, warn};

/// Minimum time between the start of two passes
const PASS_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of a single pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub deleted: u64,
    pub retained: u64,
}

pub struct RetentionScanner {
    store: Arc<dyn DataStore>,
    window: Duration,
    mailbox_sleep: Duration,
    metrics: Arc<Metrics>,
}

impl RetentionScanner {
    pub fn new(
        store: Arc<dyn DataStore>,
        window: Duration,
        mailbox_sleep: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            window,
            mailbox_sleep,
            metrics,
        }
    }

    /// Spawn the scanner loop. Returns `None` when retention is disabled.
    pub fn start(self) -> Option<JoinHandle<()>> {
        self.metrics.set_retention_period(self.window.as_secs());
        if self.window.is_zero() {
            info!("Retention scanner disabled");
            return None;
        }

        info!(
            "Retention configured for {} minutes",
            self.window.as_secs() / 60
        );
        Some(tokio::spawn(self.run()))
    }

    async fn run(self) {
        let mut started = Instant::now();
        loop {
            let elapsed = started.elapsed();
            if elapsed < PASS_INTERVAL {
                let remaining = PASS_INTERVAL - elapsed;
                trace!("Retention scanner sleeping for {:?}", remaining);
                sleep(remaining).await;
            }
            started = Instant::now();

            if let Err(e) = self.scan(Utc::now()).await {
                error!("Error during retention scan: {}", e);
            }
        }
    }

    /// One pass over all mailboxes, deleting messages received before `now - window`.
    ///
    /// A failed delete is logged and skipped; failing to enumerate mailboxes
    /// or messages aborts the pass without publishing metrics.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<ScanReport> {
        debug!("Starting retention scan");
        let cutoff = chrono::Duration::from_std(self.window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut report = ScanReport::default();

        for mailbox in self.store.all_mailboxes().await? {
            for message in mailbox.get_messages().await? {
                if message.date() >= cutoff {
                    report.retained += 1;
                    continue;
                }

                trace!("Purging expired message {} from {}", message.id(), mailbox.name());
                match message.delete().await {
                    Ok(()) => report.deleted += 1,
                    Err(e) => warn!("Failed to purge message {}: {}", message.id(), e),
                }
            }

            if !self.mailbox_sleep.is_zero() {
                sleep(self.mailbox_sleep).await;
            }
        }

        self.metrics
            .record_retention_pass(report.deleted, report.retained, Utc::now());
        info!(
            deleted = report.deleted,
            retained = report.retained,
            deleted_total = self.metrics.retention_deletes_total.load(Ordering::Relaxed),
            deletes_history = %self.metrics.retention_deletes_history(),
            retained_history = %self.metrics.retained_history(),
            "Retention scan complete"
        );
        Ok(report)
    }
}

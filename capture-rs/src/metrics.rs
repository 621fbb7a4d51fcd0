//! Server and retention counters, rendered in Prometheus text format

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Passes kept in the retention history
const HISTORY_LEN: usize = 50;

/// Metrics collector shared by sessions and the retention scanner
pub struct Metrics {
    /// Sessions accepted since start
    pub sessions_total: AtomicU64,
    /// Sessions currently open
    pub sessions_active: AtomicU64,
    /// Messages accepted (one per DATA transaction)
    pub messages_accepted_total: AtomicU64,
    /// Recipients refused by limits or domain policy
    pub recipients_rejected_total: AtomicU64,
    /// Messages deleted by retention
    pub retention_deletes_total: AtomicU64,
    /// Messages left after the last retention pass
    pub retained_current: AtomicU64,
    /// Retention window in seconds
    pub retention_period_seconds: AtomicU64,
    /// Unix timestamp of the last completed pass, 0 before the first
    retention_scan_completed: AtomicI64,
    history: Mutex<RetentionHistory>,
    start_time: Instant,
}

#[derive(Default)]
struct RetentionHistory {
    deletes: VecDeque<u64>,
    retained: VecDeque<u64>,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            sessions_total: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            messages_accepted_total: AtomicU64::new(0),
            recipients_rejected_total: AtomicU64::new(0),
            retention_deletes_total: AtomicU64::new(0),
            retained_current: AtomicU64::new(0),
            retention_period_seconds: AtomicU64::new(0),
            retention_scan_completed: AtomicI64::new(0),
            history: Mutex::new(RetentionHistory::default()),
            start_time: Instant::now(),
        }
    }

    pub fn session_opened(&self) {
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_messages_accepted(&self) {
        self.messages_accepted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_recipients_rejected(&self) {
        self.recipients_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_retention_period(&self, seconds: u64) {
        self.retention_period_seconds.store(seconds, Ordering::Relaxed);
    }

    /// Record a completed retention pass
    pub fn record_retention_pass(&self, deleted: u64, retained: u64, completed: DateTime<Utc>) {
        self.retention_deletes_total.fetch_add(deleted, Ordering::Relaxed);
        self.retained_current.store(retained, Ordering::Relaxed);
        self.retention_scan_completed
            .store(completed.timestamp(), Ordering::Relaxed);

        if let Ok(mut history) = self.history.lock() {
            push_bounded(&mut history.deletes, deleted);
            push_bounded(&mut history.retained, retained);
        }
    }

    /// Time of the last completed retention pass
    pub fn retention_scan_completed(&self) -> Option<DateTime<Utc>> {
        match self.retention_scan_completed.load(Ordering::Relaxed) {
            0 => None,
            ts => DateTime::from_timestamp(ts, 0),
        }
    }

    /// Deletes per pass, oldest first, comma-delimited
    pub fn retention_deletes_history(&self) -> String {
        self.history
            .lock()
            .map(|h| join(&h.deletes))
            .unwrap_or_default()
    }

    /// Retained count per pass, oldest first, comma-delimited
    pub fn retained_history(&self) -> String {
        self.history
            .lock()
            .map(|h| join(&h.retained))
            .unwrap_or_default()
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Format metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        format!(
            r#"# HELP capture_sessions_total Total SMTP sessions accepted
# TYPE capture_sessions_total counter
capture_sessions_total {}

# HELP capture_sessions_active Current open SMTP sessions
# TYPE capture_sessions_active gauge
capture_sessions_active {}

# HELP capture_messages_accepted_total Total messages accepted
# TYPE capture_messages_accepted_total counter
capture_messages_accepted_total {}

# HELP capture_recipients_rejected_total Total recipients refused
# TYPE capture_recipients_rejected_total counter
capture_recipients_rejected_total {}

# HELP capture_retention_deletes_total Total messages deleted by retention
# TYPE capture_retention_deletes_total counter
capture_retention_deletes_total {}

# HELP capture_retained_current Messages retained after the last pass
# TYPE capture_retained_current gauge
capture_retained_current {}

# HELP capture_retention_period_seconds Retention window
# TYPE capture_retention_period_seconds gauge
capture_retention_period_seconds {}

# HELP capture_retention_scan_completed_timestamp Last completed retention pass
# TYPE capture_retention_scan_completed_timestamp gauge
capture_retention_scan_completed_timestamp {}

# HELP capture_uptime_seconds Server uptime in seconds
# TYPE capture_uptime_seconds gauge
capture_uptime_seconds {}
"#,
            self.sessions_total.load(Ordering::Relaxed),
            self.sessions_active.load(Ordering::Relaxed),
            self.messages_accepted_total.load(Ordering::Relaxed),
            self.recipients_rejected_total.load(Ordering::Relaxed),
            self.retention_deletes_total.load(Ordering::Relaxed),
            self.retained_current.load(Ordering::Relaxed),
            self.retention_period_seconds.load(Ordering::Relaxed),
            self.retention_scan_completed.load(Ordering::Relaxed),
            self.uptime_seconds(),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn push_bounded(values: &mut VecDeque<u64>, value: u64) {
    if values.len() == HISTORY_LEN {
        values.pop_front();
    }
    values.push_back(value);
}

fn join(values: &VecDeque<u64>) -> String {
    values
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_counters() {
        let metrics = Metrics::new();
        metrics.session_opened();
        metrics.session_opened();
        metrics.session_closed();

        assert_eq!(metrics.sessions_total.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.sessions_active.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_retention_pass_and_history() {
        let metrics = Metrics::new();
        assert!(metrics.retention_scan_completed().is_none());

        let now = Utc::now();
        metrics.record_retention_pass(3, 10, now);
        metrics.record_retention_pass(0, 12, now);

        assert_eq!(metrics.retention_deletes_total.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.retained_current.load(Ordering::Relaxed), 12);
        assert_eq!(metrics.retention_deletes_history(), "3,0");
        assert_eq!(metrics.retained_history(), "10,12");
        assert_eq!(
            metrics.retention_scan_completed().map(|t| t.timestamp()),
            Some(now.timestamp())
        );
    }

    #[test]
    fn test_history_is_bounded() {
        let metrics = Metrics::new();
        for i in 0..(HISTORY_LEN as u64 + 5) {
            metrics.record_retention_pass(i, i, Utc::now());
        }
        let history = metrics.retention_deletes_history();
        assert_eq!(history.split(',').count(), HISTORY_LEN);
        assert!(history.starts_with("5,"));
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.inc_messages_accepted();
        metrics.set_retention_period(3600);

        let output = metrics.to_prometheus();
        assert!(output.contains("capture_messages_accepted_total 1"));
        assert!(output.contains("capture_retention_period_seconds 3600"));
        assert!(output.contains("# TYPE capture_sessions_active gauge"));
    }
}

//! Alive/dead tracking for a single uplink

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

/// How long an offline uplink is skipped when fast-fail is enabled
pub const OFFLINE_HOLD_SECS: i64 = 2 * 60;

/// A change of health reported by [`HealthTracker::report_outcome`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    WentOffline,
    BackOnline,
}

/// Point-in-time view of an uplink's health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub alive: bool,
    /// When the state last changed
    pub since: DateTime<Utc>,
}

/// Health state shared by every request made through an uplink
#[derive(Debug)]
pub struct HealthTracker {
    host: String,
    fast_fail: bool,
    state: Mutex<HealthSnapshot>,
}

impl HealthTracker {
    pub fn new(host: impl Into<String>, fast_fail: bool) -> Self {
        Self {
            host: host.into(),
            fast_fail,
            state: Mutex::new(HealthSnapshot {
                alive: true,
                since: Utc::now(),
            }),
        }
    }

    /// Record the outcome of a transport attempt
    ///
    /// Only a change of state is recorded, logged and returned.
    pub fn report_outcome(&self, success: bool) -> Option<HealthTransition> {
        let transition = {
            let mut state = self.state.lock();
            let transition = match (state.alive, success) {
                (true, false) => Some(HealthTransition::WentOffline),
                (false, true) => Some(HealthTransition::BackOnline),
                _ => None,
            };
            if transition.is_some() {
                state.alive = success;
                state.since = Utc::now();
            }
            transition
        };

        match transition {
            Some(HealthTransition::WentOffline) => {
                warn!(host = %self.host, "host {} is now offline", self.host)
            }
            Some(HealthTransition::BackOnline) => {
                info!(host = %self.host, "host {} is back online", self.host)
            }
            None => {}
        }

        transition
    }

    /// Whether a request should be attempted at all
    ///
    /// Always true unless fast-fail is enabled, in which case an offline
    /// uplink is held back for [`OFFLINE_HOLD_SECS`] after it failed.
    pub fn is_available(&self) -> bool {
        if !self.fast_fail {
            return true;
        }

        let state = self.state.lock();
        state.alive || Utc::now() - state.since >= Duration::seconds(OFFLINE_HOLD_SECS)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        *self.state.lock()
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn log_lines(f: impl FnOnce()) -> Vec<String> {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();
        tracing::subscriber::with_default(subscriber, f);

        let buf = logs.0.lock();
        let lines = String::from_utf8_lossy(&buf)
            .lines()
            .map(str::to_string)
            .collect();
        lines
    }

    #[test]
    fn test_starts_alive() {
        let tracker = HealthTracker::new("registry.npmjs.org", false);
        assert!(tracker.snapshot().alive);
        assert!(tracker.is_available());
    }

    #[test]
    fn test_transitions_reported_once() {
        let tracker = HealthTracker::new("registry.npmjs.org", false);

        assert_eq!(tracker.report_outcome(true), None);
        assert_eq!(tracker.report_outcome(false), Some(HealthTransition::WentOffline));
        assert!(!tracker.snapshot().alive);
        assert_eq!(tracker.report_outcome(false), None);
        assert_eq!(tracker.report_outcome(true), Some(HealthTransition::BackOnline));
        assert!(tracker.snapshot().alive);
        assert_eq!(tracker.report_outcome(true), None);
    }

    #[test]
    fn test_only_transitions_are_logged() {
        let tracker = HealthTracker::new("registry.npmjs.org", false);

        let lines = log_lines(|| {
            tracker.report_outcome(true);
            tracker.report_outcome(false);
            tracker.report_outcome(false);
            tracker.report_outcome(true);
            tracker.report_outcome(true);
        });

        assert_eq!(lines.len(), 2, "{:?}", lines);
        assert!(lines[0].contains("WARN"));
        assert!(lines[0].contains("host registry.npmjs.org is now offline"));
        assert!(lines[1].contains("INFO"));
        assert!(lines[1].contains("host registry.npmjs.org is back online"));
    }

    #[test]
    fn test_steady_state_logs_nothing() {
        let tracker = HealthTracker::new("registry.npmjs.org", false);
        let lines = log_lines(|| {
            for _ in 0..5 {
                tracker.report_outcome(true);
            }
        });
        assert!(lines.is_empty(), "{:?}", lines);
    }

    #[test]
    fn test_available_without_fast_fail() {
        let tracker = HealthTracker::new("registry.npmjs.org", false);
        tracker.report_outcome(false);
        assert!(tracker.is_available());
    }

    #[test]
    fn test_fast_fail_holds_offline_uplink() {
        let tracker = HealthTracker::new("registry.npmjs.org", true);
        assert!(tracker.is_available());

        tracker.report_outcome(false);
        assert!(!tracker.is_available());

        // hold expired
        tracker.state.lock().since = Utc::now() - Duration::seconds(OFFLINE_HOLD_SECS + 1);
        assert!(tracker.is_available());

        // further failures do not restart the hold
        tracker.report_outcome(false);
        assert!(tracker.is_available());

        tracker.report_outcome(true);
        assert!(tracker.is_available());
    }
}

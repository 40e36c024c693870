//! Alert Manager: dedups outbound operator alerts by `(component,
//! status)` with a configurable cooldown. Transport is pluggable via
//! `AlertSink` so tests assert on alerts without a network dependency;
//! the only built-in sink logs through `tracing`, since outbound
//! chat-integration transport is out of scope here.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub component: String,
    pub status: String,
    pub severity: AlertSeverity,
    pub message: String,
}

pub trait AlertSink: Send + Sync {
    fn send(&self, alert: &Alert);
}

pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn send(&self, alert: &Alert) {
        match alert.severity {
            AlertSeverity::Critical => {
                error!(component = %alert.component, status = %alert.status, "{}", alert.message)
            }
            AlertSeverity::Warning => {
                warn!(component = %alert.component, status = %alert.status, "{}", alert.message)
            }
        }
    }
}

pub struct AlertManager {
    sink: Arc<dyn AlertSink>,
    cooldown_seconds: i64,
    last_sent: Mutex<HashMap<(String, String), DateTime<Utc>>>,
}

impl AlertManager {
    pub fn new(sink: Arc<dyn AlertSink>, cooldown_seconds: i64) -> Self {
        Self {
            sink,
            cooldown_seconds,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_sink(cooldown_seconds: i64) -> Self {
        Self::new(Arc::new(LogAlertSink), cooldown_seconds)
    }

    /// Sends the alert unless one with the same `(component, status)`
    /// key was sent within the cooldown window. Returns whether it sent.
    pub fn notify(&self, alert: Alert) -> bool {
        let key = (alert.component.clone(), alert.status.clone());
        let now = Utc::now();

        let mut guard = self.last_sent.lock();
        if let Some(last) = guard.get(&key) {
            if (now - *last).num_seconds() < self.cooldown_seconds {
                return false;
            }
        }
        guard.insert(key, now);
        drop(guard);

        self.sink.send(&alert);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct CollectingSink {
        alerts: StdMutex<Vec<Alert>>,
    }

    impl AlertSink for CollectingSink {
        fn send(&self, alert: &Alert) {
            self.alerts.lock().unwrap().push(alert.clone());
        }
    }

    fn alert(component: &str, status: &str) -> Alert {
        Alert {
            component: component.into(),
            status: status.into(),
            severity: AlertSeverity::Warning,
            message: "test".into(),
        }
    }

    #[test]
    fn duplicate_alert_within_cooldown_is_suppressed() {
        let sink = Arc::new(CollectingSink {
            alerts: StdMutex::new(Vec::new()),
        });
        let manager = AlertManager::new(sink.clone(), 300);

        assert!(manager.notify(alert("balance", "low")));
        assert!(!manager.notify(alert("balance", "low")));
        assert_eq!(sink.alerts.lock().unwrap().len(), 1);
    }

    #[test]
    fn different_status_is_not_deduped() {
        let sink = Arc::new(CollectingSink {
            alerts: StdMutex::new(Vec::new()),
        });
        let manager = AlertManager::new(sink.clone(), 300);

        assert!(manager.notify(alert("balance", "low")));
        assert!(manager.notify(alert("balance", "critical")));
        assert_eq!(sink.alerts.lock().unwrap().len(), 2);
    }
}

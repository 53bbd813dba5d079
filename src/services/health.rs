//! Liveness bookkeeping for the connector and market stream
//!
//! Written by the health loop and the stream callbacks, read by whoever
//! wants a report. Nothing here touches trading state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use tokio::sync::RwLock;

/// Health status for a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    fn worst(self, other: HealthStatus) -> HealthStatus {
        use HealthStatus::*;
        match (self, other) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Degraded, _) | (_, Degraded) => Degraded,
            _ => Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Component health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub components: Vec<ComponentHealth>,
}

pub struct HealthState {
    pub started_at: DateTime<Utc>,
    /// Consecutive failed heartbeats before the connector counts as down
    failure_threshold: u32,
    heartbeat_failures: AtomicU32,
    last_heartbeat: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    stream_subscribed: AtomicBool,
    stream_connected: AtomicBool,
    /// Millis since epoch of the last stream message; 0 when none
    last_stream_event: AtomicI64,
}

impl HealthState {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            started_at: Utc::now(),
            failure_threshold: failure_threshold.max(1),
            heartbeat_failures: AtomicU32::new(0),
            last_heartbeat: RwLock::new(None),
            last_error: RwLock::new(None),
            stream_subscribed: AtomicBool::new(false),
            stream_connected: AtomicBool::new(false),
            last_stream_event: AtomicI64::new(0),
        }
    }

    pub async fn record_heartbeat(&self, result: Result<(), String>) {
        *self.last_heartbeat.write().await = Some(Utc::now());
        match result {
            Ok(()) => {
                self.heartbeat_failures.store(0, Ordering::SeqCst);
                *self.last_error.write().await = None;
            }
            Err(e) => {
                self.heartbeat_failures.fetch_add(1, Ordering::SeqCst);
                *self.last_error.write().await = Some(e);
            }
        }
    }

    pub fn heartbeat_failures(&self) -> u32 {
        self.heartbeat_failures.load(Ordering::SeqCst)
    }

    pub fn set_stream_subscribed(&self, subscribed: bool) {
        self.stream_subscribed.store(subscribed, Ordering::SeqCst);
    }

    pub fn set_stream_connected(&self, connected: bool) {
        self.stream_connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_stream_connected(&self) -> bool {
        self.stream_connected.load(Ordering::SeqCst)
    }

    /// Called from stream callbacks, which cannot await.
    pub fn record_stream_event(&self) {
        self.last_stream_event
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn last_stream_event(&self) -> Option<DateTime<Utc>> {
        match self.last_stream_event.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    fn connector_status(&self) -> HealthStatus {
        match self.heartbeat_failures() {
            0 => HealthStatus::Healthy,
            n if n < self.failure_threshold => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }

    pub async fn report(&self) -> HealthReport {
        let now = Utc::now();
        let mut components = Vec::new();

        let connector = self.connector_status();
        components.push(ComponentHealth {
            name: "connector".to_string(),
            status: connector,
            message: self.last_error.read().await.clone(),
            last_check: *self.last_heartbeat.read().await,
        });

        // A stream nobody subscribed to is not a problem.
        let stream = if !self.stream_subscribed.load(Ordering::SeqCst) || self.is_stream_connected()
        {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        components.push(ComponentHealth {
            name: "market_stream".to_string(),
            status: stream,
            message: (stream != HealthStatus::Healthy).then(|| "Disconnected".to_string()),
            last_check: self.last_stream_event(),
        });

        HealthReport {
            status: connector.worst(stream),
            timestamp: now,
            uptime_seconds: (now - self.started_at).num_seconds(),
            components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_heartbeat_failures_degrade_then_fail() {
        let health = HealthState::new(3);
        assert_eq!(health.report().await.status, HealthStatus::Healthy);

        health.record_heartbeat(Err("timeout".into())).await;
        assert_eq!(health.report().await.status, HealthStatus::Degraded);

        health.record_heartbeat(Err("timeout".into())).await;
        health.record_heartbeat(Err("timeout".into())).await;
        assert_eq!(health.report().await.status, HealthStatus::Unhealthy);

        health.record_heartbeat(Ok(())).await;
        assert_eq!(health.report().await.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_dropped_stream_is_degraded() {
        let health = HealthState::new(3);
        health.set_stream_subscribed(true);
        assert_eq!(health.report().await.status, HealthStatus::Degraded);
        health.set_stream_connected(true);
        health.record_stream_event();
        let report = health.report().await;
        assert!(report.status.is_healthy());
        assert!(report.components[1].last_check.is_some());
    }
}

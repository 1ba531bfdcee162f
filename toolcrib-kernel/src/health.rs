/**
 * HEALTH KERNEL - Suivi de l'état du serveur
 *
 * RÔLE : uptime, révision courante du store, volumétrie, état MQTT.
 * Exposé par GET /system/health (toujours accessible sans clé).
 */

use crate::state::{new_state, Shared};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use toolcrib_core::Store;

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub started_at: String,
    pub store: String,
    pub revision: u64,
    pub machines: u32,
    pub tool_types: u32,
    pub tools: u32,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    started_at: OffsetDateTime,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Shared<String>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            started_at: OffsetDateTime::now_utc(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: new_state("disabled".to_string()),
        }
    }

    pub fn mark_mqtt_connecting(&self) {
        *self.mqtt_status.lock() = "connecting".to_string();
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn mqtt_status(&self) -> String {
        self.mqtt_status.lock().clone()
    }

    pub fn get_health(&self, store: &Store) -> KernelHealth {
        let snapshot = store.get_all();
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            started_at: self.started_at.format(&Rfc3339).unwrap_or_default(),
            store: store.backend_description(),
            revision: snapshot.revision,
            machines: snapshot.machines.len() as u32,
            tool_types: snapshot.tool_types.len() as u32,
            tools: snapshot.tools.len() as u32,
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status: self.mqtt_status(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let kb = status
                .lines()
                .find(|l| l.starts_with("VmRSS:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|v| v.parse::<u64>().ok());
            if let Some(kb) = kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mqtt_status_transitions() {
        let tracker = HealthTracker::new();
        assert_eq!(tracker.mqtt_status(), "disabled");
        tracker.mark_mqtt_connecting();
        tracker.increment_reconnects();
        tracker.increment_reconnects();
        tracker.mark_mqtt_connected();

        let health = tracker.get_health(&Store::in_memory());
        assert_eq!(health.mqtt_status, "connected");
        assert_eq!(health.mqtt_reconnects, 2);
        assert_eq!(health.revision, 0);
        assert_eq!(health.store, "memory");
    }
}

//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a partial
//! JSON file only needs the fields it overrides.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutpostSettings {
    /// Servers to monitor. One connection each.
    pub servers: Vec<ServerEntry>,
    pub polling: PollingSettings,
    pub link: LinkSettings,
    pub timers: TimerSettings,
    pub tracking: TrackingSettings,
    pub activity: ActivitySettings,
    pub notifications: NotificationSettings,
    pub logging: LoggingSettings,
}

impl Default for OutpostSettings {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            polling: PollingSettings::default(),
            link: LinkSettings::default(),
            timers: TimerSettings::default(),
            tracking: TrackingSettings::default(),
            activity: ActivitySettings::default(),
            notifications: NotificationSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl OutpostSettings {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.polling.interval_ms == 0 {
            return Err(SettingsError::InvalidValue("polling.intervalMs must be > 0".into()));
        }
        if self.timers.warning_cadence_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "timers.warningCadenceMs must be > 0".into(),
            ));
        }
        if self.tracking.trajectory_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "tracking.trajectoryCapacity must be > 0".into(),
            ));
        }
        if self.link.reconnect_base_delay_ms > self.link.reconnect_max_delay_ms {
            return Err(SettingsError::InvalidValue(
                "link.reconnectBaseDelayMs exceeds link.reconnectMaxDelayMs".into(),
            ));
        }
        let mut ids = std::collections::HashSet::new();
        for server in &self.servers {
            if !ids.insert(server.id.as_str()) {
                return Err(SettingsError::InvalidValue(format!(
                    "duplicate server id '{}'",
                    server.id
                )));
            }
        }
        Ok(())
    }
}

/// One monitored server endpoint and its credentials.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntry {
    pub id: String,
    /// Websocket URL, e.g. `ws://203.0.113.7:28082`.
    pub endpoint: String,
    pub player_id: u64,
    pub player_token: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollingSettings {
    pub interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl PollingSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkSettings {
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub broadcast_capacity: usize,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            reconnect_base_delay_ms: 5_000,
            reconnect_max_delay_ms: 60_000,
            reconnect_max_attempts: 5,
            broadcast_capacity: 256,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimerSettings {
    /// How often live timers check their warning thresholds.
    pub warning_cadence_ms: u64,
    pub cargo_egress_secs: u64,
    pub cargo_egress_warning_secs: u64,
    pub oil_rig_unlock_secs: u64,
    pub oil_rig_warning_secs: u64,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            warning_cadence_ms: 10_000,
            cargo_egress_secs: 50 * 60,
            cargo_egress_warning_secs: 10 * 60,
            oil_rig_unlock_secs: 15 * 60,
            oil_rig_warning_secs: 3 * 60,
        }
    }
}

impl TimerSettings {
    pub fn warning_cadence(&self) -> Duration {
        Duration::from_millis(self.warning_cadence_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackingSettings {
    pub trajectory_capacity: usize,
    pub trajectory_max_age_secs: u64,
    /// Distance from the map edge under which a vanished entity counts as departed.
    pub boundary_margin: f64,
    pub dock_radius: f64,
    pub oil_rig_radius: f64,
    /// How far ahead along its heading a spawn prediction points.
    pub prediction_distance: f64,
    pub landmark_label_radius: f64,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            trajectory_capacity: 100,
            trajectory_max_age_secs: 600,
            boundary_margin: 150.0,
            dock_radius: 300.0,
            oil_rig_radius: 200.0,
            prediction_distance: 1000.0,
            landmark_label_radius: 250.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActivitySettings {
    pub movement_threshold: f64,
    pub idle_dwell_secs: u64,
}

impl Default for ActivitySettings {
    fn default() -> Self {
        Self {
            movement_threshold: 1.0,
            idle_dwell_secs: 180,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationSettings {
    /// Minimum delay between two outbound messages on one connection.
    pub min_interval_ms: u64,
    /// Deliver messages to in-game team chat in addition to the log.
    pub team_chat: bool,
    /// Event kinds to announce. Empty announces everything.
    pub enabled: Vec<String>,
    /// Per-kind template overrides.
    pub templates: HashMap<String, String>,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            min_interval_ms: 3_000,
            team_chat: false,
            enabled: Vec::new(),
            templates: HashMap::new(),
        }
    }
}

impl NotificationSettings {
    pub fn is_enabled(&self, kind: &str) -> bool {
        self.enabled.is_empty() || self.enabled.iter().any(|k| k == kind)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Per-module level overrides, e.g. `{"outpost_link": "debug"}`.
    pub module_levels: HashMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            module_levels: HashMap::new(),
        }
    }
}

//! Configuration
//!
//! TOML file with per-key defaults; unknown keys are ignored and missing
//! keys take the documented defaults. Section names mirror the runtime
//! areas: `[host]`, `[api]`, `[csms]`, `[allocator]`, `[model]`,
//! `[history]`, `[logging]`.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::support::errors::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub host: HostConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub csms: CsmsConfig,

    #[serde(default)]
    pub allocator: AllocatorConfig,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub history: HistoryConfig,
}

/// Logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// WebSocket listener for chargers and the admin API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_addr")]
    pub addr: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Deadline for outbound OCPP calls (seconds)
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,

    /// Connection watchdog check period (seconds)
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval: u64,

    /// Silence after which a connection is dropped (seconds)
    #[serde(default = "default_watchdog_stale")]
    pub watchdog_stale: u64,

    /// Require HTTP Basic auth from chargers
    #[serde(default)]
    pub http_auth: bool,

    /// Delay before issuing a fresh AuthorizationKey (seconds); some
    /// chargers restart on key change
    #[serde(default = "default_http_auth_delay")]
    pub http_auth_delay: u64,

    /// Development-only hack: accept credentials smuggled through the
    /// WebSocket subprotocol list (for browser clients). Never enable in
    /// production.
    #[serde(default)]
    pub http_auth_via_protocol: bool,
}

/// Admin API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_users_csv")]
    pub users_csv: String,
}

/// Central-system behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsmsConfig {
    /// Heartbeat interval handed to chargers in BootNotification (seconds)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: i32,

    /// Stale-transaction reaper period (seconds)
    #[serde(default = "default_transaction_interval")]
    pub transaction_interval: u64,

    /// Transactions silent for longer are force-closed (seconds)
    #[serde(default = "default_transaction_timeout")]
    pub transaction_timeout: u64,

    /// Allow the same tag in concurrent transactions
    #[serde(default)]
    pub allow_concurrent_tag: bool,
}

/// Smart-charging allocator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Loop period in seconds; 0 disables smart charging
    #[serde(default = "default_run_interval")]
    pub run_interval: u64,

    /// A full rebalancing pass runs every this many cycles
    #[serde(default = "default_intervals_full")]
    pub intervals_full: u64,

    /// Startup grace before the first cycle (seconds)
    #[serde(default = "default_first_wait")]
    pub first_wait: u64,

    /// Smallest workable offer (A); EVs will not start below ~6 A
    #[serde(default = "default_min_allocation")]
    pub min_allocation: u32,

    /// Connector cap when chargers.csv leaves conn_max blank (A)
    #[serde(default = "default_max_allocation_field")]
    pub default_max_allocation: u32,

    /// Largest single growth step (A)
    #[serde(default = "default_max_offer_increase")]
    pub max_offer_increase: u32,

    /// Dwell between offer increases for one connector (seconds)
    #[serde(default = "default_min_offer_increase_interval")]
    pub min_offer_increase_interval: u64,

    /// Grace between committing reductions and growth (seconds)
    #[serde(default = "default_wait_after_reduce")]
    pub wait_after_reduce: u64,

    /// Rolling usage window backing reductions and reclamation (seconds)
    #[serde(default = "default_usage_monitoring_interval")]
    pub usage_monitoring_interval: u64,

    /// Usage below this counts as "not charging" (A)
    #[serde(default = "default_usage_threshold")]
    pub usage_threshold: f64,

    /// Offer minus usage must exceed this before reducing (A)
    #[serde(default = "default_margin_lower")]
    pub margin_lower: f64,

    /// Usage must be within this of the offer before growing (A)
    #[serde(default = "default_margin_increase")]
    pub margin_increase: f64,

    /// Sessions below this energy count as "not yet started" (Wh)
    #[serde(default = "default_energy_threshold")]
    pub energy_threshold: i64,

    /// Dwell before an unused offer is reclaimed (seconds)
    #[serde(default = "default_suspended_allocation_timeout")]
    pub suspended_allocation_timeout: u64,

    /// Re-evaluation deferral for a first-suspended session (seconds)
    #[serde(default = "default_suspended_delayed_time")]
    pub suspended_delayed_time: u64,

    /// Re-evaluation deferral once the session has delivered energy (seconds)
    #[serde(default = "default_suspended_delayed_time_not_first")]
    pub suspended_delayed_time_not_first: u64,

    /// Align first-session re-evaluation to the next top of the hour
    #[serde(default)]
    pub suspend_top_of_hour: bool,

    /// Session priority when no tag/charger/group supplies one
    #[serde(default = "default_priority")]
    pub default_priority: i32,
}

/// Model CSV locations and auto-registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_groups_csv")]
    pub groups_csv: String,

    #[serde(default = "default_chargers_csv")]
    pub chargers_csv: String,

    #[serde(default = "default_tags_csv")]
    pub tags_csv: String,

    #[serde(default)]
    pub firmware_csv: String,

    /// Create unknown chargers on connect
    #[serde(default)]
    pub charger_autoregister: bool,

    /// Group that receives auto-registered chargers
    #[serde(default)]
    pub charger_autoregister_group: String,
}

/// Session history and audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Append-only session log; empty disables it
    #[serde(default)]
    pub session_csv: String,

    #[serde(default = "default_audit_file")]
    pub audit_file: String,
}

// ── Default value helpers ──────────────────────────────────────

fn default_log_level() -> String {
    "info".into()
}
fn default_addr() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    9000
}
fn default_ping_timeout() -> u64 {
    30
}
fn default_watchdog_interval() -> u64 {
    60
}
fn default_watchdog_stale() -> u64 {
    500
}
fn default_http_auth_delay() -> u64 {
    30
}
fn default_users_csv() -> String {
    "config/users.csv".into()
}
fn default_heartbeat_interval() -> i32 {
    300
}
fn default_transaction_interval() -> u64 {
    60
}
fn default_transaction_timeout() -> u64 {
    3600
}
fn default_run_interval() -> u64 {
    5
}
fn default_intervals_full() -> u64 {
    12
}
fn default_first_wait() -> u64 {
    30
}
fn default_min_allocation() -> u32 {
    6
}
fn default_max_allocation_field() -> u32 {
    32
}
fn default_max_offer_increase() -> u32 {
    3
}
fn default_min_offer_increase_interval() -> u64 {
    115
}
fn default_wait_after_reduce() -> u64 {
    5
}
fn default_usage_monitoring_interval() -> u64 {
    300
}
fn default_usage_threshold() -> f64 {
    2.0
}
fn default_margin_lower() -> f64 {
    0.8
}
fn default_margin_increase() -> f64 {
    1.0
}
fn default_energy_threshold() -> i64 {
    1000
}
fn default_suspended_allocation_timeout() -> u64 {
    300
}
fn default_suspended_delayed_time() -> u64 {
    3600
}
fn default_suspended_delayed_time_not_first() -> u64 {
    3600
}
fn default_priority() -> i32 {
    1
}
fn default_groups_csv() -> String {
    "config/groups.csv".into()
}
fn default_chargers_csv() -> String {
    "config/chargers.csv".into()
}
fn default_tags_csv() -> String {
    "config/tags.csv".into()
}
fn default_audit_file() -> String {
    "audit_log.txt".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            port: default_port(),
            ping_timeout: default_ping_timeout(),
            watchdog_interval: default_watchdog_interval(),
            watchdog_stale: default_watchdog_stale(),
            http_auth: false,
            http_auth_delay: default_http_auth_delay(),
            http_auth_via_protocol: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            users_csv: default_users_csv(),
        }
    }
}

impl Default for CsmsConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            transaction_interval: default_transaction_interval(),
            transaction_timeout: default_transaction_timeout(),
            allow_concurrent_tag: false,
        }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            run_interval: default_run_interval(),
            intervals_full: default_intervals_full(),
            first_wait: default_first_wait(),
            min_allocation: default_min_allocation(),
            default_max_allocation: default_max_allocation_field(),
            max_offer_increase: default_max_offer_increase(),
            min_offer_increase_interval: default_min_offer_increase_interval(),
            wait_after_reduce: default_wait_after_reduce(),
            usage_monitoring_interval: default_usage_monitoring_interval(),
            usage_threshold: default_usage_threshold(),
            margin_lower: default_margin_lower(),
            margin_increase: default_margin_increase(),
            energy_threshold: default_energy_threshold(),
            suspended_allocation_timeout: default_suspended_allocation_timeout(),
            suspended_delayed_time: default_suspended_delayed_time(),
            suspended_delayed_time_not_first: default_suspended_delayed_time_not_first(),
            suspend_top_of_hour: false,
            default_priority: default_priority(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            groups_csv: default_groups_csv(),
            chargers_csv: default_chargers_csv(),
            tags_csv: default_tags_csv(),
            firmware_csv: String::new(),
            charger_autoregister: false,
            charger_autoregister_group: String::new(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            session_csv: String::new(),
            audit_file: default_audit_file(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: AppConfig = toml::from_str(&content).map_err(|e| ConfigError::Invalid {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate().map_err(|message| ConfigError::Invalid {
            path: path.display().to_string(),
            message,
        })?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();

        if self.host.ping_timeout == 0 {
            errors.push("ping_timeout must be positive".to_string());
        }
        if self.allocator.run_interval > 0 && self.allocator.intervals_full == 0 {
            errors.push("intervals_full must be positive".to_string());
        }
        if self.allocator.min_allocation == 0 {
            errors.push("min_allocation must be positive".to_string());
        }
        if self.allocator.min_allocation > self.allocator.default_max_allocation {
            errors.push(format!(
                "min_allocation ({}) exceeds default_max_allocation ({})",
                self.allocator.min_allocation, self.allocator.default_max_allocation
            ));
        }
        if self.allocator.margin_lower < 0.0 || self.allocator.margin_increase < 0.0 {
            errors.push("margins must be non-negative".to_string());
        }
        if self.csms.transaction_timeout < self.csms.transaction_interval {
            errors.push("transaction_timeout must be at least transaction_interval".to_string());
        }
        if self.model.charger_autoregister && self.model.charger_autoregister_group.is_empty() {
            errors.push("charger_autoregister requires charger_autoregister_group".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host.addr, self.host.port)
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.allocator.run_interval, 5);
        assert_eq!(config.allocator.intervals_full, 12);
        assert_eq!(config.allocator.min_allocation, 6);
        assert_eq!(config.allocator.max_offer_increase, 3);
        assert_eq!(config.allocator.min_offer_increase_interval, 115);
        assert_eq!(config.allocator.usage_threshold, 2.0);
        assert_eq!(config.allocator.suspended_allocation_timeout, 300);
        assert_eq!(config.allocator.energy_threshold, 1000);
        assert_eq!(config.csms.transaction_timeout, 3600);
        assert_eq!(config.host.watchdog_stale, 500);
        assert_eq!(config.host.port, 9000);
    }

    #[test]
    fn partial_file_takes_defaults_and_ignores_unknown_keys() {
        let text = r#"
            [host]
            port = 9443
            shiny_future_knob = true

            [allocator]
            run_interval = 10
        "#;
        let config: AppConfig = toml::from_str(text).unwrap();
        assert_eq!(config.host.port, 9443);
        assert_eq!(config.host.ping_timeout, 30);
        assert_eq!(config.allocator.run_interval, 10);
        assert_eq!(config.allocator.min_allocation, 6);
    }

    #[test]
    fn zero_run_interval_disables_smart_charging_and_validates() {
        let text = "[allocator]\nrun_interval = 0\n";
        let config: AppConfig = toml::from_str(text).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn min_above_max_is_rejected() {
        let text = "[allocator]\nmin_allocation = 40\n";
        let config: AppConfig = toml::from_str(text).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn autoregister_without_group_is_rejected() {
        let text = "[model]\ncharger_autoregister = true\n";
        let config: AppConfig = toml::from_str(text).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = AppConfig::load(Path::new("/nonexistent/ampshare.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

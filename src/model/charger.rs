//! Chargers and connectors
//!
//! A charger owns 1..N connectors (index 1-based; the OCPP "connector 0"
//! pseudo-connector addresses the charger itself and is not modelled).
//! Connectors carry the live allocator bookkeeping: the installed offer,
//! its timestamp, the rolling usage window and the per-session plateau.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::model::session::ChargingSession;

/// Connector status as tracked by the state machine.
///
/// `Unknown` covers both "never heard from" and "charger disconnected".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum ConnectorStatus {
    Unknown,
    Available,
    Preparing,
    Charging,
    SuspendedEV,
    SuspendedEVSE,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

impl ConnectorStatus {
    /// States in which a connector may hold a non-zero offer.
    pub fn is_transactional(&self) -> bool {
        matches!(self, Self::Preparing | Self::Charging | Self::SuspendedEV)
    }
}

impl fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone)]
pub struct Connector {
    pub connector_id: u32,
    pub status: ConnectorStatus,
    /// Installed offer in whole amperes. Owned by the allocator.
    pub offer: u32,
    pub last_offer_change: Option<DateTime<Utc>>,
    pub session: Option<ChargingSession>,
    /// Deferred re-evaluation after unused-offer reclamation.
    pub suspend_until: Option<DateTime<Utc>>,
    /// Inferred per-session EV ceiling; sticky until the session ends.
    pub plateau: Option<u32>,
    /// Whether the blocking default profile is currently believed installed.
    pub blocking_profile_installed: bool,
    /// Urgent-review flag: a state change wants an allocator pass now.
    pub needs_review: bool,
    /// Recent `(timestamp, amperes)` usage samples, newest last.
    usage_samples: VecDeque<(DateTime<Utc>, f64)>,
}

impl Connector {
    pub fn new(connector_id: u32) -> Self {
        Self {
            connector_id,
            status: ConnectorStatus::Unknown,
            offer: 0,
            last_offer_change: None,
            session: None,
            suspend_until: None,
            plateau: None,
            blocking_profile_installed: true,
            needs_review: false,
            usage_samples: VecDeque::new(),
        }
    }

    /// Record a usage sample and drop samples older than `window`.
    pub fn record_usage(&mut self, amperes: f64, timestamp: DateTime<Utc>, window: Duration) {
        self.usage_samples.push_back((timestamp, amperes));
        self.expire_usage(timestamp, window);
    }

    pub fn expire_usage(&mut self, now: DateTime<Utc>, window: Duration) {
        while let Some((ts, _)) = self.usage_samples.front() {
            if now.signed_duration_since(*ts) >= window {
                self.usage_samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Restart usage monitoring (after an offer change).
    pub fn clear_usage(&mut self) {
        self.usage_samples.clear();
    }

    /// Maximum usage over the monitoring window, 0 when no samples.
    pub fn rolling_max_usage(&self, now: DateTime<Utc>, window: Duration) -> f64 {
        self.usage_samples
            .iter()
            .filter(|(ts, _)| now.signed_duration_since(*ts) < window)
            .map(|(_, a)| *a)
            .fold(0.0, f64::max)
    }

    /// Reset the per-session allocator fields. Called on session start and
    /// end. The plateau resets here and only here.
    pub fn reset_session_fields(&mut self) {
        self.plateau = None;
        self.suspend_until = None;
        self.usage_samples.clear();
    }

    pub fn id_str(&self, charger_id: &str) -> String {
        format!("{}/{}", charger_id, self.connector_id)
    }
}

#[derive(Debug, Clone)]
pub struct Charger {
    pub charger_id: String,
    pub alias: String,
    pub group_id: String,
    /// Default session priority; falls back to the group chain when unset.
    pub priority: Option<i32>,
    pub description: Option<String>,
    /// Per-connector current cap in amperes.
    pub conn_max: u32,
    /// SHA-256 of the expected `Authorization` header value.
    pub auth_sha: Option<String>,
    pub connectors: BTreeMap<u32, Connector>,

    // Reported by BootNotification
    pub charge_point_vendor: Option<String>,
    pub charge_point_model: Option<String>,
    pub charge_point_serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub meter_type: Option<String>,

    pub connected: bool,
    pub last_update: Option<DateTime<Utc>>,
    /// Default profiles installed since (re)connect.
    pub profile_initialized: bool,
    /// Status resync triggered since (re)connect.
    pub requested_status: bool,
}

impl Charger {
    pub fn new(
        charger_id: impl Into<String>,
        alias: impl Into<String>,
        group_id: impl Into<String>,
        no_connectors: u32,
        priority: Option<i32>,
        description: Option<String>,
        conn_max: u32,
        auth_sha: Option<String>,
    ) -> Self {
        let mut connectors = BTreeMap::new();
        for connector_id in 1..=no_connectors.max(1) {
            connectors.insert(connector_id, Connector::new(connector_id));
        }
        Self {
            charger_id: charger_id.into(),
            alias: alias.into(),
            group_id: group_id.into(),
            priority,
            description,
            conn_max,
            auth_sha,
            connectors,
            charge_point_vendor: None,
            charge_point_model: None,
            charge_point_serial_number: None,
            firmware_version: None,
            meter_type: None,
            connected: false,
            last_update: None,
            profile_initialized: false,
            requested_status: false,
        }
    }

    /// Sum of installed offers across connectors.
    pub fn offered(&self) -> u32 {
        self.connectors.values().map(|c| c.offer).sum()
    }

    /// Sum of last reported phase currents across live sessions.
    pub fn usage(&self) -> f64 {
        self.connectors
            .values()
            .filter_map(|c| c.session.as_ref().and_then(|s| s.usage_a))
            .sum()
    }

    /// Sum of session energy counters (Wh).
    pub fn energy(&self) -> i64 {
        self.connectors
            .values()
            .filter_map(|c| c.session.as_ref().map(|s| s.energy_wh - s.meter_start))
            .sum()
    }
}

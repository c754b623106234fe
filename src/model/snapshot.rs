//! Registry snapshots
//!
//! The allocator never touches the live registry: each cycle it receives a
//! self-contained copy with everything pre-resolved (effective priorities,
//! rolling usage maxima, allocation-group ancestor chains). Building one is
//! a read-lock and a walk over the model, cheap enough to do every tick.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::model::charger::ConnectorStatus;
use crate::model::schedule::Schedule;

#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub group_id: String,
    pub parent_id: Option<String>,
    pub schedule: Option<Schedule>,
    pub allocator_suspended: bool,
}

impl GroupSnapshot {
    pub fn is_allocation_group(&self) -> bool {
        self.schedule.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub transaction_id: i32,
    pub energy_delivered_wh: i64,
    pub usage_a: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ConnectorSnapshot {
    pub connector_id: u32,
    pub status: ConnectorStatus,
    pub offer: u32,
    pub last_offer_change: Option<DateTime<Utc>>,
    pub suspend_until: Option<DateTime<Utc>>,
    pub plateau: Option<u32>,
    /// Maximum usage over the monitoring window at snapshot time.
    pub rolling_max_usage: f64,
    pub blocking_profile_installed: bool,
    pub needs_review: bool,
    pub session: Option<SessionSnapshot>,
    /// Priority resolved through session -> charger -> group -> config.
    pub effective_priority: i32,
}

#[derive(Debug, Clone)]
pub struct ChargerSnapshot {
    pub charger_id: String,
    pub alias: String,
    pub group_id: String,
    pub conn_max: u32,
    pub connected: bool,
    pub profile_initialized: bool,
    pub requested_status: bool,
    /// Allocation-group ancestors, nearest first. The first entry owns
    /// this charger.
    pub allocation_ancestors: Vec<String>,
    pub connectors: Vec<ConnectorSnapshot>,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub groups: HashMap<String, GroupSnapshot>,
    pub chargers: Vec<ChargerSnapshot>,
}

impl Snapshot {
    /// Ids of all allocation groups.
    pub fn allocation_groups(&self) -> Vec<&GroupSnapshot> {
        let mut groups: Vec<&GroupSnapshot> = self
            .groups
            .values()
            .filter(|g| g.is_allocation_group())
            .collect();
        groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        groups
    }

    /// Chargers owned by `group_id` (their nearest allocation ancestor).
    pub fn chargers_owned_by(&self, group_id: &str) -> Vec<&ChargerSnapshot> {
        self.chargers
            .iter()
            .filter(|c| c.allocation_ancestors.first().map(String::as_str) == Some(group_id))
            .collect()
    }

    /// True when the group or any of its ancestors is frozen by the admin API.
    pub fn allocator_suspended(&self, group_id: &str) -> bool {
        let mut cursor = Some(group_id.to_string());
        let mut hops = 0;
        while let Some(id) = cursor {
            let Some(group) = self.groups.get(&id) else {
                return false;
            };
            if group.allocator_suspended {
                return true;
            }
            cursor = group.parent_id.clone();
            hops += 1;
            if hops > self.groups.len() {
                return false;
            }
        }
        false
    }
}

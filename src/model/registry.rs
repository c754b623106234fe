//! Model registry
//!
//! The registry exclusively owns every entity (groups, chargers, tags,
//! firmware, live sessions). All mutations go through the single write
//! lock; readers take cheap snapshots. The registry is also where inbound
//! OCPP events land after the adapter has translated them, so the
//! connector state machine lives here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::model::charger::{Charger, Connector, ConnectorStatus};
use crate::model::firmware::FirmwareRecord;
use crate::model::group::Group;
use crate::model::session::{ChargingSession, ClosedSession, SessionHistoryWriter};
use crate::model::snapshot::{
    ChargerSnapshot, ConnectorSnapshot, GroupSnapshot, SessionSnapshot, Snapshot,
};
use crate::model::tag::{Tag, TagStatus};
use crate::support::errors::ModelError;

/// Settings the registry needs at runtime. Copied out of the config at
/// startup so the model layer does not depend on the config module.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub default_priority: i32,
    pub default_conn_max: u32,
    pub usage_window: Duration,
    pub allow_concurrent_tag: bool,
    pub charger_autoregister: bool,
    pub charger_autoregister_group: String,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            default_priority: 1,
            default_conn_max: 32,
            usage_window: Duration::seconds(300),
            allow_concurrent_tag: false,
            charger_autoregister: false,
            charger_autoregister_group: String::new(),
        }
    }
}

/// Outcome of an Authorize check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted { parent_id_tag: Option<String> },
    Blocked,
    Invalid,
    ConcurrentTx,
}

#[derive(Debug, Default)]
pub struct Model {
    pub groups: HashMap<String, Group>,
    pub chargers: HashMap<String, Charger>,
    pub tags: HashMap<String, Tag>,
    pub firmware: Vec<FirmwareRecord>,
}

pub struct ModelRegistry {
    inner: RwLock<Model>,
    history: Mutex<Option<SessionHistoryWriter>>,
    closed_sessions: Mutex<Vec<ClosedSession>>,
    next_transaction_id: AtomicI32,
    settings: RegistrySettings,
}

impl ModelRegistry {
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            inner: RwLock::new(Model::default()),
            history: Mutex::new(None),
            closed_sessions: Mutex::new(Vec::new()),
            next_transaction_id: AtomicI32::new(1),
            settings,
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub fn set_history_writer(&self, writer: SessionHistoryWriter) {
        *self.history.lock().expect("history lock poisoned") = Some(writer);
    }

    /// Install a freshly loaded model (boot time). Validates the group tree.
    pub fn install(&self, model: Model) -> Result<(), ModelError> {
        validate_group_tree(&model.groups)?;
        for charger in model.chargers.values() {
            if !model.groups.contains_key(&charger.group_id) {
                return Err(ModelError::Integrity(format!(
                    "charger {} references unknown group {}",
                    charger.charger_id, charger.group_id
                )));
            }
        }
        *self.write() = model;
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Model> {
        self.inner.read().expect("registry lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Model> {
        self.inner.write().expect("registry lock poisoned")
    }

    /// Run a closure under the read lock (for API queries).
    pub fn with_model<T>(&self, f: impl FnOnce(&Model) -> T) -> T {
        f(&self.read())
    }

    // ── Group CRUD ─────────────────────────────────────────────

    pub fn add_group(&self, group: Group) -> Result<(), ModelError> {
        let mut model = self.write();
        if model.groups.contains_key(&group.group_id) {
            return Err(ModelError::Duplicate {
                entity: "group",
                id: group.group_id,
            });
        }
        if let Some(parent) = &group.parent_id {
            if !model.groups.contains_key(parent) {
                return Err(ModelError::NotFound {
                    entity: "group",
                    id: parent.clone(),
                });
            }
        }
        info!(group_id = group.group_id.as_str(), "Created group");
        model.groups.insert(group.group_id.clone(), group);
        Ok(())
    }

    pub fn update_group(
        &self,
        group_id: &str,
        description: Option<String>,
        priority: Option<i32>,
        max_allocation: Option<Option<crate::model::schedule::Schedule>>,
    ) -> Result<(), ModelError> {
        let mut model = self.write();
        let group = model.groups.get_mut(group_id).ok_or(ModelError::NotFound {
            entity: "group",
            id: group_id.to_string(),
        })?;
        if let Some(description) = description {
            group.description = Some(description);
        }
        if let Some(priority) = priority {
            group.priority = Some(priority);
        }
        if let Some(max_allocation) = max_allocation {
            group.max_allocation = max_allocation;
        }
        Ok(())
    }

    pub fn delete_group(&self, group_id: &str) -> Result<(), ModelError> {
        let mut model = self.write();
        if !model.groups.contains_key(group_id) {
            return Err(ModelError::NotFound {
                entity: "group",
                id: group_id.to_string(),
            });
        }
        if model.chargers.values().any(|c| c.group_id == group_id) {
            return Err(ModelError::Integrity(format!(
                "group {} still contains chargers",
                group_id
            )));
        }
        if model
            .groups
            .values()
            .any(|g| g.parent_id.as_deref() == Some(group_id))
        {
            return Err(ModelError::Integrity(format!(
                "group {} still has child groups",
                group_id
            )));
        }
        model.groups.remove(group_id);
        info!(group_id, "Deleted group");
        Ok(())
    }

    pub fn set_allocator_state(&self, group_id: &str, suspend: bool) -> Result<(), ModelError> {
        let mut model = self.write();
        let group = model.groups.get_mut(group_id).ok_or(ModelError::NotFound {
            entity: "group",
            id: group_id.to_string(),
        })?;
        group.allocator_suspended = suspend;
        info!(group_id, suspend, "Allocator state changed");
        Ok(())
    }

    // ── Charger CRUD ───────────────────────────────────────────

    pub fn add_charger(&self, charger: Charger) -> Result<(), ModelError> {
        let mut model = self.write();
        if model.chargers.contains_key(&charger.charger_id) {
            return Err(ModelError::Duplicate {
                entity: "charger",
                id: charger.charger_id,
            });
        }
        if !model.groups.contains_key(&charger.group_id) {
            return Err(ModelError::NotFound {
                entity: "group",
                id: charger.group_id,
            });
        }
        info!(
            charger_id = charger.charger_id.as_str(),
            alias = charger.alias.as_str(),
            group_id = charger.group_id.as_str(),
            "Created charger"
        );
        model.chargers.insert(charger.charger_id.clone(), charger);
        Ok(())
    }

    pub fn update_charger(
        &self,
        charger_id: &str,
        alias: Option<String>,
        priority: Option<i32>,
        description: Option<String>,
        conn_max: Option<u32>,
    ) -> Result<(), ModelError> {
        let mut model = self.write();
        let charger = model
            .chargers
            .get_mut(charger_id)
            .ok_or(ModelError::NotFound {
                entity: "charger",
                id: charger_id.to_string(),
            })?;
        if let Some(alias) = alias {
            charger.alias = alias;
        }
        if let Some(priority) = priority {
            charger.priority = Some(priority);
        }
        if let Some(description) = description {
            charger.description = Some(description);
        }
        if let Some(conn_max) = conn_max {
            charger.conn_max = conn_max;
        }
        Ok(())
    }

    pub fn delete_charger(&self, charger_id: &str) -> Result<(), ModelError> {
        let mut model = self.write();
        let charger = model.chargers.get(charger_id).ok_or(ModelError::NotFound {
            entity: "charger",
            id: charger_id.to_string(),
        })?;
        if charger.connectors.values().any(|c| c.session.is_some()) {
            return Err(ModelError::Integrity(format!(
                "charger {} has a live session",
                charger_id
            )));
        }
        model.chargers.remove(charger_id);
        info!(charger_id, "Deleted charger");
        Ok(())
    }

    /// Look a charger up by id or alias; id wins when both are given.
    pub fn find_charger_id(&self, id: Option<&str>, alias: Option<&str>) -> Option<String> {
        let model = self.read();
        if let Some(id) = id {
            return model.chargers.contains_key(id).then(|| id.to_string());
        }
        let alias = alias?;
        let mut matches = model.chargers.values().filter(|c| c.alias == alias);
        let found = matches.next().map(|c| c.charger_id.clone());
        // An ambiguous alias matches nothing.
        if matches.next().is_some() {
            return None;
        }
        found
    }

    pub fn charger_exists(&self, charger_id: &str) -> bool {
        self.read().chargers.contains_key(charger_id)
    }

    /// Create an unknown charger with defaults, if configured to.
    pub fn autoregister(&self, charger_id: &str) -> Result<(), ModelError> {
        if !self.settings.charger_autoregister {
            return Err(ModelError::NotFound {
                entity: "charger",
                id: charger_id.to_string(),
            });
        }
        let charger = Charger::new(
            charger_id,
            charger_id,
            self.settings.charger_autoregister_group.clone(),
            1,
            None,
            None,
            self.settings.default_conn_max,
            None,
        );
        self.add_charger(charger)
    }

    pub fn reset_charger_auth(&self, charger_id: &str) -> Result<(), ModelError> {
        let mut model = self.write();
        let charger = model
            .chargers
            .get_mut(charger_id)
            .ok_or(ModelError::NotFound {
                entity: "charger",
                id: charger_id.to_string(),
            })?;
        charger.auth_sha = None;
        Ok(())
    }

    pub fn set_charger_auth_sha(&self, charger_id: &str, auth_sha: String) {
        if let Some(charger) = self.write().chargers.get_mut(charger_id) {
            charger.auth_sha = Some(auth_sha);
        }
    }

    pub fn charger_auth_sha(&self, charger_id: &str) -> Option<String> {
        self.read()
            .chargers
            .get(charger_id)
            .and_then(|c| c.auth_sha.clone())
    }

    // ── Tag CRUD ───────────────────────────────────────────────

    pub fn add_tag(&self, tag: Tag) -> Result<(), ModelError> {
        let mut model = self.write();
        if model.tags.contains_key(&tag.id_tag) {
            return Err(ModelError::Duplicate {
                entity: "tag",
                id: tag.id_tag,
            });
        }
        model.tags.insert(tag.id_tag.clone(), tag);
        Ok(())
    }

    pub fn update_tag(
        &self,
        id_tag: &str,
        user_name: Option<String>,
        parent_id_tag: Option<String>,
        description: Option<String>,
        status: Option<TagStatus>,
        priority: Option<i32>,
    ) -> Result<(), ModelError> {
        let id_tag = id_tag.to_uppercase();
        let mut model = self.write();

        // Blocking a parent tag with active members is suspicious but
        // allowed; the members keep charging.
        if status == Some(TagStatus::Blocked) {
            let members: Vec<String> = model
                .tags
                .values()
                .filter(|t| t.parent_id_tag.as_deref() == Some(id_tag.as_str()))
                .map(|t| t.id_tag.clone())
                .collect();
            let active = members.iter().any(|member| {
                model.chargers.values().any(|c| {
                    c.connectors
                        .values()
                        .any(|conn| conn.session.as_ref().map(|s| &s.id_tag) == Some(member))
                })
            });
            if active {
                warn!(
                    id_tag = id_tag.as_str(),
                    "Blocking a parent tag while member sessions are active"
                );
            }
        }

        let tag = model
            .tags
            .get_mut(&id_tag)
            .ok_or_else(|| ModelError::NotFound {
                entity: "tag",
                id: id_tag.clone(),
            })?;
        if let Some(user_name) = user_name {
            tag.user_name = Some(user_name);
        }
        if let Some(parent_id_tag) = parent_id_tag {
            tag.parent_id_tag = Some(parent_id_tag);
        }
        if let Some(description) = description {
            tag.description = Some(description);
        }
        if let Some(status) = status {
            tag.status = status;
        }
        if let Some(priority) = priority {
            tag.priority = Some(priority);
        }
        Ok(())
    }

    pub fn delete_tag(&self, id_tag: &str) -> Result<(), ModelError> {
        let id_tag = id_tag.to_uppercase();
        let mut model = self.write();
        if model.tags.remove(&id_tag).is_none() {
            return Err(ModelError::NotFound {
                entity: "tag",
                id: id_tag,
            });
        }
        Ok(())
    }

    // ── Firmware catalogue ─────────────────────────────────────

    pub fn add_firmware(&self, record: FirmwareRecord) -> Result<(), ModelError> {
        let mut model = self.write();
        if model
            .firmware
            .iter()
            .any(|f| f.firmware_id == record.firmware_id)
        {
            return Err(ModelError::Duplicate {
                entity: "firmware",
                id: record.firmware_id,
            });
        }
        info!(firmware_id = record.firmware_id.as_str(), "Firmware entry created");
        model.firmware.push(record);
        Ok(())
    }

    pub fn update_firmware_record(
        &self,
        firmware_id: &str,
        charge_point_model: Option<String>,
        firmware_version: Option<String>,
        location: Option<String>,
    ) -> Result<(), ModelError> {
        let mut model = self.write();
        let record = model
            .firmware
            .iter_mut()
            .find(|f| f.firmware_id == firmware_id)
            .ok_or(ModelError::NotFound {
                entity: "firmware",
                id: firmware_id.to_string(),
            })?;
        if let Some(charge_point_model) = charge_point_model {
            record.charge_point_model = charge_point_model;
        }
        if let Some(firmware_version) = firmware_version {
            record.firmware_version = firmware_version;
        }
        if let Some(location) = location {
            record.location = location;
        }
        Ok(())
    }

    pub fn delete_firmware(&self, firmware_id: &str) -> Result<(), ModelError> {
        let mut model = self.write();
        let before = model.firmware.len();
        model.firmware.retain(|f| f.firmware_id != firmware_id);
        if model.firmware.len() == before {
            return Err(ModelError::NotFound {
                entity: "firmware",
                id: firmware_id.to_string(),
            });
        }
        Ok(())
    }

    // ── Authorization ──────────────────────────────────────────

    pub fn authorize(&self, id_tag: &str, charger_id: &str) -> AuthOutcome {
        let id_tag = id_tag.to_uppercase();
        let model = self.read();
        let Some(tag) = model.tags.get(&id_tag) else {
            warn!(id_tag = id_tag.as_str(), "Rejecting unknown tag");
            return AuthOutcome::Invalid;
        };
        if tag.status != TagStatus::Activated {
            warn!(id_tag = id_tag.as_str(), status = %tag.status, "Rejecting tag");
            return AuthOutcome::Blocked;
        }
        if !self.settings.allow_concurrent_tag {
            let concurrent = model
                .chargers
                .values()
                .filter(|c| c.charger_id != charger_id)
                .flat_map(|c| c.connectors.values())
                .any(|conn| conn.session.as_ref().map(|s| s.id_tag.as_str()) == Some(id_tag.as_str()));
            if concurrent {
                info!(
                    id_tag = id_tag.as_str(),
                    "Rejecting tag already used in another transaction"
                );
                return AuthOutcome::ConcurrentTx;
            }
        }
        AuthOutcome::Accepted {
            parent_id_tag: tag.parent_id_tag.clone(),
        }
    }

    /// Whether `stop_tag` may stop a session started by `start_tag`:
    /// same tag, shared parent group, or the stop tag is the parent itself.
    pub fn may_stop(&self, stop_tag: &str, start_tag: &str) -> bool {
        let stop_tag = stop_tag.to_uppercase();
        let start_tag = start_tag.to_uppercase();
        if stop_tag == start_tag {
            return true;
        }
        let model = self.read();
        let stop_parent = model.tags.get(&stop_tag).and_then(|t| t.parent_id_tag.clone());
        let start_parent = model
            .tags
            .get(&start_tag)
            .and_then(|t| t.parent_id_tag.clone());
        (stop_parent.is_some() && stop_parent == start_parent)
            || stop_parent.as_deref() == Some(start_tag.as_str())
    }

    // ── Connector state machine ────────────────────────────────

    pub fn mark_connected(&self, charger_id: &str, now: DateTime<Utc>) {
        let mut model = self.write();
        if let Some(charger) = model.chargers.get_mut(charger_id) {
            charger.connected = true;
            charger.last_update = Some(now);
            charger.profile_initialized = false;
            charger.requested_status = false;
        }
    }

    /// Disconnect: all connectors go `Unknown`, their offers leave the
    /// allocation totals. Live sessions stay for the watchdog to reap.
    pub fn mark_disconnected(&self, charger_id: &str, now: DateTime<Utc>) {
        let mut model = self.write();
        if let Some(charger) = model.chargers.get_mut(charger_id) {
            charger.connected = false;
            charger.profile_initialized = false;
            charger.requested_status = false;
            for conn in charger.connectors.values_mut() {
                conn.status = ConnectorStatus::Unknown;
                if conn.offer > 0 {
                    if let Some(session) = conn.session.as_mut() {
                        session.record_offer(now, None);
                    }
                    conn.offer = 0;
                }
            }
        }
    }

    pub fn touch(&self, charger_id: &str, now: DateTime<Utc>) {
        if let Some(charger) = self.write().chargers.get_mut(charger_id) {
            charger.last_update = Some(now);
        }
    }

    pub fn boot_notification(
        &self,
        charger_id: &str,
        vendor: String,
        model_name: String,
        serial: Option<String>,
        firmware_version: Option<String>,
        meter_type: Option<String>,
    ) {
        let mut model = self.write();
        if let Some(charger) = model.chargers.get_mut(charger_id) {
            charger.charge_point_vendor = Some(vendor);
            charger.charge_point_model = Some(model_name);
            charger.charge_point_serial_number = serial;
            charger.firmware_version = firmware_version;
            charger.meter_type = meter_type;
            info!(charger_id, "BootNotification recorded");
        }
    }

    pub fn status_notification(
        &self,
        charger_id: &str,
        connector_id: u32,
        status: ConnectorStatus,
        now: DateTime<Utc>,
    ) -> Result<(), ModelError> {
        let usage_window = self.settings.usage_window;
        let mut model = self.write();
        let charger = model
            .chargers
            .get_mut(charger_id)
            .ok_or(ModelError::NotFound {
                entity: "charger",
                id: charger_id.to_string(),
            })?;
        let conn = charger
            .connectors
            .get_mut(&connector_id)
            .ok_or(ModelError::NotFound {
                entity: "connector",
                id: format!("{}/{}", charger_id, connector_id),
            })?;

        // A SuspendedEVSE report without a transaction means the blocking
        // profile is doing its job: the EV wants current we have not yet
        // granted. Tracked as Preparing (awaiting offer) unless the
        // connector is deliberately parked by unused-offer reclamation.
        let suspension_active = conn.suspend_until.map(|t| now < t).unwrap_or(false);
        let effective = if status == ConnectorStatus::SuspendedEVSE
            && conn.session.is_none()
            && !suspension_active
        {
            ConnectorStatus::Preparing
        } else {
            status
        };

        if effective != conn.status {
            info!(
                connector = conn.id_str(charger_id).as_str(),
                from = %conn.status,
                to = %effective,
                reported = %status,
                "Connector status change"
            );
            conn.status = effective;

            if effective == ConnectorStatus::Preparing && conn.session.is_none() && conn.offer == 0
            {
                conn.needs_review = true;
            }

            // SuspendedEV means the EV draws nothing; count it as a zero
            // sample even if the charger stops sending MeterValues.
            if effective == ConnectorStatus::SuspendedEV {
                conn.record_usage(0.0, now, usage_window);
                if let Some(session) = conn.session.as_mut() {
                    session.usage_a = Some(0.0);
                }
            }
        }

        if !conn.status.is_transactional() && conn.offer > 0 {
            debug!(
                connector = conn.id_str(charger_id).as_str(),
                "Dropping offer outside transactional state"
            );
            if let Some(session) = conn.session.as_mut() {
                session.record_offer(now, None);
            }
            conn.offer = 0;
        }
        Ok(())
    }

    // ── Transactions ───────────────────────────────────────────

    pub fn start_transaction(
        &self,
        charger_id: &str,
        connector_id: u32,
        id_tag: &str,
        meter_start: i64,
        timestamp: DateTime<Utc>,
    ) -> Result<i32, ModelError> {
        let id_tag = id_tag.to_uppercase();

        // Close a leftover transaction first, unless this is a duplicate
        // delivery of the same start (timestamps match).
        let leftover = {
            let model = self.read();
            model
                .chargers
                .get(charger_id)
                .and_then(|c| c.connectors.get(&connector_id))
                .and_then(|conn| conn.session.as_ref())
                .map(|s| (s.transaction_id, s.start_time, s.energy_wh))
        };
        if let Some((old_id, old_start, old_energy)) = leftover {
            if old_start == timestamp {
                warn!(
                    charger_id,
                    connector_id, "Duplicate StartTransaction, keeping existing"
                );
                return Ok(old_id);
            }
            warn!(
                charger_id,
                connector_id, old_id, "Stopping leftover transaction before starting new"
            );
            self.stop_transaction(
                charger_id,
                old_id,
                old_energy,
                timestamp,
                Some("Start transaction without stop transaction".to_string()),
                None,
            )?;
        }

        let transaction_id = self.next_transaction_id.fetch_add(1, Ordering::SeqCst);
        let mut model = self.write();
        let (user_name, tag_priority) = match model.tags.get(&id_tag) {
            Some(tag) => (tag.user_name.clone(), tag.priority),
            None => (None, None),
        };
        let charger = model
            .chargers
            .get_mut(charger_id)
            .ok_or(ModelError::NotFound {
                entity: "charger",
                id: charger_id.to_string(),
            })?;
        let conn = charger
            .connectors
            .get_mut(&connector_id)
            .ok_or(ModelError::NotFound {
                entity: "connector",
                id: format!("{}/{}", charger_id, connector_id),
            })?;

        conn.reset_session_fields();
        conn.session = Some(ChargingSession::new(
            transaction_id,
            id_tag.clone(),
            user_name,
            timestamp,
            meter_start,
            tag_priority,
        ));
        conn.last_offer_change = Some(timestamp);
        // TxProfile + blocking reinstatement still pending for this session.
        conn.blocking_profile_installed = false;
        conn.needs_review = true;

        info!(
            charger_id,
            connector_id,
            transaction_id,
            id_tag = id_tag.as_str(),
            meter_start,
            "Transaction started"
        );
        Ok(transaction_id)
    }

    pub fn stop_transaction(
        &self,
        charger_id: &str,
        transaction_id: i32,
        meter_stop: i64,
        timestamp: DateTime<Utc>,
        reason: Option<String>,
        stop_id_tag: Option<String>,
    ) -> Result<ClosedSession, ModelError> {
        let closed = {
            let mut model = self.write();
            let charger = model
                .chargers
                .get_mut(charger_id)
                .ok_or(ModelError::NotFound {
                    entity: "charger",
                    id: charger_id.to_string(),
                })?;
            let alias = charger.alias.clone();
            let group_id = charger.group_id.clone();
            let conn = charger
                .connectors
                .values_mut()
                .find(|c| {
                    c.session
                        .as_ref()
                        .map(|s| s.transaction_id == transaction_id)
                        .unwrap_or(false)
                })
                .ok_or(ModelError::NotFound {
                    entity: "transaction",
                    id: transaction_id.to_string(),
                })?;

            let mut session = conn.session.take().expect("session checked above");
            session.record_offer(timestamp, Some(0));
            conn.offer = 0;
            conn.reset_session_fields();
            conn.blocking_profile_installed = false;
            conn.needs_review = false;

            info!(
                charger_id,
                transaction_id,
                reason = reason.as_deref().unwrap_or("-"),
                "Transaction stopped"
            );

            ClosedSession::close(
                session,
                charger_id,
                &alias,
                &group_id,
                meter_stop,
                timestamp,
                reason,
                stop_id_tag,
            )
        };

        if let Some(writer) = self.history.lock().expect("history lock poisoned").as_mut() {
            writer.append(&closed);
        }
        self.closed_sessions
            .lock()
            .expect("session archive lock poisoned")
            .push(closed.clone());
        Ok(closed)
    }

    /// Archived sessions, optionally filtered by charger.
    pub fn closed_sessions(&self, charger_id: Option<&str>) -> Vec<ClosedSession> {
        let archive = self
            .closed_sessions
            .lock()
            .expect("session archive lock poisoned");
        archive
            .iter()
            .filter(|s| charger_id.map(|id| s.charger_id == id).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// The id tag that started `transaction_id`, if it is live.
    pub fn transaction_start_tag(&self, charger_id: &str, transaction_id: i32) -> Option<String> {
        let model = self.read();
        model
            .chargers
            .get(charger_id)?
            .connectors
            .values()
            .find_map(|c| match &c.session {
                Some(s) if s.transaction_id == transaction_id => Some(s.id_tag.clone()),
                _ => None,
            })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn meter_values(
        &self,
        charger_id: &str,
        connector_id: u32,
        usage_a: f64,
        energy_wh: Option<i64>,
        offered: Option<u32>,
        transaction_id: Option<i32>,
        timestamp: DateTime<Utc>,
    ) {
        let usage_window = self.settings.usage_window;
        let mut model = self.write();
        let Some(charger) = model.chargers.get_mut(charger_id) else {
            warn!(charger_id, "MeterValues for unknown charger");
            return;
        };
        let Some(conn) = charger.connectors.get_mut(&connector_id) else {
            warn!(charger_id, connector_id, "MeterValues for unknown connector");
            return;
        };

        if let Some(tx_id) = transaction_id {
            if conn.session.is_none() {
                // Startup situation: the charger is mid-transaction from
                // before we (re)started. Synthesize the session.
                warn!(
                    charger_id,
                    connector_id, tx_id, "Synthesizing transaction from MeterValues"
                );
                conn.reset_session_fields();
                conn.session = Some(ChargingSession::new(
                    tx_id,
                    "UNKNOWN",
                    None,
                    timestamp,
                    0,
                    None,
                ));
                conn.blocking_profile_installed = false;
                if !conn.status.is_transactional() {
                    conn.status = if usage_a > 0.0 {
                        ConnectorStatus::Charging
                    } else if offered.map(|o| o > 0).unwrap_or(true) {
                        ConnectorStatus::SuspendedEV
                    } else {
                        ConnectorStatus::Preparing
                    };
                }
            }
            if let Some(session) = conn.session.as_mut() {
                session.usage_a = Some(usage_a);
                if let Some(energy) = energy_wh {
                    session.energy_wh = energy;
                }
                session.last_usage_time = timestamp;
            }
        }

        // Reconcile a reported offer with what we believe is installed.
        if let Some(offered) = offered {
            if offered != conn.offer {
                warn!(
                    connector = conn.id_str(charger_id).as_str(),
                    reported = offered,
                    installed = conn.offer,
                    "Charger-reported offer differs, adopting it"
                );
                conn.offer = offered;
                if conn.last_offer_change.is_none() {
                    conn.last_offer_change = Some(timestamp);
                }
            }
        }

        conn.record_usage(usage_a, timestamp, usage_window);
    }

    // ── Allocator effects ──────────────────────────────────────

    /// Record a committed offer change. Any offer at or above
    /// `min_allocation` restarts the monitoring window and the increase
    /// dwell; a reclaim carries its deferral timestamp.
    pub fn offer_change_implemented(
        &self,
        charger_id: &str,
        connector_id: u32,
        allocation: u32,
        min_allocation: u32,
        suspend_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        let mut model = self.write();
        let Some(conn) = model
            .chargers
            .get_mut(charger_id)
            .and_then(|c| c.connectors.get_mut(&connector_id))
        else {
            return;
        };
        conn.offer = allocation;
        if allocation >= min_allocation {
            conn.last_offer_change = Some(now);
            conn.clear_usage();
            conn.suspend_until = None;
        }
        if let Some(until) = suspend_until {
            conn.suspend_until = Some(until);
        }
        if let Some(session) = conn.session.as_mut() {
            session.record_offer(now, Some(allocation));
        }
        debug!(
            charger_id,
            connector_id, allocation, "Offer change implemented"
        );
    }

    pub fn set_plateau(&self, charger_id: &str, connector_id: u32, plateau: u32) {
        let mut model = self.write();
        if let Some(conn) = model
            .chargers
            .get_mut(charger_id)
            .and_then(|c| c.connectors.get_mut(&connector_id))
        {
            if conn.plateau.map(|p| plateau < p).unwrap_or(true) {
                info!(
                    connector = conn.id_str(charger_id).as_str(),
                    plateau, "EV usage ceiling detected"
                );
                conn.plateau = Some(plateau);
            }
        }
    }

    pub fn set_profile_initialized(&self, charger_id: &str, initialized: bool) {
        if let Some(charger) = self.write().chargers.get_mut(charger_id) {
            charger.profile_initialized = initialized;
        }
    }

    pub fn set_requested_status(&self, charger_id: &str) {
        if let Some(charger) = self.write().chargers.get_mut(charger_id) {
            charger.requested_status = true;
        }
    }

    pub fn set_blocking_profile_installed(
        &self,
        charger_id: &str,
        connector_id: u32,
        installed: bool,
    ) {
        let mut model = self.write();
        if let Some(conn) = model
            .chargers
            .get_mut(charger_id)
            .and_then(|c| c.connectors.get_mut(&connector_id))
        {
            conn.blocking_profile_installed = installed;
        }
    }

    pub fn clear_review_flags(&self, charger_id: &str) {
        let mut model = self.write();
        if let Some(charger) = model.chargers.get_mut(charger_id) {
            for conn in charger.connectors.values_mut() {
                conn.needs_review = false;
            }
        }
    }

    pub fn set_session_priority(
        &self,
        charger_id: &str,
        connector_id: u32,
        priority: i32,
    ) -> Result<(), ModelError> {
        let mut model = self.write();
        let conn = model
            .chargers
            .get_mut(charger_id)
            .and_then(|c| c.connectors.get_mut(&connector_id))
            .ok_or(ModelError::NotFound {
                entity: "connector",
                id: format!("{}/{}", charger_id, connector_id),
            })?;
        let session = conn.session.as_mut().ok_or_else(|| {
            ModelError::Integrity(format!(
                "connector {}/{} has no live session",
                charger_id, connector_id
            ))
        })?;
        session.priority = Some(priority);
        Ok(())
    }

    // ── Watchdog ───────────────────────────────────────────────

    /// Sessions on chargers not heard from within `timeout` are
    /// force-closed with reason `stale`. Returns the closed sessions.
    pub fn reap_stale_sessions(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Vec<ClosedSession> {
        let stale: Vec<(String, u32, i32, i64, bool)> = {
            let model = self.read();
            model
                .chargers
                .values()
                .filter(|c| {
                    c.last_update
                        .map(|t| now.signed_duration_since(t) > timeout)
                        .unwrap_or(true)
                })
                .flat_map(|c| {
                    c.connectors.values().filter_map(|conn| {
                        conn.session.as_ref().map(|s| {
                            (
                                c.charger_id.clone(),
                                conn.connector_id,
                                s.transaction_id,
                                s.energy_wh,
                                c.connected,
                            )
                        })
                    })
                })
                .collect()
        };

        let mut closed = Vec::new();
        for (charger_id, connector_id, transaction_id, energy_wh, connected) in stale {
            warn!(
                charger_id = charger_id.as_str(),
                transaction_id, "Force-closing stale transaction"
            );
            match self.stop_transaction(
                &charger_id,
                transaction_id,
                energy_wh,
                now,
                Some("stale".to_string()),
                None,
            ) {
                Ok(session) => {
                    // A charger that is still connected but silent gets its
                    // connector parked; a disconnected one stays Unknown.
                    if connected {
                        let mut model = self.write();
                        if let Some(conn) = model
                            .chargers
                            .get_mut(&charger_id)
                            .and_then(|c| c.connectors.get_mut(&connector_id))
                        {
                            conn.status = ConnectorStatus::Available;
                        }
                    }
                    closed.push(session);
                }
                Err(e) => warn!(error = %e, "Stale reap failed"),
            }
        }
        closed
    }

    // ── Reloads ────────────────────────────────────────────────

    /// Swap the group set. Surviving groups keep their suspension flag.
    pub fn reload_groups(&self, groups: HashMap<String, Group>) -> Result<(), ModelError> {
        validate_group_tree(&groups)?;
        let mut model = self.write();
        for charger in model.chargers.values() {
            if !groups.contains_key(&charger.group_id) {
                return Err(ModelError::Integrity(format!(
                    "charger {} would be orphaned by group reload",
                    charger.charger_id
                )));
            }
        }
        let mut groups = groups;
        for (id, new) in groups.iter_mut() {
            if let Some(old) = model.groups.get(id) {
                new.allocator_suspended = old.allocator_suspended;
            }
        }
        model.groups = groups;
        info!("Groups reloaded");
        Ok(())
    }

    /// Swap the charger set. Surviving chargers keep their live state;
    /// sessions on removed chargers are closed with reason `config_reload`.
    pub fn reload_chargers(
        &self,
        chargers: HashMap<String, Charger>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClosedSession>, ModelError> {
        let orphans: Vec<(String, i32, i64)> = {
            let model = self.read();
            for charger in chargers.values() {
                if !model.groups.contains_key(&charger.group_id) {
                    return Err(ModelError::NotFound {
                        entity: "group",
                        id: charger.group_id.clone(),
                    });
                }
            }
            model
                .chargers
                .values()
                .filter(|c| !chargers.contains_key(&c.charger_id))
                .flat_map(|c| {
                    c.connectors.values().filter_map(|conn| {
                        conn.session
                            .as_ref()
                            .map(|s| (c.charger_id.clone(), s.transaction_id, s.energy_wh))
                    })
                })
                .collect()
        };

        let mut closed = Vec::new();
        for (charger_id, transaction_id, energy_wh) in orphans {
            if let Ok(session) = self.stop_transaction(
                &charger_id,
                transaction_id,
                energy_wh,
                now,
                Some("config_reload".to_string()),
                None,
            ) {
                closed.push(session);
            }
        }

        let mut model = self.write();
        let mut chargers = chargers;
        for (id, new) in chargers.iter_mut() {
            if let Some(old) = model.chargers.remove(id) {
                // Live state survives the reload; CSV fields are refreshed.
                new.connectors = old.connectors;
                new.connected = old.connected;
                new.last_update = old.last_update;
                new.profile_initialized = old.profile_initialized;
                new.requested_status = old.requested_status;
                new.charge_point_vendor = old.charge_point_vendor;
                new.charge_point_model = old.charge_point_model;
                new.charge_point_serial_number = old.charge_point_serial_number;
                new.firmware_version = old.firmware_version;
                new.meter_type = old.meter_type;
            }
        }
        model.chargers = chargers;
        info!("Chargers reloaded");
        Ok(closed)
    }

    pub fn reload_tags(&self, tags: HashMap<String, Tag>) {
        let mut model = self.write();
        model.tags = tags;
        info!(count = model.tags.len(), "Tags reloaded");
    }

    pub fn reload_firmware(&self, firmware: Vec<FirmwareRecord>) {
        let mut model = self.write();
        model.firmware = firmware;
        info!(count = model.firmware.len(), "Firmware catalogue reloaded");
    }

    // ── Snapshots ──────────────────────────────────────────────

    pub fn snapshot(&self, now: DateTime<Utc>) -> Snapshot {
        let model = self.read();
        let groups: HashMap<String, GroupSnapshot> = model
            .groups
            .iter()
            .map(|(id, g)| {
                (
                    id.clone(),
                    GroupSnapshot {
                        group_id: g.group_id.clone(),
                        parent_id: g.parent_id.clone(),
                        schedule: g.max_allocation.clone(),
                        allocator_suspended: g.allocator_suspended,
                    },
                )
            })
            .collect();

        let mut chargers: Vec<ChargerSnapshot> = model
            .chargers
            .values()
            .map(|charger| {
                let ancestors = allocation_ancestors(&model.groups, &charger.group_id);
                let connectors = charger
                    .connectors
                    .values()
                    .map(|conn| ConnectorSnapshot {
                        connector_id: conn.connector_id,
                        status: conn.status,
                        offer: conn.offer,
                        last_offer_change: conn.last_offer_change,
                        suspend_until: conn.suspend_until,
                        plateau: conn.plateau,
                        rolling_max_usage: conn
                            .rolling_max_usage(now, self.settings.usage_window),
                        blocking_profile_installed: conn.blocking_profile_installed,
                        needs_review: conn.needs_review,
                        session: conn.session.as_ref().map(|s| SessionSnapshot {
                            transaction_id: s.transaction_id,
                            energy_delivered_wh: s.energy_delivered_wh(),
                            usage_a: s.usage_a,
                        }),
                        effective_priority: resolve_priority(
                            &model,
                            charger,
                            conn,
                            self.settings.default_priority,
                        ),
                    })
                    .collect();
                ChargerSnapshot {
                    charger_id: charger.charger_id.clone(),
                    alias: charger.alias.clone(),
                    group_id: charger.group_id.clone(),
                    conn_max: charger.conn_max,
                    connected: charger.connected,
                    profile_initialized: charger.profile_initialized,
                    requested_status: charger.requested_status,
                    allocation_ancestors: ancestors,
                    connectors,
                }
            })
            .collect();
        chargers.sort_by(|a, b| a.charger_id.cmp(&b.charger_id));

        Snapshot {
            taken_at: now,
            groups,
            chargers,
        }
    }
}

/// Session override, then charger, then the nearest group with a default,
/// then the configured fallback.
pub(crate) fn resolve_priority(
    model: &Model,
    charger: &Charger,
    conn: &Connector,
    default_priority: i32,
) -> i32 {
    if let Some(p) = conn.session.as_ref().and_then(|s| s.priority) {
        return p;
    }
    if let Some(p) = charger.priority {
        return p;
    }
    let mut cursor = Some(charger.group_id.clone());
    let mut hops = 0;
    while let Some(id) = cursor {
        let Some(group) = model.groups.get(&id) else {
            break;
        };
        if let Some(p) = group.priority {
            return p;
        }
        cursor = group.parent_id.clone();
        hops += 1;
        if hops > model.groups.len() {
            break;
        }
    }
    default_priority
}

/// Allocation-group ancestors of `group_id` (inclusive), nearest first.
fn allocation_ancestors(groups: &HashMap<String, Group>, group_id: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut cursor = Some(group_id.to_string());
    let mut hops = 0;
    while let Some(id) = cursor {
        let Some(group) = groups.get(&id) else {
            break;
        };
        if group.is_allocation_group() {
            result.push(group.group_id.clone());
        }
        cursor = group.parent_id.clone();
        hops += 1;
        if hops > groups.len() {
            break;
        }
    }
    result
}

/// Parents must exist and the tree must be acyclic.
fn validate_group_tree(groups: &HashMap<String, Group>) -> Result<(), ModelError> {
    for group in groups.values() {
        if let Some(parent) = &group.parent_id {
            if !groups.contains_key(parent) {
                return Err(ModelError::Integrity(format!(
                    "group {} references unknown parent {}",
                    group.group_id, parent
                )));
            }
        }
        let mut cursor = group.parent_id.clone();
        let mut hops = 0;
        while let Some(id) = cursor {
            if id == group.group_id {
                return Err(ModelError::Integrity(format!(
                    "group cycle through {}",
                    group.group_id
                )));
            }
            cursor = groups.get(&id).and_then(|g| g.parent_id.clone());
            hops += 1;
            if hops > groups.len() {
                return Err(ModelError::Integrity(format!(
                    "group cycle through {}",
                    group.group_id
                )));
            }
        }
    }
    Ok(())
}

//! Admin API
//!
//! WebSocket protocol on `/api`, deliberately framed like OCPP-J:
//! `[2, msgId, command, payload]` in, `[3, msgId, payload]` or
//! `[4, msgId, status, description, {}]` out. Every call before a
//! successful `Login` is rejected; after login the user's role gates the
//! catalogue. Mutating commands land in the audit log.

use std::sync::Arc;

use chrono::{Local, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::api::draw::draw_all;
use crate::api::users::{Role, UserStore};
use crate::config::AppConfig;
use crate::model::registry::resolve_priority;
use crate::model::{
    store, Charger, ClosedSession, FirmwareRecord, Group, ModelRegistry, Schedule, TagStatus,
};
use crate::ocpp::commands::SharedCommandSender;
use crate::ocpp::connections::SharedConnectionRegistry;
use crate::ocpp::frame::OcppFrame;
use crate::support::audit::AuditLog;
use crate::support::errors::CommandError;
use crate::support::shutdown::ShutdownSignal;

/// Commands that must name a known charger (by id or alias).
const CHARGER_COMMANDS: [&str; 12] = [
    "ClearDefaultProfiles",
    "ClearDefaultProfile",
    "SetDefaultProfile",
    "SetTxProfile",
    "Reset",
    "RemoteStartTransaction",
    "RemoteStopTransaction",
    "GetConfiguration",
    "ChangeConfiguration",
    "TriggerMessage",
    "SetChargePriority",
    "UpdateFirmware",
];

pub struct ApiContext {
    pub registry: Arc<ModelRegistry>,
    pub connections: SharedConnectionRegistry,
    pub commands: SharedCommandSender,
    pub users: Arc<UserStore>,
    pub audit: Arc<AuditLog>,
    pub config: Arc<AppConfig>,
}

/// Per-connection API session state.
pub struct ApiSession {
    user: Option<(String, Role)>,
}

impl Default for ApiSession {
    fn default() -> Self {
        Self { user: None }
    }
}

/// Serve one admin API connection until it closes.
pub async fn run<S>(stream: WebSocketStream<S>, ctx: Arc<ApiContext>, shutdown: ShutdownSignal)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut source) = stream.split();
    let mut session = ApiSession::default();

    loop {
        tokio::select! {
            message = source.next() => {
                let Some(message) = message else { break };
                match message {
                    Ok(Message::Text(text)) => {
                        let response = match OcppFrame::parse(&text) {
                            Ok(OcppFrame::Call { unique_id, action, payload }) => {
                                session.handle_command(&ctx, &unique_id, &action, payload).await
                            }
                            Ok(other) => {
                                OcppFrame::error_response(other.unique_id(), "ProtocolError", "Expected a Call frame")
                            }
                            Err(e) => {
                                warn!(error = %e, "Malformed API frame");
                                OcppFrame::error_response("-1", "ProtocolError", e.to_string())
                            }
                        };
                        if sink.send(Message::Text(response.serialize())).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            _ = shutdown.notified().wait() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    debug!("API connection closed");
}

impl ApiSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn handle_command(
        &mut self,
        ctx: &ApiContext,
        message_id: &str,
        command: &str,
        mut payload: Value,
    ) -> OcppFrame {
        // Login and DrawAll stay out of the logs (secrets and noise).
        if command != "Login" && command != "DrawAll" {
            debug!(command, message_id, "API command");
        }

        if command == "Login" {
            return self.login(ctx, message_id, &payload);
        }

        let Some((user_id, role)) = self.user.clone() else {
            return OcppFrame::error_response(message_id, "NotAuthorized", "Login first");
        };
        if !role.allows(command) {
            return OcppFrame::error_response(message_id, "NotAuthorized", "Insufficient role");
        }

        // Resolve a charger alias quietly; an explicit id wins.
        if payload.is_object() && payload.get("charger_id").is_none() {
            if let Some(alias) = payload.get("alias").and_then(Value::as_str) {
                if let Some(id) = ctx.registry.find_charger_id(None, Some(alias)) {
                    payload["charger_id"] = json!(id);
                }
            }
        }

        // Common checks for charger-addressed commands.
        if CHARGER_COMMANDS.contains(&command) {
            let charger_id = payload.get("charger_id").and_then(Value::as_str);
            let Some(charger_id) = charger_id else {
                return OcppFrame::error_response(message_id, "NoSuchCharger", "charger_id missing");
            };
            if !ctx.registry.charger_exists(charger_id) {
                return OcppFrame::error_response(message_id, "NoSuchCharger", charger_id);
            }
            if command != "SetChargePriority" && !ctx.connections.is_connected(charger_id) {
                return OcppFrame::error_response(message_id, "ChargerNotConnected", charger_id);
            }
        }

        // Everything that mutates lands in the audit log.
        if !command.starts_with("Get") && command != "DrawAll" {
            ctx.audit.record(&user_id, command, &payload.to_string());
        }

        match command {
            "GetStatus" => self.get_status(ctx, message_id),
            "GetGroups" => self.get_groups(ctx, message_id, &payload),
            "GetChargers" => self.get_chargers(ctx, message_id, &payload),
            "GetTags" => self.get_tags(ctx, message_id),
            "GetSessions" => self.get_sessions(ctx, message_id, &payload),
            "GetUsers" => self.get_users(ctx, message_id),
            "GetFirmware" => self.get_firmware(ctx, message_id),
            "DrawAll" => {
                let text = ctx.registry.with_model(draw_all);
                OcppFrame::result(message_id, json!({"text": text}))
            }

            "CreateGroup" => self.create_group(ctx, message_id, &payload),
            "UpdateGroup" => self.update_group(ctx, message_id, &payload),
            "DeleteGroup" => self.delete_group(ctx, message_id, &payload),
            "ReloadGroups" => self.reload_groups(ctx, message_id),

            "CreateCharger" => self.create_charger(ctx, message_id, &payload),
            "UpdateCharger" => self.update_charger(ctx, message_id, &payload),
            "DeleteCharger" => self.delete_charger(ctx, message_id, &payload),
            "ResetChargerAuth" => self.reset_charger_auth(ctx, message_id, &payload),
            "ReloadChargers" => self.reload_chargers(ctx, message_id),

            "CreateTag" => self.create_tag(ctx, message_id, &payload),
            "UpdateTag" => self.update_tag(ctx, message_id, &payload),
            "DeleteTag" => self.delete_tag(ctx, message_id, &payload),
            "ReloadTags" => self.reload_tags(ctx, message_id),

            "CreateFirmware" => self.create_firmware(ctx, message_id, &payload),
            "ModifyFirmware" => self.modify_firmware(ctx, message_id, &payload),
            "DeleteFirmware" => self.delete_firmware(ctx, message_id, &payload),
            "ReloadFirmware" => self.reload_firmware(ctx, message_id),

            "CreateUser" => self.create_user(ctx, message_id, &payload),
            "UpdateUser" => self.update_user(ctx, message_id, &payload),
            "DeleteUser" => self.delete_user(ctx, message_id, &payload),

            "SetAllocatorState" => self.set_allocator_state(ctx, message_id, &payload),
            "SetChargePriority" => self.set_charge_priority(ctx, message_id, &payload),

            "Reset" | "RemoteStartTransaction" | "RemoteStopTransaction" | "GetConfiguration"
            | "ChangeConfiguration" | "TriggerMessage" | "ClearDefaultProfiles"
            | "ClearDefaultProfile" | "SetDefaultProfile" | "SetTxProfile"
            | "UpdateFirmware" => {
                self.passthrough(ctx, message_id, command, payload).await
            }

            _ => OcppFrame::error_response(message_id, "UnknownCommand", command),
        }
    }

    fn login(&mut self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let Some(token) = payload.get("token").and_then(Value::as_str) else {
            return OcppFrame::error_response(message_id, "InvalidLogin", "token missing");
        };
        match ctx.users.check_auth(token) {
            Some((user_id, role)) => {
                info!(user_id = user_id.as_str(), role = role.as_str(), "API login");
                self.user = Some((user_id, role));
                OcppFrame::result(message_id, json!({"user_type": role.as_str()}))
            }
            None => OcppFrame::error_response(message_id, "InvalidLogin", "Unknown credentials"),
        }
    }

    // ── Queries ────────────────────────────────────────────────

    fn get_status(&self, ctx: &ApiContext, message_id: &str) -> OcppFrame {
        let (groups, chargers, tags) = ctx
            .registry
            .with_model(|m| (m.groups.len(), m.chargers.len(), m.tags.len()));
        OcppFrame::result(
            message_id,
            json!({
                "groups": groups,
                "chargers": chargers,
                "tags": tags,
                "connected": ctx.connections.count(),
            }),
        )
    }

    fn get_groups(&self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let filter = payload.get("group_id").and_then(Value::as_str);
        let groups = ctx.registry.with_model(|model| {
            let mut groups: Vec<Value> = model
                .groups
                .values()
                .filter(|g| filter.map(|f| g.group_id == f).unwrap_or(true))
                .map(|g| group_json(g, model))
                .collect();
            groups.sort_by_key(|g| g["group_id"].as_str().map(String::from));
            groups
        });
        OcppFrame::result(message_id, json!({"groups": groups}))
    }

    fn get_chargers(&self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let group_filter = payload.get("group_id").and_then(Value::as_str);
        let charger_filter = payload.get("charger_id").and_then(Value::as_str);
        let default_priority = ctx.registry.settings().default_priority;
        let chargers = ctx.registry.with_model(|model| {
            let mut chargers: Vec<Value> = model
                .chargers
                .values()
                .filter(|c| group_filter.map(|f| c.group_id == f).unwrap_or(true))
                .filter(|c| charger_filter.map(|f| c.charger_id == f).unwrap_or(true))
                .map(|c| charger_json(c, model, default_priority, &ctx.connections))
                .collect();
            chargers.sort_by_key(|c| c["charger_id"].as_str().map(String::from));
            chargers
        });
        OcppFrame::result(message_id, json!({"chargers": chargers}))
    }

    fn get_tags(&self, ctx: &ApiContext, message_id: &str) -> OcppFrame {
        let tags = ctx.registry.with_model(|model| {
            let mut tags: Vec<Value> = model
                .tags
                .values()
                .map(|t| {
                    json!({
                        "id_tag": t.id_tag,
                        "user_name": t.user_name,
                        "parent_id_tag": t.parent_id_tag,
                        "description": t.description,
                        "status": t.status.to_string(),
                        "priority": t.priority,
                    })
                })
                .collect();
            tags.sort_by_key(|t| t["id_tag"].as_str().map(String::from));
            tags
        });
        OcppFrame::result(message_id, json!({"tags": tags}))
    }

    fn get_sessions(&self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let charger_id = payload.get("charger_id").and_then(Value::as_str);
        let sessions: Vec<Value> = ctx
            .registry
            .closed_sessions(charger_id)
            .iter()
            .map(session_json)
            .collect();
        OcppFrame::result(message_id, json!({"sessions": sessions}))
    }

    fn get_users(&self, ctx: &ApiContext, message_id: &str) -> OcppFrame {
        let users: Vec<Value> = ctx
            .users
            .list()
            .iter()
            .map(|u| {
                json!({
                    "user_id": u.user_id,
                    "user_type": u.role.as_str(),
                    "description": u.description,
                })
            })
            .collect();
        OcppFrame::result(message_id, json!({"users": users}))
    }

    fn get_firmware(&self, ctx: &ApiContext, message_id: &str) -> OcppFrame {
        let firmware = ctx.registry.with_model(|model| {
            model
                .firmware
                .iter()
                .map(|f| {
                    json!({
                        "firmware_id": f.firmware_id,
                        "charge_point_model": f.charge_point_model,
                        "firmware_version": f.firmware_version,
                        "location": f.location,
                    })
                })
                .collect::<Vec<Value>>()
        });
        OcppFrame::result(message_id, json!({"firmware": firmware}))
    }

    // ── Group maintenance ──────────────────────────────────────

    fn create_group(&self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let Some(group_id) = payload.get("group_id").and_then(Value::as_str) else {
            return OcppFrame::error_response(message_id, "MissingField", "group_id");
        };
        let schedule = match payload.get("max_allocation").and_then(Value::as_str) {
            Some(text) if !text.is_empty() => match Schedule::parse(text) {
                Ok(s) => Some(s),
                Err(e) => {
                    return OcppFrame::error_response(message_id, "InvalidSchedule", e.to_string())
                }
            },
            _ => None,
        };
        let group = Group::new(
            group_id,
            payload
                .get("parent_id")
                .and_then(Value::as_str)
                .map(String::from),
            payload
                .get("description")
                .and_then(Value::as_str)
                .map(String::from),
            payload
                .get("priority")
                .and_then(Value::as_i64)
                .map(|p| p as i32),
            schedule,
        );
        match ctx.registry.add_group(group) {
            Ok(()) => OcppFrame::result(message_id, json!({"status": "OK"})),
            Err(e) => OcppFrame::error_response(message_id, "ModelError", e.to_string()),
        }
    }

    fn update_group(&self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let Some(group_id) = payload.get("group_id").and_then(Value::as_str) else {
            return OcppFrame::error_response(message_id, "MissingField", "group_id");
        };
        let schedule = match payload.get("max_allocation").and_then(Value::as_str) {
            Some("") => Some(None),
            Some(text) => match Schedule::parse(text) {
                Ok(s) => Some(Some(s)),
                Err(e) => {
                    return OcppFrame::error_response(message_id, "InvalidSchedule", e.to_string())
                }
            },
            None => None,
        };
        match ctx.registry.update_group(
            group_id,
            payload
                .get("description")
                .and_then(Value::as_str)
                .map(String::from),
            payload
                .get("priority")
                .and_then(Value::as_i64)
                .map(|p| p as i32),
            schedule,
        ) {
            Ok(()) => OcppFrame::result(message_id, json!({"status": "OK"})),
            Err(e) => OcppFrame::error_response(message_id, "ModelError", e.to_string()),
        }
    }

    fn delete_group(&self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let Some(group_id) = payload.get("group_id").and_then(Value::as_str) else {
            return OcppFrame::error_response(message_id, "MissingField", "group_id");
        };
        match ctx.registry.delete_group(group_id) {
            Ok(()) => OcppFrame::result(message_id, json!({"status": "OK"})),
            Err(e) => OcppFrame::error_response(message_id, "ModelError", e.to_string()),
        }
    }

    fn reload_groups(&self, ctx: &ApiContext, message_id: &str) -> OcppFrame {
        let path = std::path::Path::new(&ctx.config.model.groups_csv);
        let groups = match store::load_groups(path) {
            Ok(groups) => groups,
            Err(e) => return OcppFrame::error_response(message_id, "ConfigError", e.to_string()),
        };
        match ctx.registry.reload_groups(groups) {
            Ok(()) => OcppFrame::result(message_id, json!({"status": "OK"})),
            Err(e) => OcppFrame::error_response(message_id, "ModelError", e.to_string()),
        }
    }

    // ── Charger maintenance ────────────────────────────────────

    fn create_charger(&self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let (Some(charger_id), Some(alias), Some(group_id)) = (
            payload.get("charger_id").and_then(Value::as_str),
            payload.get("alias").and_then(Value::as_str),
            payload.get("group_id").and_then(Value::as_str),
        ) else {
            return OcppFrame::error_response(
                message_id,
                "MissingField",
                "charger_id, alias and group_id required",
            );
        };
        let charger = Charger::new(
            charger_id,
            alias,
            group_id,
            payload
                .get("no_connectors")
                .and_then(Value::as_u64)
                .unwrap_or(1) as u32,
            payload
                .get("priority")
                .and_then(Value::as_i64)
                .map(|p| p as i32),
            payload
                .get("description")
                .and_then(Value::as_str)
                .map(String::from),
            payload
                .get("conn_max")
                .and_then(Value::as_u64)
                .map(|v| v as u32)
                .unwrap_or(ctx.config.allocator.default_max_allocation),
            None,
        );
        match ctx.registry.add_charger(charger) {
            Ok(()) => OcppFrame::result(message_id, json!({"status": "OK"})),
            Err(e) => OcppFrame::error_response(message_id, "ModelError", e.to_string()),
        }
    }

    fn update_charger(&self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let Some(charger_id) = payload.get("charger_id").and_then(Value::as_str) else {
            return OcppFrame::error_response(message_id, "NoSuchCharger", "charger_id missing");
        };
        match ctx.registry.update_charger(
            charger_id,
            payload.get("alias").and_then(Value::as_str).map(String::from),
            payload
                .get("priority")
                .and_then(Value::as_i64)
                .map(|p| p as i32),
            payload
                .get("description")
                .and_then(Value::as_str)
                .map(String::from),
            payload
                .get("conn_max")
                .and_then(Value::as_u64)
                .map(|v| v as u32),
        ) {
            Ok(()) => OcppFrame::result(message_id, json!({"status": "OK"})),
            Err(e) => OcppFrame::error_response(message_id, "ModelError", e.to_string()),
        }
    }

    fn delete_charger(&self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let Some(charger_id) = payload.get("charger_id").and_then(Value::as_str) else {
            return OcppFrame::error_response(message_id, "NoSuchCharger", "charger_id missing");
        };
        match ctx.registry.delete_charger(charger_id) {
            Ok(()) => OcppFrame::result(message_id, json!({"status": "OK"})),
            Err(e) => OcppFrame::error_response(message_id, "ModelError", e.to_string()),
        }
    }

    fn reset_charger_auth(&self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let Some(charger_id) = payload.get("charger_id").and_then(Value::as_str) else {
            return OcppFrame::error_response(message_id, "NoSuchCharger", "charger_id missing");
        };
        match ctx.registry.reset_charger_auth(charger_id) {
            Ok(()) => {
                self.persist_chargers(ctx);
                OcppFrame::result(message_id, json!({"status": "OK"}))
            }
            Err(e) => OcppFrame::error_response(message_id, "ModelError", e.to_string()),
        }
    }

    fn reload_chargers(&self, ctx: &ApiContext, message_id: &str) -> OcppFrame {
        let path = std::path::Path::new(&ctx.config.model.chargers_csv);
        let chargers =
            match store::load_chargers(path, ctx.config.allocator.default_max_allocation) {
                Ok(chargers) => chargers,
                Err(e) => {
                    return OcppFrame::error_response(message_id, "ConfigError", e.to_string())
                }
            };
        match ctx.registry.reload_chargers(chargers, Utc::now()) {
            Ok(closed) => {
                OcppFrame::result(message_id, json!({"status": "OK", "closed": closed.len()}))
            }
            Err(e) => OcppFrame::error_response(message_id, "ModelError", e.to_string()),
        }
    }

    fn persist_chargers(&self, ctx: &ApiContext) {
        let path = std::path::Path::new(&ctx.config.model.chargers_csv);
        let result = ctx
            .registry
            .with_model(|model| store::write_chargers(path, &model.chargers));
        if let Err(e) = result {
            warn!(error = %e, "Failed to rewrite chargers CSV");
        }
    }

    // ── Tag maintenance ────────────────────────────────────────

    fn create_tag(&self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let Some(id_tag) = payload.get("id_tag").and_then(Value::as_str) else {
            return OcppFrame::error_response(message_id, "MissingField", "id_tag");
        };
        let tag = crate::model::Tag::new(
            id_tag,
            payload
                .get("user_name")
                .and_then(Value::as_str)
                .map(String::from),
            payload
                .get("parent_id_tag")
                .and_then(Value::as_str)
                .map(String::from),
            payload
                .get("description")
                .and_then(Value::as_str)
                .map(String::from),
            payload
                .get("status")
                .and_then(Value::as_str)
                .map(TagStatus::from)
                .unwrap_or(TagStatus::Activated),
            payload
                .get("priority")
                .and_then(Value::as_i64)
                .map(|p| p as i32),
        );
        match ctx.registry.add_tag(tag) {
            Ok(()) => OcppFrame::result(message_id, json!({"status": "OK"})),
            Err(e) => OcppFrame::error_response(message_id, "ModelError", e.to_string()),
        }
    }

    fn update_tag(&self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let Some(id_tag) = payload.get("id_tag").and_then(Value::as_str) else {
            return OcppFrame::error_response(message_id, "MissingField", "id_tag");
        };
        match ctx.registry.update_tag(
            id_tag,
            payload
                .get("user_name")
                .and_then(Value::as_str)
                .map(String::from),
            payload
                .get("parent_id_tag")
                .and_then(Value::as_str)
                .map(String::from),
            payload
                .get("description")
                .and_then(Value::as_str)
                .map(String::from),
            payload.get("status").and_then(Value::as_str).map(TagStatus::from),
            payload
                .get("priority")
                .and_then(Value::as_i64)
                .map(|p| p as i32),
        ) {
            Ok(()) => OcppFrame::result(message_id, json!({"status": "OK"})),
            Err(e) => OcppFrame::error_response(message_id, "ModelError", e.to_string()),
        }
    }

    fn delete_tag(&self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let Some(id_tag) = payload.get("id_tag").and_then(Value::as_str) else {
            return OcppFrame::error_response(message_id, "MissingField", "id_tag");
        };
        match ctx.registry.delete_tag(id_tag) {
            Ok(()) => OcppFrame::result(message_id, json!({"status": "OK"})),
            Err(e) => OcppFrame::error_response(message_id, "ModelError", e.to_string()),
        }
    }

    fn reload_tags(&self, ctx: &ApiContext, message_id: &str) -> OcppFrame {
        let path = std::path::Path::new(&ctx.config.model.tags_csv);
        match store::load_tags(path) {
            Ok(tags) => {
                ctx.registry.reload_tags(tags);
                OcppFrame::result(message_id, json!({"status": "OK"}))
            }
            Err(e) => OcppFrame::error_response(message_id, "ConfigError", e.to_string()),
        }
    }

    fn reload_firmware(&self, ctx: &ApiContext, message_id: &str) -> OcppFrame {
        let path = std::path::Path::new(&ctx.config.model.firmware_csv);
        match store::load_firmware(path) {
            Ok(firmware) => {
                ctx.registry.reload_firmware(firmware);
                OcppFrame::result(message_id, json!({"status": "OK"}))
            }
            Err(e) => OcppFrame::error_response(message_id, "ConfigError", e.to_string()),
        }
    }

    fn create_firmware(&self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let (Some(firmware_id), Some(charge_point_model), Some(location)) = (
            payload.get("firmware_id").and_then(Value::as_str),
            payload.get("charge_point_model").and_then(Value::as_str),
            payload.get("location").and_then(Value::as_str),
        ) else {
            return OcppFrame::error_response(
                message_id,
                "MissingField",
                "firmware_id, charge_point_model and location required",
            );
        };
        let record = FirmwareRecord {
            firmware_id: firmware_id.to_string(),
            charge_point_model: charge_point_model.to_string(),
            firmware_version: payload
                .get("firmware_version")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            location: location.to_string(),
        };
        match ctx.registry.add_firmware(record) {
            Ok(()) => {
                self.persist_firmware(ctx);
                OcppFrame::result(message_id, json!({"status": "OK"}))
            }
            Err(e) => OcppFrame::error_response(message_id, "ModelError", e.to_string()),
        }
    }

    fn modify_firmware(&self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let Some(firmware_id) = payload.get("firmware_id").and_then(Value::as_str) else {
            return OcppFrame::error_response(message_id, "MissingField", "firmware_id");
        };
        match ctx.registry.update_firmware_record(
            firmware_id,
            payload
                .get("charge_point_model")
                .and_then(Value::as_str)
                .map(String::from),
            payload
                .get("firmware_version")
                .and_then(Value::as_str)
                .map(String::from),
            payload
                .get("location")
                .and_then(Value::as_str)
                .map(String::from),
        ) {
            Ok(()) => {
                self.persist_firmware(ctx);
                OcppFrame::result(message_id, json!({"status": "OK"}))
            }
            Err(e) => OcppFrame::error_response(message_id, "ModelError", e.to_string()),
        }
    }

    fn delete_firmware(&self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let Some(firmware_id) = payload.get("firmware_id").and_then(Value::as_str) else {
            return OcppFrame::error_response(message_id, "MissingField", "firmware_id");
        };
        match ctx.registry.delete_firmware(firmware_id) {
            Ok(()) => {
                self.persist_firmware(ctx);
                OcppFrame::result(message_id, json!({"status": "OK"}))
            }
            Err(e) => OcppFrame::error_response(message_id, "ModelError", e.to_string()),
        }
    }

    fn persist_firmware(&self, ctx: &ApiContext) {
        if ctx.config.model.firmware_csv.is_empty() {
            return;
        }
        let path = std::path::Path::new(&ctx.config.model.firmware_csv);
        let result = ctx
            .registry
            .with_model(|model| store::write_firmware(path, &model.firmware));
        if let Err(e) = result {
            warn!(error = %e, "Failed to rewrite firmware CSV");
        }
    }

    // ── User maintenance ───────────────────────────────────────

    fn create_user(&self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let (Some(user_id), Some(password), Some(user_type)) = (
            payload.get("user_id").and_then(Value::as_str),
            payload.get("password").and_then(Value::as_str),
            payload.get("user_type").and_then(Value::as_str),
        ) else {
            return OcppFrame::error_response(
                message_id,
                "MissingField",
                "user_id, password and user_type required",
            );
        };
        let Some(role) = Role::parse(user_type) else {
            return OcppFrame::error_response(message_id, "ModelError", "Unknown user_type");
        };
        if !ctx.users.create(
            user_id,
            password,
            role,
            payload
                .get("description")
                .and_then(Value::as_str)
                .map(String::from),
        ) {
            return OcppFrame::error_response(message_id, "ModelError", "User exists");
        }
        self.persist_users(ctx);
        OcppFrame::result(message_id, json!({"status": "OK"}))
    }

    fn update_user(&self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let Some(user_id) = payload.get("user_id").and_then(Value::as_str) else {
            return OcppFrame::error_response(message_id, "MissingField", "user_id");
        };
        let role = match payload.get("user_type").and_then(Value::as_str) {
            Some(text) => match Role::parse(text) {
                Some(role) => Some(role),
                None => {
                    return OcppFrame::error_response(message_id, "ModelError", "Unknown user_type")
                }
            },
            None => None,
        };
        if !ctx.users.update(
            user_id,
            payload.get("password").and_then(Value::as_str),
            role,
            payload
                .get("description")
                .and_then(Value::as_str)
                .map(String::from),
        ) {
            return OcppFrame::error_response(message_id, "ModelError", "No such user");
        }
        self.persist_users(ctx);
        OcppFrame::result(message_id, json!({"status": "OK"}))
    }

    fn delete_user(&self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let Some(user_id) = payload.get("user_id").and_then(Value::as_str) else {
            return OcppFrame::error_response(message_id, "MissingField", "user_id");
        };
        if !ctx.users.delete(user_id) {
            return OcppFrame::error_response(message_id, "ModelError", "No such user");
        }
        self.persist_users(ctx);
        OcppFrame::result(message_id, json!({"status": "OK"}))
    }

    fn persist_users(&self, ctx: &ApiContext) {
        let path = std::path::Path::new(&ctx.config.api.users_csv);
        if let Err(e) = ctx.users.write(path) {
            warn!(error = %e, "Failed to rewrite users CSV");
        }
    }

    // ── Allocator controls ─────────────────────────────────────

    fn set_allocator_state(&self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let Some(group_id) = payload.get("group_id").and_then(Value::as_str) else {
            return OcppFrame::error_response(message_id, "MissingField", "group_id");
        };
        let suspend = payload
            .get("suspend")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        match ctx.registry.set_allocator_state(group_id, suspend) {
            Ok(()) => OcppFrame::result(message_id, json!({"status": "OK"})),
            Err(e) => OcppFrame::error_response(message_id, "ModelError", e.to_string()),
        }
    }

    fn set_charge_priority(&self, ctx: &ApiContext, message_id: &str, payload: &Value) -> OcppFrame {
        let (Some(charger_id), Some(priority)) = (
            payload.get("charger_id").and_then(Value::as_str),
            payload.get("priority").and_then(Value::as_i64),
        ) else {
            return OcppFrame::error_response(
                message_id,
                "MissingField",
                "charger_id and priority required",
            );
        };
        let connector_id = payload
            .get("connector_id")
            .and_then(Value::as_u64)
            .unwrap_or(1) as u32;
        match ctx
            .registry
            .set_session_priority(charger_id, connector_id, priority as i32)
        {
            Ok(()) => OcppFrame::result(message_id, json!({"status": "OK"})),
            Err(e) => OcppFrame::error_response(message_id, "ModelError", e.to_string()),
        }
    }

    // ── OCPP pass-through ──────────────────────────────────────

    async fn passthrough(
        &self,
        ctx: &ApiContext,
        message_id: &str,
        command: &str,
        mut payload: Value,
    ) -> OcppFrame {
        let charger_id = payload
            .get("charger_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let (action, call_payload) = match command {
            "ClearDefaultProfiles" => (
                "ClearChargingProfile",
                json!({"chargingProfilePurpose": "TxDefaultProfile"}),
            ),
            "ClearDefaultProfile" => {
                let connector_id = payload
                    .get("connector_id")
                    .and_then(Value::as_u64)
                    .unwrap_or(1);
                let mut call = json!({"connectorId": connector_id});
                if let Some(profile_id) =
                    payload.get("charging_profile_id").and_then(Value::as_u64)
                {
                    call["id"] = json!(profile_id);
                }
                ("ClearChargingProfile", call)
            }
            "SetDefaultProfile" => {
                let (Some(profile_id), Some(limit)) = (
                    payload.get("charging_profile_id").and_then(Value::as_u64),
                    payload.get("limit").and_then(Value::as_u64),
                ) else {
                    return OcppFrame::error_response(
                        message_id,
                        "MissingField",
                        "charging_profile_id and limit required",
                    );
                };
                let connector_id = payload
                    .get("connector_id")
                    .and_then(Value::as_u64)
                    .unwrap_or(1);
                let stack_level = payload
                    .get("stack_level")
                    .and_then(Value::as_u64)
                    .unwrap_or(1);
                (
                    "SetChargingProfile",
                    json!({
                        "connectorId": connector_id,
                        "csChargingProfiles": {
                            "chargingProfileId": profile_id,
                            "stackLevel": stack_level,
                            "chargingProfilePurpose": "TxDefaultProfile",
                            "chargingProfileKind": "Absolute",
                            "chargingSchedule": {
                                "chargingRateUnit": "A",
                                "chargingSchedulePeriod": [{"startPeriod": 0, "limit": limit}],
                            },
                        },
                    }),
                )
            }
            "SetTxProfile" => {
                let (Some(connector_id), Some(transaction_id), Some(limit)) = (
                    payload.get("connector_id").and_then(Value::as_u64),
                    payload.get("transaction_id").and_then(Value::as_i64),
                    payload.get("limit").and_then(Value::as_u64),
                ) else {
                    return OcppFrame::error_response(
                        message_id,
                        "MissingField",
                        "connector_id, transaction_id and limit required",
                    );
                };
                (
                    "SetChargingProfile",
                    json!({
                        "connectorId": connector_id,
                        "csChargingProfiles": {
                            "chargingProfileId": 3,
                            "transactionId": transaction_id,
                            "stackLevel": 3,
                            "chargingProfilePurpose": "TxProfile",
                            "chargingProfileKind": "Absolute",
                            "chargingSchedule": {
                                "chargingRateUnit": "A",
                                "chargingSchedulePeriod": [{"startPeriod": 0, "limit": limit}],
                            },
                        },
                    }),
                )
            }
            "UpdateFirmware" => {
                let location = match payload.get("location").and_then(Value::as_str) {
                    Some(location) => location.to_string(),
                    // Fall back to the firmware catalogue entry for the
                    // charger's reported model.
                    None => {
                        let model_name = ctx.registry.with_model(|m| {
                            m.chargers
                                .get(&charger_id)
                                .and_then(|c| c.charge_point_model.clone())
                        });
                        let found = model_name.and_then(|model_name| {
                            ctx.registry.with_model(|m| {
                                m.firmware
                                    .iter()
                                    .find(|f| f.charge_point_model == model_name)
                                    .map(|f| f.location.clone())
                            })
                        });
                        match found {
                            Some(location) => location,
                            None => {
                                return OcppFrame::error_response(
                                    message_id,
                                    "ModelError",
                                    "No firmware location known for charger",
                                )
                            }
                        }
                    }
                };
                (
                    "UpdateFirmware",
                    json!({
                        "location": location,
                        "retrieveDate": Utc::now(),
                    }),
                )
            }
            "Reset" => {
                let kind = payload
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("Soft");
                ("Reset", json!({"type": kind}))
            }
            // Remaining calls forward their payload minus our addressing.
            _ => {
                if let Some(object) = payload.as_object_mut() {
                    object.remove("charger_id");
                    object.remove("alias");
                }
                (command, payload)
            }
        };

        match ctx.commands.send_call(&charger_id, action, call_payload).await {
            Ok(result) => OcppFrame::result(message_id, result),
            Err(CommandError::Timeout) => {
                OcppFrame::error_response(message_id, "Timeout", "Charger did not answer")
            }
            Err(e) => OcppFrame::error_response(message_id, "CommandError", e.to_string()),
        }
    }
}

// ── JSON projections ───────────────────────────────────────────

fn group_json(group: &Group, model: &crate::model::registry::Model) -> Value {
    let chargers: Vec<&str> = model
        .chargers
        .values()
        .filter(|c| c.group_id == group.group_id)
        .map(|c| c.charger_id.as_str())
        .collect();
    json!({
        "group_id": group.group_id,
        "parent_id": group.parent_id,
        "description": group.description,
        "priority": group.priority,
        "max_allocation": group.max_allocation.as_ref().map(|s| s.to_string()),
        "max_allocation_now": group
            .max_allocation
            .as_ref()
            .map(|s| s.max_cap_at(Local::now().time())),
        "allocator_suspended": group.allocator_suspended,
        "chargers": chargers,
    })
}

fn charger_json(
    charger: &Charger,
    model: &crate::model::registry::Model,
    default_priority: i32,
    connections: &SharedConnectionRegistry,
) -> Value {
    let connectors: serde_json::Map<String, Value> = charger
        .connectors
        .values()
        .map(|conn| {
            let mut entry = json!({
                "status": conn.status.to_string(),
                "offer": conn.offer,
                "priority": resolve_priority(model, charger, conn, default_priority),
                "plateau": conn.plateau,
                "suspend_until": conn.suspend_until,
                "transaction_id": conn.session.as_ref().map(|s| s.transaction_id),
            });
            if let Some(session) = &conn.session {
                entry["transaction"] = json!({
                    "id_tag": session.id_tag,
                    "user_name": session.user_name,
                    "start_time": session.start_time,
                    "energy_wh": session.energy_delivered_wh(),
                    "usage_a": session.usage_a,
                    "priority": session.priority,
                });
            }
            (conn.connector_id.to_string(), entry)
        })
        .collect();

    json!({
        "charger_id": charger.charger_id,
        "alias": charger.alias,
        "group_id": charger.group_id,
        "priority": charger.priority,
        "description": charger.description,
        "conn_max": charger.conn_max,
        "charge_point_vendor": charger.charge_point_vendor,
        "charge_point_model": charger.charge_point_model,
        "firmware_version": charger.firmware_version,
        "network_connected": connections.is_connected(&charger.charger_id),
        "connectors": connectors,
    })
}

fn session_json(session: &ClosedSession) -> Value {
    json!({
        "session_id": session.session_id,
        "charger_id": session.charger_id,
        "charger_alias": session.charger_alias,
        "group_id": session.group_id,
        "id_tag": session.id_tag,
        "user_name": session.user_name,
        "stop_id_tag": session.stop_id_tag,
        "start_time": session.start_time,
        "end_time": session.end_time,
        "duration": session.duration_str(),
        "energy": session.kwh_str(),
        "stop_reason": session.stop_reason,
        "charging_history": session
            .history
            .iter()
            .map(|h| json!({"timestamp": h.timestamp, "offered": h.offered}))
            .collect::<Vec<Value>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Model, RegistrySettings, Tag};
    use crate::ocpp::commands::CommandSender;
    use crate::ocpp::connections::ConnectionRegistry;
    use std::time::Duration;

    fn context() -> ApiContext {
        let registry = Arc::new(ModelRegistry::new(RegistrySettings::default()));
        let mut model = Model::default();
        model
            .groups
            .insert("SITE".into(), Group::new("SITE", None, None, None, None));
        model.chargers.insert(
            "CP-1".into(),
            Charger::new("CP-1", "bay-1", "SITE", 1, None, None, 32, None),
        );
        model.tags.insert(
            "AA11".into(),
            Tag::new("AA11", Some("wile".into()), None, None, TagStatus::Activated, None),
        );
        registry.install(model).unwrap();

        let users = Arc::new(UserStore::new());
        users.create("ops", "secret", Role::Admin, None);
        users.create("viewer", "pw", Role::Status, None);

        let connections = ConnectionRegistry::shared();
        let commands = CommandSender::shared(
            connections.clone(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        ApiContext {
            registry,
            connections,
            commands,
            users,
            audit: Arc::new(AuditLog::disabled()),
            config: Arc::new(AppConfig::default()),
        }
    }

    async fn call(
        session: &mut ApiSession,
        ctx: &ApiContext,
        command: &str,
        payload: Value,
    ) -> OcppFrame {
        session.handle_command(ctx, "m1", command, payload).await
    }

    fn expect_result(frame: &OcppFrame) -> &Value {
        match frame {
            OcppFrame::CallResult { payload, .. } => payload,
            other => panic!("expected CallResult, got {:?}", other),
        }
    }

    fn expect_error(frame: &OcppFrame) -> &str {
        match frame {
            OcppFrame::CallError { error_code, .. } => error_code,
            other => panic!("expected CallError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn commands_require_login() {
        let ctx = context();
        let mut session = ApiSession::new();
        let frame = call(&mut session, &ctx, "GetChargers", json!({})).await;
        assert_eq!(expect_error(&frame), "NotAuthorized");
    }

    #[tokio::test]
    async fn login_with_bad_token_fails() {
        let ctx = context();
        let mut session = ApiSession::new();
        let frame = call(&mut session, &ctx, "Login", json!({"token": "nope"})).await;
        assert_eq!(expect_error(&frame), "InvalidLogin");
    }

    #[tokio::test]
    async fn login_reports_role() {
        let ctx = context();
        let mut session = ApiSession::new();
        let frame = call(&mut session, &ctx, "Login", json!({"token": "opssecret"})).await;
        assert_eq!(expect_result(&frame)["user_type"], "Admin");
    }

    #[tokio::test]
    async fn role_gating_blocks_weak_users() {
        let ctx = context();
        let mut session = ApiSession::new();
        call(&mut session, &ctx, "Login", json!({"token": "viewerpw"})).await;

        let frame = call(&mut session, &ctx, "GetChargers", json!({})).await;
        expect_result(&frame);

        let frame = call(&mut session, &ctx, "GetSessions", json!({})).await;
        assert_eq!(expect_error(&frame), "NotAuthorized");

        let frame = call(&mut session, &ctx, "DeleteCharger", json!({"charger_id": "CP-1"})).await;
        assert_eq!(expect_error(&frame), "NotAuthorized");
    }

    #[tokio::test]
    async fn get_chargers_resolves_alias_and_reports_priority() {
        let ctx = context();
        let mut session = ApiSession::new();
        call(&mut session, &ctx, "Login", json!({"token": "opssecret"})).await;

        let frame = call(&mut session, &ctx, "GetChargers", json!({"group_id": "SITE"})).await;
        let chargers = expect_result(&frame)["chargers"].as_array().unwrap().clone();
        assert_eq!(chargers.len(), 1);
        assert_eq!(chargers[0]["alias"], "bay-1");
        assert_eq!(chargers[0]["connectors"]["1"]["priority"], 1);
        assert_eq!(chargers[0]["network_connected"], false);
    }

    #[tokio::test]
    async fn charger_commands_demand_known_connected_charger() {
        let ctx = context();
        let mut session = ApiSession::new();
        call(&mut session, &ctx, "Login", json!({"token": "opssecret"})).await;

        let frame = call(&mut session, &ctx, "Reset", json!({"charger_id": "CP-9"})).await;
        assert_eq!(expect_error(&frame), "NoSuchCharger");

        let frame = call(&mut session, &ctx, "Reset", json!({"charger_id": "CP-1"})).await;
        assert_eq!(expect_error(&frame), "ChargerNotConnected");

        // Alias resolution: same command addressed by alias.
        let frame = call(&mut session, &ctx, "Reset", json!({"alias": "bay-1"})).await;
        assert_eq!(expect_error(&frame), "ChargerNotConnected");
    }

    #[tokio::test]
    async fn tag_crud_roundtrip() {
        let ctx = context();
        let mut session = ApiSession::new();
        call(&mut session, &ctx, "Login", json!({"token": "opssecret"})).await;

        let frame = call(
            &mut session,
            &ctx,
            "CreateTag",
            json!({"id_tag": "bb22", "user_name": "coyote", "priority": 4}),
        )
        .await;
        expect_result(&frame);

        let frame = call(&mut session, &ctx, "GetTags", json!({})).await;
        let tags = expect_result(&frame)["tags"].as_array().unwrap().clone();
        assert_eq!(tags.len(), 2);
        assert!(tags.iter().any(|t| t["id_tag"] == "BB22"));

        let frame = call(
            &mut session,
            &ctx,
            "UpdateTag",
            json!({"id_tag": "BB22", "status": "Blocked"}),
        )
        .await;
        expect_result(&frame);

        let frame = call(&mut session, &ctx, "DeleteTag", json!({"id_tag": "BB22"})).await;
        expect_result(&frame);

        let frame = call(&mut session, &ctx, "DeleteTag", json!({"id_tag": "BB22"})).await;
        assert_eq!(expect_error(&frame), "ModelError");
    }

    #[tokio::test]
    async fn set_allocator_state_flags_group() {
        let ctx = context();
        let mut session = ApiSession::new();
        call(&mut session, &ctx, "Login", json!({"token": "opssecret"})).await;

        let frame = call(
            &mut session,
            &ctx,
            "SetAllocatorState",
            json!({"group_id": "SITE", "suspend": true}),
        )
        .await;
        expect_result(&frame);

        let snapshot = ctx.registry.snapshot(Utc::now());
        assert!(snapshot.allocator_suspended("SITE"));
    }

    #[tokio::test]
    async fn set_charge_priority_needs_live_session() {
        let ctx = context();
        let mut session = ApiSession::new();
        call(&mut session, &ctx, "Login", json!({"token": "opssecret"})).await;

        let frame = call(
            &mut session,
            &ctx,
            "SetChargePriority",
            json!({"charger_id": "CP-1", "connector_id": 1, "priority": 5}),
        )
        .await;
        assert_eq!(expect_error(&frame), "ModelError");

        ctx.registry
            .start_transaction("CP-1", 1, "AA11", 0, Utc::now())
            .unwrap();
        let frame = call(
            &mut session,
            &ctx,
            "SetChargePriority",
            json!({"charger_id": "CP-1", "connector_id": 1, "priority": 5}),
        )
        .await;
        expect_result(&frame);

        let snapshot = ctx.registry.snapshot(Utc::now());
        assert_eq!(snapshot.chargers[0].connectors[0].effective_priority, 5);
    }

    #[tokio::test]
    async fn firmware_catalogue_crud_roundtrip() {
        let ctx = context();
        let mut session = ApiSession::new();
        call(&mut session, &ctx, "Login", json!({"token": "opssecret"})).await;

        let frame = call(
            &mut session,
            &ctx,
            "CreateFirmware",
            json!({
                "firmware_id": "fw-1",
                "charge_point_model": "TACW22",
                "firmware_version": "1.6.0",
                "location": "https://fw.example.net/tacw22-1.6.0.bin",
            }),
        )
        .await;
        expect_result(&frame);

        // Incomplete create is rejected.
        let frame = call(
            &mut session,
            &ctx,
            "CreateFirmware",
            json!({"firmware_id": "fw-2"}),
        )
        .await;
        assert_eq!(expect_error(&frame), "MissingField");

        let frame = call(&mut session, &ctx, "GetFirmware", json!({})).await;
        let firmware = expect_result(&frame)["firmware"].as_array().unwrap().clone();
        assert_eq!(firmware.len(), 1);
        assert_eq!(firmware[0]["firmware_id"], "fw-1");

        let frame = call(
            &mut session,
            &ctx,
            "ModifyFirmware",
            json!({"firmware_id": "fw-1", "firmware_version": "1.6.1"}),
        )
        .await;
        expect_result(&frame);

        let frame = call(&mut session, &ctx, "GetFirmware", json!({})).await;
        let firmware = expect_result(&frame)["firmware"].as_array().unwrap().clone();
        assert_eq!(firmware[0]["firmware_version"], "1.6.1");

        let frame = call(&mut session, &ctx, "DeleteFirmware", json!({"firmware_id": "fw-1"})).await;
        expect_result(&frame);
        let frame = call(&mut session, &ctx, "DeleteFirmware", json!({"firmware_id": "fw-1"})).await;
        assert_eq!(expect_error(&frame), "ModelError");
    }

    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let ctx = context();
        let mut session = ApiSession::new();
        call(&mut session, &ctx, "Login", json!({"token": "opssecret"})).await;
        let frame = call(&mut session, &ctx, "FlyToTheMoon", json!({})).await;
        assert_eq!(expect_error(&frame), "UnknownCommand");
    }

    #[tokio::test]
    async fn get_sessions_returns_archive() {
        let ctx = context();
        let now = Utc::now();
        let tx = ctx
            .registry
            .start_transaction("CP-1", 1, "AA11", 0, now)
            .unwrap();
        ctx.registry
            .stop_transaction("CP-1", tx, 3200, now + chrono::Duration::seconds(900), Some("Local".into()), None)
            .unwrap();

        let mut session = ApiSession::new();
        call(&mut session, &ctx, "Login", json!({"token": "opssecret"})).await;
        let frame = call(&mut session, &ctx, "GetSessions", json!({"charger_id": "CP-1"})).await;
        let sessions = expect_result(&frame)["sessions"].as_array().unwrap().clone();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["energy"], "3.200");
        assert_eq!(sessions[0]["stop_reason"], "Local");
    }
}

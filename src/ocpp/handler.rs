//! Inbound OCPP 1.6 message handling
//!
//! Parses OCPP-J frames, routes Call actions to the state machine in the
//! registry, and pairs CallResult/CallError frames with pending outbound
//! commands. Payloads are deserialized into `rust_ocpp::v1_6` types within
//! each handler.

use std::sync::Arc;

use chrono::Utc;
use rust_ocpp::v1_6::messages::authorize::{AuthorizeRequest, AuthorizeResponse};
use rust_ocpp::v1_6::messages::boot_notification::BootNotificationRequest;
use rust_ocpp::v1_6::messages::heart_beat::HeartbeatResponse;
use rust_ocpp::v1_6::messages::meter_values::{MeterValuesRequest, MeterValuesResponse};
use rust_ocpp::v1_6::messages::start_transaction::StartTransactionRequest;
use rust_ocpp::v1_6::messages::status_notification::{
    StatusNotificationRequest, StatusNotificationResponse,
};
use rust_ocpp::v1_6::messages::stop_transaction::StopTransactionRequest;
use rust_ocpp::v1_6::types::{
    AuthorizationStatus, ChargePointStatus, IdTagInfo, Measurand, UnitOfMeasure,
};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::model::{AuthOutcome, ConnectorStatus, ModelRegistry};
use crate::ocpp::commands::SharedCommandSender;
use crate::ocpp::frame::OcppFrame;
use crate::support::errors::ProtocolError;

pub struct OcppHandler {
    pub charger_id: String,
    registry: Arc<ModelRegistry>,
    commands: SharedCommandSender,
    heartbeat_interval: i32,
}

impl OcppHandler {
    pub fn new(
        charger_id: impl Into<String>,
        registry: Arc<ModelRegistry>,
        commands: SharedCommandSender,
        heartbeat_interval: i32,
    ) -> Self {
        Self {
            charger_id: charger_id.into(),
            registry,
            commands,
            heartbeat_interval,
        }
    }

    /// Handle one inbound message. `Ok(Some(text))` is the response to
    /// send back; a `ProtocolError` means the connection should close.
    pub async fn handle(&self, text: &str) -> Result<Option<String>, ProtocolError> {
        self.registry.touch(&self.charger_id, Utc::now());
        match OcppFrame::parse(text)? {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => {
                let response = self.handle_call(&action, &payload).await;
                Ok(Some(OcppFrame::result(unique_id, response).serialize()))
            }
            OcppFrame::CallResult { unique_id, payload } => {
                self.commands
                    .handle_response(&self.charger_id, &unique_id, payload);
                Ok(None)
            }
            OcppFrame::CallError {
                unique_id,
                error_code,
                error_description,
                ..
            } => {
                self.commands.handle_error(
                    &self.charger_id,
                    &unique_id,
                    &error_code,
                    &error_description,
                );
                Ok(None)
            }
        }
    }

    async fn handle_call(&self, action: &str, payload: &Value) -> Value {
        match action {
            "BootNotification" => self.handle_boot_notification(payload),
            "Heartbeat" => self.handle_heartbeat(),
            "Authorize" => self.handle_authorize(payload),
            "StartTransaction" => self.handle_start_transaction(payload),
            "StopTransaction" => self.handle_stop_transaction(payload),
            "MeterValues" => self.handle_meter_values(payload),
            "StatusNotification" => self.handle_status_notification(payload),
            "FirmwareStatusNotification" => {
                info!(
                    charger_id = self.charger_id.as_str(),
                    status = payload["status"].as_str().unwrap_or("?"),
                    "FirmwareStatusNotification"
                );
                json!({})
            }
            "DiagnosticsStatusNotification" => json!({}),
            "DataTransfer" => json!({"status": "Rejected", "data": "Not supported"}),
            unknown => {
                error!(
                    charger_id = self.charger_id.as_str(),
                    action = unknown,
                    "Unknown OCPP 1.6 action"
                );
                json!({})
            }
        }
    }

    fn handle_boot_notification(&self, payload: &Value) -> Value {
        let req: BootNotificationRequest = match serde_json::from_value(payload.clone()) {
            Ok(r) => r,
            Err(e) => {
                error!(charger_id = self.charger_id.as_str(), error = %e, "Failed to parse BootNotification");
                return json!({});
            }
        };

        info!(
            charger_id = self.charger_id.as_str(),
            vendor = req.charge_point_vendor.as_str(),
            model = req.charge_point_model.as_str(),
            "BootNotification"
        );

        self.registry.boot_notification(
            &self.charger_id,
            req.charge_point_vendor,
            req.charge_point_model,
            req.charge_point_serial_number,
            req.firmware_version,
            req.meter_type,
        );

        json!({
            "currentTime": Utc::now(),
            "interval": self.heartbeat_interval,
            "status": "Accepted",
        })
    }

    fn handle_heartbeat(&self) -> Value {
        let response = HeartbeatResponse {
            current_time: Utc::now(),
        };
        serde_json::to_value(&response).unwrap_or_default()
    }

    fn handle_authorize(&self, payload: &Value) -> Value {
        let req: AuthorizeRequest = match serde_json::from_value(payload.clone()) {
            Ok(r) => r,
            Err(e) => {
                error!(charger_id = self.charger_id.as_str(), error = %e, "Failed to parse Authorize");
                return json!({});
            }
        };

        let outcome = self.registry.authorize(&req.id_tag, &self.charger_id);
        info!(
            charger_id = self.charger_id.as_str(),
            id_tag = req.id_tag.as_str(),
            outcome = ?outcome,
            "Authorize"
        );

        let (status, parent_id_tag) = match outcome {
            AuthOutcome::Accepted { parent_id_tag } => {
                (AuthorizationStatus::Accepted, parent_id_tag)
            }
            AuthOutcome::Blocked => (AuthorizationStatus::Blocked, None),
            AuthOutcome::ConcurrentTx => (AuthorizationStatus::ConcurrentTx, None),
            AuthOutcome::Invalid => (AuthorizationStatus::Invalid, None),
        };

        let response = AuthorizeResponse {
            id_tag_info: IdTagInfo {
                status,
                expiry_date: None,
                parent_id_tag,
            },
        };
        serde_json::to_value(&response).unwrap_or_default()
    }

    fn handle_start_transaction(&self, payload: &Value) -> Value {
        let req: StartTransactionRequest = match serde_json::from_value(payload.clone()) {
            Ok(r) => r,
            Err(e) => {
                error!(charger_id = self.charger_id.as_str(), error = %e, "Failed to parse StartTransaction");
                return json!({});
            }
        };

        info!(
            charger_id = self.charger_id.as_str(),
            connector_id = req.connector_id,
            id_tag = req.id_tag.as_str(),
            meter_start = req.meter_start,
            "StartTransaction"
        );

        // The session opens regardless; the tag verdict travels in
        // idTagInfo and the charger decides what to do with it.
        let status = match self.registry.authorize(&req.id_tag, &self.charger_id) {
            AuthOutcome::Accepted { .. } | AuthOutcome::ConcurrentTx => {
                AuthorizationStatus::Accepted
            }
            AuthOutcome::Blocked => AuthorizationStatus::Blocked,
            AuthOutcome::Invalid => AuthorizationStatus::Invalid,
        };

        let transaction_id = match self.registry.start_transaction(
            &self.charger_id,
            req.connector_id as u32,
            &req.id_tag,
            req.meter_start as i64,
            req.timestamp,
        ) {
            Ok(id) => id,
            Err(e) => {
                error!(charger_id = self.charger_id.as_str(), error = %e, "StartTransaction rejected");
                return json!({
                    "transactionId": 0,
                    "idTagInfo": {"status": "Invalid"},
                });
            }
        };

        json!({
            "transactionId": transaction_id,
            "idTagInfo": {"status": serde_json::to_value(&status).unwrap_or(json!("Accepted"))},
        })
    }

    fn handle_stop_transaction(&self, payload: &Value) -> Value {
        let req: StopTransactionRequest = match serde_json::from_value(payload.clone()) {
            Ok(r) => r,
            Err(e) => {
                error!(charger_id = self.charger_id.as_str(), error = %e, "Failed to parse StopTransaction");
                return json!({});
            }
        };

        let transaction_id = req.transaction_id;
        info!(
            charger_id = self.charger_id.as_str(),
            transaction_id,
            meter_stop = req.meter_stop,
            "StopTransaction"
        );

        // A stop by a different tag is honored when both tags belong to
        // the same parent group.
        let authorized = match (&req.id_tag, self
            .registry
            .transaction_start_tag(&self.charger_id, transaction_id))
        {
            (Some(stop_tag), Some(start_tag)) => self.registry.may_stop(stop_tag, &start_tag),
            _ => true,
        };

        let reason = req
            .reason
            .as_ref()
            .and_then(|r| serde_json::to_value(r).ok())
            .and_then(|v| v.as_str().map(str::to_string));

        if let Err(e) = self.registry.stop_transaction(
            &self.charger_id,
            transaction_id,
            req.meter_stop as i64,
            req.timestamp,
            reason,
            req.id_tag.clone(),
        ) {
            warn!(charger_id = self.charger_id.as_str(), error = %e, "StopTransaction for unknown transaction");
        }

        let status = if authorized {
            AuthorizationStatus::Accepted
        } else {
            AuthorizationStatus::Invalid
        };
        json!({
            "idTagInfo": {"status": serde_json::to_value(&status).unwrap_or(json!("Accepted"))},
        })
    }

    fn handle_meter_values(&self, payload: &Value) -> Value {
        let req: MeterValuesRequest = match serde_json::from_value(payload.clone()) {
            Ok(r) => r,
            Err(e) => {
                error!(charger_id = self.charger_id.as_str(), error = %e, "Failed to parse MeterValues");
                return json!({});
            }
        };

        for meter_value in &req.meter_value {
            let mut usage_a: f64 = 0.0;
            let mut energy_wh: Option<i64> = None;
            let mut offered: Option<u32> = None;

            for sampled in &meter_value.sampled_value {
                let value: f64 = match sampled.value.parse() {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let measurand = sampled
                    .measurand
                    .clone()
                    .unwrap_or(Measurand::EnergyActiveImportRegister);

                match measurand {
                    // Usage is the maximum phase current; offers are
                    // 3-phase symmetric.
                    Measurand::CurrentImport => usage_a = usage_a.max(value),
                    Measurand::EnergyActiveImportRegister => {
                        let wh = match sampled.unit.as_ref() {
                            Some(UnitOfMeasure::KWh) => value * 1000.0,
                            _ => value,
                        };
                        energy_wh = Some(wh as i64);
                    }
                    Measurand::CurrentOffered => offered = Some(value.round() as u32),
                    _ => {}
                }
            }

            self.registry.meter_values(
                &self.charger_id,
                req.connector_id as u32,
                usage_a,
                energy_wh,
                offered,
                req.transaction_id.map(|t| t as i32),
                meter_value.timestamp,
            );
        }

        serde_json::to_value(&MeterValuesResponse {}).unwrap_or_default()
    }

    fn handle_status_notification(&self, payload: &Value) -> Value {
        let req: StatusNotificationRequest = match serde_json::from_value(payload.clone()) {
            Ok(r) => r,
            Err(e) => {
                error!(charger_id = self.charger_id.as_str(), error = %e, "Failed to parse StatusNotification");
                return json!({});
            }
        };

        // Connector 0 addresses the charger itself; not modelled.
        if req.connector_id != 0 {
            let status = map_status(&req.status);
            if let Err(e) = self.registry.status_notification(
                &self.charger_id,
                req.connector_id as u32,
                status,
                Utc::now(),
            ) {
                warn!(charger_id = self.charger_id.as_str(), error = %e, "StatusNotification rejected");
            }
        }

        serde_json::to_value(&StatusNotificationResponse {}).unwrap_or_default()
    }
}

fn map_status(status: &ChargePointStatus) -> ConnectorStatus {
    match status {
        ChargePointStatus::Available => ConnectorStatus::Available,
        ChargePointStatus::Preparing => ConnectorStatus::Preparing,
        ChargePointStatus::Charging => ConnectorStatus::Charging,
        ChargePointStatus::SuspendedEV => ConnectorStatus::SuspendedEV,
        ChargePointStatus::SuspendedEVSE => ConnectorStatus::SuspendedEVSE,
        ChargePointStatus::Finishing => ConnectorStatus::Finishing,
        ChargePointStatus::Reserved => ConnectorStatus::Reserved,
        ChargePointStatus::Unavailable => ConnectorStatus::Unavailable,
        ChargePointStatus::Faulted => ConnectorStatus::Faulted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Charger, Group, Model, RegistrySettings, Tag, TagStatus};
    use crate::ocpp::commands::CommandSender;
    use crate::ocpp::connections::ConnectionRegistry;
    use std::time::Duration;

    fn handler() -> OcppHandler {
        let registry = Arc::new(ModelRegistry::new(RegistrySettings::default()));
        let mut model = Model::default();
        model
            .groups
            .insert("G1".into(), Group::new("G1", None, None, None, None));
        model.chargers.insert(
            "CP-1".into(),
            Charger::new("CP-1", "bay-1", "G1", 1, None, None, 32, None),
        );
        model.tags.insert(
            "AA11".into(),
            Tag::new("AA11", Some("wile".into()), None, None, TagStatus::Activated, None),
        );
        registry.install(model).unwrap();
        let connections = ConnectionRegistry::shared();
        let commands =
            CommandSender::shared(connections, Duration::from_secs(5), Duration::from_secs(5));
        OcppHandler::new("CP-1", registry, commands, 300)
    }

    #[tokio::test]
    async fn boot_notification_is_accepted() {
        let handler = handler();
        let frame = r#"[2,"1","BootNotification",{"chargePointVendor":"ACME","chargePointModel":"One"}]"#;
        let response = handler.handle(frame).await.unwrap().unwrap();
        let parsed = OcppFrame::parse(&response).unwrap();
        match parsed {
            OcppFrame::CallResult { payload, .. } => {
                assert_eq!(payload["status"], "Accepted");
                assert_eq!(payload["interval"], 300);
            }
            _ => panic!("expected CallResult"),
        }
    }

    #[tokio::test]
    async fn authorize_known_tag() {
        let handler = handler();
        let frame = r#"[2,"2","Authorize",{"idTag":"aa11"}]"#;
        let response = handler.handle(frame).await.unwrap().unwrap();
        let parsed = OcppFrame::parse(&response).unwrap();
        match parsed {
            OcppFrame::CallResult { payload, .. } => {
                assert_eq!(payload["idTagInfo"]["status"], "Accepted");
            }
            _ => panic!("expected CallResult"),
        }
    }

    #[tokio::test]
    async fn authorize_unknown_tag_is_invalid() {
        let handler = handler();
        let frame = r#"[2,"3","Authorize",{"idTag":"ZZ99"}]"#;
        let response = handler.handle(frame).await.unwrap().unwrap();
        let parsed = OcppFrame::parse(&response).unwrap();
        match parsed {
            OcppFrame::CallResult { payload, .. } => {
                assert_eq!(payload["idTagInfo"]["status"], "Invalid");
            }
            _ => panic!("expected CallResult"),
        }
    }

    #[tokio::test]
    async fn start_transaction_assigns_id() {
        let handler = handler();
        let frame = r#"[2,"4","StartTransaction",{"connectorId":1,"idTag":"AA11","meterStart":100,"timestamp":"2026-03-01T10:00:00Z"}]"#;
        let response = handler.handle(frame).await.unwrap().unwrap();
        let parsed = OcppFrame::parse(&response).unwrap();
        match parsed {
            OcppFrame::CallResult { payload, .. } => {
                assert!(payload["transactionId"].as_i64().unwrap() > 0);
                assert_eq!(payload["idTagInfo"]["status"], "Accepted");
            }
            _ => panic!("expected CallResult"),
        }
    }

    #[tokio::test]
    async fn malformed_frame_is_a_protocol_error() {
        let handler = handler();
        assert!(handler.handle("[not json").await.is_err());
        assert!(handler.handle("[]").await.is_err());
    }

    #[tokio::test]
    async fn status_notification_updates_model() {
        let handler = handler();
        let frame = r#"[2,"5","StatusNotification",{"connectorId":1,"errorCode":"NoError","status":"Preparing"}]"#;
        handler.handle(frame).await.unwrap().unwrap();
        let snapshot = handler.registry.snapshot(Utc::now());
        assert_eq!(
            snapshot.chargers[0].connectors[0].status,
            ConnectorStatus::Preparing
        );
    }

    #[tokio::test]
    async fn meter_values_feed_usage_window() {
        let handler = handler();
        handler
            .handle(r#"[2,"6","StartTransaction",{"connectorId":1,"idTag":"AA11","meterStart":0,"timestamp":"2026-03-01T10:00:00Z"}]"#)
            .await
            .unwrap();
        let snapshot = handler.registry.snapshot(Utc::now());
        let tx = snapshot.chargers[0].connectors[0]
            .session
            .as_ref()
            .unwrap()
            .transaction_id;

        let now = Utc::now().to_rfc3339();
        let frame = format!(
            r#"[2,"7","MeterValues",{{"connectorId":1,"transactionId":{tx},"meterValue":[{{"timestamp":"{now}","sampledValue":[
                {{"value":"9.6","measurand":"Current.Import","phase":"L1"}},
                {{"value":"8.1","measurand":"Current.Import","phase":"L2"}},
                {{"value":"2500","measurand":"Energy.Active.Import.Register","unit":"Wh"}},
                {{"value":"10","measurand":"Current.Offered"}}
            ]}}]}}]"#
        );
        handler.handle(&frame).await.unwrap();

        let snapshot = handler.registry.snapshot(Utc::now());
        let conn = &snapshot.chargers[0].connectors[0];
        assert!(conn.rolling_max_usage > 9.0);
        assert_eq!(conn.offer, 10);
        let session = conn.session.as_ref().unwrap();
        assert_eq!(session.energy_delivered_wh, 2500);
    }
}

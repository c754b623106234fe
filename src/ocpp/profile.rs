//! Charging-profile discipline
//!
//! The allocator controls chargers through three fixed profiles:
//!
//! - profile 1, `TxDefaultProfile`, connector 0, stack 0, the *minimum
//!   profile*: permits charging at `min_allocation` once nothing shadows it.
//! - profile 2, `TxDefaultProfile`, per connector, stack 1, the *blocking
//!   profile*: limit 0, shadows the minimum profile so an EV plugging in
//!   lands in SuspendedEVSE instead of free-running.
//! - profile 3, `TxProfile`, stack 3, the live offer for one transaction.
//!
//! Granting an offer means clearing profile 2 (charging starts at the
//! minimum), then steering with profile 3 once a transaction id exists.
//! Stopping means reinstalling profile 2.

use rust_ocpp::v1_6::messages::clear_charging_profile::ClearChargingProfileResponse;
use rust_ocpp::v1_6::messages::set_charging_profile::SetChargingProfileResponse;
use serde_json::json;
use tracing::debug;

use crate::ocpp::commands::CommandSender;
use crate::support::errors::CommandError;

const MINIMUM_PROFILE_ID: u32 = 1;
const BLOCKING_PROFILE_ID: u32 = 2;
const TX_PROFILE_ID: u32 = 3;

fn default_profile_payload(
    profile_id: u32,
    connector_id: u32,
    stack_level: u32,
    limit: u32,
) -> serde_json::Value {
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
    })
}

async fn set_profile(
    commands: &CommandSender,
    charger_id: &str,
    payload: serde_json::Value,
) -> Result<bool, CommandError> {
    let result = commands
        .send_call(charger_id, "SetChargingProfile", payload)
        .await?;
    let response: SetChargingProfileResponse = serde_json::from_value(result)
        .map_err(|e| CommandError::InvalidResponse(e.to_string()))?;
    let accepted = format!("{:?}", response.status) == "Accepted";
    debug!(charger_id, accepted, "SetChargingProfile answered");
    Ok(accepted)
}

async fn clear_profile(
    commands: &CommandSender,
    charger_id: &str,
    payload: serde_json::Value,
) -> Result<bool, CommandError> {
    let result = commands
        .send_call(charger_id, "ClearChargingProfile", payload)
        .await?;
    let response: ClearChargingProfileResponse = serde_json::from_value(result)
        .map_err(|e| CommandError::InvalidResponse(e.to_string()))?;
    let accepted = format!("{:?}", response.status) == "Accepted";
    debug!(charger_id, accepted, "ClearChargingProfile answered");
    Ok(accepted)
}

/// Wipe every `TxDefaultProfile` before installing our own pair.
pub async fn clear_all_default_profiles(
    commands: &CommandSender,
    charger_id: &str,
) -> Result<bool, CommandError> {
    clear_profile(
        commands,
        charger_id,
        json!({"chargingProfilePurpose": "TxDefaultProfile"}),
    )
    .await
}

/// Install the minimum profile on connector 0 (applies charger-wide).
pub async fn set_minimum_profile(
    commands: &CommandSender,
    charger_id: &str,
    min_allocation: u32,
) -> Result<bool, CommandError> {
    set_profile(
        commands,
        charger_id,
        default_profile_payload(MINIMUM_PROFILE_ID, 0, 0, min_allocation),
    )
    .await
}

/// Install the blocking profile on one connector.
pub async fn set_blocking_profile(
    commands: &CommandSender,
    charger_id: &str,
    connector_id: u32,
) -> Result<bool, CommandError> {
    set_profile(
        commands,
        charger_id,
        default_profile_payload(BLOCKING_PROFILE_ID, connector_id, 1, 0),
    )
    .await
}

/// Remove the blocking profile, exposing the minimum profile so a pending
/// transaction can start.
pub async fn clear_blocking_profile(
    commands: &CommandSender,
    charger_id: &str,
    connector_id: u32,
) -> Result<bool, CommandError> {
    clear_profile(
        commands,
        charger_id,
        json!({"id": BLOCKING_PROFILE_ID, "connectorId": connector_id}),
    )
    .await
}

/// Set (or overwrite) the transaction profile carrying the granted offer.
pub async fn set_tx_profile(
    commands: &CommandSender,
    charger_id: &str,
    connector_id: u32,
    transaction_id: i32,
    limit: u32,
) -> Result<bool, CommandError> {
    set_profile(
        commands,
        charger_id,
        json!({
            "connectorId": connector_id,
            "csChargingProfiles": {
                "chargingProfileId": TX_PROFILE_ID,
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
    .await
}

// ── Status resync triggers ─────────────────────────────────────

pub async fn trigger_boot_notification(
    commands: &CommandSender,
    charger_id: &str,
) -> Result<(), CommandError> {
    commands
        .send_call(
            charger_id,
            "TriggerMessage",
            json!({"requestedMessage": "BootNotification"}),
        )
        .await
        .map(|_| ())
}

pub async fn trigger_status_notification(
    commands: &CommandSender,
    charger_id: &str,
    connector_id: u32,
) -> Result<(), CommandError> {
    commands
        .send_call(
            charger_id,
            "TriggerMessage",
            json!({"requestedMessage": "StatusNotification", "connectorId": connector_id}),
        )
        .await
        .map(|_| ())
}

pub async fn trigger_meter_values(
    commands: &CommandSender,
    charger_id: &str,
) -> Result<(), CommandError> {
    commands
        .send_call(
            charger_id,
            "TriggerMessage",
            json!({"requestedMessage": "MeterValues"}),
        )
        .await
        .map(|_| ())
}

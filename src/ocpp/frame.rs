//! OCPP-J wire framing
//!
//! Both listener paths speak the same envelope: chargers on
//! `/<charger_id>` and admin clients on `/api`. A frame is a JSON array
//! whose first element selects the shape:
//!
//! | id | shape                                                        |
//! |----|--------------------------------------------------------------|
//! | 2  | `[2, uniqueId, action, payload]`                             |
//! | 3  | `[3, uniqueId, payload]`                                     |
//! | 4  | `[4, uniqueId, errorCode, errorDescription, errorDetails]`   |

use serde_json::{json, Value};

use crate::support::errors::ProtocolError;

/// Wire ids of the three frame shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Call = 2,
    Result = 3,
    Error = 4,
}

impl FrameKind {
    fn from_wire(id: u64) -> Result<Self, ProtocolError> {
        match id {
            2 => Ok(Self::Call),
            3 => Ok(Self::Result),
            4 => Ok(Self::Error),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }

    /// Fields a well-formed frame of this kind must carry.
    fn arity(&self) -> usize {
        match self {
            Self::Call | Self::Error => 4,
            Self::Result => 3,
        }
    }
}

/// A parsed OCPP-J frame.
#[derive(Debug, Clone)]
pub enum OcppFrame {
    Call {
        unique_id: String,
        action: String,
        payload: Value,
    },
    CallResult {
        unique_id: String,
        payload: Value,
    },
    CallError {
        unique_id: String,
        error_code: String,
        error_description: String,
        error_details: Value,
    },
}

impl OcppFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let fields: Vec<Value> =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

        if fields.is_empty() {
            return Err(ProtocolError::EmptyArray);
        }
        let kind = match fields[0].as_u64() {
            Some(id) => FrameKind::from_wire(id)?,
            None => return Err(ProtocolError::InvalidMessageType),
        };
        if fields.len() < kind.arity() {
            return Err(ProtocolError::MissingFields {
                expected: kind.arity(),
                got: fields.len(),
            });
        }

        let unique_id = required_str(&fields, 1, "uniqueId must be a string")?;
        Ok(match kind {
            FrameKind::Call => Self::Call {
                unique_id,
                action: required_str(&fields, 2, "action must be a string")?,
                payload: fields[3].clone(),
            },
            FrameKind::Result => Self::CallResult {
                unique_id,
                payload: fields[2].clone(),
            },
            FrameKind::Error => Self::CallError {
                unique_id,
                // Lenient on the error fields; chargers get these wrong
                // and a broken error report should not kill the pairing.
                error_code: fields[2].as_str().unwrap_or("InternalError").to_string(),
                error_description: fields[3].as_str().unwrap_or("").to_string(),
                error_details: fields.get(4).cloned().unwrap_or_else(|| json!({})),
            },
        })
    }

    pub fn serialize(&self) -> String {
        match self {
            Self::Call {
                unique_id,
                action,
                payload,
            } => json!([FrameKind::Call as u8, unique_id, action, payload]),
            Self::CallResult { unique_id, payload } => {
                json!([FrameKind::Result as u8, unique_id, payload])
            }
            Self::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            } => json!([
                FrameKind::Error as u8,
                unique_id,
                error_code,
                error_description,
                error_details
            ]),
        }
        .to_string()
    }

    pub fn unique_id(&self) -> &str {
        match self {
            Self::Call { unique_id, .. }
            | Self::CallResult { unique_id, .. }
            | Self::CallError { unique_id, .. } => unique_id,
        }
    }

    // Both handlers (charger side and admin API) answer inbound Calls;
    // these shape the two possible replies.

    pub fn result(unique_id: impl Into<String>, payload: Value) -> Self {
        Self::CallResult {
            unique_id: unique_id.into(),
            payload,
        }
    }

    pub fn error_response(
        unique_id: impl Into<String>,
        error_code: impl Into<String>,
        error_description: impl Into<String>,
    ) -> Self {
        Self::CallError {
            unique_id: unique_id.into(),
            error_code: error_code.into(),
            error_description: error_description.into(),
            error_details: json!({}),
        }
    }
}

fn required_str(
    fields: &[Value],
    index: usize,
    complaint: &'static str,
) -> Result<String, ProtocolError> {
    fields[index]
        .as_str()
        .map(str::to_string)
        .ok_or(ProtocolError::FieldTypeMismatch(complaint))
}

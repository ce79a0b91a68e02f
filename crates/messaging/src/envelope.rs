//! Correlation envelope: the request identity that crosses the broker boundary.
//!
//! Every message the bridge publishes, and every response it accepts, is a
//! `CorrelationEnvelope`. The protocol rules:
//!
//! - `requestId` is minted once per logical request and never reused.
//! - The outbound side publishes it as the broker message **key**; the inbound
//!   side reads it back from the **payload** field `requestId`.
//! - A message without a usable `requestId` is a protocol violation. It is
//!   logged and dropped, never resumed under a substitute identity.
//!
//! Decoding accepts both casings of field names (`requestId` / `RequestId`,
//! `errorMessage` / `ErrorMessage`) but is strict about the identity itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use flowbridge_core::RequestId;

/// Lifecycle of one logical request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "success", alias = "succeeded")]
    Succeeded,
    #[serde(rename = "error", alias = "failed")]
    Failed,
}

impl EnvelopeStatus {
    /// Wire/engine representation (`pending`, `success`, `error`).
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeStatus::Pending => "pending",
            EnvelopeStatus::Succeeded => "success",
            EnvelopeStatus::Failed => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, EnvelopeStatus::Pending)
    }

    fn from_wire(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(EnvelopeStatus::Pending),
            "success" | "succeeded" | "ok" => Some(EnvelopeStatus::Succeeded),
            "error" | "failed" | "failure" => Some(EnvelopeStatus::Failed),
            _ => None,
        }
    }
}

impl core::fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("envelope has no requestId")]
    MissingRequestId,
    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

impl From<EnvelopeError> for flowbridge_core::BridgeError {
    fn from(value: EnvelopeError) -> Self {
        match value {
            EnvelopeError::Encode(msg) => flowbridge_core::BridgeError::transient(msg),
            other => flowbridge_core::BridgeError::protocol(other.to_string()),
        }
    }
}

/// Tagged request/response envelope with a small closed set of known fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationEnvelope {
    request_id: RequestId,
    status: EnvelopeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    /// Opaque to the bridge.
    #[serde(default)]
    payload: JsonValue,
    created_at: DateTime<Utc>,
}

impl CorrelationEnvelope {
    /// Outbound request (`pending`).
    pub fn request(request_id: RequestId, target: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            request_id,
            status: EnvelopeStatus::Pending,
            target: Some(target.into()),
            detail: None,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Response to a request, carrying its terminal status.
    pub fn response(
        request_id: RequestId,
        status: EnvelopeStatus,
        detail: Option<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            request_id,
            status,
            target: None,
            detail,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn status(&self) -> EnvelopeStatus {
        self.status
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    /// Decode a broker payload.
    ///
    /// A missing or blank `requestId` yields [`EnvelopeError::MissingRequestId`].
    /// A missing or unrecognized `status` decodes as [`EnvelopeStatus::Failed`]
    /// with an explanatory `detail`, so a garbled response never reads as success.
    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        let value: JsonValue =
            serde_json::from_str(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        let JsonValue::Object(fields) = value else {
            return Err(EnvelopeError::Malformed("payload is not a JSON object".to_string()));
        };

        let request_id = match field(&fields, &["requestId", "RequestId", "request_id"]) {
            Some(JsonValue::String(s)) => {
                RequestId::parse(s.as_str()).map_err(|_| EnvelopeError::MissingRequestId)?
            }
            Some(JsonValue::Null) | None => return Err(EnvelopeError::MissingRequestId),
            Some(_) => {
                return Err(EnvelopeError::Malformed("requestId must be a string".to_string()));
            }
        };

        let mut detail = string_field(&fields, &["detail", "errorMessage", "ErrorMessage", "message", "Message"]);
        let status = match string_field(&fields, &["status", "Status"]) {
            Some(s) => match EnvelopeStatus::from_wire(&s) {
                Some(status) => status,
                None => {
                    detail.get_or_insert_with(|| format!("unrecognized status '{s}'"));
                    EnvelopeStatus::Failed
                }
            },
            None => {
                detail.get_or_insert_with(|| "response carried no status".to_string());
                EnvelopeStatus::Failed
            }
        };

        let created_at = string_field(&fields, &["createdAt", "timestamp", "Timestamp", "sentAt", "SentAt"])
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Self {
            request_id,
            status,
            target: string_field(&fields, &["target", "to", "To"]),
            detail,
            payload: field(&fields, &["payload", "Payload"]).cloned().unwrap_or(JsonValue::Null),
            created_at,
        })
    }
}

fn field<'a>(fields: &'a Map<String, JsonValue>, names: &[&str]) -> Option<&'a JsonValue> {
    names.iter().find_map(|n| fields.get(*n))
}

fn string_field(fields: &Map<String, JsonValue>, names: &[&str]) -> Option<String> {
    field(fields, names)
        .and_then(JsonValue::as_str)
        .map(str::to_string)
}

//! Notification Router
//!
//! Classifies inbound pubsub messages into a tagged [`Classified`] variant and
//! extracts the embedded payload. Log notifications carry the transaction
//! signature and its log lines, account notifications carry the decoded account
//! data. Acknowledgements and unknown methods are surfaced as their own variants
//! so the session can match exhaustively.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::decoder::{decode_payload, PayloadEncoding};

/// Log line emitted by the target program when it creates a token
pub const DEFAULT_CREATE_MARKER: &str = "Program log: Create";

pub const LOGS_NOTIFICATION: &str = "logsNotification";
pub const PROGRAM_NOTIFICATION: &str = "programNotification";
pub const ACCOUNT_NOTIFICATION: &str = "accountNotification";

/// A message that could not be interpreted; the message is dropped
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Notification '{method}' has an unexpected shape: {reason}")]
    InvalidPayload { method: String, reason: String },

    #[error("Unsupported account data encoding: {0}")]
    UnsupportedEncoding(String),
}

/// Push message as it arrives: a method tag and an opaque parameter payload
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationEnvelope {
    pub method: String,
    pub params: Value,
}

/// A transaction's log output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogsPayload {
    pub signature: String,
    pub logs: Vec<String>,
    pub slot: Option<u64>,
}

/// An account's raw data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountPayload {
    /// Account address; absent for single-account subscriptions
    pub pubkey: Option<String>,
    pub data: Vec<u8>,
    pub slot: Option<u64>,
}

/// Outcome of routing a single message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    /// Successful transaction log output
    Logs(LogsPayload),
    /// Account data update
    Account(AccountPayload),
    /// Log output of a failed transaction
    Discarded { signature: String },
    /// Response to a subscribe request
    Ack { request_id: u64, subscription: u64 },
    /// Error response to a request
    RpcError {
        request_id: Option<u64>,
        code: i64,
        message: String,
    },
    /// Anything else; dropped silently
    Unrecognized,
}

#[derive(Deserialize)]
struct InboundMessage {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct NotificationParams<T> {
    result: Contextual<T>,
}

#[derive(Deserialize)]
struct Contextual<T> {
    #[serde(default)]
    context: Option<SlotContext>,
    value: T,
}

#[derive(Deserialize)]
struct SlotContext {
    slot: u64,
}

#[derive(Deserialize)]
struct LogsValue {
    signature: String,
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    logs: Vec<String>,
}

#[derive(Deserialize)]
struct ProgramValue {
    pubkey: String,
    account: AccountValue,
}

#[derive(Deserialize)]
struct AccountValue {
    data: Value,
}

/// Classify a raw text frame
///
/// # Returns
/// The classified message, or a `ProtocolError` if it is not valid JSON-RPC
pub fn classify(text: &str) -> Result<Classified, ProtocolError> {
    let message: InboundMessage = serde_json::from_str(text)?;

    if let (Some(method), Some(params)) = (message.method, message.params) {
        return classify_envelope(NotificationEnvelope { method, params });
    }
    if let Some(error) = message.error {
        return Ok(Classified::RpcError {
            request_id: message.id,
            code: error.code,
            message: error.message,
        });
    }
    match (message.id, message.result.as_ref().and_then(Value::as_u64)) {
        (Some(request_id), Some(subscription)) => Ok(Classified::Ack {
            request_id,
            subscription,
        }),
        _ => Ok(Classified::Unrecognized),
    }
}

/// Classify a notification envelope
pub fn classify_envelope(envelope: NotificationEnvelope) -> Result<Classified, ProtocolError> {
    let NotificationEnvelope { method, params } = envelope;
    let invalid = |e: serde_json::Error| ProtocolError::InvalidPayload {
        method: method.clone(),
        reason: e.to_string(),
    };

    match method.as_str() {
        LOGS_NOTIFICATION => {
            let params: NotificationParams<LogsValue> = serde_json::from_value(params).map_err(invalid)?;
            let slot = params.result.context.map(|c| c.slot);
            let value = params.result.value;
            if value.err.as_ref().is_some_and(|e| !e.is_null()) {
                return Ok(Classified::Discarded {
                    signature: value.signature,
                });
            }
            Ok(Classified::Logs(LogsPayload {
                signature: value.signature,
                logs: value.logs,
                slot,
            }))
        }
        PROGRAM_NOTIFICATION => {
            let params: NotificationParams<ProgramValue> = serde_json::from_value(params).map_err(invalid)?;
            let slot = params.result.context.map(|c| c.slot);
            let value = params.result.value;
            Ok(Classified::Account(AccountPayload {
                pubkey: Some(value.pubkey),
                data: account_data(&method, &value.account.data)?,
                slot,
            }))
        }
        ACCOUNT_NOTIFICATION => {
            let params: NotificationParams<AccountValue> = serde_json::from_value(params).map_err(invalid)?;
            let slot = params.result.context.map(|c| c.slot);
            Ok(Classified::Account(AccountPayload {
                pubkey: None,
                data: account_data(&method, &params.result.value.data)?,
                slot,
            }))
        }
        _ => Ok(Classified::Unrecognized),
    }
}

/// Decode the account data field: `["<data>", "<encoding>"]` or a bare base58 string
///
/// Only the first slice is significant.
fn account_data(method: &str, data: &Value) -> Result<Vec<u8>, ProtocolError> {
    let (text, encoding) = match data {
        Value::String(text) => (text.as_str(), PayloadEncoding::Base58),
        Value::Array(parts) => {
            let text = parts.first().and_then(Value::as_str).ok_or_else(|| ProtocolError::InvalidPayload {
                method: method.to_string(),
                reason: "account data array has no leading string".to_string(),
            })?;
            let tag = parts.last().and_then(Value::as_str).unwrap_or("base58");
            let encoding = PayloadEncoding::from_tag(tag)
                .ok_or_else(|| ProtocolError::UnsupportedEncoding(tag.to_string()))?;
            (text, encoding)
        }
        other => return Err(ProtocolError::UnsupportedEncoding(json_kind(other).to_string())),
    };
    decode_payload(text, encoding).map_err(|e| ProtocolError::InvalidPayload {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Object(_) => "jsonParsed",
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
    }
}

/// Whether any log line contains the creation marker
///
/// A textual match, not a parse: unrelated programs printing the same text are
/// false positives that later fail to decode.
pub fn is_creation_event<S: AsRef<str>>(logs: &[S], marker: &str) -> bool {
    logs.iter().any(|line| line.as_ref().contains(marker))
}

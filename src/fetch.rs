//! Transaction Fetcher
//!
//! Retrieves a full transaction by signature over HTTP JSON-RPC
//! (`getTransaction`) and locates the instruction of interest inside it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::Commitment;
use crate::decoder::{decode_payload, DecodeError, PayloadEncoding};
use crate::schema::InstructionSchema;

/// HTTP request timeout for a single fetch
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;

/// Errors that can occur while fetching a transaction
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
}

/// Errors that can occur while locating an instruction inside a transaction
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ResolveError {
    #[error("No '{instruction}' instruction for program {program_id}")]
    NoMatchingInstruction { instruction: String, program_id: String },

    #[error("Account index {0} out of range")]
    InvalidAccountIndex(usize),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Source of full transactions by signature
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionFetcher: Send + Sync {
    /// Fetch a transaction; `Ok(None)` when the node does not have it (yet)
    async fn fetch(&self, signature: &str) -> Result<Option<FetchedTransaction>, FetchError>;
}

/// Transaction as returned by `getTransaction` with `encoding: "json"`
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FetchedTransaction {
    #[serde(default)]
    pub slot: u64,
    #[serde(default)]
    pub block_time: Option<i64>,
    pub transaction: TransactionBody,
    #[serde(default)]
    pub meta: Option<TransactionMeta>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TransactionBody {
    #[serde(default)]
    pub signatures: Vec<String>,
    pub message: TransactionMessage,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMessage {
    pub account_keys: Vec<String>,
    pub instructions: Vec<CompiledInstruction>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompiledInstruction {
    pub program_id_index: usize,
    #[serde(default)]
    pub accounts: Vec<usize>,
    /// base58 instruction data
    pub data: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMeta {
    #[serde(default)]
    pub err: Option<Value>,
    #[serde(default)]
    pub log_messages: Option<Vec<String>>,
    #[serde(default)]
    pub inner_instructions: Option<Vec<InnerInstructions>>,
    #[serde(default)]
    pub loaded_addresses: Option<LoadedAddresses>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct InnerInstructions {
    pub index: usize,
    pub instructions: Vec<CompiledInstruction>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct LoadedAddresses {
    #[serde(default)]
    pub writable: Vec<String>,
    #[serde(default)]
    pub readonly: Vec<String>,
}

impl FetchedTransaction {
    /// Whether the transaction executed without error
    pub fn succeeded(&self) -> bool {
        self.meta
            .as_ref()
            .and_then(|m| m.err.as_ref())
            .map_or(true, Value::is_null)
    }

    /// Log lines, empty when the node returned none
    pub fn log_messages(&self) -> &[String] {
        self.meta
            .as_ref()
            .and_then(|m| m.log_messages.as_deref())
            .unwrap_or_default()
    }

    /// Full account key list: static keys, then loaded writable, then loaded readonly
    pub fn account_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.transaction.message.account_keys.iter().map(String::as_str).collect();
        if let Some(loaded) = self.meta.as_ref().and_then(|m| m.loaded_addresses.as_ref()) {
            keys.extend(loaded.writable.iter().map(String::as_str));
            keys.extend(loaded.readonly.iter().map(String::as_str));
        }
        keys
    }

    /// Top-level instructions followed by inner (CPI) instructions
    pub fn all_instructions(&self) -> impl Iterator<Item = &CompiledInstruction> {
        let inner = self
            .meta
            .as_ref()
            .and_then(|m| m.inner_instructions.as_ref())
            .into_iter()
            .flatten()
            .flat_map(|group| group.instructions.iter());
        self.transaction.message.instructions.iter().chain(inner)
    }
}

/// Instruction data plus its resolved account addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInstruction {
    pub data: Vec<u8>,
    pub accounts: Vec<String>,
}

/// Find the first instruction invoking `program_id` whose data matches `schema`
///
/// # Arguments
/// * `tx` - The fetched transaction
/// * `program_id` - Base58 id of the program that must be invoked
/// * `schema` - Layout whose discriminator must prefix the instruction data
pub fn resolve_instruction(
    tx: &FetchedTransaction,
    program_id: &str,
    schema: &InstructionSchema,
) -> Result<ResolvedInstruction, ResolveError> {
    let keys = tx.account_keys();

    for ix in tx.all_instructions() {
        if keys.get(ix.program_id_index) != Some(&program_id) {
            continue;
        }
        let data = match decode_payload(&ix.data, PayloadEncoding::Base58) {
            Ok(data) => data,
            Err(e) => {
                debug!("Skipping instruction with undecodable data: {}", e);
                continue;
            }
        };
        if !schema.matches(&data) {
            continue;
        }
        let accounts = ix
            .accounts
            .iter()
            .map(|&i| {
                keys.get(i)
                    .map(|k| k.to_string())
                    .ok_or(ResolveError::InvalidAccountIndex(i))
            })
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(ResolvedInstruction { data, accounts });
    }

    Err(ResolveError::NoMatchingInstruction {
        instruction: schema.name.clone(),
        program_id: program_id.to_string(),
    })
}

#[derive(Serialize)]
struct RpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: Vec<Value>,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// `getTransaction` over HTTP JSON-RPC
pub struct RpcTransactionFetcher {
    client: reqwest::Client,
    url: String,
    commitment: Commitment,
    next_id: AtomicU64,
}

impl RpcTransactionFetcher {
    /// Create a fetcher for an HTTP RPC endpoint
    ///
    /// `getTransaction` does not serve `processed`; it is raised to `confirmed`.
    pub fn new(url: impl Into<String>, commitment: Commitment) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            commitment: commitment.at_least_confirmed(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request_body(&self, signature: &str) -> RpcRequest {
        RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: "getTransaction",
            params: vec![
                Value::String(signature.to_string()),
                json!({
                    "encoding": "json",
                    "commitment": self.commitment.as_str(),
                    "maxSupportedTransactionVersion": 0,
                }),
            ],
        }
    }
}

#[async_trait]
impl TransactionFetcher for RpcTransactionFetcher {
    async fn fetch(&self, signature: &str) -> Result<Option<FetchedTransaction>, FetchError> {
        let body = self.request_body(signature);
        let response: RpcResponse<FetchedTransaction> = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = response.error {
            return Err(FetchError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::encode_payload;
    use crate::schema::pump_create_schema;

    const PROGRAM: &str = "6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P";

    fn create_data() -> Vec<u8> {
        let mut data = pump_create_schema().discriminator;
        for s in ["Name", "SYM", "uri"] {
            data.extend_from_slice(&(s.len() as u32).to_le_bytes());
            data.extend_from_slice(s.as_bytes());
        }
        data
    }

    fn tx_json(instructions: Value, inner: Value, loaded: Value) -> FetchedTransaction {
        let value = json!({
            "slot": 300,
            "blockTime": 1730000000,
            "transaction": {
                "signatures": ["sig"],
                "message": {
                    "accountKeys": ["Mint", "Payer", "Curve", "Assoc", PROGRAM, "ComputeBudget111111111111111111111111111111"],
                    "instructions": instructions
                }
            },
            "meta": {
                "err": null,
                "logMessages": ["Program log: Create"],
                "innerInstructions": inner,
                "loadedAddresses": loaded
            }
        });
        serde_json::from_value(value).unwrap()
    }

    // ==================== FetchedTransaction tests ====================

    #[test]
    fn test_parse_get_transaction_result() {
        let tx = tx_json(json!([]), json!([]), json!({"writable": ["W1"], "readonly": ["R1", "R2"]}));
        assert_eq!(tx.slot, 300);
        assert_eq!(tx.block_time, Some(1730000000));
        assert!(tx.succeeded());
        assert_eq!(tx.log_messages(), &["Program log: Create".to_string()]);
        assert_eq!(tx.account_keys().len(), 9);
        assert_eq!(tx.account_keys()[6..], ["W1", "R1", "R2"]);
    }

    #[test]
    fn test_failed_transaction_not_succeeded() {
        let mut tx = tx_json(json!([]), json!([]), json!(null));
        tx.meta = Some(TransactionMeta {
            err: Some(json!({"InstructionError": [0, "InvalidArgument"]})),
            ..Default::default()
        });
        assert!(!tx.succeeded());
    }

    #[test]
    fn test_missing_meta_counts_as_success() {
        let mut tx = tx_json(json!([]), json!([]), json!(null));
        tx.meta = None;
        assert!(tx.succeeded());
        assert!(tx.log_messages().is_empty());
    }

    // ==================== resolve_instruction tests ====================

    #[test]
    fn test_resolve_top_level_instruction() {
        let data = create_data();
        let tx = tx_json(
            json!([
                {"programIdIndex": 5, "accounts": [], "data": "3DTZbgwsozUF"},
                {"programIdIndex": 4, "accounts": [0, 1, 2, 3], "data": encode_payload(&data, PayloadEncoding::Base58)}
            ]),
            json!([]),
            json!(null),
        );
        let resolved = resolve_instruction(&tx, PROGRAM, &pump_create_schema()).unwrap();
        assert_eq!(resolved.data, data);
        assert_eq!(resolved.accounts, vec!["Mint", "Payer", "Curve", "Assoc"]);
    }

    #[test]
    fn test_resolve_inner_instruction_with_loaded_addresses() {
        let data = create_data();
        let tx = tx_json(
            json!([{"programIdIndex": 5, "accounts": [], "data": "3DTZbgwsozUF"}]),
            json!([{"index": 0, "instructions": [
                {"programIdIndex": 4, "accounts": [0, 6, 7], "data": encode_payload(&data, PayloadEncoding::Base58), "stackHeight": 2}
            ]}]),
            json!({"writable": ["Loaded1"], "readonly": ["Loaded2"]}),
        );
        let resolved = resolve_instruction(&tx, PROGRAM, &pump_create_schema()).unwrap();
        assert_eq!(resolved.accounts, vec!["Mint", "Loaded1", "Loaded2"]);
    }

    #[test]
    fn test_resolve_ignores_other_program_and_discriminator() {
        let buy = {
            let mut d = crate::schema::anchor_discriminator("buy").to_vec();
            d.extend_from_slice(&[0u8; 16]);
            d
        };
        let tx = tx_json(
            json!([
                {"programIdIndex": 5, "accounts": [0], "data": encode_payload(&create_data(), PayloadEncoding::Base58)},
                {"programIdIndex": 4, "accounts": [0], "data": encode_payload(&buy, PayloadEncoding::Base58)}
            ]),
            json!([]),
            json!(null),
        );
        let result = resolve_instruction(&tx, PROGRAM, &pump_create_schema());
        assert!(matches!(result, Err(ResolveError::NoMatchingInstruction { .. })));
    }

    #[test]
    fn test_resolve_invalid_account_index() {
        let tx = tx_json(
            json!([{"programIdIndex": 4, "accounts": [0, 42], "data": encode_payload(&create_data(), PayloadEncoding::Base58)}]),
            json!([]),
            json!(null),
        );
        let result = resolve_instruction(&tx, PROGRAM, &pump_create_schema());
        assert_eq!(result, Err(ResolveError::InvalidAccountIndex(42)));
    }

    // ==================== RpcTransactionFetcher tests ====================

    #[test]
    fn test_request_body_shape() {
        let fetcher = RpcTransactionFetcher::new("http://127.0.0.1:8899", Commitment::Processed).unwrap();
        let first = serde_json::to_value(fetcher.request_body("sigA")).unwrap();
        let second = serde_json::to_value(fetcher.request_body("sigB")).unwrap();

        assert_eq!(first["method"], "getTransaction");
        assert_eq!(first["params"][0], "sigA");
        assert_eq!(first["params"][1]["encoding"], "json");
        assert_eq!(first["params"][1]["commitment"], "confirmed");
        assert_eq!(first["params"][1]["maxSupportedTransactionVersion"], 0);
        assert!(second["id"].as_u64().unwrap() > first["id"].as_u64().unwrap());
    }

    #[test]
    fn test_rpc_response_null_result() {
        let response: RpcResponse<FetchedTransaction> =
            serde_json::from_str(r#"{"jsonrpc":"2.0","result":null,"id":1}"#).unwrap();
        assert!(response.result.is_none());
        assert!(response.error.is_none());
    }

    #[test]
    fn test_rpc_response_without_result_or_error_keys() {
        let response: RpcResponse<FetchedTransaction> =
            serde_json::from_str(r#"{"jsonrpc":"2.0","error":{"code":-32009,"message":"Slot skipped"},"id":2}"#)
                .unwrap();
        assert!(response.result.is_none());
        let error = response.error.unwrap();
        assert_eq!(error.code, -32009);
        assert_eq!(error.message, "Slot skipped");

        let bare: RpcResponse<FetchedTransaction> = serde_json::from_str(r#"{"jsonrpc":"2.0","id":3}"#).unwrap();
        assert!(bare.result.is_none());
        assert!(bare.error.is_none());
    }

    #[tokio::test]
    async fn test_fetch_unreachable_endpoint_is_http_error() {
        let fetcher = RpcTransactionFetcher::new("http://127.0.0.1:1", Commitment::Confirmed).unwrap();
        let result = fetcher.fetch("sig").await;
        assert!(matches!(result, Err(FetchError::Http(_))));
    }
}

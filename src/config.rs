//! Ingestor Configuration
//!
//! All tunables of the pipeline with their defaults, loading from `MINTSCOPE_*`
//! environment variables, and the startup validation that decides which
//! misconfigurations are fatal.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::router::DEFAULT_CREATE_MARKER;
use crate::schema::{SchemaError, SchemaRegistry, CREATE_INSTRUCTION, PUMP_PROGRAM_ID};
use crate::store::{DEFAULT_CHECKPOINT_EVERY, DEFAULT_STORE_PATH};

/// Public mainnet pubsub endpoint
pub const DEFAULT_WS_URL: &str = "wss://api.mainnet-beta.solana.com";

/// Public mainnet HTTP endpoint
pub const DEFAULT_RPC_URL: &str = "https://api.mainnet-beta.solana.com";

/// Keep-alive ping interval
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 20_000;

/// Connection handshake timeout
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Initial reconnect backoff
pub const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Reconnect backoff cap
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Secondary fetches allowed to run at once
pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;

/// Attempts to fetch a transaction before giving up
pub const DEFAULT_FETCH_ATTEMPTS: u32 = 5;

/// Pause between fetch attempts
pub const DEFAULT_FETCH_RETRY_DELAY_MS: u64 = 500;

/// Attempts to append a record before sending it to the dead-letter log
pub const DEFAULT_STORE_ATTEMPTS: u32 = 3;

/// Pause before the first append retry, doubled per attempt
pub const DEFAULT_STORE_RETRY_DELAY_MS: u64 = 100;

/// Cluster name used in explorer links
pub const DEFAULT_EXPLORER_CLUSTER: &str = "mainnet";

/// Prefix of every environment variable read by [`IngestorConfig::from_env`]
pub const ENV_PREFIX: &str = "MINTSCOPE_";

/// Configuration problems detected at startup; these are fatal
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid endpoint URL '{url}': {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("Invalid program id '{0}': expected a base58 32-byte address")]
    InvalidProgramId(String),

    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("Schema registry is empty")]
    EmptyRegistry,

    #[error("Failed to read IDL {path}: {source}")]
    IdlRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Requested finality of data served by the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    #[default]
    Processed,
    Confirmed,
    Finalized,
}

impl Commitment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Commitment::Processed => "processed",
            Commitment::Confirmed => "confirmed",
            Commitment::Finalized => "finalized",
        }
    }

    /// `processed` is raised to `confirmed`; others unchanged
    pub fn at_least_confirmed(self) -> Self {
        match self {
            Commitment::Processed => Commitment::Confirmed,
            other => other,
        }
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Commitment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "processed" => Ok(Commitment::Processed),
            "confirmed" => Ok(Commitment::Confirmed),
            "finalized" => Ok(Commitment::Finalized),
            _ => Err(ConfigError::InvalidValue {
                key: "COMMITMENT".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Which pubsub subscription the session opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionKind {
    /// `logsSubscribe` filtered by program mention
    #[default]
    Logs,
    /// `programSubscribe` on the program's accounts
    Program,
}

impl SubscriptionKind {
    pub fn method(&self) -> &'static str {
        match self {
            SubscriptionKind::Logs => "logsSubscribe",
            SubscriptionKind::Program => "programSubscribe",
        }
    }
}

impl FromStr for SubscriptionKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "logs" => Ok(SubscriptionKind::Logs),
            "program" => Ok(SubscriptionKind::Program),
            _ => Err(ConfigError::InvalidValue {
                key: "SUBSCRIPTION".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Full ingestor configuration
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    /// WebSocket pubsub endpoint
    pub ws_url: String,
    /// HTTP endpoint for `getTransaction`
    pub rpc_url: String,
    /// Program whose activity is observed
    pub program_id: String,
    pub commitment: Commitment,
    pub subscription: SubscriptionKind,
    /// Log text that marks a creation event
    pub create_marker: String,
    /// Schema name of the creation instruction
    pub instruction: String,
    /// Optional IDL replacing the built-in schemas
    pub idl_path: Option<PathBuf>,
    pub explorer_cluster: String,
    pub store_path: String,
    pub checkpoint_every: usize,
    pub keepalive_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
    pub max_in_flight: usize,
    pub fetch_attempts: u32,
    pub fetch_retry_delay_ms: u64,
    pub store_attempts: u32,
    pub store_retry_delay_ms: u64,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            rpc_url: DEFAULT_RPC_URL.to_string(),
            program_id: PUMP_PROGRAM_ID.to_string(),
            commitment: Commitment::default(),
            subscription: SubscriptionKind::default(),
            create_marker: DEFAULT_CREATE_MARKER.to_string(),
            instruction: CREATE_INSTRUCTION.to_string(),
            idl_path: None,
            explorer_cluster: DEFAULT_EXPLORER_CLUSTER.to_string(),
            store_path: DEFAULT_STORE_PATH.to_string(),
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
            max_reconnect_attempts: None,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            fetch_attempts: DEFAULT_FETCH_ATTEMPTS,
            fetch_retry_delay_ms: DEFAULT_FETCH_RETRY_DELAY_MS,
            store_attempts: DEFAULT_STORE_ATTEMPTS,
            store_retry_delay_ms: DEFAULT_STORE_RETRY_DELAY_MS,
        }
    }
}

impl IngestorConfig {
    /// Default configuration pointed at other endpoints
    pub fn with_endpoints(ws_url: impl Into<String>, rpc_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            rpc_url: rpc_url.into(),
            ..Default::default()
        }
    }

    /// Read overrides from `MINTSCOPE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through an arbitrary key lookup
    ///
    /// Keys are looked up with the `MINTSCOPE_` prefix; absent keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut config = Self::default();

        if let Some(v) = get("WS_URL") {
            config.ws_url = v;
        }
        if let Some(v) = get("RPC_URL") {
            config.rpc_url = v;
        }
        if let Some(v) = get("PROGRAM_ID") {
            config.program_id = v;
        }
        if let Some(v) = get("COMMITMENT") {
            config.commitment = v.parse()?;
        }
        if let Some(v) = get("SUBSCRIPTION") {
            config.subscription = v.parse()?;
        }
        if let Some(v) = get("CREATE_MARKER") {
            config.create_marker = v;
        }
        if let Some(v) = get("INSTRUCTION") {
            config.instruction = v;
        }
        if let Some(v) = get("IDL_PATH") {
            config.idl_path = Some(PathBuf::from(expand_path(&v)));
        }
        if let Some(v) = get("EXPLORER_CLUSTER") {
            config.explorer_cluster = v;
        }
        if let Some(v) = get("STORE_PATH") {
            config.store_path = v;
        }
        if let Some(v) = get("CHECKPOINT_EVERY") {
            config.checkpoint_every = parse_number("CHECKPOINT_EVERY", &v)?;
        }
        if let Some(v) = get("KEEPALIVE_MS") {
            config.keepalive_interval_ms = parse_number("KEEPALIVE_MS", &v)?;
        }
        if let Some(v) = get("MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = Some(parse_number("MAX_RECONNECT_ATTEMPTS", &v)?);
        }
        if let Some(v) = get("MAX_IN_FLIGHT") {
            config.max_in_flight = parse_number("MAX_IN_FLIGHT", &v)?;
        }
        if let Some(v) = get("FETCH_ATTEMPTS") {
            config.fetch_attempts = parse_number("FETCH_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("FETCH_RETRY_DELAY_MS") {
            config.fetch_retry_delay_ms = parse_number("FETCH_RETRY_DELAY_MS", &v)?;
        }
        if let Some(v) = get("CONNECT_TIMEOUT_MS") {
            config.connect_timeout_ms = parse_number("CONNECT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("INITIAL_BACKOFF_MS") {
            config.initial_backoff_ms = parse_number("INITIAL_BACKOFF_MS", &v)?;
        }
        if let Some(v) = get("MAX_BACKOFF_MS") {
            config.max_backoff_ms = parse_number("MAX_BACKOFF_MS", &v)?;
        }
        if let Some(v) = get("STORE_ATTEMPTS") {
            config.store_attempts = parse_number("STORE_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("STORE_RETRY_DELAY_MS") {
            config.store_retry_delay_ms = parse_number("STORE_RETRY_DELAY_MS", &v)?;
        }

        Ok(config)
    }

    /// Check everything that would make the ingestor unable to start
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url(&self.ws_url, &["ws", "wss"])?;
        validate_url(&self.rpc_url, &["http", "https"])?;
        validate_program_id(&self.program_id)?;
        if self.keepalive_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "KEEPALIVE_MS".to_string(),
                value: "0".to_string(),
            });
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_IN_FLIGHT".to_string(),
                value: "0".to_string(),
            });
        }
        // An empty marker would match every log line
        if self.create_marker.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "CREATE_MARKER".to_string(),
                value: self.create_marker.clone(),
            });
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::InvalidValue {
                key: "INITIAL_BACKOFF_MS".to_string(),
                value: format!("{} (above MAX_BACKOFF_MS {})", self.initial_backoff_ms, self.max_backoff_ms),
            });
        }
        Ok(())
    }

    /// Load the schema registry: the IDL when configured, the built-in one otherwise
    ///
    /// The configured creation instruction must be present.
    pub fn load_registry(&self) -> Result<SchemaRegistry, ConfigError> {
        let registry = match &self.idl_path {
            Some(path) => {
                let json = std::fs::read_to_string(path).map_err(|source| ConfigError::IdlRead {
                    path: path.clone(),
                    source,
                })?;
                SchemaRegistry::from_idl_json(&json)?
            }
            None => SchemaRegistry::builtin().clone(),
        };
        if registry.is_empty() {
            return Err(ConfigError::EmptyRegistry);
        }
        registry.lookup(&self.instruction)?;
        Ok(registry)
    }

    /// Store path with `~` expanded
    pub fn resolved_store_path(&self) -> PathBuf {
        PathBuf::from(expand_path(&self.store_path))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn validate_url(url: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| ConfigError::InvalidEndpoint {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(ConfigError::InvalidEndpoint {
            url: url.to_string(),
            reason: format!("scheme must be one of {:?}", schemes),
        });
    }
    if parsed.host_str().is_none() {
        return Err(ConfigError::InvalidEndpoint {
            url: url.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(())
}

/// Check that a string is a base58-encoded 32-byte address
pub fn validate_program_id(program_id: &str) -> Result<(), ConfigError> {
    match bs58::decode(program_id).into_vec() {
        Ok(bytes) if bytes.len() == 32 => Ok(()),
        _ => Err(ConfigError::InvalidProgramId(program_id.to_string())),
    }
}

/// Expand ~ to home directory in path
pub fn expand_path(path: &str) -> String {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}

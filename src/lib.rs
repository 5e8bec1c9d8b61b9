//! MintScope Ingestor Library
//!
//! This crate provides components for watching a Solana program over pubsub,
//! detecting token creations, decoding their instruction payloads and storing
//! the resulting records in a crash-safe log.

pub mod config;
pub mod decoder;
pub mod fetch;
pub mod pipeline;
pub mod router;
pub mod schema;
pub mod session;
pub mod store;
pub mod transport;

// Re-export commonly used types
pub use config::{Commitment, ConfigError, IngestorConfig, SubscriptionKind};
pub use decoder::{decode_instruction, DecodeError, DecodedInstruction};
pub use fetch::{RpcTransactionFetcher, TransactionFetcher};
pub use router::{classify, is_creation_event, Classified};
pub use schema::{InstructionSchema, SchemaRegistry};
pub use session::{Session, SessionState, SessionStats};
pub use store::{MintRecord, RecordSink, RecordStore, StoreError};
pub use transport::{Connection, Connector, WsConnector};

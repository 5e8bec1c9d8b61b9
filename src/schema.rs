//! Instruction Schema Registry
//!
//! Static definitions of the instruction layouts the ingestor knows how to decode.
//! Each layout names its discriminator, its ordered argument fields and the
//! positional bindings from logical account roles to account indices.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Instruction name of the token creation instruction
pub const CREATE_INSTRUCTION: &str = "create";

/// pump.fun bonding curve program
pub const PUMP_PROGRAM_ID: &str = "6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P";

/// Length of an Anchor instruction discriminator
pub const ANCHOR_DISCRIMINATOR_LEN: usize = 8;

/// Byte length of an embedded public key
pub const PUBKEY_LEN: usize = 32;

/// Errors raised by schema lookup and IDL loading
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("No instruction schema registered for '{0}'")]
    NotFound(String),

    #[error("Invalid IDL document: {0}")]
    InvalidIdl(#[from] serde_json::Error),

    #[error("Instruction '{0}' declared twice")]
    Duplicate(String),
}

/// Wire type of a single instruction argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    /// Exactly `n` raw bytes, rendered as a base58 address
    FixedBytes(usize),
    /// u32 little-endian length followed by that many UTF-8 bytes
    String,
    /// A type this decoder cannot read; carries the IDL type name
    Unsupported(String),
}

impl FieldType {
    /// Map an IDL type name onto a wire type
    pub fn from_idl(type_name: &str) -> Self {
        match type_name {
            "publicKey" | "pubkey" => FieldType::FixedBytes(PUBKEY_LEN),
            "string" => FieldType::String,
            other => FieldType::Unsupported(other.to_string()),
        }
    }

    /// Human-readable type name, as it would appear in an IDL
    pub fn name(&self) -> String {
        match self {
            FieldType::FixedBytes(PUBKEY_LEN) => "publicKey".to_string(),
            FieldType::FixedBytes(n) => format!("bytes{}", n),
            FieldType::String => "string".to_string(),
            FieldType::Unsupported(name) => name.clone(),
        }
    }
}

/// One named argument of an instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub ty: FieldType,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self { name: name.into(), ty }
    }
}

/// Maps a logical role (e.g. "mint") to a fixed index in the instruction's account list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountBinding {
    pub role: String,
    pub index: usize,
}

impl AccountBinding {
    pub fn new(role: impl Into<String>, index: usize) -> Self {
        Self { role: role.into(), index }
    }
}

/// Layout of one instruction variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionSchema {
    /// Instruction name, used as the registry key
    pub name: String,
    /// Leading bytes identifying the variant; its length is the discriminator length
    pub discriminator: Vec<u8>,
    /// Argument fields in wire order
    pub fields: Vec<FieldSpec>,
    /// Positional account bindings
    pub accounts: Vec<AccountBinding>,
}

impl InstructionSchema {
    /// Byte length of the discriminator
    pub fn discriminator_len(&self) -> usize {
        self.discriminator.len()
    }

    /// Discriminator as lowercase hex, for diagnostics
    pub fn discriminator_hex(&self) -> String {
        hex::encode(&self.discriminator)
    }

    /// Whether `data` starts with this schema's discriminator
    pub fn matches(&self, data: &[u8]) -> bool {
        data.starts_with(&self.discriminator)
    }

    /// Highest account index referenced by a binding, if any
    pub fn max_account_index(&self) -> Option<usize> {
        self.accounts.iter().map(|b| b.index).max()
    }

    /// Copy of this layout keeping only bindings to the first `account_count` accounts
    pub fn bound_within(&self, account_count: usize) -> InstructionSchema {
        InstructionSchema {
            accounts: self
                .accounts
                .iter()
                .filter(|b| b.index < account_count)
                .cloned()
                .collect(),
            ..self.clone()
        }
    }

    /// Smallest payload that could possibly hold every field
    ///
    /// Strings count only their 4-byte length prefix.
    pub fn min_len(&self) -> usize {
        self.discriminator_len()
            + self
                .fields
                .iter()
                .map(|f| match f.ty {
                    FieldType::FixedBytes(n) => n,
                    FieldType::String => 4,
                    FieldType::Unsupported(_) => 0,
                })
                .sum::<usize>()
    }
}

/// Compute the Anchor discriminator for an instruction name
///
/// # Arguments
/// * `instruction_name` - The snake_case instruction name (e.g. "create")
///
/// # Returns
/// The first 8 bytes of `sha256("global:<name>")`
pub fn anchor_discriminator(instruction_name: &str) -> [u8; ANCHOR_DISCRIMINATOR_LEN] {
    let digest = Sha256::digest(format!("global:{}", instruction_name).as_bytes());
    let mut out = [0u8; ANCHOR_DISCRIMINATOR_LEN];
    out.copy_from_slice(&digest[..ANCHOR_DISCRIMINATOR_LEN]);
    out
}

/// The pump.fun `create` instruction layout
pub fn pump_create_schema() -> InstructionSchema {
    InstructionSchema {
        name: CREATE_INSTRUCTION.to_string(),
        discriminator: anchor_discriminator(CREATE_INSTRUCTION).to_vec(),
        fields: vec![
            FieldSpec::new("name", FieldType::String),
            FieldSpec::new("symbol", FieldType::String),
            FieldSpec::new("uri", FieldType::String),
        ],
        accounts: vec![
            AccountBinding::new("mint", 0),
            AccountBinding::new("bondingCurve", 2),
            AccountBinding::new("associatedBondingCurve", 3),
            AccountBinding::new("user", 7),
        ],
    }
}

/// Built-in registry shared by every session that does not load its own IDL
static BUILTIN: LazyLock<SchemaRegistry> = LazyLock::new(|| {
    let mut registry = SchemaRegistry::new();
    registry.schemas.insert(CREATE_INSTRUCTION.to_string(), pump_create_schema());
    registry
});

#[derive(Deserialize)]
struct IdlDocument {
    #[serde(default)]
    instructions: Vec<IdlInstruction>,
}

#[derive(Deserialize)]
struct IdlInstruction {
    name: String,
    #[serde(default)]
    discriminator: Option<Vec<u8>>,
    #[serde(default)]
    accounts: Vec<IdlAccount>,
    #[serde(default)]
    args: Vec<IdlArg>,
}

#[derive(Deserialize)]
struct IdlAccount {
    name: String,
}

#[derive(Deserialize)]
struct IdlArg {
    name: String,
    #[serde(rename = "type")]
    ty: serde_json::Value,
}

/// Read-only collection of instruction schemas keyed by instruction name
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, InstructionSchema>,
}

impl SchemaRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in registry (pump.fun `create`)
    pub fn builtin() -> &'static SchemaRegistry {
        &BUILTIN
    }

    /// Build a registry from explicit schemas
    pub fn from_schemas(schemas: impl IntoIterator<Item = InstructionSchema>) -> Result<Self, SchemaError> {
        let mut registry = Self::new();
        for schema in schemas {
            if registry.schemas.contains_key(&schema.name) {
                return Err(SchemaError::Duplicate(schema.name));
            }
            registry.schemas.insert(schema.name.clone(), schema);
        }
        Ok(registry)
    }

    /// Load instruction layouts from an Anchor-style IDL document
    ///
    /// Every IDL account becomes a binding at its declared position. Instructions
    /// without an explicit discriminator get the derived Anchor one.
    pub fn from_idl_json(json: &str) -> Result<Self, SchemaError> {
        let idl: IdlDocument = serde_json::from_str(json)?;
        let schemas = idl.instructions.into_iter().map(|ix| {
            let discriminator = ix
                .discriminator
                .unwrap_or_else(|| anchor_discriminator(&ix.name).to_vec());
            InstructionSchema {
                fields: ix
                    .args
                    .into_iter()
                    .map(|arg| {
                        // Composite types ({"defined": ..}, {"vec": ..}) are never readable here
                        let ty = match arg.ty.as_str() {
                            Some(name) => FieldType::from_idl(name),
                            None => FieldType::Unsupported(arg.ty.to_string()),
                        };
                        FieldSpec::new(arg.name, ty)
                    })
                    .collect(),
                accounts: ix
                    .accounts
                    .into_iter()
                    .enumerate()
                    .map(|(index, account)| AccountBinding::new(account.name, index))
                    .collect(),
                name: ix.name,
                discriminator,
            }
        });
        Self::from_schemas(schemas)
    }

    /// Look up the schema for an instruction kind
    ///
    /// # Returns
    /// The schema, or `SchemaError::NotFound` for unknown kinds
    pub fn lookup(&self, kind: &str) -> Result<&InstructionSchema, SchemaError> {
        self.schemas
            .get(kind)
            .ok_or_else(|| SchemaError::NotFound(kind.to_string()))
    }

    /// Find the schema whose discriminator prefixes `data`
    pub fn identify(&self, data: &[u8]) -> Option<&InstructionSchema> {
        self.schemas.values().find(|schema| schema.matches(data))
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Registered instruction names, sorted
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }
}

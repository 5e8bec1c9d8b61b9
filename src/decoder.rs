//! Instruction Decoder
//!
//! Decodes raw instruction bytes against an [`InstructionSchema`]: skips the
//! discriminator, reads each declared field at a moving cursor and resolves the
//! positional account bindings. Also owns the text encodings used to carry
//! binary payloads inside JSON (base58 and base64).

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use thiserror::Error;

use crate::schema::{FieldType, InstructionSchema};

/// Errors that can occur while decoding an instruction
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Truncated input: field '{field}' needs {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        field: String,
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Unsupported field type: {0}")]
    UnsupportedType(String),

    #[error("Missing account for role '{role}': index {index} but only {available} accounts supplied")]
    MissingAccount {
        role: String,
        index: usize,
        available: usize,
    },

    #[error("Field '{field}' is not valid UTF-8")]
    InvalidUtf8 { field: String },

    #[error("Invalid {encoding} payload: {reason}")]
    InvalidEncoding { encoding: &'static str, reason: String },
}

/// Text encoding of a binary payload embedded in a JSON message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    Base58,
    Base64,
}

impl PayloadEncoding {
    /// Parse an RPC encoding tag ("base58", "base64", legacy "binary")
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "base58" | "binary" => Some(PayloadEncoding::Base58),
            "base64" => Some(PayloadEncoding::Base64),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            PayloadEncoding::Base58 => "base58",
            PayloadEncoding::Base64 => "base64",
        }
    }
}

/// Decode a text-encoded payload into raw bytes
pub fn decode_payload(text: &str, encoding: PayloadEncoding) -> Result<Vec<u8>, DecodeError> {
    match encoding {
        PayloadEncoding::Base58 => bs58::decode(text).into_vec().map_err(|e| DecodeError::InvalidEncoding {
            encoding: encoding.tag(),
            reason: e.to_string(),
        }),
        PayloadEncoding::Base64 => BASE64.decode(text).map_err(|e| DecodeError::InvalidEncoding {
            encoding: encoding.tag(),
            reason: e.to_string(),
        }),
    }
}

/// Encode raw bytes as payload text
pub fn encode_payload(bytes: &[u8], encoding: PayloadEncoding) -> String {
    match encoding {
        PayloadEncoding::Base58 => bs58::encode(bytes).into_string(),
        PayloadEncoding::Base64 => BASE64.encode(bytes),
    }
}

/// A decoded argument value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Fixed-length bytes rendered as a base58 address
    Address(String),
    /// Length-prefixed UTF-8 string
    Text(String),
}

impl FieldValue {
    pub fn as_str(&self) -> &str {
        match self {
            FieldValue::Address(s) | FieldValue::Text(s) => s,
        }
    }
}

/// Result of decoding one instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedInstruction {
    /// Name of the schema the payload was decoded with
    pub instruction: String,
    /// Field name -> decoded value
    pub fields: BTreeMap<String, FieldValue>,
    /// Logical role -> account address
    pub accounts: BTreeMap<String, String>,
    /// Bytes read from the payload, discriminator included
    pub consumed: usize,
}

impl DecodedInstruction {
    /// String value of a field, if present
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(FieldValue::as_str)
    }

    /// Account address bound to a role, if present
    pub fn account(&self, role: &str) -> Option<&str> {
        self.accounts.get(role).map(String::as_str)
    }
}

/// Read-only cursor over the instruction bytes
struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take(&mut self, n: usize, field: &str) -> Result<&'a [u8], DecodeError> {
        if n > self.remaining() {
            return Err(DecodeError::Truncated {
                field: field.to_string(),
                offset: self.offset,
                needed: n,
                available: self.remaining(),
            });
        }
        let bytes = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(bytes)
    }

    fn read_u32_le(&mut self, field: &str) -> Result<u32, DecodeError> {
        let bytes = self.take(4, field)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(buf))
    }
}

/// Decode an instruction payload
///
/// # Arguments
/// * `raw` - The instruction data, discriminator included
/// * `schema` - The layout to decode with
/// * `accounts` - The instruction's account addresses, in instruction order
///
/// # Returns
/// A `DecodedInstruction`, or the first `DecodeError` encountered. The
/// discriminator bytes are skipped, not verified.
pub fn decode_instruction(
    raw: &[u8],
    schema: &InstructionSchema,
    accounts: &[String],
) -> Result<DecodedInstruction, DecodeError> {
    let mut cursor = Cursor::new(raw);
    cursor.take(schema.discriminator_len(), "discriminator")?;

    let mut fields = BTreeMap::new();
    for def in &schema.fields {
        let value = match &def.ty {
            FieldType::FixedBytes(n) => {
                let bytes = cursor.take(*n, &def.name)?;
                FieldValue::Address(bs58::encode(bytes).into_string())
            }
            FieldType::String => {
                let len = cursor.read_u32_le(&def.name)? as usize;
                let bytes = cursor.take(len, &def.name)?;
                let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8 {
                    field: def.name.clone(),
                })?;
                FieldValue::Text(text.to_string())
            }
            FieldType::Unsupported(name) => return Err(DecodeError::UnsupportedType(name.clone())),
        };
        fields.insert(def.name.clone(), value);
    }

    let mut resolved = BTreeMap::new();
    for binding in &schema.accounts {
        let address = accounts.get(binding.index).ok_or_else(|| DecodeError::MissingAccount {
            role: binding.role.clone(),
            index: binding.index,
            available: accounts.len(),
        })?;
        resolved.insert(binding.role.clone(), address.clone());
    }

    Ok(DecodedInstruction {
        instruction: schema.name.clone(),
        fields,
        accounts: resolved,
        consumed: cursor.offset,
    })
}

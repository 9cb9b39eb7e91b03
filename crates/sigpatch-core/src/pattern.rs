use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::MemoryView;

/// Mask byte for a position that must equal the pattern byte.
pub const MASK_MATCH: u8 = 0xFF;
/// Mask byte for a position whose value is ignored.
pub const MASK_IGNORE: u8 = 0x00;

const WILDCARD: &str = "??";

/// A byte signature with a per-byte "must match / ignore" mask.
///
/// Serialized in signature syntax: `"48 89 C6 ?? ?? E8"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MaskedPattern {
    bytes: Vec<u8>,
    mask: Vec<u8>,
}

impl MaskedPattern {
    pub fn new(bytes: Vec<u8>, mask: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::config("Pattern is empty"));
        }
        if bytes.len() != mask.len() {
            return Err(Error::config(format!(
                "Pattern length {} does not match mask length {}",
                bytes.len(),
                mask.len()
            )));
        }
        if let Some(pos) = mask.iter().position(|&m| m != MASK_MATCH && m != MASK_IGNORE) {
            return Err(Error::config(format!(
                "Mask byte 0x{:02X} at index {} is neither 0xFF nor 0x00",
                mask[pos], pos
            )));
        }

        Ok(Self { bytes, mask })
    }

    /// Pattern where every byte must match.
    pub fn exact(bytes: &[u8]) -> Result<Self> {
        Self::new(bytes.to_vec(), vec![MASK_MATCH; bytes.len()])
    }

    /// Parse signature syntax: two hex digits per byte, `??` for an ignored byte.
    pub fn parse(pattern: &str) -> Result<Self> {
        let mut bytes = Vec::new();
        let mut mask = Vec::new();
        for token in pattern.split_whitespace() {
            if token == WILDCARD {
                bytes.push(0);
                mask.push(MASK_IGNORE);
            } else {
                bytes.push(parse_byte(token)?);
                mask.push(MASK_MATCH);
            }
        }
        Self::new(bytes, mask)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mask(&self) -> &[u8] {
        &self.mask
    }

    /// Test `data` against the signature. Data shorter than the pattern never matches.
    pub fn matches(&self, data: &[u8]) -> bool {
        if self.bytes.is_empty() || data.len() < self.bytes.len() {
            return false;
        }

        self.bytes
            .iter()
            .zip(&self.mask)
            .zip(data)
            .all(|((&expected, &mask), &actual)| mask == MASK_IGNORE || expected == actual)
    }

    /// Read a pattern-sized window at `address` and test it.
    pub fn matches_at<M: MemoryView + ?Sized>(&self, memory: &M, address: u64) -> Result<bool> {
        let window = memory.read_bytes(address, self.len())?;
        Ok(self.matches(&window))
    }

    /// Byte values with `None` at ignored positions.
    pub fn to_tokens(&self) -> Vec<Option<u8>> {
        self.bytes
            .iter()
            .zip(&self.mask)
            .map(|(&b, &m)| (m == MASK_MATCH).then_some(b))
            .collect()
    }
}

impl fmt::Display for MaskedPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.to_tokens().into_iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match token {
                Some(value) => write!(f, "{:02X}", value)?,
                None => f.write_str(WILDCARD)?,
            }
        }
        Ok(())
    }
}

impl TryFrom<String> for MaskedPattern {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<MaskedPattern> for String {
    fn from(value: MaskedPattern) -> Self {
        value.to_string()
    }
}

fn parse_byte(token: &str) -> Result<u8> {
    if token.len() != 2 || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::config(format!(
            "Byte token '{}' must be exactly two hex digits",
            token
        )));
    }
    u8::from_str_radix(token, 16)
        .map_err(|e| Error::config(format!("Invalid hex byte '{}': {}", token, e)))
}

/// Parse a plain hex byte string such as `"50 48 C7 C7"`, used for template and
/// image bytes. Wildcards are rejected.
pub fn parse_hex_bytes(text: &str) -> Result<Vec<u8>> {
    text.split_whitespace().map(parse_byte).collect()
}

pub fn format_hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

//! Serde helpers for writing addresses and displacements as hex strings.
//!
//! Deserialization accepts either a JSON/TOML integer or a string such as
//! `"0xFFFFFFFF81000000"` / `"-0x8B8986"`; serialization always writes the string form.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum Raw {
    Unsigned(u64),
    Signed(i64),
    Text(String),
}

fn parse_unsigned(text: &str) -> Result<u64, String> {
    let trimmed = text.trim().replace('_', "");
    match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(digits) => u64::from_str_radix(digits, 16),
        None => trimmed.parse::<u64>(),
    }
    .map_err(|e| format!("invalid address '{}': {}", text, e))
}

fn parse_signed(text: &str) -> Result<i64, String> {
    let trimmed = text.trim();
    let (negative, magnitude) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let value = parse_unsigned(magnitude)?;
    if negative {
        0i64.checked_sub_unsigned(value)
    } else {
        i64::try_from(value).ok()
    }
    .ok_or_else(|| format!("offset '{}' does not fit in 64 signed bits", text))
}

pub mod address {
    use super::*;

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{:X}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Unsigned(v) => Ok(v),
            Raw::Signed(v) => u64::try_from(v).map_err(de::Error::custom),
            Raw::Text(text) => parse_unsigned(&text).map_err(de::Error::custom),
        }
    }
}

pub mod offset {
    use super::*;

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        let text = if *value < 0 {
            format!("-0x{:X}", value.unsigned_abs())
        } else {
            format!("0x{:X}", value)
        };
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Unsigned(v) => i64::try_from(v).map_err(de::Error::custom),
            Raw::Signed(v) => Ok(v),
            Raw::Text(text) => parse_signed(&text).map_err(de::Error::custom),
        }
    }
}

pub mod option_address {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(address) => serializer.serialize_some(&format!("0x{:X}", address)),
            None => serializer.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        #[serde(with = "super::address")]
        addr: u64,
        #[serde(with = "super::offset")]
        delta: i64,
    }

    #[test]
    fn test_accepts_strings_and_numbers() {
        let parsed: Sample =
            serde_json::from_str(r#"{"addr": "0xFFFFFFFF80000000", "delta": "-0x8B8986"}"#)
                .unwrap();
        assert_eq!(parsed.addr, 0xFFFF_FFFF_8000_0000);
        assert_eq!(parsed.delta, -0x8B8986);

        let parsed: Sample = serde_json::from_str(r#"{"addr": 4096, "delta": -16}"#).unwrap();
        assert_eq!(parsed.addr, 0x1000);
        assert_eq!(parsed.delta, -16);
    }

    #[test]
    fn test_serializes_hex() {
        let sample = Sample {
            addr: 0x1000,
            delta: -0x20,
        };
        let json = serde_json::to_string(&sample).unwrap();
        assert_eq!(json, r#"{"addr":"0x1000","delta":"-0x20"}"#);
        let back: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(serde_json::from_str::<Sample>(r#"{"addr": "0xZZ", "delta": 0}"#).is_err());
        assert!(serde_json::from_str::<Sample>(r#"{"addr": -1, "delta": 0}"#).is_err());
        assert!(
            serde_json::from_str::<Sample>(r#"{"addr": 0, "delta": "0xFFFFFFFFFFFFFFFF"}"#)
                .is_err()
        );
    }
}

//! Trace and span identifiers
//!
//! Identifiers are drawn from the thread-local CSPRNG and rendered as
//! fixed-width lowercase hex: 32 characters for a trace, 16 for a span.
//! The width is part of the wire contract, leading zeros are always kept.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Error returned when text is not a well-formed identifier
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseIdError {
    #[error("Invalid trace ID")]
    TraceId,
    #[error("Invalid span ID")]
    SpanId,
}

/// A 128-bit trace identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId([u8; 16]);

/// A 64-bit span identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId([u8; 8]);

impl TraceId {
    /// Number of hex characters in a rendered trace ID
    pub const HEX_LEN: usize = 32;

    /// Draw a new random trace ID
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut bytes = [0u8; 16];
            rng.fill(&mut bytes);
            // The all-zero ID is reserved as "invalid"
            if bytes != [0u8; 16] {
                return Self(bytes);
            }
        }
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub const fn to_bytes(self) -> [u8; 16] {
        self.0
    }

    /// Parse a trace ID from an inbound header value.
    ///
    /// Accepts exactly 32 hex digits in either case. Anything else yields
    /// `None`, without telling a wrong length apart from a wrong alphabet.
    /// The all-zero ID is rejected since no tracing backend accepts it.
    pub fn parse_lenient(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.len() != Self::HEX_LEN {
            return None;
        }
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(value, &mut bytes).ok()?;
        (bytes != [0u8; 16]).then_some(Self(bytes))
    }

    /// Lowercase hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl SpanId {
    /// Number of hex characters in a rendered span ID
    pub const HEX_LEN: usize = 16;

    /// Draw a new random span ID
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut bytes = [0u8; 8];
            rng.fill(&mut bytes);
            if bytes != [0u8; 8] {
                return Self(bytes);
            }
        }
    }

    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub const fn to_bytes(self) -> [u8; 8] {
        self.0
    }

    /// Lowercase hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Mint a new trace ID
pub fn new_trace_id() -> TraceId {
    TraceId::random()
}

/// Mint a new span ID, independent of any trace ID
pub fn new_span_id() -> SpanId {
    SpanId::random()
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({self})")
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({self})")
    }
}

impl FromStr for TraceId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_lenient(s).ok_or(ParseIdError::TraceId)
    }
}

impl FromStr for SpanId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Self::HEX_LEN {
            return Err(ParseIdError::SpanId);
        }
        let mut bytes = [0u8; 8];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ParseIdError::SpanId)?;
        Ok(Self(bytes))
    }
}

impl Serialize for TraceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TraceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for SpanId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SpanId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn is_lower_hex(s: &str) -> bool {
        s.chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    }

    #[test]
    fn test_rendered_width() {
        for _ in 0..256 {
            let trace = new_trace_id().to_string();
            let span = new_span_id().to_string();
            assert_eq!(trace.len(), 32);
            assert_eq!(span.len(), 16);
            assert!(is_lower_hex(&trace));
            assert!(is_lower_hex(&span));
        }
    }

    #[test]
    fn test_leading_zeros_preserved() {
        let mut bytes = [0u8; 16];
        bytes[15] = 1;
        assert_eq!(
            TraceId::from_bytes(bytes).to_string(),
            "00000000000000000000000000000001"
        );
        assert_eq!(
            SpanId::from_bytes([0, 0, 0, 0, 0, 0, 0, 0x2a]).to_string(),
            "000000000000002a"
        );
    }

    #[test]
    fn test_ids_are_unique() {
        let traces: HashSet<_> = (0..1000).map(|_| new_trace_id()).collect();
        let spans: HashSet<_> = (0..1000).map(|_| new_span_id()).collect();
        assert_eq!(traces.len(), 1000);
        assert_eq!(spans.len(), 1000);
    }

    #[test]
    fn test_parse_lenient() {
        let id = TraceId::parse_lenient("4bf92f3577b34da6a3ce929d0e0e4736").unwrap();
        assert_eq!(id.to_string(), "4bf92f3577b34da6a3ce929d0e0e4736");

        // Uppercase input is normalized on render
        let id = TraceId::parse_lenient("4BF92F3577B34DA6A3CE929D0E0E4736").unwrap();
        assert_eq!(id.to_string(), "4bf92f3577b34da6a3ce929d0e0e4736");

        // Wrong length
        assert!(TraceId::parse_lenient("4bf92f3577b34da6").is_none());
        assert!(TraceId::parse_lenient("").is_none());
        // Wrong alphabet
        assert!(TraceId::parse_lenient("zzf92f3577b34da6a3ce929d0e0e4736").is_none());
        // Multi-byte characters never panic
        assert!(TraceId::parse_lenient("ééééééééééééééééé").is_none());
    }

    #[test]
    fn test_all_zero_trace_id_is_rejected() {
        assert!(TraceId::parse_lenient("00000000000000000000000000000000").is_none());
        assert_eq!(
            "00000000000000000000000000000000".parse::<TraceId>(),
            Err(ParseIdError::TraceId)
        );
        assert!(TraceId::parse_lenient("00000000000000000000000000000001").is_some());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let id = TraceId::parse_lenient("4bf92f3577b34da6a3ce929d0e0e4736").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"4bf92f3577b34da6a3ce929d0e0e4736\"");
        let back: TraceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}

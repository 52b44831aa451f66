//! Request identity and trace context propagated to backends.
//!
//! Uses UUID v7 for time-ordered request ids and W3C `traceparent` for
//! trace context.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Metadata key carrying the request id
pub const REQUEST_ID_KEY: &str = "x-request-id";
/// Metadata key carrying the W3C trace context
pub const TRACEPARENT_KEY: &str = "traceparent";

/// Correlation ID for tracking one inbound request through every hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a new correlation ID (UUID v7)
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }

    /// Reuse the caller's id when it is a valid UUID, otherwise mint one.
    pub fn from_header(value: Option<&str>) -> Self {
        value
            .and_then(|v| Self::parse(v.trim()).ok())
            .unwrap_or_default()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// W3C trace context (`00-<trace_id>-<span_id>-<flags>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub sampled: bool,
}

impl TraceContext {
    /// Start a new trace.
    pub fn new_root() -> Self {
        Self {
            trace_id: non_zero(rand::random()),
            span_id: non_zero(rand::random()),
            sampled: true,
        }
    }

    /// Parse a `traceparent` header value. Returns `None` for anything
    /// malformed, including all-zero ids.
    pub fn parse(header: &str) -> Option<Self> {
        let parts: Vec<&str> = header.trim().split('-').collect();
        if parts.len() != 4 || parts[0].len() != 2 || parts[0] == "ff" {
            return None;
        }

        let mut trace_id = [0u8; 16];
        let mut span_id = [0u8; 8];
        hex::decode_to_slice(parts[1], &mut trace_id).ok()?;
        hex::decode_to_slice(parts[2], &mut span_id).ok()?;
        if trace_id == [0u8; 16] || span_id == [0u8; 8] {
            return None;
        }

        let mut flags = [0u8; 1];
        hex::decode_to_slice(parts[3], &mut flags).ok()?;

        Some(Self {
            trace_id,
            span_id,
            sampled: flags[0] & 0x01 == 0x01,
        })
    }

    /// Continue the caller's trace, or start one.
    pub fn from_header(value: Option<&str>) -> Self {
        value.and_then(Self::parse).unwrap_or_else(Self::new_root)
    }

    /// Same trace, fresh span id: used for each outbound hop.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: non_zero(rand::random()),
            sampled: self.sampled,
        }
    }

    pub fn trace_id_hex(&self) -> String {
        hex::encode(self.trace_id)
    }

    pub fn to_header(&self) -> String {
        format!(
            "00-{}-{}-{:02x}",
            hex::encode(self.trace_id),
            hex::encode(self.span_id),
            u8::from(self.sampled)
        )
    }
}

fn non_zero<const N: usize>(mut bytes: [u8; N]) -> [u8; N] {
    if bytes.iter().all(|b| *b == 0) {
        bytes[N - 1] = 1;
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_correlation_id() {
        let id1 = CorrelationId::new();
        let id2 = CorrelationId::new();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_uuid().get_version_num(), 7);
    }

    #[test]
    fn test_correlation_id_from_header() {
        let id = CorrelationId::new();
        assert_eq!(CorrelationId::from_header(Some(&id.to_string())), id);
        assert_ne!(CorrelationId::from_header(Some("not-a-uuid")), id);
    }

    #[test]
    fn test_traceparent_roundtrip() {
        let header = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";
        let ctx = TraceContext::parse(header).unwrap();
        assert!(ctx.sampled);
        assert_eq!(ctx.trace_id_hex(), "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(ctx.to_header(), header);
    }

    #[test]
    fn test_invalid_traceparent() {
        assert!(TraceContext::parse("invalid").is_none());
        assert!(TraceContext::parse("00-xyz-b7ad6b7169203331-01").is_none());
        assert!(TraceContext::parse(
            "00-00000000000000000000000000000000-b7ad6b7169203331-01"
        )
        .is_none());
    }

    #[test]
    fn test_child_keeps_trace_id() {
        let root = TraceContext::new_root();
        let child = root.child();
        assert_eq!(root.trace_id, child.trace_id);
        assert_eq!(child.to_header().len(), 55);
    }
}

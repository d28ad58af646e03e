//! Intent Model & Id Generator (C1).
//!
//! `Intent` is the immutable description of a trade the strategy layer wants
//! executed. `intent_id` is a pure function of its canonical fields so that
//! two processes handed identical input derive identical ids — the basis for
//! idempotent submission and deterministic replay everywhere downstream.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ctp_mapping::{Offset, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Algo {
    Immediate,
    Twap,
    Vwap,
    Iceberg,
    Pov,
    Adaptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Urgency {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub strategy_id: String,
    /// Opaque hash of the originating trading decision; not interpreted here.
    pub decision_hash: String,
    pub instrument: String,
    pub side: Side,
    pub offset: Offset,
    pub target_qty: u64,
    pub algo: Algo,
    pub urgency: Urgency,
    #[serde(default)]
    pub limit_price: Option<rust_decimal::Decimal>,
    pub signal_ts: i64,
    #[serde(default)]
    pub expiry_ts: Option<i64>,
}

impl Intent {
    /// Deterministic id: a pure function of the canonical field order.
    /// No clocks, no randomness, no locale-sensitive formatting.
    pub fn intent_id(&self) -> String {
        derive_intent_id(
            &self.strategy_id,
            &self.decision_hash,
            &self.instrument,
            self.side,
            self.offset,
            self.target_qty,
            self.algo,
            self.signal_ts,
        )
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expiry_ts, Some(expiry) if now_ms >= expiry)
    }
}

#[allow(clippy::too_many_arguments)]
pub fn derive_intent_id(
    strategy_id: &str,
    decision_hash: &str,
    instrument: &str,
    side: Side,
    offset: Offset,
    target_qty: u64,
    algo: Algo,
    signal_ts: i64,
) -> String {
    let canonical = format!(
        "{}\u{1f}{}\u{1f}{}\u{1f}{:?}\u{1f}{:?}\u{1f}{}\u{1f}{:?}\u{1f}{}",
        strategy_id, decision_hash, instrument, side, offset, target_qty, algo, signal_ts
    );
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

/// `intentId-slice-retry`, parseable back for broker idempotency and event
/// demultiplexing.
pub fn generate_client_order_id(intent_id: &str, slice_index: usize, retry: u32) -> String {
    format!("{}-{}-{}", intent_id, slice_index, retry)
}

pub fn parse_client_order_id(raw: &str) -> Result<(String, usize, u32), crate::error::PipelineError> {
    let mut parts = raw.rsplitn(3, '-');
    let retry = parts.next();
    let slice_index = parts.next();
    let intent_id = parts.next();

    match (intent_id, slice_index, retry) {
        (Some(intent_id), Some(slice_index), Some(retry)) if !intent_id.is_empty() => {
            let slice_index: usize = slice_index.parse().map_err(|_| {
                crate::error::PipelineError::MalformedClientOrderId { raw: raw.to_string() }
            })?;
            let retry: u32 = retry.parse().map_err(|_| {
                crate::error::PipelineError::MalformedClientOrderId { raw: raw.to_string() }
            })?;
            Ok((intent_id.to_string(), slice_index, retry))
        }
        _ => Err(crate::error::PipelineError::MalformedClientOrderId { raw: raw.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_intent() -> Intent {
        Intent {
            strategy_id: "alpha-momentum".into(),
            decision_hash: "deadbeef".into(),
            instrument: "rb2501".into(),
            side: Side::Buy,
            offset: Offset::Open,
            target_qty: 100,
            algo: Algo::Twap,
            urgency: Urgency::Normal,
            limit_price: None,
            signal_ts: 1_700_000_000_000,
            expiry_ts: None,
        }
    }

    #[test]
    fn intent_id_is_deterministic() {
        let a = sample_intent();
        let b = sample_intent();
        assert_eq!(a.intent_id(), b.intent_id());
    }

    #[test]
    fn intent_id_differs_on_any_field_change() {
        let a = sample_intent();
        let mut b = sample_intent();
        b.target_qty = 101;
        assert_ne!(a.intent_id(), b.intent_id());
    }

    #[test]
    fn intent_id_is_128_bits_or_more() {
        let id = sample_intent().intent_id();
        // hex-encoded SHA-256 is 64 chars = 256 bits.
        assert!(id.len() * 4 >= 128);
    }

    #[test]
    fn client_order_id_round_trips() {
        let intent_id = "abc123";
        for (slice, retry) in [(0usize, 0u32), (7, 2), (1000, 42)] {
            let coid = generate_client_order_id(intent_id, slice, retry);
            let (parsed_id, parsed_slice, parsed_retry) = parse_client_order_id(&coid).unwrap();
            assert_eq!(parsed_id, intent_id);
            assert_eq!(parsed_slice, slice);
            assert_eq!(parsed_retry, retry);
        }
    }

    #[test]
    fn malformed_client_order_id_errors() {
        assert!(parse_client_order_id("garbage").is_err());
        assert!(parse_client_order_id("abc-notanumber-0").is_err());
    }

    #[test]
    fn expiry_check() {
        let mut intent = sample_intent();
        intent.expiry_ts = Some(1_700_000_001_000);
        assert!(!intent.is_expired(1_700_000_000_999));
        assert!(intent.is_expired(1_700_000_001_000));
    }
}

//! Circuit-Breaker–Aware Confirmation Wrapper (C7, spec.md §4.8).
//!
//! Generalizes the teacher's `GlobalHalt` (binary, disk-persisted halt flag)
//! into the tri-state `CLOSED / OPEN / HALF_OPEN` breaker the confirmation
//! path needs, while keeping the same "flip a bool, log it, persist it"
//! texture — HALF_OPEN/OPEN transitions are still rare enough that a plain
//! `RwLock<BreakerState>` with a lockfile mirror is the right tool, not a
//! lock-free structure.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditEventType, AuditSink, NoopAuditSink};
use crate::confirmation::{
    ConfirmationContext, ConfirmationDecision, ConfirmationLevel, ConfirmationManager,
    ConfirmationResult, StrategyType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HfExemptionConfig {
    pub enable_exemption: bool,
    pub max_exempt_value: f64,
    /// Empty whitelist means every instrument qualifies.
    pub instrument_whitelist: Vec<String>,
}

impl Default for HfExemptionConfig {
    fn default() -> Self {
        Self {
            enable_exemption: true,
            max_exempt_value: 100_000.0,
            instrument_whitelist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub hf_exemption: HfExemptionConfig,
    /// Whether HALF_OPEN upgrades the selected confirmation level by one tier.
    pub upgrade_on_half_open: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            hf_exemption: HfExemptionConfig::default(),
            upgrade_on_half_open: true,
        }
    }
}

/// Process-wide breaker state, persisted to a lockfile the way the teacher's
/// `GlobalHalt` persists `system.halt` — a crash-recovering operator reads
/// the same file to see whether the breaker tripped.
pub struct GlobalBreaker {
    state: RwLock<BreakerState>,
    file_path: PathBuf,
}

impl GlobalBreaker {
    pub fn new(file_path: PathBuf) -> Self {
        let exists = file_path.exists();
        if exists {
            warn!(path = %file_path.display(), "breaker initialized OPEN (lockfile present)");
        }
        Self {
            state: RwLock::new(if exists { BreakerState::Open } else { BreakerState::Closed }),
            file_path,
        }
    }

    pub fn state(&self) -> BreakerState {
        *self.state.read()
    }

    pub fn trip(&self, reason: &str) {
        let mut state = self.state.write();
        if *state != BreakerState::Open {
            warn!(reason, "circuit breaker OPEN");
        }
        *state = BreakerState::Open;
        if let Err(e) = std::fs::write(&self.file_path, reason) {
            warn!(error = %e, "failed to persist breaker lockfile");
        }
    }

    pub fn half_open(&self) {
        let mut state = self.state.write();
        info!(from = ?*state, "circuit breaker entering HALF_OPEN");
        *state = BreakerState::HalfOpen;
    }

    pub fn close(&self, reason: &str) {
        let mut state = self.state.write();
        info!(reason, "circuit breaker CLOSED");
        *state = BreakerState::Closed;
        if self.file_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.file_path) {
                warn!(error = %e, "failed to remove breaker lockfile");
            }
        }
    }
}

fn upgrade_tier(level: ConfirmationLevel) -> ConfirmationLevel {
    match level {
        ConfirmationLevel::Auto => ConfirmationLevel::Soft,
        ConfirmationLevel::Soft => ConfirmationLevel::Hard,
        ConfirmationLevel::Hard => ConfirmationLevel::Hard,
    }
}

fn is_hf_exempt(cfg: &HfExemptionConfig, ctx: &ConfirmationContext) -> bool {
    cfg.enable_exemption
        && ctx.strategy == StrategyType::HighFrequency
        && ctx.order_value <= cfg.max_exempt_value
        && (cfg.instrument_whitelist.is_empty()
            || cfg.instrument_whitelist.contains(&ctx.intent.instrument))
}

/// Wraps a [`ConfirmationManager`], consulting breaker state before handing
/// off to normal level selection.
pub struct BreakerAwareConfirmation {
    breaker: std::sync::Arc<GlobalBreaker>,
    manager: ConfirmationManager,
    config: BreakerConfig,
    audit: Arc<dyn AuditSink>,
}

impl BreakerAwareConfirmation {
    pub fn new(
        breaker: std::sync::Arc<GlobalBreaker>,
        manager: ConfirmationManager,
        config: BreakerConfig,
    ) -> Self {
        Self {
            breaker,
            manager,
            config,
            audit: Arc::new(NoopAuditSink),
        }
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub async fn confirm(
        &self,
        confirmation_id: &str,
        ctx: ConfirmationContext,
    ) -> ConfirmationDecision {
        let state = self.breaker.state();
        self.audit.emit(
            AuditEvent::new(AuditEventType::CircuitBreakerCheck, ctx.ts, json!({"state": state}))
                .with_client_order_id(confirmation_id),
        );

        match state {
            BreakerState::Open => {
                if is_hf_exempt(&self.config.hf_exemption, &ctx) {
                    info!(confirmation_id, "HF exemption bypasses OPEN breaker");
                    return self.run_and_watch(confirmation_id, ctx).await;
                }
                self.audit.emit(
                    AuditEvent::new(
                        AuditEventType::CircuitBreakerBlocked,
                        ctx.ts,
                        json!({"reason": "breaker OPEN, no HF exemption"}),
                    )
                    .with_client_order_id(confirmation_id),
                );
                ConfirmationDecision {
                    level: ConfirmationLevel::Hard,
                    result: ConfirmationResult::Rejected,
                    reasons: vec!["CIRCUIT_BREAKER_BLOCK".to_string()],
                    checks_passed: Vec::new(),
                    checks_failed: vec!["CIRCUIT_BREAKER_BLOCK".to_string()],
                    elapsed_ms: 0,
                }
            }
            BreakerState::HalfOpen => {
                let mut decision = self.run_and_watch(confirmation_id, ctx).await;
                if self.config.upgrade_on_half_open {
                    decision.level = upgrade_tier(decision.level);
                    decision.reasons.push("HALF_OPEN: confirmation level upgraded".to_string());
                }
                decision
            }
            BreakerState::Closed => self.run_and_watch(confirmation_id, ctx).await,
        }
    }

    async fn run_and_watch(
        &self,
        confirmation_id: &str,
        ctx: ConfirmationContext,
    ) -> ConfirmationDecision {
        let ts = ctx.ts;
        let decision = self.manager.confirm(confirmation_id, ctx).await;
        if decision.level == ConfirmationLevel::Hard
            && matches!(
                decision.result,
                ConfirmationResult::Rejected | ConfirmationResult::Timeout
            )
            && decision.checks_failed.contains(&"M6_CIRCUIT_BREAKER".to_string())
        {
            self.breaker.trip("hard confirmation timed out in day session");
            self.audit.emit(
                AuditEvent::new(
                    AuditEventType::CircuitBreakerTrigger,
                    ts,
                    json!({"reason": "hard confirmation timed out in day session"}),
                )
                .with_client_order_id(confirmation_id),
            );
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::{ConfirmationConfig, MarketCondition, SessionType};
    use crate::ctp_mapping::{Offset, Side};
    use crate::intent::{Algo, Intent, Urgency};

    fn intent(instrument: &str) -> Intent {
        Intent {
            strategy_id: "s".into(),
            decision_hash: "h".into(),
            instrument: instrument.into(),
            side: Side::Buy,
            offset: Offset::Open,
            target_qty: 10,
            algo: Algo::Twap,
            urgency: Urgency::Normal,
            limit_price: None,
            signal_ts: 0,
            expiry_ts: None,
        }
    }

    fn ctx(order_value: f64, strategy: StrategyType, instrument: &str) -> ConfirmationContext {
        ConfirmationContext {
            intent: intent(instrument),
            order_value,
            market: MarketCondition::default(),
            session: SessionType::Day,
            strategy,
            ts: 0,
        }
    }

    fn breaker(dir: &std::path::Path) -> std::sync::Arc<GlobalBreaker> {
        std::sync::Arc::new(GlobalBreaker::new(dir.join("breaker.lock")))
    }

    #[tokio::test]
    async fn open_breaker_blocks_non_exempt_flow() {
        let tmp = tempdir();
        let b = breaker(tmp.path());
        b.trip("test");
        let wrapper = BreakerAwareConfirmation::new(
            b,
            ConfirmationManager::new(ConfirmationConfig::default()),
            BreakerConfig::default(),
        );
        let decision = wrapper
            .confirm("c1", ctx(10_000.0, StrategyType::Production, "rb2501"))
            .await;
        assert_eq!(decision.result, ConfirmationResult::Rejected);
        assert!(decision.checks_failed.contains(&"CIRCUIT_BREAKER_BLOCK".to_string()));
    }

    #[tokio::test]
    async fn hf_exemption_bypasses_open_breaker() {
        let tmp = tempdir();
        let b = breaker(tmp.path());
        b.trip("test");
        let wrapper = BreakerAwareConfirmation::new(
            b,
            ConfirmationManager::new(ConfirmationConfig::default()),
            BreakerConfig::default(),
        );
        let decision = wrapper
            .confirm("c2", ctx(10_000.0, StrategyType::HighFrequency, "rb2501"))
            .await;
        assert_ne!(decision.result, ConfirmationResult::Rejected);
    }

    #[tokio::test]
    async fn half_open_upgrades_tier() {
        let tmp = tempdir();
        let b = breaker(tmp.path());
        b.half_open();
        let wrapper = BreakerAwareConfirmation::new(
            b,
            ConfirmationManager::new(ConfirmationConfig::default()),
            BreakerConfig::default(),
        );
        let decision = wrapper
            .confirm("c3", ctx(10_000.0, StrategyType::HighFrequency, "rb2501"))
            .await;
        // AUTO would be the unupgraded level for HF+small order; HALF_OPEN bumps to SOFT.
        assert_eq!(decision.level, ConfirmationLevel::Soft);
    }

    fn tempdir() -> tempfile_shim::TempDir {
        tempfile_shim::TempDir::new()
    }

    /// Minimal scratch-directory helper so tests don't need a `tempfile` dev
    /// dependency just for a lockfile path.
    mod tempfile_shim {
        use std::sync::atomic::{AtomicU64, Ordering};

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        pub struct TempDir(std::path::PathBuf);
        impl TempDir {
            pub fn new() -> Self {
                let n = COUNTER.fetch_add(1, Ordering::Relaxed);
                let dir = std::env::temp_dir().join(format!(
                    "execution-pipeline-test-{}-{}",
                    std::process::id(),
                    n
                ));
                std::fs::create_dir_all(&dir).unwrap();
                Self(dir)
            }
            pub fn path(&self) -> &std::path::Path {
                &self.0
            }
        }
        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }
}

//! Confirmation Manager (C6): AUTO/SOFT/HARD tiered decision with internal
//! sub-checks and timeout/degradation policy.
//!
//! Grounded on `confirmation.py`'s `determine_confirmation_level` (max-over-
//! dimensions rule), `SoftConfirmation.confirm` (three concurrent sub-checks,
//! each individually timed out and defaulting to pass on timeout), and
//! `HardConfirmation.confirm` (alert + user-confirm + night-session
//! degradation to SOFT / day-session circuit-break on timeout).

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditEventType, AuditSink, NoopAuditSink};
use crate::ctp_mapping::Side;
use crate::intent::Intent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfirmationLevel {
    Auto,
    Soft,
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfirmationResult {
    Approved,
    Rejected,
    Timeout,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionType {
    Day,
    Night,
    Volatile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyType {
    HighFrequency,
    Production,
    Experimental,
}

impl StrategyType {
    fn base_level(self) -> ConfirmationLevel {
        match self {
            Self::HighFrequency => ConfirmationLevel::Auto,
            Self::Production => ConfirmationLevel::Soft,
            Self::Experimental => ConfirmationLevel::Hard,
        }
    }
}

impl SessionType {
    fn base_level(self) -> ConfirmationLevel {
        match self {
            Self::Day => ConfirmationLevel::Auto,
            Self::Night => ConfirmationLevel::Soft,
            Self::Volatile => ConfirmationLevel::Hard,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderValueThresholds {
    pub auto_max: f64,
    pub soft_confirm_max: f64,
}

impl Default for OrderValueThresholds {
    fn default() -> Self {
        Self {
            auto_max: 500_000.0,
            soft_confirm_max: 2_000_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConditionThresholds {
    pub volatility_pct: f64,
    pub price_gap_pct: f64,
    pub limit_hit_count: u32,
}

impl Default for MarketConditionThresholds {
    fn default() -> Self {
        Self {
            volatility_pct: 0.05,
            price_gap_pct: 0.03,
            limit_hit_count: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MarketCondition {
    pub current_volatility_pct: f64,
    pub price_gap_pct: f64,
    pub limit_hit_count: u32,
    pub is_limit_up: bool,
    pub is_limit_down: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    pub order_thresholds: OrderValueThresholds,
    pub market_thresholds: MarketConditionThresholds,
    pub soft_confirm_timeout_seconds: f64,
    pub hard_confirm_timeout_seconds: f64,
    pub enable_night_session_degradation: bool,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            order_thresholds: OrderValueThresholds::default(),
            market_thresholds: MarketConditionThresholds::default(),
            soft_confirm_timeout_seconds: 5.0,
            hard_confirm_timeout_seconds: 30.0,
            enable_night_session_degradation: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfirmationContext {
    pub intent: Intent,
    pub order_value: f64,
    pub market: MarketCondition,
    pub session: SessionType,
    pub strategy: StrategyType,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationDecision {
    pub level: ConfirmationLevel,
    pub result: ConfirmationResult,
    pub reasons: Vec<String>,
    pub checks_passed: Vec<String>,
    pub checks_failed: Vec<String>,
    pub elapsed_ms: i64,
}

/// Max-over-dimensions rule: order value, market stress, session, strategy
/// each propose a level; the final level is the strictest of the four.
pub fn determine_confirmation_level(
    ctx: &ConfirmationContext,
    config: &ConfirmationConfig,
) -> (ConfirmationLevel, Vec<String>) {
    let mut levels: Vec<(ConfirmationLevel, String)> = Vec::new();
    let t = &config.order_thresholds;

    if ctx.order_value < t.auto_max {
        levels.push((
            ConfirmationLevel::Auto,
            format!("order value {:.0} < {:.0}: AUTO", ctx.order_value, t.auto_max),
        ));
    } else if ctx.order_value < t.soft_confirm_max {
        levels.push((
            ConfirmationLevel::Soft,
            format!(
                "order value {:.0} in [{:.0},{:.0}): SOFT",
                ctx.order_value, t.auto_max, t.soft_confirm_max
            ),
        ));
    } else {
        levels.push((
            ConfirmationLevel::Hard,
            format!("order value {:.0} >= {:.0}: HARD", ctx.order_value, t.soft_confirm_max),
        ));
    }

    let mt = &config.market_thresholds;
    let market = ctx.market;
    if market.current_volatility_pct > mt.volatility_pct {
        levels.push((ConfirmationLevel::Soft, "volatility above threshold: SOFT".into()));
    }
    if market.price_gap_pct > mt.price_gap_pct {
        levels.push((ConfirmationLevel::Soft, "price gap above threshold: SOFT".into()));
    }
    if market.limit_hit_count >= mt.limit_hit_count {
        levels.push((ConfirmationLevel::Hard, "consecutive limit moves: HARD".into()));
    }
    if market.is_limit_up || market.is_limit_down {
        levels.push((ConfirmationLevel::Soft, "at limit up/down: SOFT".into()));
    }

    let session_level = ctx.session.base_level();
    if session_level != ConfirmationLevel::Auto {
        levels.push((session_level, format!("session {:?}: {:?}", ctx.session, session_level)));
    }

    let strategy_level = ctx.strategy.base_level();
    levels.push((
        strategy_level,
        format!("strategy {:?}: {:?}", ctx.strategy, strategy_level),
    ));

    let max_level = levels.iter().map(|(l, _)| *l).max().unwrap_or(ConfirmationLevel::Auto);
    let reasons = levels.into_iter().map(|(_, r)| r).collect();
    (max_level, reasons)
}

/// System-side re-checks invoked by SOFT confirmation; default implementations
/// always pass so AUTO-equivalent flows don't need to wire anything up.
#[async_trait]
pub trait SoftCheck: Send + Sync {
    async fn risk_check(&self, ctx: &ConfirmationContext) -> bool;
    async fn cost_check(&self, ctx: &ConfirmationContext) -> bool;
    async fn limit_check(&self, ctx: &ConfirmationContext) -> bool {
        let market = ctx.market;
        if market.is_limit_up && ctx.intent.side == Side::Buy {
            return false;
        }
        if market.is_limit_down && ctx.intent.side == Side::Sell {
            return false;
        }
        true
    }
}

pub struct DefaultSoftCheck;

#[async_trait]
impl SoftCheck for DefaultSoftCheck {
    async fn risk_check(&self, _ctx: &ConfirmationContext) -> bool {
        true
    }
    async fn cost_check(&self, _ctx: &ConfirmationContext) -> bool {
        true
    }
}

/// Human-in-the-loop callback for HARD confirmation.
#[async_trait]
pub trait UserConfirm: Send + Sync {
    async fn confirm(&self, confirmation_id: &str, ctx: &ConfirmationContext) -> bool;
}

/// Never responds in time — the conservative default when no human channel
/// is wired up, so HARD always falls through to its timeout branch.
pub struct NoUserConfirm;

#[async_trait]
impl UserConfirm for NoUserConfirm {
    async fn confirm(&self, _confirmation_id: &str, _ctx: &ConfirmationContext) -> bool {
        std::future::pending::<()>().await;
        false
    }
}

pub struct ConfirmationManager {
    config: ConfirmationConfig,
    soft_check: Box<dyn SoftCheck>,
    user_confirm: Box<dyn UserConfirm>,
    audit: Arc<dyn AuditSink>,
}

impl ConfirmationManager {
    pub fn new(config: ConfirmationConfig) -> Self {
        Self {
            config,
            soft_check: Box::new(DefaultSoftCheck),
            user_confirm: Box::new(NoUserConfirm),
            audit: Arc::new(NoopAuditSink),
        }
    }

    pub fn with_checks(
        config: ConfirmationConfig,
        soft_check: Box<dyn SoftCheck>,
        user_confirm: Box<dyn UserConfirm>,
    ) -> Self {
        Self {
            config,
            soft_check,
            user_confirm,
            audit: Arc::new(NoopAuditSink),
        }
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    fn emit(&self, event_type: AuditEventType, confirmation_id: &str, ts: i64, payload: serde_json::Value) {
        self.audit
            .emit(AuditEvent::new(event_type, ts, payload).with_client_order_id(confirmation_id));
    }

    pub async fn confirm(
        &self,
        confirmation_id: &str,
        ctx: ConfirmationContext,
    ) -> ConfirmationDecision {
        self.emit(
            AuditEventType::ConfirmationStarted,
            confirmation_id,
            ctx.ts,
            json!({"order_value": ctx.order_value, "session": ctx.session, "strategy": ctx.strategy}),
        );

        let (level, mut reasons) = determine_confirmation_level(&ctx, &self.config);
        info!(confirmation_id, ?level, "confirmation level determined");
        self.emit(
            AuditEventType::ConfirmationLevelDetermined,
            confirmation_id,
            ctx.ts,
            json!({"level": level, "reasons": reasons}),
        );

        let decision = match level {
            ConfirmationLevel::Auto => ConfirmationDecision {
                level,
                result: ConfirmationResult::Approved,
                reasons,
                checks_passed: vec!["AUTO".to_string()],
                checks_failed: Vec::new(),
                elapsed_ms: 0,
            },
            ConfirmationLevel::Soft => self.run_soft(confirmation_id, &ctx, level, &mut reasons).await,
            ConfirmationLevel::Hard => self.run_hard(confirmation_id, ctx.clone(), reasons).await,
        };

        self.emit(
            AuditEventType::ConfirmationCompleted,
            confirmation_id,
            decision.elapsed_ms,
            json!({"level": decision.level, "result": decision.result}),
        );
        decision
    }

    /// Three re-checks run concurrently, each bounded to a third of the
    /// overall soft-confirm timeout; a per-check timeout defaults to PASS
    /// rather than blocking the whole decision (matches the Python original's
    /// "超时自动通过" behavior — a deliberately permissive default, recorded
    /// as an accepted Open Question in SPEC_FULL.md §9).
    async fn run_soft(
        &self,
        confirmation_id: &str,
        ctx: &ConfirmationContext,
        level: ConfirmationLevel,
        reasons: &mut Vec<String>,
    ) -> ConfirmationDecision {
        info!(confirmation_id, "soft confirm started");
        let start = ctx.ts;
        let per_check = std::time::Duration::from_secs_f64(self.config.soft_confirm_timeout_seconds / 3.0);

        let (risk_passed, cost_passed, limit_passed) = tokio::join!(
            timeout_default_true(per_check, self.soft_check.risk_check(ctx)),
            timeout_default_true(per_check, self.soft_check.cost_check(ctx)),
            timeout_default_true(per_check, self.soft_check.limit_check(ctx)),
        );

        let mut checks_passed = Vec::new();
        let mut checks_failed = Vec::new();
        for (name, passed) in [
            ("M6_RISK_CHECK", risk_passed),
            ("M5_COST_CHECK", cost_passed),
            ("M13_LIMIT_CHECK", limit_passed),
        ] {
            if passed {
                checks_passed.push(name.to_string());
            } else {
                checks_failed.push(name.to_string());
                reasons.push(format!("{name} failed"));
            }
        }

        let all_passed = risk_passed && cost_passed && limit_passed;
        let result = if all_passed {
            ConfirmationResult::Approved
        } else {
            ConfirmationResult::Rejected
        };
        self.emit(
            AuditEventType::ConfirmationSoft,
            confirmation_id,
            ctx.ts,
            json!({"result": result, "checks_passed": checks_passed, "checks_failed": checks_failed}),
        );
        ConfirmationDecision {
            level,
            result,
            reasons: reasons.clone(),
            checks_passed,
            checks_failed,
            elapsed_ms: ctx.ts - start,
        }
    }

    async fn run_hard(
        &self,
        confirmation_id: &str,
        ctx: ConfirmationContext,
        mut reasons: Vec<String>,
    ) -> ConfirmationDecision {
        self.emit(
            AuditEventType::ConfirmationHard,
            confirmation_id,
            ctx.ts,
            json!({"session": ctx.session}),
        );
        let timeout = std::time::Duration::from_secs_f64(self.config.hard_confirm_timeout_seconds);
        match tokio::time::timeout(timeout, self.user_confirm.confirm(confirmation_id, &ctx)).await {
            Ok(approved) => {
                if approved {
                    reasons.push("user approved".to_string());
                    ConfirmationDecision {
                        level: ConfirmationLevel::Hard,
                        result: ConfirmationResult::Approved,
                        reasons,
                        checks_passed: vec!["M12_USER_CONFIRM".to_string()],
                        checks_failed: Vec::new(),
                        elapsed_ms: 0,
                    }
                } else {
                    reasons.push("user rejected".to_string());
                    ConfirmationDecision {
                        level: ConfirmationLevel::Hard,
                        result: ConfirmationResult::Rejected,
                        reasons,
                        checks_passed: Vec::new(),
                        checks_failed: vec!["M12_USER_CONFIRM".to_string()],
                        elapsed_ms: 0,
                    }
                }
            }
            Err(_) => {
                warn!(confirmation_id, "hard confirm timed out");
                if ctx.session == SessionType::Night && self.config.enable_night_session_degradation {
                    reasons.push(format!(
                        "hard confirm timed out ({}s), night session degrades to SOFT",
                        self.config.hard_confirm_timeout_seconds
                    ));
                    let mut soft_decision = Box::pin(self.run_soft(
                        confirmation_id,
                        &ctx,
                        ConfirmationLevel::Soft,
                        &mut reasons,
                    ))
                    .await;
                    soft_decision.level = ConfirmationLevel::Hard;
                    soft_decision.result = ConfirmationResult::Degraded;
                    self.emit(
                        AuditEventType::ConfirmationDegraded,
                        confirmation_id,
                        ctx.ts,
                        json!({"from": "HARD", "to": "SOFT"}),
                    );
                    soft_decision
                } else {
                    reasons.push(format!(
                        "hard confirm timed out ({}s), day session trips the breaker",
                        self.config.hard_confirm_timeout_seconds
                    ));
                    self.emit(
                        AuditEventType::ConfirmationCircuitBreak,
                        confirmation_id,
                        ctx.ts,
                        json!({"reason": "hard confirm timeout in day session"}),
                    );
                    ConfirmationDecision {
                        level: ConfirmationLevel::Hard,
                        result: ConfirmationResult::Rejected,
                        reasons,
                        checks_passed: Vec::new(),
                        checks_failed: vec!["M6_CIRCUIT_BREAKER".to_string()],
                        elapsed_ms: 0,
                    }
                }
            }
        }
    }
}

async fn timeout_default_true<F: std::future::Future<Output = bool>>(
    duration: std::time::Duration,
    fut: F,
) -> bool {
    tokio::time::timeout(duration, fut).await.unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctp_mapping::Offset;
    use crate::intent::{Algo, Urgency};

    fn intent() -> Intent {
        Intent {
            strategy_id: "s".into(),
            decision_hash: "h".into(),
            instrument: "rb2501".into(),
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

    fn ctx(order_value: f64, session: SessionType) -> ConfirmationContext {
        ConfirmationContext {
            intent: intent(),
            order_value,
            market: MarketCondition::default(),
            session,
            strategy: StrategyType::Production,
            ts: 0,
        }
    }

    #[test]
    fn small_day_order_is_auto() {
        let (level, _) = determine_confirmation_level(&ctx(10_000.0, SessionType::Day), &ConfirmationConfig::default());
        assert_eq!(level, ConfirmationLevel::Soft); // strategy=Production forces SOFT minimum
    }

    #[test]
    fn huge_order_is_hard_regardless_of_session() {
        let (level, _) = determine_confirmation_level(&ctx(9_000_000.0, SessionType::Day), &ConfirmationConfig::default());
        assert_eq!(level, ConfirmationLevel::Hard);
    }

    #[test]
    fn volatile_period_forces_hard() {
        let (level, _) = determine_confirmation_level(&ctx(10_000.0, SessionType::Volatile), &ConfirmationConfig::default());
        assert_eq!(level, ConfirmationLevel::Hard);
    }

    #[tokio::test]
    async fn auto_level_approves_immediately() {
        let mgr = ConfirmationManager::new(ConfirmationConfig::default());
        let mut c = ctx(10_000.0, SessionType::Day);
        c.strategy = StrategyType::HighFrequency;
        let decision = mgr.confirm("c1", c).await;
        assert_eq!(decision.level, ConfirmationLevel::Auto);
        assert_eq!(decision.result, ConfirmationResult::Approved);
    }

    #[tokio::test]
    async fn soft_confirm_approves_with_default_checks() {
        let mgr = ConfirmationManager::new(ConfirmationConfig {
            soft_confirm_timeout_seconds: 0.3,
            ..ConfirmationConfig::default()
        });
        let decision = mgr.confirm("c2", ctx(600_000.0, SessionType::Day)).await;
        assert_eq!(decision.result, ConfirmationResult::Approved);
    }

    #[tokio::test]
    async fn hard_confirm_times_out_and_trips_breaker_in_day_session() {
        let mgr = ConfirmationManager::new(ConfirmationConfig {
            hard_confirm_timeout_seconds: 0.05,
            ..ConfirmationConfig::default()
        });
        let decision = mgr.confirm("c3", ctx(9_000_000.0, SessionType::Day)).await;
        assert_eq!(decision.result, ConfirmationResult::Rejected);
        assert!(decision.checks_failed.contains(&"M6_CIRCUIT_BREAKER".to_string()));
    }

    #[tokio::test]
    async fn hard_confirm_degrades_to_soft_at_night() {
        let mgr = ConfirmationManager::new(ConfirmationConfig {
            hard_confirm_timeout_seconds: 0.05,
            soft_confirm_timeout_seconds: 0.3,
            ..ConfirmationConfig::default()
        });
        let decision = mgr.confirm("c4", ctx(9_000_000.0, SessionType::Night)).await;
        assert_eq!(decision.level, ConfirmationLevel::Hard);
        assert_eq!(decision.result, ConfirmationResult::Degraded);
    }
}

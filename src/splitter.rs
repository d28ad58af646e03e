//! Splitter & Algorithm Selector (C5): classifies order size and market
//! context, scores the four schedulable algos, optionally requires
//! confirmation, and hands back the constructed [`ExecutorHandle`].
//!
//! Grounded on `order_splitter.py`'s `AlgorithmSelector` — the scoring
//! matrices below are transcribed verbatim from its `_score_*_factor`
//! methods, keeping the magic numbers tabulated once rather than scattered
//! through conditionals.

use serde::{Deserialize, Serialize};

use crate::executor::{BehavioralExecutor, ExecutorHandle, IcebergExecutor, TwapExecutor, VwapExecutor};
use crate::intent::{Algo, Intent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SplitAlgorithm {
    Twap,
    Vwap,
    Iceberg,
    Behavioral,
}

impl SplitAlgorithm {
    const ALL: [SplitAlgorithm; 4] = [
        SplitAlgorithm::Twap,
        SplitAlgorithm::Vwap,
        SplitAlgorithm::Iceberg,
        SplitAlgorithm::Behavioral,
    ];

    /// Tie-break order when scores are equal (spec.md §4.6.3).
    fn tie_rank(self) -> u8 {
        match self {
            Self::Twap => 0,
            Self::Vwap => 1,
            Self::Iceberg => 2,
            Self::Behavioral => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSizeCategory {
    Small,
    Medium,
    Large,
    Huge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LiquidityLevel {
    High,
    Normal,
    Low,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    Opening,
    Morning,
    Afternoon,
    Closing,
    NightActive,
    NightQuiet,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarketContext {
    pub liquidity_level: LiquidityLevel,
    pub session_phase: SessionPhase,
    pub volatility_pct: f64,
    pub avg_volume: u64,
    pub is_limit_up: bool,
    pub is_limit_down: bool,
}

impl Default for MarketContext {
    fn default() -> Self {
        Self {
            liquidity_level: LiquidityLevel::Normal,
            session_phase: SessionPhase::Morning,
            volatility_pct: 0.0,
            avg_volume: 0,
            is_limit_up: false,
            is_limit_down: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderValueThresholds {
    pub small: f64,
    pub medium: f64,
    pub large: f64,
}

impl Default for OrderValueThresholds {
    fn default() -> Self {
        Self {
            small: 500_000.0,
            medium: 2_000_000.0,
            large: 5_000_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitterConfig {
    pub order_value_thresholds: OrderValueThresholds,
    pub enable_confirmation: bool,
    pub confirmation_threshold: f64,
    pub twap: crate::executor::TwapConfig,
    pub vwap: crate::executor::VwapConfig,
    pub iceberg: crate::executor::IcebergConfig,
    pub behavioral: crate::executor::BehavioralConfig,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            order_value_thresholds: OrderValueThresholds::default(),
            enable_confirmation: true,
            confirmation_threshold: 500_000.0,
            twap: Default::default(),
            vwap: Default::default(),
            iceberg: Default::default(),
            behavioral: Default::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlgorithmScore {
    pub algorithm: SplitAlgorithm,
    pub score: f64,
    pub reasons: Vec<String>,
}

/// Decides which of the four schedulable algorithms (spec.md §4.6.3 excludes
/// IMMEDIATE — that path is chosen earlier, by urgency, in the engine) best
/// fits an order.
pub struct AlgorithmSelector {
    config_thresholds: OrderValueThresholds,
}

impl AlgorithmSelector {
    pub fn new(thresholds: OrderValueThresholds) -> Self {
        Self {
            config_thresholds: thresholds,
        }
    }

    pub fn classify_order_size(&self, order_value: f64) -> OrderSizeCategory {
        let t = &self.config_thresholds;
        if order_value < t.small {
            OrderSizeCategory::Small
        } else if order_value < t.medium {
            OrderSizeCategory::Medium
        } else if order_value < t.large {
            OrderSizeCategory::Large
        } else {
            OrderSizeCategory::Huge
        }
    }

    pub fn select_algorithm(
        &self,
        intent: &Intent,
        order_value: f64,
        market: MarketContext,
    ) -> (SplitAlgorithm, Vec<String>) {
        if market.is_limit_up || market.is_limit_down {
            return (
                SplitAlgorithm::Twap,
                vec!["extreme market (limit up/down): fast TWAP".to_string()],
            );
        }

        match intent.algo {
            Algo::Twap => return (SplitAlgorithm::Twap, vec!["intent specifies TWAP".into()]),
            Algo::Vwap => return (SplitAlgorithm::Vwap, vec!["intent specifies VWAP".into()]),
            Algo::Iceberg => {
                return (SplitAlgorithm::Iceberg, vec!["intent specifies ICEBERG".into()])
            }
            _ => {}
        }

        let size_category = self.classify_order_size(order_value);
        let scores = self.score_algorithms(size_category, market);
        let best = scores
            .into_iter()
            .max_by(|a, b| {
                a.score
                    .partial_cmp(&b.score)
                    .unwrap()
                    .then(b.algorithm.tie_rank().cmp(&a.algorithm.tie_rank()))
            })
            .expect("ALL is non-empty");

        let mut reasons = best.reasons;
        reasons.push(format!("composite score: {:.2}", best.score));
        (best.algorithm, reasons)
    }

    fn score_algorithms(
        &self,
        size: OrderSizeCategory,
        market: MarketContext,
    ) -> Vec<AlgorithmScore> {
        SplitAlgorithm::ALL
            .iter()
            .map(|&algo| self.score_algorithm(algo, size, market))
            .collect()
    }

    fn score_algorithm(
        &self,
        algo: SplitAlgorithm,
        size: OrderSizeCategory,
        market: MarketContext,
    ) -> AlgorithmScore {
        let mut reasons = Vec::new();

        let size_score = score_size_factor(algo, size);
        if size_score > 0.7 {
            reasons.push(format!("size fit ({size:?}): {size_score:.2}"));
        }
        let liquidity_score = score_liquidity_factor(algo, market.liquidity_level);
        if liquidity_score > 0.7 {
            reasons.push(format!("liquidity fit: {liquidity_score:.2}"));
        }
        let session_score = score_session_factor(algo, market.session_phase);
        if session_score > 0.7 {
            reasons.push(format!("session fit: {session_score:.2}"));
        }
        let stealth_score = stealth_weight(algo);
        let volatility_score = score_volatility_factor(algo, market.volatility_pct);

        let score = (size_score * 0.30
            + liquidity_score * 0.25
            + session_score * 0.15
            + stealth_score * 0.15
            + volatility_score * 0.15)
            * 100.0;

        AlgorithmScore {
            algorithm: algo,
            score,
            reasons,
        }
    }
}

fn stealth_weight(algo: SplitAlgorithm) -> f64 {
    match algo {
        SplitAlgorithm::Twap => 0.4,
        SplitAlgorithm::Vwap => 0.5,
        SplitAlgorithm::Iceberg => 0.9,
        SplitAlgorithm::Behavioral => 1.0,
    }
}

fn score_size_factor(algo: SplitAlgorithm, size: OrderSizeCategory) -> f64 {
    use OrderSizeCategory::*;
    use SplitAlgorithm::*;
    match (size, algo) {
        (Small, Twap) => 0.9,
        (Small, Vwap) => 0.6,
        (Small, Iceberg) => 0.4,
        (Small, Behavioral) => 0.3,
        (Medium, Twap) => 0.7,
        (Medium, Vwap) => 0.9,
        (Medium, Iceberg) => 0.7,
        (Medium, Behavioral) => 0.5,
        (Large, Twap) => 0.5,
        (Large, Vwap) => 0.7,
        (Large, Iceberg) => 0.9,
        (Large, Behavioral) => 0.8,
        (Huge, Twap) => 0.3,
        (Huge, Vwap) => 0.5,
        (Huge, Iceberg) => 0.7,
        (Huge, Behavioral) => 1.0,
    }
}

fn score_liquidity_factor(algo: SplitAlgorithm, liquidity: LiquidityLevel) -> f64 {
    use LiquidityLevel::*;
    use SplitAlgorithm::*;
    match (liquidity, algo) {
        (High, Twap) => 0.9,
        (High, Vwap) => 1.0,
        (High, Iceberg) => 0.7,
        (High, Behavioral) => 0.6,
        (Normal, Twap) => 0.8,
        (Normal, Vwap) => 0.8,
        (Normal, Iceberg) => 0.8,
        (Normal, Behavioral) => 0.7,
        (Low, Twap) => 0.6,
        (Low, Vwap) => 0.5,
        (Low, Iceberg) => 0.9,
        (Low, Behavioral) => 0.8,
        (Critical, Twap) => 0.7,
        (Critical, Vwap) => 0.3,
        (Critical, Iceberg) => 0.6,
        (Critical, Behavioral) => 0.9,
    }
}

fn score_session_factor(algo: SplitAlgorithm, session: SessionPhase) -> f64 {
    use SessionPhase::*;
    use SplitAlgorithm::*;
    match (session, algo) {
        (Opening, Twap) => 0.6,
        (Opening, Vwap) => 0.9,
        (Opening, Iceberg) => 0.5,
        (Opening, Behavioral) => 0.4,
        (Morning, Twap) => 0.8,
        (Morning, Vwap) => 0.9,
        (Morning, Iceberg) => 0.8,
        (Morning, Behavioral) => 0.7,
        (Afternoon, Twap) => 0.8,
        (Afternoon, Vwap) => 0.8,
        (Afternoon, Iceberg) => 0.8,
        (Afternoon, Behavioral) => 0.7,
        (Closing, Twap) => 0.9,
        (Closing, Vwap) => 0.6,
        (Closing, Iceberg) => 0.5,
        (Closing, Behavioral) => 0.4,
        (NightActive, Twap) => 0.7,
        (NightActive, Vwap) => 0.7,
        (NightActive, Iceberg) => 0.8,
        (NightActive, Behavioral) => 0.8,
        (NightQuiet, Twap) => 0.6,
        (NightQuiet, Vwap) => 0.5,
        (NightQuiet, Iceberg) => 0.9,
        (NightQuiet, Behavioral) => 0.9,
    }
}

fn score_volatility_factor(algo: SplitAlgorithm, volatility_pct: f64) -> f64 {
    use SplitAlgorithm::*;
    if volatility_pct > 0.05 {
        match algo {
            Twap => 0.9,
            Vwap => 0.5,
            Iceberg => 0.4,
            Behavioral => 0.3,
        }
    } else if volatility_pct > 0.02 {
        match algo {
            Twap => 0.7,
            Vwap => 0.7,
            Iceberg => 0.6,
            Behavioral => 0.5,
        }
    } else {
        match algo {
            Twap => 0.6,
            Vwap => 0.8,
            Iceberg => 0.8,
            Behavioral => 0.8,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SplitterError {
    #[error("confirmation rejected for plan {plan_id} (order value {order_value})")]
    ConfirmationRejected { plan_id: String, order_value: f64 },
}

#[derive(Debug)]
pub struct SplitPlan {
    pub plan_id: String,
    pub algorithm: SplitAlgorithm,
    pub executor: ExecutorHandle,
    pub order_value: f64,
    pub size_category: OrderSizeCategory,
    pub requires_confirmation: bool,
    pub created_ts: i64,
}

/// `confirmation_callback` mirrors `order_splitter.py`'s async callback but
/// is synchronous here: by the time the splitter runs, C6/C7 have already
/// resolved the confirmation decision (see engine.rs), so this is a plain
/// accept/reject gate rather than an awaited prompt.
pub struct OrderSplitter {
    config: SplitterConfig,
    selector: AlgorithmSelector,
}

impl OrderSplitter {
    pub fn new(config: SplitterConfig) -> Self {
        let selector = AlgorithmSelector::new(config.order_value_thresholds.clone());
        Self { config, selector }
    }

    pub fn estimate_order_value(&self, intent: &Intent, reference_price: Option<f64>) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        let price = reference_price
            .or_else(|| intent.limit_price.and_then(|p| p.to_f64()))
            .unwrap_or(0.0);
        price * intent.target_qty as f64
    }

    fn create_executor(&self, algorithm: SplitAlgorithm) -> ExecutorHandle {
        match algorithm {
            SplitAlgorithm::Twap => ExecutorHandle::Twap(TwapExecutor::new(self.config.twap.clone())),
            SplitAlgorithm::Vwap => ExecutorHandle::Vwap(VwapExecutor::new(self.config.vwap.clone())),
            SplitAlgorithm::Iceberg => {
                ExecutorHandle::Iceberg(IcebergExecutor::new(self.config.iceberg.clone()))
            }
            SplitAlgorithm::Behavioral => {
                ExecutorHandle::Behavioral(BehavioralExecutor::new(self.config.behavioral.clone()))
            }
        }
    }

    /// Idempotent: a previously confirmed plan for this intent is never
    /// rebuilt or re-confirmed.
    pub fn create_split_plan(
        &self,
        intent: Intent,
        market: MarketContext,
        reference_price: Option<f64>,
        confirmed: bool,
        now_ms: i64,
    ) -> Result<SplitPlan, SplitterError> {
        let plan_id = intent.intent_id();
        let order_value = self.estimate_order_value(&intent, reference_price);
        let size_category = self.selector.classify_order_size(order_value);

        let requires_confirmation =
            self.config.enable_confirmation && order_value >= self.config.confirmation_threshold;

        if requires_confirmation && !confirmed {
            return Err(SplitterError::ConfirmationRejected {
                plan_id,
                order_value,
            });
        }

        let (algorithm, _reasons) = self.selector.select_algorithm(&intent, order_value, market);
        let executor = self.create_executor(algorithm);
        executor_make_plan(&executor, intent, now_ms);

        Ok(SplitPlan {
            plan_id,
            algorithm,
            executor,
            order_value,
            size_category,
            requires_confirmation,
            created_ts: now_ms,
        })
    }
}

fn executor_make_plan(executor: &ExecutorHandle, intent: Intent, now_ms: i64) -> String {
    use crate::executor::Executor;
    executor.make_plan(intent, now_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctp_mapping::{Offset, Side};
    use crate::intent::{Algo, Urgency};

    fn intent(algo: Algo, target_qty: u64) -> Intent {
        Intent {
            strategy_id: "s".into(),
            decision_hash: "h".into(),
            instrument: "rb2501".into(),
            side: Side::Buy,
            offset: Offset::Open,
            target_qty,
            algo,
            urgency: Urgency::Normal,
            limit_price: Some(rust_decimal::Decimal::from(4000)),
            signal_ts: 0,
            expiry_ts: None,
        }
    }

    #[test]
    fn small_order_value_classified_small() {
        let selector = AlgorithmSelector::new(OrderValueThresholds::default());
        assert_eq!(selector.classify_order_size(100_000.0), OrderSizeCategory::Small);
        assert_eq!(selector.classify_order_size(600_000.0), OrderSizeCategory::Medium);
        assert_eq!(selector.classify_order_size(3_000_000.0), OrderSizeCategory::Large);
        assert_eq!(selector.classify_order_size(9_000_000.0), OrderSizeCategory::Huge);
    }

    #[test]
    fn explicit_algo_always_honored() {
        let selector = AlgorithmSelector::new(OrderValueThresholds::default());
        let intent = intent(Algo::Vwap, 10);
        let (algo, _) = selector.select_algorithm(&intent, 10_000.0, MarketContext::default());
        assert_eq!(algo, SplitAlgorithm::Vwap);
    }

    #[test]
    fn limit_move_forces_twap_even_with_vwap_intent() {
        let selector = AlgorithmSelector::new(OrderValueThresholds::default());
        let intent = intent(Algo::Vwap, 10);
        let mut market = MarketContext::default();
        market.is_limit_up = true;
        let (algo, _) = selector.select_algorithm(&intent, 10_000.0, market);
        assert_eq!(algo, SplitAlgorithm::Twap);
    }

    #[test]
    fn huge_adaptive_order_scores_toward_behavioral() {
        let selector = AlgorithmSelector::new(OrderValueThresholds::default());
        let intent = intent(Algo::Adaptive, 100_000);
        let (algo, _) = selector.select_algorithm(&intent, 9_000_000.0, MarketContext::default());
        assert_eq!(algo, SplitAlgorithm::Behavioral);
    }

    #[test]
    fn confirmation_rejected_below_threshold_fails_split() {
        let splitter = OrderSplitter::new(SplitterConfig::default());
        let intent = intent(Algo::Twap, 1000);
        let err = splitter
            .create_split_plan(intent, MarketContext::default(), Some(1000.0), false, 0)
            .unwrap_err();
        assert!(matches!(err, SplitterError::ConfirmationRejected { .. }));
    }

    #[test]
    fn split_plan_is_idempotent_by_construction() {
        let splitter = OrderSplitter::new(SplitterConfig::default());
        let intent = intent(Algo::Twap, 10);
        let plan = splitter
            .create_split_plan(intent.clone(), MarketContext::default(), Some(10.0), true, 0)
            .unwrap();
        assert_eq!(plan.plan_id, intent.intent_id());
    }
}

//! Adaptive VaR Scheduler (C8, spec.md §4.9).
//!
//! Grounded on `original_source/V4PRO/src/risk/adaptive_var.py`'s
//! `AdaptiveVaRScheduler`: market regime decides update cadence and
//! calculation method, event triggers force immediate recomputation, and a
//! rolling CPU-time estimate throttles the next cycle when it gets too
//! expensive relative to its own interval.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketRegime {
    Calm,
    Normal,
    Volatile,
    Extreme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarMethod {
    Parametric,
    Historical,
    MonteCarlo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VarEventType {
    PositionChange,
    PriceGap3Pct,
    MarginWarning,
    LimitPriceHit,
}

impl MarketRegime {
    pub fn update_interval_ms(self) -> u64 {
        match self {
            Self::Calm => 5000,
            Self::Normal => 1000,
            Self::Volatile => 500,
            Self::Extreme => 200,
        }
    }

    pub fn calculation_method(self) -> VarMethod {
        match self {
            Self::Calm => VarMethod::Parametric,
            Self::Normal | Self::Volatile => VarMethod::Historical,
            Self::Extreme => VarMethod::MonteCarlo,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveVarConfig {
    pub base_interval_ms: u64,
    pub cpu_limit_pct: f64,
    pub min_interval_ms: u64,
    pub max_cpu_samples: usize,
    pub max_calc_time_samples: usize,
}

impl Default for AdaptiveVarConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 1000,
            cpu_limit_pct: 10.0,
            min_interval_ms: 100,
            max_cpu_samples: 100,
            max_calc_time_samples: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VarResult {
    pub var: f64,
    pub method: VarMethod,
    pub confidence: f64,
}

/// Minimal parametric/historical/Monte-Carlo VaR estimator. The original's
/// precision is a calibration detail the scheduling contract does not
/// depend on; this keeps the three methods distinct and deterministic.
fn calculate_var(returns: &[f64], method: VarMethod, confidence: f64, seed: u64) -> VarResult {
    if returns.is_empty() {
        return VarResult { var: 0.0, method, confidence };
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n.max(1.0);
    let stddev = variance.sqrt();

    let var = match method {
        VarMethod::Parametric => {
            let z = z_score(confidence);
            -(mean - z * stddev)
        }
        VarMethod::Historical => {
            let mut sorted: Vec<f64> = returns.to_vec();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let idx = (((1.0 - confidence) * n).floor() as usize).min(sorted.len() - 1);
            -sorted[idx]
        }
        VarMethod::MonteCarlo => {
            use rand::rngs::StdRng;
            use rand::{Rng, SeedableRng};
            let mut rng = StdRng::seed_from_u64(seed);
            let mut samples: Vec<f64> = (0..2000)
                .map(|_| mean + stddev * rng.gen_range(-3.0..3.0) / 3.0)
                .collect();
            samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let idx = (((1.0 - confidence) * samples.len() as f64).floor() as usize)
                .min(samples.len() - 1);
            -samples[idx]
        }
    };

    VarResult { var: var.max(0.0), method, confidence }
}

fn z_score(confidence: f64) -> f64 {
    if confidence >= 0.99 {
        2.326
    } else if confidence >= 0.975 {
        1.96
    } else if confidence >= 0.95 {
        1.645
    } else {
        1.282
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    current_regime: MarketRegime,
    last_calculation: Option<Instant>,
    calculation_count: u64,
    event_trigger_count: u64,
    skipped_calculations: u64,
    cpu_usage_samples: VecDeque<f64>,
    calc_times_ms: VecDeque<f64>,
    last_result: Option<VarResult>,
}

impl Default for MarketRegime {
    fn default() -> Self {
        Self::Normal
    }
}

pub struct AdaptiveVarScheduler {
    config: AdaptiveVarConfig,
    confidence: f64,
    state: Mutex<SchedulerState>,
}

impl AdaptiveVarScheduler {
    pub fn new(config: AdaptiveVarConfig, confidence: f64) -> Self {
        Self {
            config,
            confidence,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    pub fn current_regime(&self) -> MarketRegime {
        self.state.lock().current_regime
    }

    pub fn last_result(&self) -> Option<VarResult> {
        self.state.lock().last_result
    }

    /// Moving from CALM directly into VOLATILE/EXTREME forces an immediate
    /// recompute on the next `calculate_if_needed` call.
    pub fn update_market_regime(&self, regime: MarketRegime) {
        let mut state = self.state.lock();
        let old = state.current_regime;
        state.current_regime = regime;
        if old == MarketRegime::Calm && matches!(regime, MarketRegime::Volatile | MarketRegime::Extreme) {
            state.last_calculation = None;
        }
    }

    pub fn detect_market_regime(returns: &[f64]) -> MarketRegime {
        if returns.len() < 5 {
            return MarketRegime::Normal;
        }
        let recent = &returns[returns.len().saturating_sub(20)..];
        let n = recent.len() as f64;
        if n < 2.0 {
            return MarketRegime::Normal;
        }
        let mean = recent.iter().sum::<f64>() / n;
        let variance = recent.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let volatility = variance.sqrt();
        let annual_vol = volatility * 252f64.sqrt();
        let max_abs_return = recent.iter().map(|r| r.abs()).fold(0.0, f64::max);

        if max_abs_return >= 0.05 || annual_vol >= 0.50 {
            MarketRegime::Extreme
        } else if annual_vol >= 0.30 {
            MarketRegime::Volatile
        } else if annual_vol >= 0.15 {
            MarketRegime::Normal
        } else {
            MarketRegime::Calm
        }
    }

    pub fn update_interval_ms(&self) -> u64 {
        self.state.lock().current_regime.update_interval_ms()
    }

    pub fn calculation_method(&self) -> VarMethod {
        self.state.lock().current_regime.calculation_method()
    }

    fn avg_cpu_usage(state: &SchedulerState) -> f64 {
        if state.cpu_usage_samples.is_empty() {
            0.0
        } else {
            state.cpu_usage_samples.iter().sum::<f64>() / state.cpu_usage_samples.len() as f64
        }
    }

    pub fn should_calculate(&self) -> bool {
        let mut state = self.state.lock();
        let interval = state.current_regime.update_interval_ms();
        let elapsed = state
            .last_calculation
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(u64::MAX);
        if elapsed < interval {
            return false;
        }
        if Self::avg_cpu_usage(&state) >= self.config.cpu_limit_pct {
            state.skipped_calculations += 1;
            return false;
        }
        true
    }

    /// Event triggers bypass the cadence check entirely; margin and limit
    /// events force Monte Carlo regardless of current regime.
    pub fn trigger_event(&self, event: VarEventType, returns: &[f64], seed: u64) -> VarResult {
        let force_method = matches!(
            event,
            VarEventType::MarginWarning | VarEventType::LimitPriceHit
        )
        .then_some(VarMethod::MonteCarlo);
        let mut state = self.state.lock();
        state.event_trigger_count += 1;
        self.perform_calculation(&mut state, returns, force_method, seed)
    }

    pub fn calculate_if_needed(&self, returns: &[f64], seed: u64) -> Option<VarResult> {
        if !self.should_calculate() {
            return self.state.lock().last_result;
        }
        let mut state = self.state.lock();
        let detected = Self::detect_market_regime(returns);
        if detected != state.current_regime {
            state.current_regime = detected;
        }
        Some(self.perform_calculation(&mut state, returns, None, seed))
    }

    pub fn force_calculate(&self, returns: &[f64], method: Option<VarMethod>, seed: u64) -> VarResult {
        let mut state = self.state.lock();
        self.perform_calculation(&mut state, returns, method, seed)
    }

    fn perform_calculation(
        &self,
        state: &mut SchedulerState,
        returns: &[f64],
        method: Option<VarMethod>,
        seed: u64,
    ) -> VarResult {
        let start = Instant::now();
        let calc_method = method.unwrap_or_else(|| state.current_regime.calculation_method());
        let result = calculate_var(returns, calc_method, self.confidence, seed);

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        state.calc_times_ms.push_back(elapsed_ms);
        if state.calc_times_ms.len() > self.config.max_calc_time_samples {
            state.calc_times_ms.pop_front();
        }

        state.last_calculation = Some(Instant::now());
        state.calculation_count += 1;
        state.last_result = Some(result);

        let interval = state.current_regime.update_interval_ms().max(1) as f64;
        let cpu_estimate = (elapsed_ms / interval * 100.0).min(100.0);
        state.cpu_usage_samples.push_back(cpu_estimate);
        if state.cpu_usage_samples.len() > self.config.max_cpu_samples {
            state.cpu_usage_samples.pop_front();
        }

        result
    }

    pub fn calculation_count(&self) -> u64 {
        self.state.lock().calculation_count
    }

    pub fn event_trigger_count(&self) -> u64 {
        self.state.lock().event_trigger_count
    }

    pub fn skipped_calculations(&self) -> u64 {
        self.state.lock().skipped_calculations
    }

    pub fn reset(&self) {
        *self.state.lock() = SchedulerState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cadence_by_regime_matches_spec_table() {
        assert_eq!(MarketRegime::Calm.update_interval_ms(), 5000);
        assert_eq!(MarketRegime::Normal.update_interval_ms(), 1000);
        assert_eq!(MarketRegime::Volatile.update_interval_ms(), 500);
        assert_eq!(MarketRegime::Extreme.update_interval_ms(), 200);
        assert_eq!(MarketRegime::Calm.calculation_method(), VarMethod::Parametric);
        assert_eq!(MarketRegime::Extreme.calculation_method(), VarMethod::MonteCarlo);
    }

    #[test]
    fn detects_extreme_regime_from_large_return() {
        let returns = vec![0.0, 0.01, -0.01, 0.0, 0.08, 0.0];
        assert_eq!(AdaptiveVarScheduler::detect_market_regime(&returns), MarketRegime::Extreme);
    }

    #[test]
    fn event_trigger_forces_monte_carlo_for_margin_warning() {
        let scheduler = AdaptiveVarScheduler::new(AdaptiveVarConfig::default(), 0.95);
        let returns = vec![0.01, -0.02, 0.015, -0.01, 0.02, -0.015];
        let result = scheduler.trigger_event(VarEventType::MarginWarning, &returns, 1);
        assert_eq!(result.method, VarMethod::MonteCarlo);
        assert_eq!(scheduler.event_trigger_count(), 1);
    }

    #[test]
    fn calm_to_volatile_forces_immediate_recompute() {
        let scheduler = AdaptiveVarScheduler::new(AdaptiveVarConfig::default(), 0.95);
        scheduler.update_market_regime(MarketRegime::Calm);
        scheduler.force_calculate(&[0.01, -0.01, 0.02], None, 1);
        scheduler.update_market_regime(MarketRegime::Volatile);
        assert!(scheduler.should_calculate());
    }

    #[test]
    fn cpu_throttle_skips_once_cap_exceeded() {
        let mut config = AdaptiveVarConfig::default();
        config.cpu_limit_pct = 0.0;
        let scheduler = AdaptiveVarScheduler::new(config, 0.95);
        scheduler.force_calculate(&[0.01, 0.02, -0.01], None, 1);
        assert!(!scheduler.should_calculate());
        assert_eq!(scheduler.skipped_calculations(), 1);
    }
}

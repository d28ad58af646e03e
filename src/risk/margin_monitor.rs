//! Dynamic Margin Monitor (C8, spec.md §4.9).
//!
//! Grounded on `original_source/V4PRO/src/risk/margin_monitor.py`'s
//! `DynamicMarginMonitor`: five-tier alert ladder over usage ratio, margin
//! call alerts on upward transitions, optional VaR-scheduler integration,
//! and force-close risk estimation from recent trend.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::adaptive_var::{AdaptiveVarScheduler, VarEventType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarginAlertLevel {
    Safe,
    Warning,
    Danger,
    Critical,
    ForceClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarginRiskAction {
    None,
    Monitor,
    ReducePosition,
    MarginCall,
    ForceLiquidate,
}

impl MarginAlertLevel {
    pub fn risk_action(self) -> MarginRiskAction {
        match self {
            Self::Safe => MarginRiskAction::None,
            Self::Warning => MarginRiskAction::Monitor,
            Self::Danger => MarginRiskAction::ReducePosition,
            Self::Critical => MarginRiskAction::MarginCall,
            Self::ForceClose => MarginRiskAction::ForceLiquidate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarginCallReason {
    HighUsage,
    PriceVolatility,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginMonitorConfig {
    pub safe_threshold: f64,
    pub warning_threshold: f64,
    pub danger_threshold: f64,
    pub critical_threshold: f64,
    pub force_close_threshold: f64,
    pub margin_call_buffer: f64,
    pub history_size: usize,
    pub var_trigger_threshold: f64,
}

impl Default for MarginMonitorConfig {
    fn default() -> Self {
        Self {
            safe_threshold: 0.70,
            warning_threshold: 0.80,
            danger_threshold: 0.90,
            critical_threshold: 0.95,
            force_close_threshold: 1.00,
            margin_call_buffer: 0.05,
            history_size: 1000,
            var_trigger_threshold: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MarginSnapshot {
    pub ts: Instant,
    pub equity: f64,
    pub margin_used: f64,
    pub margin_frozen: f64,
    pub margin_available: f64,
    pub usage_ratio: f64,
    pub alert_level: MarginAlertLevel,
    pub risk_action: MarginRiskAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginCallAlert {
    pub alert_level: MarginAlertLevel,
    pub previous_level: MarginAlertLevel,
    pub usage_ratio: f64,
    pub required_margin: f64,
    pub reason: MarginCallReason,
    pub message: String,
    pub urgency_score: f64,
}

impl MarginCallAlert {
    fn urgency_for(level: MarginAlertLevel) -> f64 {
        match level {
            MarginAlertLevel::Safe => 0.0,
            MarginAlertLevel::Warning => 0.3,
            MarginAlertLevel::Danger => 0.6,
            MarginAlertLevel::Critical => 0.85,
            MarginAlertLevel::ForceClose => 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceCloseRisk {
    pub risk_score: f64,
    pub probability: f64,
    pub time_to_force_close_hours: Option<f64>,
    pub suggested_reduce_ratio: f64,
    pub escape_actions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginUpdateResult {
    pub alert_level: MarginAlertLevel,
    pub previous_level: MarginAlertLevel,
    pub usage_ratio: f64,
    pub level_changed: bool,
    pub alert_generated: bool,
    pub var_trigger_needed: bool,
    pub force_close_risk: Option<ForceCloseRisk>,
}

struct MonitorState {
    equity: f64,
    margin_used: f64,
    margin_frozen: f64,
    margin_available: f64,
    usage_ratio: f64,
    previous_usage_ratio: f64,
    alert_level: MarginAlertLevel,
    previous_level: MarginAlertLevel,
    snapshots: VecDeque<MarginSnapshot>,
    alerts: VecDeque<MarginCallAlert>,
    update_count: u64,
    alert_count: u64,
    force_close_warning_count: u64,
}

impl MonitorState {
    fn new() -> Self {
        Self {
            equity: 0.0,
            margin_used: 0.0,
            margin_frozen: 0.0,
            margin_available: 0.0,
            usage_ratio: 0.0,
            previous_usage_ratio: 0.0,
            alert_level: MarginAlertLevel::Safe,
            previous_level: MarginAlertLevel::Safe,
            snapshots: VecDeque::new(),
            alerts: VecDeque::new(),
            update_count: 0,
            alert_count: 0,
            force_close_warning_count: 0,
        }
    }
}

pub struct DynamicMarginMonitor {
    config: MarginMonitorConfig,
    var_scheduler: Option<std::sync::Arc<AdaptiveVarScheduler>>,
    state: Mutex<MonitorState>,
}

impl DynamicMarginMonitor {
    pub fn new(config: MarginMonitorConfig) -> Self {
        Self {
            config,
            var_scheduler: None,
            state: Mutex::new(MonitorState::new()),
        }
    }

    pub fn with_var_scheduler(mut self, scheduler: std::sync::Arc<AdaptiveVarScheduler>) -> Self {
        self.var_scheduler = Some(scheduler);
        self
    }

    fn alert_level_for(config: &MarginMonitorConfig, usage_ratio: f64) -> MarginAlertLevel {
        if usage_ratio < config.safe_threshold {
            MarginAlertLevel::Safe
        } else if usage_ratio < config.warning_threshold {
            MarginAlertLevel::Warning
        } else if usage_ratio < config.danger_threshold {
            MarginAlertLevel::Danger
        } else if usage_ratio < config.critical_threshold {
            MarginAlertLevel::Critical
        } else {
            MarginAlertLevel::ForceClose
        }
    }

    fn required_margin(config: &MarginMonitorConfig, usage_ratio: f64, total_margin: f64, equity: f64) -> f64 {
        if usage_ratio <= config.safe_threshold {
            return 0.0;
        }
        let target_ratio = (config.safe_threshold - config.margin_call_buffer).max(0.1);
        let target_equity = total_margin / target_ratio;
        (target_equity - equity).max(0.0)
    }

    /// Updates the snapshot, returns an [`MarginUpdateResult`] describing
    /// whether this crossing warrants a margin call or a VaR re-trigger.
    /// `returns` feeds the VaR scheduler if a recompute is warranted.
    pub fn update_margin_status(
        &self,
        equity: f64,
        margin_used: f64,
        margin_frozen: f64,
        returns: Option<&[f64]>,
        var_seed: u64,
    ) -> MarginUpdateResult {
        let mut state = self.state.lock();
        state.previous_level = state.alert_level;
        state.previous_usage_ratio = state.usage_ratio;

        state.equity = equity.max(0.0);
        state.margin_used = margin_used.max(0.0);
        state.margin_frozen = margin_frozen.max(0.0);
        state.margin_available = (state.equity - state.margin_used - state.margin_frozen).max(0.0);

        let total_margin = state.margin_used + state.margin_frozen;
        state.usage_ratio = if state.equity > 0.0 {
            total_margin / state.equity
        } else if total_margin > 0.0 {
            1.0
        } else {
            0.0
        };

        state.alert_level = Self::alert_level_for(&self.config, state.usage_ratio);

        let snapshot = MarginSnapshot {
            ts: Instant::now(),
            equity: state.equity,
            margin_used: state.margin_used,
            margin_frozen: state.margin_frozen,
            margin_available: state.margin_available,
            usage_ratio: state.usage_ratio,
            alert_level: state.alert_level,
            risk_action: state.alert_level.risk_action(),
        };
        if state.snapshots.len() >= self.config.history_size {
            state.snapshots.pop_front();
        }
        state.snapshots.push_back(snapshot);

        let level_changed = state.alert_level != state.previous_level;
        let mut alert_generated = false;

        if level_changed && state.alert_level > state.previous_level {
            let usage_change = state.usage_ratio - state.previous_usage_ratio;
            let reason = if usage_change > 0.10 {
                MarginCallReason::PriceVolatility
            } else {
                MarginCallReason::HighUsage
            };
            let required = Self::required_margin(&self.config, state.usage_ratio, total_margin, state.equity);
            let alert = MarginCallAlert {
                alert_level: state.alert_level,
                previous_level: state.previous_level,
                usage_ratio: state.usage_ratio,
                required_margin: required,
                reason,
                message: format!(
                    "margin alert escalated: {:?} -> {:?}, usage {:.1}%, required top-up {:.2}",
                    state.previous_level,
                    state.alert_level,
                    state.usage_ratio * 100.0,
                    required
                ),
                urgency_score: MarginCallAlert::urgency_for(state.alert_level),
            };
            if state.alerts.len() >= 100 {
                state.alerts.pop_front();
            }
            state.alerts.push_back(alert);
            state.alert_count += 1;
            alert_generated = true;
        }

        let usage_change = (state.usage_ratio - state.previous_usage_ratio).abs();
        let entered_danger_from_below = state.alert_level >= MarginAlertLevel::Danger
            && matches!(state.previous_level, MarginAlertLevel::Safe | MarginAlertLevel::Warning);
        let var_trigger_needed = usage_change >= self.config.var_trigger_threshold || entered_danger_from_below;

        if var_trigger_needed {
            if let (Some(scheduler), Some(returns)) = (&self.var_scheduler, returns) {
                scheduler.trigger_event(VarEventType::MarginWarning, returns, var_seed);
            }
        }

        let force_close_risk = if state.alert_level >= MarginAlertLevel::Danger {
            if state.alert_level == MarginAlertLevel::ForceClose {
                state.force_close_warning_count += 1;
            }
            Some(self.assess_force_close_risk(&state))
        } else {
            None
        };

        state.update_count += 1;

        MarginUpdateResult {
            alert_level: state.alert_level,
            previous_level: state.previous_level,
            usage_ratio: state.usage_ratio,
            level_changed,
            alert_generated,
            var_trigger_needed,
            force_close_risk,
        }
    }

    fn assess_force_close_risk(&self, state: &MonitorState) -> ForceCloseRisk {
        let config = &self.config;
        let risk_score = if state.usage_ratio < config.safe_threshold {
            0.0
        } else if state.usage_ratio < config.warning_threshold {
            0.2
        } else if state.usage_ratio < config.danger_threshold {
            0.4
        } else if state.usage_ratio < config.critical_threshold {
            0.7
        } else {
            state.usage_ratio.min(1.0)
        };

        let probability = Self::estimate_probability(config, state);
        let time_to_force_close_hours = Self::estimate_time_to_force_close(config, state);
        let suggested_reduce_ratio = Self::suggested_reduce_ratio(config, state.usage_ratio);
        let escape_actions = Self::escape_actions(state.alert_level);

        ForceCloseRisk {
            risk_score,
            probability,
            time_to_force_close_hours,
            suggested_reduce_ratio,
            escape_actions,
        }
    }

    fn estimate_probability(config: &MarginMonitorConfig, state: &MonitorState) -> f64 {
        if state.usage_ratio >= config.force_close_threshold {
            return 1.0;
        }
        let distance = config.force_close_threshold - state.usage_ratio;
        let trend_factor = if state.snapshots.len() >= 2 {
            let recent: Vec<&MarginSnapshot> =
                state.snapshots.iter().rev().take(10).collect();
            if recent.len() >= 2 {
                let last = recent[0].usage_ratio;
                let first = recent[recent.len() - 1].usage_ratio;
                let trend = last - first;
                if trend > 0.0 {
                    (trend * 2.0).min(0.5)
                } else {
                    trend.max(-0.3)
                }
            } else {
                0.0
            }
        } else {
            0.0
        };
        let base_probability = (1.0 - distance * 2.0).max(0.0);
        (base_probability + trend_factor).clamp(0.0, 1.0)
    }

    fn estimate_time_to_force_close(config: &MarginMonitorConfig, state: &MonitorState) -> Option<f64> {
        if state.usage_ratio >= config.force_close_threshold {
            return Some(0.0);
        }
        if state.snapshots.len() < 3 {
            return None;
        }
        let recent: Vec<&MarginSnapshot> = state.snapshots.iter().rev().take(10).collect();
        if recent.len() < 2 {
            return None;
        }
        let last = recent[0];
        let first = recent[recent.len() - 1];
        let time_diff = last.ts.duration_since(first.ts).as_secs_f64();
        if time_diff <= 0.0 {
            return None;
        }
        let ratio_diff = last.usage_ratio - first.usage_ratio;
        if ratio_diff <= 0.0 {
            return None;
        }
        let speed = ratio_diff / time_diff;
        let distance = config.force_close_threshold - state.usage_ratio;
        Some((distance / speed / 3600.0).max(0.0))
    }

    fn suggested_reduce_ratio(config: &MarginMonitorConfig, usage_ratio: f64) -> f64 {
        if usage_ratio < config.warning_threshold {
            return 0.0;
        }
        let target_ratio = config.safe_threshold - config.margin_call_buffer;
        if usage_ratio <= target_ratio {
            return 0.0;
        }
        let excess_ratio = usage_ratio - target_ratio;
        (excess_ratio / usage_ratio).clamp(0.0, 1.0)
    }

    fn escape_actions(level: MarginAlertLevel) -> Vec<String> {
        match level {
            MarginAlertLevel::ForceClose => vec![
                "close the largest losing position immediately".to_string(),
                "close the highest-margin-usage position".to_string(),
                "contact the broker to top up margin".to_string(),
            ],
            MarginAlertLevel::Critical => vec![
                "top up margin to a safe level".to_string(),
                "reduce high-risk positions".to_string(),
                "watch for further volatility".to_string(),
            ],
            MarginAlertLevel::Danger => vec![
                "consider topping up margin".to_string(),
                "assess position risk and reduce if needed".to_string(),
                "set protective stop orders".to_string(),
            ],
            MarginAlertLevel::Warning => vec![
                "increase monitoring frequency".to_string(),
                "avoid opening new positions".to_string(),
                "prepare top-up funds".to_string(),
            ],
            MarginAlertLevel::Safe => Vec::new(),
        }
    }

    pub fn current_level(&self) -> MarginAlertLevel {
        self.state.lock().alert_level
    }

    pub fn usage_ratio(&self) -> f64 {
        self.state.lock().usage_ratio
    }

    pub fn alert_count(&self) -> u64 {
        self.state.lock().alert_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seventy_five_percent_usage_is_warning() {
        let monitor = DynamicMarginMonitor::new(MarginMonitorConfig::default());
        let result = monitor.update_margin_status(1_000_000.0, 750_000.0, 0.0, None, 1);
        assert_eq!(result.alert_level, MarginAlertLevel::Warning);
        assert!((result.usage_ratio - 0.75).abs() < 1e-9);
    }

    #[test]
    fn escalation_generates_margin_call_alert() {
        let monitor = DynamicMarginMonitor::new(MarginMonitorConfig::default());
        monitor.update_margin_status(1_000_000.0, 100_000.0, 0.0, None, 1);
        let result = monitor.update_margin_status(1_000_000.0, 850_000.0, 0.0, None, 1);
        assert_eq!(result.alert_level, MarginAlertLevel::Danger);
        assert!(result.level_changed);
        assert!(result.alert_generated);
        assert_eq!(monitor.alert_count(), 1);
    }

    #[test]
    fn no_alert_on_descending_transition() {
        let monitor = DynamicMarginMonitor::new(MarginMonitorConfig::default());
        monitor.update_margin_status(1_000_000.0, 850_000.0, 0.0, None, 1);
        let result = monitor.update_margin_status(1_000_000.0, 100_000.0, 0.0, None, 1);
        assert_eq!(result.alert_level, MarginAlertLevel::Safe);
        assert!(result.level_changed);
        assert!(!result.alert_generated);
    }

    #[test]
    fn danger_and_above_estimates_force_close_risk() {
        let monitor = DynamicMarginMonitor::new(MarginMonitorConfig::default());
        let result = monitor.update_margin_status(1_000_000.0, 960_000.0, 0.0, None, 1);
        assert_eq!(result.alert_level, MarginAlertLevel::Critical);
        assert!(result.force_close_risk.is_some());
    }

    #[test]
    fn var_trigger_needed_on_jump_into_danger() {
        let monitor = DynamicMarginMonitor::new(MarginMonitorConfig::default());
        monitor.update_margin_status(1_000_000.0, 100_000.0, 0.0, None, 1);
        let result = monitor.update_margin_status(1_000_000.0, 850_000.0, 0.0, None, 1);
        assert!(result.var_trigger_needed);
    }
}

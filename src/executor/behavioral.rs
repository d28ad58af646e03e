//! BEHAVIORAL variant (spec.md §4.3.5): disguises the true execution
//! footprint as retail/institutional-looking flow while staying replayable —
//! every random draw comes from a RNG seeded deterministically off
//! `intent_id`, never from the system clock or OS entropy.

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::intent::Intent;

use super::context::{next_action_generic, OrderEvent, PlanContext, PlanStatus, Slice};
use super::{Executor, ExecutorAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisguisePattern {
    Retail,
    Institutional,
    Hybrid,
    Adaptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoiseType {
    None,
    Timing,
    Size,
    Both,
}

impl NoiseType {
    fn has_size_noise(self) -> bool {
        matches!(self, Self::Size | Self::Both)
    }
    fn has_timing_noise(self) -> bool {
        matches!(self, Self::Timing | Self::Both)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehavioralConfig {
    pub pattern: DisguisePattern,
    pub noise_type: NoiseType,
    pub duration_seconds: f64,
    pub min_interval_seconds: f64,
    pub max_interval_seconds: f64,
    pub min_slice_qty: u64,
    pub max_slice_qty: u64,
    pub size_variance: f64,
    pub timing_variance: f64,
    pub min_slices: u32,
    pub max_slices: u32,
    pub retry_count: u32,
    pub timeout_seconds: f64,
}

impl Default for BehavioralConfig {
    fn default() -> Self {
        Self {
            pattern: DisguisePattern::Retail,
            noise_type: NoiseType::Both,
            duration_seconds: 300.0,
            min_interval_seconds: 5.0,
            max_interval_seconds: 60.0,
            min_slice_qty: 1,
            max_slice_qty: 20,
            size_variance: 0.3,
            timing_variance: 0.4,
            min_slices: 5,
            max_slices: 20,
            retry_count: 3,
            timeout_seconds: 30.0,
        }
    }
}

/// Snapshot returned by `disguise_info` (spec.md §4.3.5), kept separate from
/// `PlanContext` so callers don't have to depend on executor-internal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisguiseInfo {
    pub plan_id: String,
    pub seed: u64,
    pub pattern: DisguisePattern,
    pub noise_type: NoiseType,
    pub slice_count: usize,
    pub executed_slices: usize,
}

#[derive(Debug)]
pub struct BehavioralExecutor {
    config: BehavioralConfig,
    plans: DashMap<String, RwLock<PlanContext>>,
}

impl BehavioralExecutor {
    pub fn new(config: BehavioralConfig) -> Self {
        Self {
            config,
            plans: DashMap::new(),
        }
    }

    /// First 8 bytes of SHA-256(intent_id), big-endian — identical across
    /// processes and across replays of the same intent.
    fn derive_seed(intent_id: &str) -> u64 {
        let digest = Sha256::digest(intent_id.as_bytes());
        u64::from_be_bytes(digest[0..8].try_into().unwrap())
    }

    fn pattern_multiplier(pattern: DisguisePattern, rng: &mut StdRng) -> f64 {
        match pattern {
            DisguisePattern::Retail => rng.gen_range(1.2..1.5),
            DisguisePattern::Institutional => rng.gen_range(0.6..0.8),
            DisguisePattern::Hybrid => rng.gen_range(0.8..1.2),
            DisguisePattern::Adaptive => 1.0,
        }
    }

    fn generate_varied_sizes(
        &self,
        total_qty: u64,
        slice_count: u32,
        rng: &mut StdRng,
    ) -> Vec<u64> {
        let variance = if self.config.noise_type.has_size_noise() {
            self.config.size_variance
        } else {
            0.0
        };

        let weights: Vec<f64> = (0..slice_count)
            .map(|_| {
                let w = rng.gen_range((1.0 - variance)..=(1.0 + variance));
                w.max(0.1)
            })
            .collect();
        let total_weight: f64 = weights.iter().sum();

        let mut sizes: Vec<u64> = Vec::new();
        let mut allocated: u64 = 0;
        let n = weights.len();
        for (i, &weight) in weights.iter().enumerate() {
            let size = if i == n - 1 {
                total_qty.saturating_sub(allocated)
            } else {
                let raw = ((total_qty as f64) * weight / total_weight) as u64;
                raw.clamp(self.config.min_slice_qty, self.config.max_slice_qty)
            };
            if size > 0 {
                sizes.push(size);
                allocated = allocated.saturating_add(size);
            }
        }

        if allocated < total_qty {
            if let Some(last) = sizes.last_mut() {
                *last += total_qty - allocated;
            }
        } else if allocated > total_qty {
            let mut excess = allocated - total_qty;
            for size in sizes.iter_mut().rev() {
                let reduce = excess.min(size.saturating_sub(1));
                *size -= reduce;
                excess -= reduce;
                if excess == 0 {
                    break;
                }
            }
        }

        sizes.into_iter().filter(|&s| s > 0).collect()
    }

    fn generate_varied_times(&self, slice_count: usize, start_ts: i64, rng: &mut StdRng) -> Vec<i64> {
        let variance = if self.config.noise_type.has_timing_noise() {
            self.config.timing_variance
        } else {
            0.0
        };
        let base_interval = if slice_count > 0 {
            self.config.duration_seconds / slice_count as f64
        } else {
            0.0
        };

        let mut times = Vec::with_capacity(slice_count);
        let mut current = start_ts;
        for i in 0..slice_count {
            if i == 0 {
                times.push(current);
                continue;
            }
            let interval_s = if variance > 0.0 {
                base_interval * rng.gen_range((1.0 - variance)..=(1.0 + variance))
            } else {
                base_interval
            };
            let interval_s = interval_s.clamp(
                self.config.min_interval_seconds,
                self.config.max_interval_seconds,
            );
            current += (interval_s * 1000.0) as i64;
            times.push(current);
        }
        times
    }

    fn calculate_disguised_slices(
        &self,
        intent: &Intent,
        seed: u64,
        start_ts: i64,
    ) -> Vec<Slice> {
        let mut rng = StdRng::seed_from_u64(seed);
        let total_qty = intent.target_qty;

        let base_slices = self
            .config
            .min_slices
            .max((total_qty / self.config.max_slice_qty.max(1)) as u32)
            .min(self.config.max_slices);

        let multiplier = Self::pattern_multiplier(self.config.pattern, &mut rng);
        let slice_count = ((base_slices as f64) * multiplier) as u32;
        let slice_count = slice_count.clamp(1, self.config.max_slices);

        let sizes = self.generate_varied_sizes(total_qty, slice_count, &mut rng);
        let times = self.generate_varied_times(sizes.len(), start_ts, &mut rng);

        sizes
            .into_iter()
            .zip(times)
            .enumerate()
            .filter(|(_, (qty, _))| *qty > 0)
            .map(|(i, (qty, scheduled_ts))| Slice {
                index: i,
                qty,
                target_price: intent.limit_price,
                scheduled_ts,
                executed: false,
                metadata: serde_json::Value::Null,
            })
            .collect()
    }

    pub fn disguise_info(&self, plan_id: &str) -> Option<DisguiseInfo> {
        let plan = self.plans.get(plan_id)?;
        let ctx = plan.read();
        let seed = ctx.metadata.get("random_seed")?.as_u64()?;
        Some(DisguiseInfo {
            plan_id: plan_id.to_string(),
            seed,
            pattern: self.config.pattern,
            noise_type: self.config.noise_type,
            slice_count: ctx.slices.len(),
            executed_slices: ctx.slices.iter().filter(|s| s.executed).count(),
        })
    }
}

impl Executor for BehavioralExecutor {
    fn make_plan(&self, intent: Intent, now_ms: i64) -> String {
        let plan_id = intent.intent_id();
        if self.plans.contains_key(&plan_id) {
            return plan_id;
        }
        let seed = Self::derive_seed(&plan_id);
        let slices = self.calculate_disguised_slices(&intent, seed, now_ms);
        let mut ctx = PlanContext::new(plan_id.clone(), intent, slices, now_ms);
        ctx.metadata = serde_json::json!({
            "algo": "BEHAVIORAL",
            "pattern": self.config.pattern,
            "noise_type": self.config.noise_type,
            "random_seed": seed,
        });
        self.plans.insert(plan_id.clone(), RwLock::new(ctx));
        plan_id
    }

    fn next_action(&self, plan_id: &str, now_ms: i64) -> ExecutorAction {
        let Some(plan) = self.plans.get(plan_id) else {
            return ExecutorAction::Abort {
                reason: "unknown plan".to_string(),
            };
        };
        let mut ctx = plan.write();
        next_action_generic(
            &mut ctx,
            now_ms,
            self.config.timeout_seconds,
            self.config.retry_count,
        )
    }

    fn on_event(&self, plan_id: &str, event: OrderEvent, now_ms: i64) {
        if let Some(plan) = self.plans.get(plan_id) {
            plan.write()
                .apply_event(&event, self.config.retry_count, now_ms);
        }
    }


    fn cancel(&self, plan_id: &str, reason: &str, now_ms: i64) -> bool {
        self.cancel_impl(plan_id, reason, now_ms)
    }
    fn pause(&self, plan_id: &str, now_ms: i64) -> bool {
        self.pause_impl(plan_id, now_ms)
    }
    fn resume(&self, plan_id: &str, now_ms: i64) -> bool {
        self.resume_impl(plan_id, now_ms)
    }
    fn status(&self, plan_id: &str) -> Option<PlanStatus> {
        self.status_impl(plan_id)
    }
    fn progress(&self, plan_id: &str) -> Option<super::ExecutionProgress> {
        self.progress_impl(plan_id)
    }
    fn pending_cancel_orders(&self, plan_id: &str) -> Vec<String> {
        self.pending_cancel_orders_impl(plan_id)
    }
    fn slice_count(&self, plan_id: &str) -> usize {
        self.slice_count_impl(plan_id)
    }
    fn avg_price(&self, plan_id: &str) -> Option<rust_decimal::Decimal> {
        self.avg_price_impl(plan_id)
    }
}

super::impl_shared_plan_ops!(BehavioralExecutor);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctp_mapping::{Offset, Side};
    use crate::intent::{Algo, Urgency};

    fn intent(target_qty: u64) -> Intent {
        Intent {
            strategy_id: "s".into(),
            decision_hash: "h".into(),
            instrument: "rb2501".into(),
            side: Side::Buy,
            offset: Offset::Open,
            target_qty,
            algo: Algo::Adaptive,
            urgency: Urgency::Normal,
            limit_price: None,
            signal_ts: 0,
            expiry_ts: None,
        }
    }

    #[test]
    fn seed_is_deterministic_function_of_intent_id() {
        let exec = BehavioralExecutor::new(BehavioralConfig::default());
        let id1 = exec.make_plan(intent(200), 0);
        let other = BehavioralExecutor::new(BehavioralConfig::default());
        let id2 = other.make_plan(intent(200), 0);
        assert_eq!(id1, id2);
        assert_eq!(
            exec.disguise_info(&id1).unwrap().seed,
            other.disguise_info(&id2).unwrap().seed
        );
    }

    #[test]
    fn replay_produces_identical_schedule() {
        let a = BehavioralExecutor::new(BehavioralConfig::default());
        let b = BehavioralExecutor::new(BehavioralConfig::default());
        let plan_id_a = a.make_plan(intent(137), 5_000);
        let plan_id_b = b.make_plan(intent(137), 5_000);
        assert_eq!(plan_id_a, plan_id_b);

        let slices_a: Vec<(u64, i64)> = a
            .plans
            .get(&plan_id_a)
            .unwrap()
            .read()
            .slices
            .iter()
            .map(|s| (s.qty, s.scheduled_ts))
            .collect();
        let slices_b: Vec<(u64, i64)> = b
            .plans
            .get(&plan_id_b)
            .unwrap()
            .read()
            .slices
            .iter()
            .map(|s| (s.qty, s.scheduled_ts))
            .collect();
        assert_eq!(slices_a, slices_b);
    }

    #[test]
    fn slice_quantities_sum_to_target() {
        let exec = BehavioralExecutor::new(BehavioralConfig::default());
        let plan_id = exec.make_plan(intent(150), 0);
        let plan = exec.plans.get(&plan_id).unwrap();
        let total: u64 = plan.read().slices.iter().map(|s| s.qty).sum();
        assert_eq!(total, 150);
    }

    #[test]
    fn disguise_info_tracks_executed_slices() {
        let exec = BehavioralExecutor::new(BehavioralConfig::default());
        let plan_id = exec.make_plan(intent(100), 0);
        let info_before = exec.disguise_info(&plan_id).unwrap();
        assert_eq!(info_before.executed_slices, 0);
        let _ = exec.next_action(&plan_id, 0);
        let info_after = exec.disguise_info(&plan_id).unwrap();
        assert_eq!(info_after.executed_slices, 1);
    }
}

//! VWAP variant (spec.md §4.3.3): allocate quantity across a volume-profile
//! weighted schedule instead of splitting it evenly like TWAP.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::intent::Intent;

use super::context::{next_action_generic, OrderEvent, PlanContext, PlanStatus, Slice};
use super::{Executor, ExecutorAction};

/// Canonical Chinese-futures intraday U-shape: heavier volume at the open and
/// close than through the midday lull, sampled into ten buckets.
pub const DEFAULT_VOLUME_PROFILE: &[f64] = &[
    0.14, 0.11, 0.08, 0.06, 0.05, 0.05, 0.06, 0.08, 0.12, 0.25,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VwapConfig {
    pub volume_profile: Vec<f64>,
    pub duration_seconds: f64,
    pub participation_rate: f64,
    pub min_slice_qty_ratio: f64,
    pub retry_count: u32,
    pub timeout_seconds: f64,
}

impl Default for VwapConfig {
    fn default() -> Self {
        Self {
            volume_profile: DEFAULT_VOLUME_PROFILE.to_vec(),
            duration_seconds: 300.0,
            participation_rate: 0.1,
            min_slice_qty_ratio: 0.0,
            retry_count: 3,
            timeout_seconds: 30.0,
        }
    }
}

#[derive(Debug)]
pub struct VwapExecutor {
    config: VwapConfig,
    plans: DashMap<String, RwLock<PlanContext>>,
}

impl VwapExecutor {
    pub fn new(config: VwapConfig) -> Self {
        Self {
            config,
            plans: DashMap::new(),
        }
    }

    fn calculate_slices(&self, intent: &Intent, start_ts: i64) -> Vec<Slice> {
        let total_qty = intent.target_qty;
        let raw_profile = if self.config.volume_profile.is_empty() {
            DEFAULT_VOLUME_PROFILE.to_vec()
        } else {
            self.config.volume_profile.clone()
        };
        let sum: f64 = raw_profile.iter().sum();
        let weights: Vec<f64> = if sum > 0.0 {
            raw_profile.iter().map(|w| w / sum).collect()
        } else {
            vec![1.0 / raw_profile.len() as f64; raw_profile.len()]
        };

        let n = weights.len();
        let min_qty = ((total_qty as f64) * self.config.min_slice_qty_ratio).ceil() as u64;

        let mut qtys: Vec<u64> = weights
            .iter()
            .map(|w| ((total_qty as f64) * w).round() as u64)
            .map(|q| q.max(min_qty))
            .collect();

        // Reconcile rounding/floor drift against the last slice so the
        // schedule always sums to exactly targetQty (spec.md §8 scenario 2).
        let allocated: u64 = qtys[..n - 1].iter().sum();
        qtys[n - 1] = total_qty.saturating_sub(allocated);

        let interval_s = if n > 1 {
            self.config.duration_seconds / (n as f64 - 1.0)
        } else {
            0.0
        };
        let interval_ms = (interval_s * 1000.0) as i64;

        let mut slices = Vec::new();
        for (i, (&qty, &weight)) in qtys.iter().zip(weights.iter()).enumerate() {
            if qty == 0 {
                continue;
            }
            slices.push(Slice {
                index: i,
                qty,
                target_price: intent.limit_price,
                scheduled_ts: start_ts + (i as i64) * interval_ms,
                executed: false,
                metadata: serde_json::json!({"volume_weight": weight}),
            });
        }
        slices
    }
}

impl Executor for VwapExecutor {
    fn make_plan(&self, intent: Intent, now_ms: i64) -> String {
        let plan_id = intent.intent_id();
        if self.plans.contains_key(&plan_id) {
            return plan_id;
        }
        let slices = self.calculate_slices(&intent, now_ms);
        let mut ctx = PlanContext::new(plan_id.clone(), intent, slices, now_ms);
        ctx.metadata = serde_json::json!({"algo": "VWAP"});
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

super::impl_shared_plan_ops!(VwapExecutor);

//! ICEBERG variant (spec.md §4.3.4): repeated equal tips, one visible at a
//! time. The single-outstanding-order rule in `next_action_generic` already
//! gives us "don't release the next tip until the previous one resolves" for
//! free, so this file only has to build the tip schedule.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::intent::Intent;

use super::context::{next_action_generic, OrderEvent, PlanContext, PlanStatus, Slice};
use super::{Executor, ExecutorAction};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IcebergConfig {
    /// Absolute tip size; ignored when `tip_ratio` is set (> 0).
    pub tip_size: u64,
    /// Visible tip as a fraction of `targetQty`, overrides `tip_size` when > 0.
    pub tip_ratio: f64,
    pub refill_delay_seconds: f64,
    pub max_visible: u64,
    pub retry_count: u32,
    pub timeout_seconds: f64,
}

impl Default for IcebergConfig {
    fn default() -> Self {
        Self {
            tip_size: 10,
            tip_ratio: 0.0,
            refill_delay_seconds: 2.0,
            max_visible: u64::MAX,
            retry_count: 3,
            timeout_seconds: 30.0,
        }
    }
}

#[derive(Debug)]
pub struct IcebergExecutor {
    config: IcebergConfig,
    plans: DashMap<String, RwLock<PlanContext>>,
}

impl IcebergExecutor {
    pub fn new(config: IcebergConfig) -> Self {
        Self {
            config,
            plans: DashMap::new(),
        }
    }

    fn calculate_slices(&self, intent: &Intent, start_ts: i64) -> Vec<Slice> {
        let total_qty = intent.target_qty;
        let tip = if self.config.tip_ratio > 0.0 {
            ((total_qty as f64) * self.config.tip_ratio).round() as u64
        } else {
            self.config.tip_size
        }
        .clamp(1, self.config.max_visible.max(1));

        let tip_count = total_qty.div_ceil(tip).max(1);
        let base_qty = total_qty / tip_count;
        let remainder = total_qty % tip_count;
        let delay_ms = (self.config.refill_delay_seconds * 1000.0) as i64;

        let mut slices = Vec::new();
        for i in 0..tip_count {
            let qty = (base_qty + if i < remainder { 1 } else { 0 }).min(tip);
            if qty == 0 {
                continue;
            }
            slices.push(Slice {
                index: i as usize,
                qty,
                target_price: intent.limit_price,
                scheduled_ts: start_ts + (i as i64) * delay_ms,
                executed: false,
                metadata: serde_json::Value::Null,
            });
        }
        slices
    }
}

impl Executor for IcebergExecutor {
    fn make_plan(&self, intent: Intent, now_ms: i64) -> String {
        let plan_id = intent.intent_id();
        if self.plans.contains_key(&plan_id) {
            return plan_id;
        }
        let slices = self.calculate_slices(&intent, now_ms);
        let mut ctx = PlanContext::new(plan_id.clone(), intent, slices, now_ms);
        ctx.metadata = serde_json::json!({"algo": "ICEBERG"});
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

super::impl_shared_plan_ops!(IcebergExecutor);

//! IMMEDIATE variant (spec.md §4.3.1): one slice, fire now.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::intent::Intent;

use super::context::{next_action_generic, OrderEvent, PlanContext, PlanStatus, Slice};
use super::{Executor, ExecutorAction};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImmediateConfig {
    pub retry_count: u32,
    pub timeout_seconds: f64,
}

impl Default for ImmediateConfig {
    fn default() -> Self {
        Self {
            retry_count: 1,
            timeout_seconds: 10.0,
        }
    }
}

#[derive(Debug)]
pub struct ImmediateExecutor {
    config: ImmediateConfig,
    plans: DashMap<String, RwLock<PlanContext>>,
}

impl ImmediateExecutor {
    pub fn new(config: ImmediateConfig) -> Self {
        Self {
            config,
            plans: DashMap::new(),
        }
    }
}

impl Default for ImmediateExecutor {
    fn default() -> Self {
        Self::new(ImmediateConfig::default())
    }
}

impl Executor for ImmediateExecutor {
    fn make_plan(&self, intent: Intent, now_ms: i64) -> String {
        let plan_id = intent.intent_id();
        if self.plans.contains_key(&plan_id) {
            return plan_id;
        }
        let slice = Slice {
            index: 0,
            qty: intent.target_qty,
            target_price: intent.limit_price,
            scheduled_ts: now_ms,
            executed: false,
            metadata: serde_json::Value::Null,
        };
        let mut ctx = PlanContext::new(plan_id.clone(), intent, vec![slice], now_ms);
        ctx.metadata = serde_json::json!({"algo": "IMMEDIATE"});
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
        next_action_generic(&mut ctx, now_ms, self.config.timeout_seconds, self.config.retry_count)
    }

    fn on_event(&self, plan_id: &str, event: OrderEvent, now_ms: i64) {
        if let Some(plan) = self.plans.get(plan_id) {
            plan.write().apply_event(&event, self.config.retry_count, now_ms);
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

super::impl_shared_plan_ops!(ImmediateExecutor);

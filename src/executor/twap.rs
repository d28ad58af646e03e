//! TWAP variant (spec.md §4.3.2).

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::intent::Intent;

use super::context::{next_action_generic, OrderEvent, PlanContext, PlanStatus, Slice};
use super::{Executor, ExecutorAction};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwapConfig {
    pub duration_seconds: f64,
    /// 0 = auto-compute from `max_slice_qty`.
    pub slice_count: u32,
    pub min_interval_seconds: f64,
    pub max_interval_seconds: f64,
    pub min_slice_qty: u64,
    pub max_slice_qty: u64,
    pub retry_count: u32,
    pub timeout_seconds: f64,
}

impl Default for TwapConfig {
    fn default() -> Self {
        Self {
            duration_seconds: 300.0,
            slice_count: 0,
            min_interval_seconds: 10.0,
            max_interval_seconds: 60.0,
            min_slice_qty: 1,
            max_slice_qty: 100,
            retry_count: 3,
            timeout_seconds: 30.0,
        }
    }
}

#[derive(Debug)]
pub struct TwapExecutor {
    config: TwapConfig,
    plans: DashMap<String, RwLock<PlanContext>>,
}

impl TwapExecutor {
    pub fn new(config: TwapConfig) -> Self {
        Self {
            config,
            plans: DashMap::new(),
        }
    }

    /// Deterministic slice construction: no randomization, no clock reads
    /// beyond the supplied `start_ts`, so identical intents always yield
    /// identical schedules.
    fn calculate_slices(&self, intent: &Intent, start_ts: i64) -> Vec<Slice> {
        let total_qty = intent.target_qty;
        let duration = self.config.duration_seconds;

        let mut slice_count = if self.config.slice_count > 0 {
            self.config.slice_count as u64
        } else {
            let auto = total_qty.div_ceil(self.config.max_slice_qty).max(1);
            if auto > 1 {
                let interval = duration / (auto as f64 - 1.0);
                if interval < self.config.min_interval_seconds {
                    ((duration / self.config.min_interval_seconds) as u64 + 1).max(1)
                } else if interval > self.config.max_interval_seconds {
                    ((duration / self.config.max_interval_seconds) as u64 + 1).max(2)
                } else {
                    auto
                }
            } else {
                auto
            }
        };
        slice_count = slice_count.max(1);

        let base_qty = total_qty / slice_count;
        let remainder = total_qty % slice_count;
        let interval_s = if slice_count > 1 {
            duration / (slice_count as f64 - 1.0)
        } else {
            0.0
        };
        let interval_ms = (interval_s * 1000.0) as i64;

        let mut slices = Vec::new();
        for i in 0..slice_count {
            let qty = base_qty + if i < remainder { 1 } else { 0 };
            if qty == 0 {
                continue;
            }
            slices.push(Slice {
                index: i as usize,
                qty,
                target_price: intent.limit_price,
                scheduled_ts: start_ts + (i as i64) * interval_ms,
                executed: false,
                metadata: serde_json::Value::Null,
            });
        }
        slices
    }
}

impl Executor for TwapExecutor {
    fn make_plan(&self, intent: Intent, now_ms: i64) -> String {
        let plan_id = intent.intent_id();
        if self.plans.contains_key(&plan_id) {
            return plan_id;
        }
        let slices = self.calculate_slices(&intent, now_ms);
        let mut ctx = PlanContext::new(plan_id.clone(), intent, slices, now_ms);
        ctx.metadata = serde_json::json!({"algo": "TWAP"});
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

super::impl_shared_plan_ops!(TwapExecutor);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctp_mapping::{Offset, Side};
    use crate::executor::context::{OrderEventKind};
    use crate::intent::{Algo, Urgency};

    fn intent(target_qty: u64) -> Intent {
        Intent {
            strategy_id: "s".into(),
            decision_hash: "h".into(),
            instrument: "rb2501".into(),
            side: Side::Buy,
            offset: Offset::Open,
            target_qty,
            algo: Algo::Twap,
            urgency: Urgency::Normal,
            limit_price: None,
            signal_ts: 0,
            expiry_ts: None,
        }
    }

    #[test]
    fn splits_100_into_34_33_33_over_60s() {
        let exec = TwapExecutor::new(TwapConfig {
            duration_seconds: 60.0,
            slice_count: 0,
            min_interval_seconds: 10.0,
            max_interval_seconds: 60.0,
            max_slice_qty: 40,
            ..TwapConfig::default()
        });
        let plan_id = exec.make_plan(intent(100), 0);
        let plan = exec.plans.get(&plan_id).unwrap();
        let ctx = plan.read();
        let qtys: Vec<u64> = ctx.slices.iter().map(|s| s.qty).collect();
        let tss: Vec<i64> = ctx.slices.iter().map(|s| s.scheduled_ts).collect();
        assert_eq!(qtys, vec![34, 33, 33]);
        assert_eq!(tss, vec![0, 30_000, 60_000]);
    }

    #[test]
    fn make_plan_is_idempotent() {
        let exec = TwapExecutor::new(TwapConfig::default());
        let id1 = exec.make_plan(intent(10), 0);
        let id2 = exec.make_plan(intent(10), 0);
        assert_eq!(id1, id2);
        assert_eq!(exec.plans.len(), 1);
    }

    #[test]
    fn full_fill_sequence_completes() {
        let exec = TwapExecutor::new(TwapConfig {
            duration_seconds: 60.0,
            max_slice_qty: 40,
            ..TwapConfig::default()
        });
        let plan_id = exec.make_plan(intent(100), 0);

        for (now, expected_qty) in [(0i64, 34u64), (30_000, 33), (60_000, 33)] {
            let action = exec.next_action(&plan_id, now);
            let coid = match action {
                ExecutorAction::PlaceOrder { client_order_id, qty, .. } => {
                    assert_eq!(qty, expected_qty);
                    client_order_id
                }
                other => panic!("expected PlaceOrder, got {other:?}"),
            };
            exec.on_event(
                &plan_id,
                OrderEvent {
                    client_order_id: coid,
                    kind: OrderEventKind::Fill,
                    filled_qty: expected_qty,
                    filled_price: Some(rust_decimal::Decimal::from(4000)),
                    remaining_qty: 0,
                    error_code: None,
                    error_msg: None,
                    exchange_order_id: None,
                    ts: now,
                },
                now,
            );
        }
        assert!(matches!(exec.next_action(&plan_id, 60_000), ExecutorAction::Complete));
        assert_eq!(exec.status(&plan_id), Some(PlanStatus::Completed));
        assert_eq!(exec.progress(&plan_id).unwrap().filled_qty, 100);
    }

    #[test]
    fn waits_before_scheduled_time() {
        let exec = TwapExecutor::new(TwapConfig {
            duration_seconds: 60.0,
            max_slice_qty: 40,
            ..TwapConfig::default()
        });
        let plan_id = exec.make_plan(intent(100), 0);
        let _ = exec.next_action(&plan_id, 0);
        let action = exec.next_action(&plan_id, 0);
        assert!(matches!(action, ExecutorAction::Wait { .. }));
    }
}

//! Executor Family (C4): five variants sharing one contract.
//!
//! The Python source expresses this as an `ExecutorBase` + `Protocol`; per
//! spec.md §9 that is better expressed here as a closed sum type dispatched
//! through [`ExecutorHandle`] than as open trait-object extension, so the hot
//! `next_action` path inlines across variants.

pub mod context;

mod behavioral;
mod iceberg;
mod immediate;
mod twap;
mod vwap;

pub use behavioral::{BehavioralConfig, BehavioralExecutor, DisguiseInfo, DisguisePattern, NoiseType};
pub use context::{ExecutionProgress, OrderEvent, OrderEventKind, PlanContext, PlanStatus, Slice};
pub use iceberg::{IcebergConfig, IcebergExecutor};
pub use immediate::{ImmediateConfig, ImmediateExecutor};
pub use twap::{TwapConfig, TwapExecutor};
pub use vwap::{VwapConfig, VwapExecutor};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ctp_mapping::{Offset, Side};
use crate::intent::Intent;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutorAction {
    PlaceOrder {
        client_order_id: String,
        instrument: String,
        side: Side,
        offset: Offset,
        price: Option<Decimal>,
        qty: u64,
        metadata: serde_json::Value,
    },
    CancelOrder {
        client_order_id: String,
        reason: String,
    },
    Wait {
        until_ts: Option<i64>,
        reason: String,
    },
    Complete,
    Abort {
        reason: String,
    },
}

/// Shared capability set every algorithm variant implements over the plan
/// contexts it owns (spec.md §4.3).
pub trait Executor: Send + Sync {
    /// Idempotent: if a plan for `intent.intent_id()` already exists, returns
    /// that id unchanged rather than rebuilding the schedule.
    fn make_plan(&self, intent: Intent, now_ms: i64) -> String;

    /// Pure inspection of state plus the supplied clock. Identical
    /// `(plan_id, state, now)` always yields the same action modulo a
    /// non-decreasing clock.
    fn next_action(&self, plan_id: &str, now_ms: i64) -> ExecutorAction;

    fn on_event(&self, plan_id: &str, event: OrderEvent, now_ms: i64);

    fn cancel(&self, plan_id: &str, reason: &str, now_ms: i64) -> bool;

    fn pause(&self, plan_id: &str, now_ms: i64) -> bool;

    fn resume(&self, plan_id: &str, now_ms: i64) -> bool;

    fn status(&self, plan_id: &str) -> Option<PlanStatus>;

    fn progress(&self, plan_id: &str) -> Option<ExecutionProgress>;

    fn pending_cancel_orders(&self, plan_id: &str) -> Vec<String>;

    fn slice_count(&self, plan_id: &str) -> usize;

    fn avg_price(&self, plan_id: &str) -> Option<rust_decimal::Decimal>;
}

/// Closed enum dispatch across the five algorithm families (spec.md §9:
/// "closed sum type / enum-dispatched implementation").
#[derive(Debug)]
pub enum ExecutorHandle {
    Immediate(ImmediateExecutor),
    Twap(TwapExecutor),
    Vwap(VwapExecutor),
    Iceberg(IcebergExecutor),
    Behavioral(BehavioralExecutor),
}

macro_rules! dispatch {
    ($self:ident, $method:ident $(, $arg:expr)*) => {
        match $self {
            ExecutorHandle::Immediate(e) => e.$method($($arg),*),
            ExecutorHandle::Twap(e) => e.$method($($arg),*),
            ExecutorHandle::Vwap(e) => e.$method($($arg),*),
            ExecutorHandle::Iceberg(e) => e.$method($($arg),*),
            ExecutorHandle::Behavioral(e) => e.$method($($arg),*),
        }
    };
}

impl Executor for ExecutorHandle {
    fn make_plan(&self, intent: Intent, now_ms: i64) -> String {
        dispatch!(self, make_plan, intent, now_ms)
    }

    fn next_action(&self, plan_id: &str, now_ms: i64) -> ExecutorAction {
        dispatch!(self, next_action, plan_id, now_ms)
    }

    fn on_event(&self, plan_id: &str, event: OrderEvent, now_ms: i64) {
        dispatch!(self, on_event, plan_id, event, now_ms)
    }

    fn cancel(&self, plan_id: &str, reason: &str, now_ms: i64) -> bool {
        dispatch!(self, cancel, plan_id, reason, now_ms)
    }

    fn pause(&self, plan_id: &str, now_ms: i64) -> bool {
        dispatch!(self, pause, plan_id, now_ms)
    }

    fn resume(&self, plan_id: &str, now_ms: i64) -> bool {
        dispatch!(self, resume, plan_id, now_ms)
    }

    fn status(&self, plan_id: &str) -> Option<PlanStatus> {
        dispatch!(self, status, plan_id)
    }

    fn progress(&self, plan_id: &str) -> Option<ExecutionProgress> {
        dispatch!(self, progress, plan_id)
    }

    fn pending_cancel_orders(&self, plan_id: &str) -> Vec<String> {
        dispatch!(self, pending_cancel_orders, plan_id)
    }

    fn slice_count(&self, plan_id: &str) -> usize {
        dispatch!(self, slice_count, plan_id)
    }

    fn avg_price(&self, plan_id: &str) -> Option<rust_decimal::Decimal> {
        dispatch!(self, avg_price, plan_id)
    }
}

/// Shared `cancel`/`pause`/`resume`/`status`/`progress` bodies — identical
/// across all five variants, each of which stores `DashMap<String,
/// parking_lot::RwLock<PlanContext>>`. Kept as a macro (not a blanket trait
/// impl) because each variant's map field name differs only in spelling, and
/// this keeps each variant file self-contained and readable top-to-bottom.
macro_rules! impl_shared_plan_ops {
    ($ty:ty) => {
        impl $ty {
            pub fn status_impl(&self, plan_id: &str) -> Option<crate::executor::PlanStatus> {
                self.plans.get(plan_id).map(|p| p.read().status)
            }

            pub fn progress_impl(&self, plan_id: &str) -> Option<crate::executor::ExecutionProgress> {
                self.plans.get(plan_id).map(|p| p.read().progress())
            }

            pub fn pending_cancel_orders_impl(&self, plan_id: &str) -> Vec<String> {
                self.plans
                    .get(plan_id)
                    .map(|p| p.read().pending_client_order_ids())
                    .unwrap_or_default()
            }

            pub fn slice_count_impl(&self, plan_id: &str) -> usize {
                self.plans.get(plan_id).map(|p| p.read().slices.len()).unwrap_or(0)
            }

            pub fn avg_price_impl(&self, plan_id: &str) -> Option<rust_decimal::Decimal> {
                self.plans.get(plan_id).and_then(|p| p.read().avg_price())
            }

            pub fn cancel_impl(&self, plan_id: &str, reason: &str, now_ms: i64) -> bool {
                if let Some(plan) = self.plans.get(plan_id) {
                    let mut ctx = plan.write();
                    if ctx.status.is_terminal() {
                        return false;
                    }
                    ctx.error = Some(reason.to_string());
                    ctx.transition(crate::executor::PlanStatus::Cancelled, now_ms).is_ok()
                } else {
                    false
                }
            }

            pub fn pause_impl(&self, plan_id: &str, now_ms: i64) -> bool {
                if let Some(plan) = self.plans.get(plan_id) {
                    let mut ctx = plan.write();
                    ctx.transition(crate::executor::PlanStatus::Paused, now_ms).is_ok()
                } else {
                    false
                }
            }

            pub fn resume_impl(&self, plan_id: &str, now_ms: i64) -> bool {
                if let Some(plan) = self.plans.get(plan_id) {
                    let mut ctx = plan.write();
                    ctx.transition(crate::executor::PlanStatus::Running, now_ms).is_ok()
                } else {
                    false
                }
            }
        }
    };
}
pub(crate) use impl_shared_plan_ops;

//! Per-plan mutable state (C3): slice schedule, pending orders, fills,
//! status. One `PlanContext` is owned exclusively by one executor instance,
//! keyed by `plan_id = intent_id`.
//!
//! The status guard below generalizes the teacher's `order_fsm.rs` pattern
//! (`valid_transitions` / `can_transition_to`) from order lifecycle states to
//! plan lifecycle states, which is what gives terminal monotonicity its
//! enforcement.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::intent::Intent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    fn valid_transitions(&self) -> &'static [PlanStatus] {
        use PlanStatus::*;
        match self {
            Pending => &[Running, Cancelled, Failed],
            Running => &[Paused, Completed, Cancelled, Failed],
            Paused => &[Running, Cancelled, Failed],
            Completed | Cancelled | Failed => &[],
        }
    }

    pub fn can_transition_to(&self, next: PlanStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slice {
    pub index: usize,
    pub qty: u64,
    pub target_price: Option<Decimal>,
    pub scheduled_ts: i64,
    pub executed: bool,
    /// Algorithm-specific annotations (e.g. VWAP's normalized profile weight).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    pub slice_index: usize,
    pub qty: u64,
    pub price: Option<Decimal>,
    pub submit_ts: i64,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilledOrder {
    pub client_order_id: String,
    pub slice_index: usize,
    pub filled_qty: u64,
    pub avg_price: Decimal,
    pub ts: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub filled_qty: u64,
    pub target_qty: u64,
    pub fill_ratio: f64,
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderEventKind {
    Ack,
    PartialFill,
    Fill,
    Reject,
    CancelAck,
    CancelReject,
}

impl OrderEventKind {
    pub fn is_fill(&self) -> bool {
        matches!(self, Self::PartialFill | Self::Fill)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub client_order_id: String,
    pub kind: OrderEventKind,
    #[serde(default)]
    pub filled_qty: u64,
    #[serde(default)]
    pub filled_price: Option<Decimal>,
    #[serde(default)]
    pub remaining_qty: u64,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_msg: Option<String>,
    #[serde(default)]
    pub exchange_order_id: Option<String>,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanContext {
    pub plan_id: String,
    pub intent: Intent,
    pub status: PlanStatus,
    pub slices: Vec<Slice>,
    pub pending_orders: HashMap<String, PendingOrder>,
    pub filled_orders: Vec<FilledOrder>,
    pub cancelled_orders: Vec<String>,
    pub error: Option<String>,
    pub start_ts: i64,
    pub end_ts: Option<i64>,
    /// Per-slice retry counters; a slice reaching the configured `retry_count`
    /// is marked executed (skipped) rather than retried again.
    pub retry_counts: HashMap<usize, u32>,
    /// Algorithm-specific metadata, e.g. the behavioral executor's RNG seed.
    pub metadata: serde_json::Value,
}

impl PlanContext {
    pub fn new(plan_id: String, intent: Intent, slices: Vec<Slice>, start_ts: i64) -> Self {
        Self {
            plan_id,
            intent,
            status: PlanStatus::Pending,
            slices,
            pending_orders: HashMap::new(),
            filled_orders: Vec::new(),
            cancelled_orders: Vec::new(),
            error: None,
            start_ts,
            end_ts: None,
            retry_counts: HashMap::new(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn transition(&mut self, next: PlanStatus, now_ms: i64) -> Result<(), PipelineError> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::InvariantViolation {
                detail: format!(
                    "plan {}: illegal transition {:?} -> {:?}",
                    self.plan_id, self.status, next
                ),
            });
        }
        info!(plan_id = %self.plan_id, from = ?self.status, to = ?next, "plan transition");
        if next.is_terminal() {
            self.end_ts = Some(now_ms);
        }
        self.status = next;
        Ok(())
    }

    pub fn total_filled(&self) -> u64 {
        self.filled_orders.iter().map(|f| f.filled_qty).sum()
    }

    /// `Σ(filledQty·avgPrice) / Σ(filledQty)` over all FilledOrder entries.
    pub fn avg_price(&self) -> Option<Decimal> {
        let total_qty = self.total_filled();
        if total_qty == 0 {
            return None;
        }
        let weighted: Decimal = self
            .filled_orders
            .iter()
            .map(|f| f.avg_price * Decimal::from(f.filled_qty))
            .sum();
        Some(weighted / Decimal::from(total_qty))
    }

    pub fn progress(&self) -> ExecutionProgress {
        let filled = self.total_filled();
        let target = self.intent.target_qty;
        ExecutionProgress {
            filled_qty: filled,
            target_qty: target,
            fill_ratio: if target == 0 {
                1.0
            } else {
                filled as f64 / target as f64
            },
            is_complete: filled >= target,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total_filled() >= self.intent.target_qty
    }

    pub fn next_pending_slice(&self) -> Option<&Slice> {
        self.slices.iter().find(|s| !s.executed)
    }

    pub fn pending_client_order_ids(&self) -> Vec<String> {
        self.pending_orders.keys().cloned().collect()
    }

    /// If any pending order exceeds `timeout_seconds`, return it so the
    /// caller can issue `CANCEL_ORDER` before placing any new slice.
    pub fn find_timed_out_order(&self, now_ms: i64, timeout_seconds: f64) -> Option<String> {
        let timeout_ms = (timeout_seconds * 1000.0) as i64;
        self.pending_orders
            .iter()
            .find(|(_, order)| now_ms - order.submit_ts >= timeout_ms)
            .map(|(coid, _)| coid.clone())
    }

    pub fn register_pending(
        &mut self,
        client_order_id: String,
        slice_index: usize,
        qty: u64,
        price: Option<Decimal>,
        now_ms: i64,
        retry_count: u32,
    ) {
        self.pending_orders.insert(
            client_order_id,
            PendingOrder {
                slice_index,
                qty,
                price,
                submit_ts: now_ms,
                retry_count,
            },
        );
        if let Some(slice) = self.slices.get_mut(slice_index) {
            slice.executed = true;
        }
    }

    /// Shared Order Event handling rules (spec.md §4.4), identical across all
    /// five executor variants.
    pub fn apply_event(&mut self, event: &OrderEvent, retry_limit: u32, now_ms: i64) {
        match event.kind {
            OrderEventKind::Ack => {
                // No state change: PLACE_ORDER already registered the pending order.
            }
            OrderEventKind::PartialFill => {
                if let Some(order) = self.pending_orders.get(&event.client_order_id) {
                    self.filled_orders.push(FilledOrder {
                        client_order_id: event.client_order_id.clone(),
                        slice_index: order.slice_index,
                        filled_qty: event.filled_qty,
                        avg_price: event.filled_price.unwrap_or_default(),
                        ts: event.ts,
                    });
                }
            }
            OrderEventKind::Fill => {
                if let Some(order) = self.pending_orders.remove(&event.client_order_id) {
                    self.filled_orders.push(FilledOrder {
                        client_order_id: event.client_order_id.clone(),
                        slice_index: order.slice_index,
                        filled_qty: event.filled_qty,
                        avg_price: event.filled_price.unwrap_or_default(),
                        ts: event.ts,
                    });
                }
                if self.is_complete() && self.status == PlanStatus::Running {
                    let _ = self.transition(PlanStatus::Completed, now_ms);
                }
            }
            OrderEventKind::Reject | OrderEventKind::CancelAck => {
                if let Some(order) = self.pending_orders.remove(&event.client_order_id) {
                    self.cancelled_orders.push(event.client_order_id.clone());
                    let retries = self.retry_counts.entry(order.slice_index).or_insert(0);
                    *retries += 1;
                    if *retries >= retry_limit {
                        warn!(
                            plan_id = %self.plan_id,
                            slice_index = order.slice_index,
                            "retry limit reached, skipping slice"
                        );
                        if let Some(slice) = self.slices.get_mut(order.slice_index) {
                            slice.executed = true;
                        }
                    } else if let Some(slice) = self.slices.get_mut(order.slice_index) {
                        slice.executed = false;
                    }
                    let all_slices_resolved = self
                        .slices
                        .iter()
                        .all(|s| s.executed || self.pending_orders.values().any(|p| p.slice_index == s.index));
                    if all_slices_resolved && !self.is_complete() && self.status == PlanStatus::Running {
                        let _ = self.transition(PlanStatus::Failed, now_ms);
                        self.error = Some("retry limit exceeded".to_string());
                    }
                }
            }
            OrderEventKind::CancelReject => {
                // No-op: the order may have already filled.
            }
        }
    }
}

/// Shared decision loop used by every variant's `next_action`: terminal
/// absorption, pause, per-order timeout, single-outstanding-order
/// serialization, slice retry-skip, and completion/failure detection. Only
/// slice *construction* (in `make_plan`) differs between algorithm families.
pub fn next_action_generic(
    ctx: &mut PlanContext,
    now_ms: i64,
    timeout_seconds: f64,
    retry_count: u32,
) -> super::ExecutorAction {
    use super::ExecutorAction;

    if ctx.status.is_terminal() {
        return match ctx.status {
            PlanStatus::Completed => ExecutorAction::Complete,
            PlanStatus::Cancelled => ExecutorAction::Abort {
                reason: "plan cancelled".to_string(),
            },
            _ => ExecutorAction::Abort {
                reason: ctx.error.clone().unwrap_or_else(|| "execution failed".to_string()),
            },
        };
    }

    if ctx.status == PlanStatus::Paused {
        return ExecutorAction::Wait {
            until_ts: None,
            reason: "plan paused".to_string(),
        };
    }

    if let Some(coid) = ctx.find_timed_out_order(now_ms, timeout_seconds) {
        return ExecutorAction::CancelOrder {
            client_order_id: coid,
            reason: format!("order exceeded timeout of {timeout_seconds}s"),
        };
    }

    // Single outstanding order at a time: wait for the broker's response
    // before releasing the next slice.
    if !ctx.pending_orders.is_empty() {
        return ExecutorAction::Wait {
            until_ts: None,
            reason: "awaiting order response".to_string(),
        };
    }

    if ctx.is_complete() {
        let _ = ctx.transition(PlanStatus::Completed, now_ms);
        return ExecutorAction::Complete;
    }

    let Some(next_slice_index) = ctx.slices.iter().position(|s| !s.executed) else {
        if ctx.is_complete() {
            let _ = ctx.transition(PlanStatus::Completed, now_ms);
            return ExecutorAction::Complete;
        }
        let _ = ctx.transition(PlanStatus::Failed, now_ms);
        ctx.error = Some("all slices processed but target not reached".to_string());
        return ExecutorAction::Abort {
            reason: "all slices processed but target not reached".to_string(),
        };
    };

    let retries_so_far = *ctx.retry_counts.get(&next_slice_index).unwrap_or(&0);
    if retries_so_far >= retry_count {
        ctx.slices[next_slice_index].executed = true;
        return next_action_generic(ctx, now_ms, timeout_seconds, retry_count);
    }

    let scheduled_ts = ctx.slices[next_slice_index].scheduled_ts;
    if now_ms < scheduled_ts {
        return ExecutorAction::Wait {
            until_ts: Some(scheduled_ts),
            reason: format!("awaiting slice #{next_slice_index} schedule"),
        };
    }

    let remaining = ctx.intent.target_qty.saturating_sub(ctx.total_filled());
    let slice_qty = ctx.slices[next_slice_index].qty.min(remaining);
    if slice_qty == 0 {
        ctx.slices[next_slice_index].executed = true;
        return next_action_generic(ctx, now_ms, timeout_seconds, retry_count);
    }

    if ctx.status == PlanStatus::Pending {
        let _ = ctx.transition(PlanStatus::Running, now_ms);
    }

    let intent_id = ctx.intent.intent_id();
    let price = ctx.slices[next_slice_index].target_price;
    let slice_metadata = ctx.slices[next_slice_index].metadata.clone();
    let client_order_id =
        crate::intent::generate_client_order_id(&intent_id, next_slice_index, retries_so_far);

    ctx.register_pending(
        client_order_id.clone(),
        next_slice_index,
        slice_qty,
        price,
        now_ms,
        retries_so_far,
    );

    let mut metadata = serde_json::json!({
        "slice_index": next_slice_index,
        "retry_count": retries_so_far,
    });
    if let (Some(meta), Some(extra)) = (metadata.as_object_mut(), slice_metadata.as_object()) {
        for (k, v) in extra {
            meta.insert(k.clone(), v.clone());
        }
    }

    ExecutorAction::PlaceOrder {
        client_order_id,
        instrument: ctx.intent.instrument.clone(),
        side: ctx.intent.side,
        offset: ctx.intent.offset,
        price,
        qty: slice_qty,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctp_mapping::{Offset, Side};
    use crate::intent::{Algo, Urgency};

    fn intent() -> Intent {
        Intent {
            strategy_id: "s".into(),
            decision_hash: "h".into(),
            instrument: "rb2501".into(),
            side: Side::Buy,
            offset: Offset::Open,
            target_qty: 100,
            algo: Algo::Twap,
            urgency: Urgency::Normal,
            limit_price: None,
            signal_ts: 0,
            expiry_ts: None,
        }
    }

    fn ctx_with_one_slice() -> PlanContext {
        let slice = Slice {
            index: 0,
            qty: 100,
            target_price: None,
            scheduled_ts: 0,
            executed: false,
            metadata: serde_json::Value::Null,
        };
        let mut ctx = PlanContext::new("p1".into(), intent(), vec![slice], 0);
        ctx.transition(PlanStatus::Running, 0).unwrap();
        ctx
    }

    #[test]
    fn terminal_states_are_monotonic() {
        let mut ctx = ctx_with_one_slice();
        ctx.transition(PlanStatus::Completed, 10).unwrap();
        assert!(ctx.transition(PlanStatus::Running, 20).is_err());
        assert_eq!(ctx.status, PlanStatus::Completed);
    }

    #[test]
    fn fill_completes_plan_when_target_reached() {
        let mut ctx = ctx_with_one_slice();
        ctx.register_pending("p1-0-0".into(), 0, 100, None, 0, 0);
        ctx.apply_event(
            &OrderEvent {
                client_order_id: "p1-0-0".into(),
                kind: OrderEventKind::Fill,
                filled_qty: 100,
                filled_price: Some(Decimal::from(4000)),
                remaining_qty: 0,
                error_code: None,
                error_msg: None,
                exchange_order_id: None,
                ts: 1,
            },
            3,
            1,
        );
        assert_eq!(ctx.status, PlanStatus::Completed);
        assert_eq!(ctx.total_filled(), 100);
        assert_eq!(ctx.avg_price(), Some(Decimal::from(4000)));
    }

    #[test]
    fn reject_resets_slice_for_retry() {
        let mut ctx = ctx_with_one_slice();
        ctx.register_pending("p1-0-0".into(), 0, 100, None, 0, 0);
        ctx.apply_event(
            &OrderEvent {
                client_order_id: "p1-0-0".into(),
                kind: OrderEventKind::Reject,
                filled_qty: 0,
                filled_price: None,
                remaining_qty: 100,
                error_code: Some("REJECTED".into()),
                error_msg: None,
                exchange_order_id: None,
                ts: 1,
            },
            3,
            1,
        );
        assert!(!ctx.slices[0].executed);
        assert_eq!(ctx.retry_counts.get(&0), Some(&1));
        assert_eq!(ctx.status, PlanStatus::Running);
    }

    #[test]
    fn retry_limit_exceeded_fails_plan() {
        let mut ctx = ctx_with_one_slice();
        for attempt in 0..3u32 {
            ctx.register_pending(format!("p1-0-{attempt}"), 0, 100, None, 0, attempt);
            ctx.apply_event(
                &OrderEvent {
                    client_order_id: format!("p1-0-{attempt}"),
                    kind: OrderEventKind::Reject,
                    filled_qty: 0,
                    filled_price: None,
                    remaining_qty: 100,
                    error_code: None,
                    error_msg: None,
                    exchange_order_id: None,
                    ts: attempt as i64,
                },
                3,
                attempt as i64,
            );
        }
        assert_eq!(ctx.status, PlanStatus::Failed);
        assert_eq!(ctx.error.as_deref(), Some("retry limit exceeded"));
    }

    #[test]
    fn timeout_detection() {
        let mut ctx = ctx_with_one_slice();
        ctx.register_pending("p1-0-0".into(), 0, 100, None, 0, 0);
        assert!(ctx.find_timed_out_order(31_000, 30.0).is_some());
        assert!(ctx.find_timed_out_order(1_000, 30.0).is_none());
    }
}

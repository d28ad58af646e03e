//! Execution Engine (C10, spec.md §4.5): the single façade the strategy
//! layer and the broker-event callback both drive. Owns intent
//! deduplication, executor selection, plan bookkeeping, and audit emission;
//! delegates all slicing/retry/FSM logic to the selected [`ExecutorHandle`].

use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::audit::{AuditEvent, AuditEventType, AuditSink, NoopAuditSink};
use crate::error::PipelineError;
use crate::executor::{
    Executor, ExecutorAction, ExecutorHandle, IcebergExecutor, OrderEvent, PlanStatus, TwapExecutor,
    VwapExecutor,
};
use crate::intent::{Algo, Intent, Urgency};
use crate::intent_registry::IntentRegistry;

/// `Arc<dyn Fn...>` rather than a trait: one-shot predicate callbacks don't
/// warrant a named trait, and this is the shape the teacher's own config
/// hooks use for optional cost/risk gates.
pub type CostCheckFn = Arc<dyn Fn(&Intent) -> bool + Send + Sync>;

fn default_cost_check() -> CostCheckFn {
    Arc::new(|_intent: &Intent| true)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub enable_audit: bool,
    pub enable_cost_check: bool,
    pub default_timeout_seconds: f64,
    pub max_concurrent_plans: usize,
    pub retry_count: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_audit: true,
            enable_cost_check: false,
            default_timeout_seconds: 30.0,
            max_concurrent_plans: 100,
            retry_count: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanSummaryStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlanSummary {
    pub plan_id: String,
    pub intent_id: String,
    pub algo: Algo,
    pub slice_count: usize,
    pub status: PlanSummaryStatus,
    pub filled_qty: u64,
    pub avg_price: Option<Decimal>,
    pub start_ts: i64,
    pub end_ts: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStatistics {
    pub intents_submitted: u64,
    pub intents_rejected: u64,
    pub plans_completed: u64,
    pub plans_failed: u64,
    pub plans_cancelled: u64,
}

struct StatCounters {
    intents_submitted: std::sync::atomic::AtomicU64,
    intents_rejected: std::sync::atomic::AtomicU64,
    plans_completed: std::sync::atomic::AtomicU64,
    plans_failed: std::sync::atomic::AtomicU64,
    plans_cancelled: std::sync::atomic::AtomicU64,
}

impl Default for StatCounters {
    fn default() -> Self {
        Self {
            intents_submitted: std::sync::atomic::AtomicU64::new(0),
            intents_rejected: std::sync::atomic::AtomicU64::new(0),
            plans_completed: std::sync::atomic::AtomicU64::new(0),
            plans_failed: std::sync::atomic::AtomicU64::new(0),
            plans_cancelled: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

/// Selects the executor family for an intent (spec.md §4.5.1). `CRITICAL`
/// urgency always routes to Immediate regardless of the requested algo;
/// POV and ADAPTIVE are substitutions onto VWAP/TWAP since neither has a
/// dedicated executor in this pipeline.
fn select_executor(intent: Intent, now_ms: i64, retry_count: u32, timeout_seconds: f64) -> (ExecutorHandle, Algo) {
    let algo = if intent.urgency == Urgency::Critical {
        Algo::Immediate
    } else {
        intent.algo
    };

    let handle = match algo {
        Algo::Immediate => ExecutorHandle::Immediate(crate::executor::ImmediateExecutor::new(
            crate::executor::ImmediateConfig {
                retry_count,
                timeout_seconds,
            },
        )),
        Algo::Twap | Algo::Adaptive => ExecutorHandle::Twap(TwapExecutor::new(crate::executor::TwapConfig {
            retry_count,
            timeout_seconds,
            ..Default::default()
        })),
        Algo::Vwap | Algo::Pov => ExecutorHandle::Vwap(VwapExecutor::new(crate::executor::VwapConfig {
            retry_count,
            timeout_seconds,
            ..Default::default()
        })),
        Algo::Iceberg => ExecutorHandle::Iceberg(IcebergExecutor::new(crate::executor::IcebergConfig {
            retry_count,
            timeout_seconds,
            ..Default::default()
        })),
    };
    let _ = (intent, now_ms);
    (handle, algo)
}

/// Owns `IntentRegistry`, one `ExecutorHandle` per plan, and the
/// plan-summary cache the engine exposes to queries. The strategy layer
/// calls `submit`; a driver loop calls `get_next_action`; a broker-callback
/// task calls `on_order_event`.
pub struct ExecutionEngine {
    config: EngineConfig,
    registry: IntentRegistry,
    executors: DashMap<String, ExecutorHandle>,
    summaries: DashMap<String, ExecutionPlanSummary>,
    audit: Arc<dyn AuditSink>,
    cost_check: CostCheckFn,
    stats: StatCounters,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: IntentRegistry::new(),
            executors: DashMap::new(),
            summaries: DashMap::new(),
            audit: Arc::new(NoopAuditSink),
            cost_check: default_cost_check(),
            stats: StatCounters::default(),
        }
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn with_cost_check(mut self, cost_check: CostCheckFn) -> Self {
        self.cost_check = cost_check;
        self
    }

    fn emit(&self, event_type: AuditEventType, ts: i64, payload: serde_json::Value) -> AuditEvent {
        let event = AuditEvent::new(event_type, ts, payload);
        if self.config.enable_audit {
            self.audit.emit(event.clone());
        }
        event
    }

    pub fn submit(&self, intent: Intent, now_ms: i64) -> Result<String, PipelineError> {
        let intent_id = intent.intent_id();

        if self.registry.is_registered(&intent_id) {
            self.emit(
                AuditEventType::IntentRejected,
                now_ms,
                json!({"reason": "DUPLICATE"}),
            )
            .with_intent(&intent_id);
            self.stats.intents_rejected.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Err(PipelineError::DuplicateIntent { intent_id });
        }

        if intent.is_expired(now_ms) {
            self.emit(
                AuditEventType::IntentRejected,
                now_ms,
                json!({"reason": "EXPIRED"}),
            )
            .with_intent(&intent_id);
            self.stats.intents_rejected.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Err(PipelineError::ExpiredIntent {
                intent_id,
                expiry_ts: intent.expiry_ts.unwrap_or(now_ms),
                now: now_ms,
            });
        }

        if self.config.enable_cost_check && !(self.cost_check)(&intent) {
            self.emit(
                AuditEventType::IntentRejected,
                now_ms,
                json!({"reason": "COST_CHECK_FAILED"}),
            )
            .with_intent(&intent_id);
            self.stats.intents_rejected.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Err(PipelineError::CostCheckFailed { intent_id });
        }

        if self.active_plan_count() >= self.config.max_concurrent_plans {
            self.emit(
                AuditEventType::IntentRejected,
                now_ms,
                json!({"reason": "MAX_CONCURRENT"}),
            )
            .with_intent(&intent_id);
            self.stats.intents_rejected.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Err(PipelineError::MaxConcurrentPlans {
                limit: self.config.max_concurrent_plans,
            });
        }

        self.registry.register(&intent_id, now_ms)?;
        self.stats.intents_submitted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.emit(AuditEventType::IntentCreated, now_ms, json!({})).with_intent(&intent_id);

        let (handle, algo) = select_executor(
            intent.clone(),
            now_ms,
            self.config.retry_count,
            self.config.default_timeout_seconds,
        );
        let plan_id = handle.make_plan(intent, now_ms);
        let slice_count = handle.slice_count(&plan_id);

        self.emit(
            AuditEventType::PlanCreated,
            now_ms,
            json!({"sliceCount": slice_count, "algo": algo}),
        )
        .with_intent(&intent_id)
        .with_plan(&plan_id);

        self.summaries.insert(
            plan_id.clone(),
            ExecutionPlanSummary {
                plan_id: plan_id.clone(),
                intent_id,
                algo,
                slice_count,
                status: PlanSummaryStatus::Pending,
                filled_qty: 0,
                avg_price: None,
                start_ts: now_ms,
                end_ts: None,
            },
        );
        self.executors.insert(plan_id.clone(), handle);

        Ok(plan_id)
    }

    pub fn get_next_action(&self, plan_id: &str, now_ms: i64) -> Result<ExecutorAction, PipelineError> {
        let handle = self
            .executors
            .get(plan_id)
            .ok_or_else(|| PipelineError::UnknownPlan { plan_id: plan_id.to_string() })?;
        let was_pending = handle.status(plan_id) == Some(PlanStatus::Pending);
        let action = handle.next_action(plan_id, now_ms);
        drop(handle);

        match &action {
            ExecutorAction::PlaceOrder { client_order_id, qty, .. } => {
                if was_pending {
                    if let Some(mut summary) = self.summaries.get_mut(plan_id) {
                        summary.status = PlanSummaryStatus::Active;
                    }
                }
                self.emit(
                    AuditEventType::SliceSent,
                    now_ms,
                    json!({"clientOrderId": client_order_id, "qty": qty}),
                )
                .with_plan(plan_id)
                .with_client_order_id(client_order_id);
            }
            ExecutorAction::CancelOrder { client_order_id, reason } => {
                self.emit(
                    AuditEventType::SliceCancelled,
                    now_ms,
                    json!({"reason": reason}),
                )
                .with_plan(plan_id)
                .with_client_order_id(client_order_id);
            }
            ExecutorAction::Complete => {
                if !self.is_already_finalized(plan_id) {
                    self.finalize_completed(plan_id, now_ms);
                }
            }
            ExecutorAction::Abort { reason } => {
                if !self.is_already_finalized(plan_id) {
                    self.finalize_failed(plan_id, reason, now_ms);
                }
            }
            ExecutorAction::Wait { .. } => {}
        }

        Ok(action)
    }

    fn finalize_completed(&self, plan_id: &str, now_ms: i64) {
        self.registry_mark_completed_for(plan_id);
        self.stats.plans_completed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (filled_qty, avg_price, intent_id) = self
            .executors
            .get(plan_id)
            .map(|h| {
                let progress = h.progress(plan_id);
                (
                    progress.map(|p| p.filled_qty).unwrap_or(0),
                    h.avg_price(plan_id),
                    self.summaries.get(plan_id).map(|s| s.intent_id.clone()).unwrap_or_default(),
                )
            })
            .unwrap_or((0, None, String::new()));

        if let Some(mut summary) = self.summaries.get_mut(plan_id) {
            summary.status = PlanSummaryStatus::Completed;
            summary.filled_qty = filled_qty;
            summary.avg_price = avg_price;
            summary.end_ts = Some(now_ms);
        }

        self.emit(
            AuditEventType::IntentCompleted,
            now_ms,
            json!({"filledQty": filled_qty, "avgPrice": avg_price}),
        )
        .with_intent(&intent_id)
        .with_plan(plan_id);
    }

    fn finalize_failed(&self, plan_id: &str, error: &str, now_ms: i64) {
        self.registry_mark_failed_for(plan_id);
        self.stats.plans_failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (filled_qty, target_qty, intent_id) = self
            .executors
            .get(plan_id)
            .map(|h| {
                let progress = h.progress(plan_id);
                (
                    progress.map(|p| p.filled_qty).unwrap_or(0),
                    progress.map(|p| p.target_qty).unwrap_or(0),
                    self.summaries.get(plan_id).map(|s| s.intent_id.clone()).unwrap_or_default(),
                )
            })
            .unwrap_or((0, 0, String::new()));

        if let Some(mut summary) = self.summaries.get_mut(plan_id) {
            summary.status = PlanSummaryStatus::Failed;
            summary.filled_qty = filled_qty;
            summary.end_ts = Some(now_ms);
        }

        self.emit(
            AuditEventType::IntentFailed,
            now_ms,
            json!({
                "filledQty": filled_qty,
                "remainingQty": target_qty.saturating_sub(filled_qty),
                "errorMsg": error,
            }),
        )
        .with_intent(&intent_id)
        .with_plan(plan_id);
    }

    fn registry_mark_completed_for(&self, plan_id: &str) {
        if let Some(summary) = self.summaries.get(plan_id) {
            self.registry.mark_completed(&summary.intent_id);
        }
    }

    fn registry_mark_failed_for(&self, plan_id: &str) {
        if let Some(summary) = self.summaries.get(plan_id) {
            self.registry.mark_failed(&summary.intent_id);
        }
    }

    pub fn on_order_event(&self, plan_id: &str, event: OrderEvent, now_ms: i64) -> Result<(), PipelineError> {
        let handle = self
            .executors
            .get(plan_id)
            .ok_or_else(|| PipelineError::UnknownPlan { plan_id: plan_id.to_string() })?;
        let client_order_id = event.client_order_id.clone();
        let kind = event.kind.clone();
        handle.on_event(plan_id, event.clone(), now_ms);
        let became_completed = handle.status(plan_id) == Some(PlanStatus::Completed);
        drop(handle);

        use crate::executor::OrderEventKind::*;
        let event_type = match kind {
            Ack => AuditEventType::SliceAck,
            PartialFill | Fill => AuditEventType::SliceFilled,
            Reject => AuditEventType::SliceRejected,
            CancelAck => AuditEventType::SliceCancelled,
            CancelReject => AuditEventType::SliceAck,
        };
        self.emit(
            event_type,
            now_ms,
            json!({
                "filledQty": event.filled_qty,
                "partial": matches!(kind, PartialFill),
            }),
        )
        .with_plan(plan_id)
        .with_client_order_id(&client_order_id);

        if became_completed && !self.is_already_finalized(plan_id) {
            self.finalize_completed(plan_id, now_ms);
        }

        Ok(())
    }

    fn is_already_finalized(&self, plan_id: &str) -> bool {
        self.summaries
            .get(plan_id)
            .map(|s| {
                matches!(
                    s.status,
                    PlanSummaryStatus::Completed | PlanSummaryStatus::Failed | PlanSummaryStatus::Cancelled
                )
            })
            .unwrap_or(false)
    }

    pub fn pause(&self, plan_id: &str, now_ms: i64) -> Result<(), PipelineError> {
        let ok = self
            .executors
            .get(plan_id)
            .ok_or_else(|| PipelineError::UnknownPlan { plan_id: plan_id.to_string() })?
            .pause(plan_id, now_ms);
        if ok {
            self.emit(AuditEventType::PlanPaused, now_ms, json!({})).with_plan(plan_id);
        }
        Ok(())
    }

    pub fn resume(&self, plan_id: &str, now_ms: i64) -> Result<(), PipelineError> {
        let ok = self
            .executors
            .get(plan_id)
            .ok_or_else(|| PipelineError::UnknownPlan { plan_id: plan_id.to_string() })?
            .resume(plan_id, now_ms);
        if ok {
            self.emit(AuditEventType::PlanResumed, now_ms, json!({})).with_plan(plan_id);
        }
        Ok(())
    }

    pub fn cancel(&self, plan_id: &str, reason: &str, now_ms: i64) -> Result<(), PipelineError> {
        let ok = self
            .executors
            .get(plan_id)
            .ok_or_else(|| PipelineError::UnknownPlan { plan_id: plan_id.to_string() })?
            .cancel(plan_id, reason, now_ms);
        if ok {
            self.stats.plans_cancelled.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.registry_mark_failed_for(plan_id);
            if let Some(mut summary) = self.summaries.get_mut(plan_id) {
                summary.status = PlanSummaryStatus::Cancelled;
                summary.end_ts = Some(now_ms);
            }
            self.emit(
                AuditEventType::PlanCancelled,
                now_ms,
                json!({"reason": reason}),
            )
            .with_plan(plan_id);
        }
        Ok(())
    }

    pub fn get_plan(&self, plan_id: &str) -> Option<ExecutionPlanSummary> {
        self.summaries.get(plan_id).map(|s| s.clone())
    }

    pub fn get_progress(&self, plan_id: &str) -> Option<crate::executor::ExecutionProgress> {
        self.executors.get(plan_id).and_then(|h| h.progress(plan_id))
    }

    pub fn get_active_plans(&self) -> Vec<String> {
        self.summaries
            .iter()
            .filter(|e| matches!(e.status, PlanSummaryStatus::Pending | PlanSummaryStatus::Active))
            .map(|e| e.plan_id.clone())
            .collect()
    }

    fn active_plan_count(&self) -> usize {
        self.summaries
            .iter()
            .filter(|e| matches!(e.status, PlanSummaryStatus::Pending | PlanSummaryStatus::Active))
            .count()
    }

    pub fn get_pending_cancel_orders(&self, plan_id: &str) -> Vec<String> {
        self.executors
            .get(plan_id)
            .map(|h| h.pending_cancel_orders(plan_id))
            .unwrap_or_default()
    }

    pub fn is_intent_registered(&self, intent_id: &str) -> bool {
        self.registry.is_registered(intent_id)
    }

    pub fn statistics(&self) -> EngineStatistics {
        use std::sync::atomic::Ordering::Relaxed;
        EngineStatistics {
            intents_submitted: self.stats.intents_submitted.load(Relaxed),
            intents_rejected: self.stats.intents_rejected.load(Relaxed),
            plans_completed: self.stats.plans_completed.load(Relaxed),
            plans_failed: self.stats.plans_failed.load(Relaxed),
            plans_cancelled: self.stats.plans_cancelled.load(Relaxed),
        }
    }
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        info!("execution engine initialized with default config");
        Self::new(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::ctp_mapping::{Offset, Side};

    fn intent(strategy_id: &str, algo: Algo, urgency: Urgency) -> Intent {
        Intent {
            strategy_id: strategy_id.into(),
            decision_hash: "h".into(),
            instrument: "rb2501".into(),
            side: Side::Buy,
            offset: Offset::Open,
            target_qty: 100,
            algo,
            urgency,
            limit_price: None,
            signal_ts: 0,
            expiry_ts: None,
        }
    }

    #[test]
    fn submit_registers_and_creates_plan() {
        let sink = Arc::new(MemoryAuditSink::new());
        let engine = ExecutionEngine::new(EngineConfig::default()).with_audit_sink(sink.clone());
        let plan_id = engine.submit(intent("s1", Algo::Twap, Urgency::Normal), 0).unwrap();
        assert!(engine.get_plan(&plan_id).is_some());
        assert!(!sink.is_empty());
    }

    #[test]
    fn duplicate_submit_is_rejected() {
        let engine = ExecutionEngine::new(EngineConfig::default());
        let i = intent("s1", Algo::Twap, Urgency::Normal);
        engine.submit(i.clone(), 0).unwrap();
        let err = engine.submit(i, 1).unwrap_err();
        assert_eq!(err.error_code(), "DUPLICATE_INTENT");
    }

    #[test]
    fn expired_intent_is_rejected() {
        let engine = ExecutionEngine::new(EngineConfig::default());
        let mut i = intent("s1", Algo::Twap, Urgency::Normal);
        i.expiry_ts = Some(100);
        let err = engine.submit(i, 200).unwrap_err();
        assert_eq!(err.error_code(), "EXPIRED_INTENT");
    }

    #[test]
    fn cost_check_failure_rejects_submission() {
        let engine = ExecutionEngine::new(EngineConfig {
            enable_cost_check: true,
            ..EngineConfig::default()
        })
        .with_cost_check(Arc::new(|_| false));
        let err = engine.submit(intent("s1", Algo::Twap, Urgency::Normal), 0).unwrap_err();
        assert_eq!(err.error_code(), "COST_CHECK_FAILED");
    }

    #[test]
    fn max_concurrent_plans_rejects_once_at_limit() {
        let engine = ExecutionEngine::new(EngineConfig {
            max_concurrent_plans: 1,
            ..EngineConfig::default()
        });
        engine.submit(intent("s1", Algo::Twap, Urgency::Normal), 0).unwrap();
        let err = engine.submit(intent("s2", Algo::Twap, Urgency::Normal), 0).unwrap_err();
        assert_eq!(err.error_code(), "MAX_CONCURRENT");
    }

    #[test]
    fn critical_urgency_routes_to_immediate_regardless_of_algo() {
        let engine = ExecutionEngine::new(EngineConfig::default());
        let plan_id = engine.submit(intent("s1", Algo::Vwap, Urgency::Critical), 0).unwrap();
        assert_eq!(engine.get_plan(&plan_id).unwrap().algo, Algo::Immediate);
    }

    #[test]
    fn pov_substitutes_onto_vwap_executor() {
        let engine = ExecutionEngine::new(EngineConfig::default());
        let plan_id = engine.submit(intent("s1", Algo::Pov, Urgency::Normal), 0).unwrap();
        assert_eq!(engine.get_plan(&plan_id).unwrap().algo, Algo::Vwap);
    }

    #[test]
    fn full_fill_completes_plan_and_updates_registry() {
        let engine = ExecutionEngine::new(EngineConfig::default());
        let plan_id = engine.submit(intent("s1", Algo::Immediate, Urgency::Normal), 0).unwrap();
        let action = engine.get_next_action(&plan_id, 0).unwrap();
        let client_order_id = match action {
            ExecutorAction::PlaceOrder { client_order_id, .. } => client_order_id,
            other => panic!("expected PlaceOrder, got {other:?}"),
        };
        engine
            .on_order_event(
                &plan_id,
                OrderEvent {
                    client_order_id,
                    kind: crate::executor::OrderEventKind::Fill,
                    filled_qty: 100,
                    filled_price: Some(Decimal::from(4000)),
                    remaining_qty: 0,
                    error_code: None,
                    error_msg: None,
                    exchange_order_id: None,
                    ts: 1,
                },
                1,
            )
            .unwrap();
        assert_eq!(engine.get_plan(&plan_id).unwrap().status, PlanSummaryStatus::Completed);
        assert_eq!(engine.statistics().plans_completed, 1);
    }
}

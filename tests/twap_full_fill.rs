//! End-to-end scenario 1: TWAP split, full fill, driven entirely through
//! `ExecutionEngine`'s public submit/get_next_action/on_order_event surface
//! (the same calls a driver loop makes), not the executor directly.

use execution_pipeline::audit::{AuditEventType, MemoryAuditSink};
use execution_pipeline::ctp_mapping::{Offset, Side};
use execution_pipeline::engine::{EngineConfig, ExecutionEngine, PlanSummaryStatus};
use execution_pipeline::executor::{ExecutorAction, OrderEvent, OrderEventKind};
use execution_pipeline::intent::{Algo, Intent, Urgency};
use std::sync::Arc;

fn intent() -> Intent {
    Intent {
        strategy_id: "s1".into(),
        decision_hash: "h1".into(),
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

#[test]
fn twap_100_splits_34_33_33_and_completes_via_engine() {
    let sink = Arc::new(MemoryAuditSink::new());
    let engine = ExecutionEngine::new(EngineConfig::default()).with_audit_sink(sink.clone());
    let plan_id = engine.submit(intent(), 0).unwrap();

    let expected = [(0i64, 34u64), (30_000, 33), (60_000, 33)];
    for (now, qty) in expected {
        let action = engine.get_next_action(&plan_id, now).unwrap();
        let client_order_id = match action {
            ExecutorAction::PlaceOrder { client_order_id, qty: got_qty, .. } => {
                assert_eq!(got_qty, qty, "slice quantity mismatch at t={now}");
                client_order_id
            }
            other => panic!("expected PlaceOrder at t={now}, got {other:?}"),
        };
        engine
            .on_order_event(
                &plan_id,
                OrderEvent {
                    client_order_id,
                    kind: OrderEventKind::Fill,
                    filled_qty: qty,
                    filled_price: Some(rust_decimal::Decimal::from(4000)),
                    remaining_qty: 0,
                    error_code: None,
                    error_msg: None,
                    exchange_order_id: None,
                    ts: now,
                },
                now,
            )
            .unwrap();
    }

    let summary = engine.get_plan(&plan_id).unwrap();
    assert_eq!(summary.status, PlanSummaryStatus::Completed);
    assert_eq!(summary.filled_qty, 100);
    assert_eq!(summary.avg_price, Some(rust_decimal::Decimal::from(4000)));

    // Terminal monotonicity: once COMPLETED, further polls only return COMPLETE/ABORT.
    assert!(matches!(
        engine.get_next_action(&plan_id, 90_000).unwrap(),
        ExecutorAction::Complete
    ));

    let completed = sink
        .drain()
        .into_iter()
        .filter(|e| e.event_type == AuditEventType::IntentCompleted)
        .count();
    assert_eq!(completed, 1, "expected exactly one INTENT_COMPLETED audit event");
}

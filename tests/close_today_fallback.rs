//! End-to-end scenario 6: a CLOSETODAY order rejected by the broker must not
//! lose the position — the follow-up plain CLOSE for the same instrument
//! still reaches the broker and fills.

use execution_pipeline::audit::{AuditEventType, MemoryAuditSink};
use execution_pipeline::ctp_mapping::{Offset, Side};
use execution_pipeline::engine::{EngineConfig, ExecutionEngine};
use execution_pipeline::executor::{ExecutorAction, OrderEvent, OrderEventKind};
use execution_pipeline::intent::{Algo, Intent, Urgency};
use std::sync::Arc;

fn intent(offset: Offset, price: i64) -> Intent {
    Intent {
        strategy_id: "s1".into(),
        decision_hash: format!("h-{offset:?}-{price}"),
        instrument: "rb2501".into(),
        side: Side::Sell,
        offset,
        target_qty: 1,
        algo: Algo::Immediate,
        urgency: Urgency::Normal,
        limit_price: Some(rust_decimal::Decimal::from(price)),
        signal_ts: 0,
        expiry_ts: None,
    }
}

#[test]
fn closetoday_rejection_does_not_lose_the_position() {
    let sink = Arc::new(MemoryAuditSink::new());
    let engine = ExecutionEngine::new(EngineConfig::default()).with_audit_sink(sink.clone());

    // First leg: SELL CLOSETODAY qty=1 price=100, broker rejects it.
    let plan_a = engine.submit(intent(Offset::CloseToday, 100), 0).unwrap();
    let action_a = engine.get_next_action(&plan_a, 0).unwrap();
    let client_order_id_a = match action_a {
        ExecutorAction::PlaceOrder { client_order_id, offset, .. } => {
            assert_eq!(offset, Offset::CloseToday);
            client_order_id
        }
        other => panic!("expected PlaceOrder, got {other:?}"),
    };
    engine
        .on_order_event(
            &plan_a,
            OrderEvent {
                client_order_id: client_order_id_a,
                kind: OrderEventKind::Reject,
                filled_qty: 0,
                filled_price: None,
                remaining_qty: 1,
                error_code: Some("CLOSETODAY".to_string()),
                error_msg: Some("closeToday required: position opened today".to_string()),
                exchange_order_id: None,
                ts: 1,
            },
            1,
        )
        .unwrap();

    // Second leg: caller retries with a plain CLOSE, broker accepts and fills.
    let plan_b = engine.submit(intent(Offset::Close, 99), 2).unwrap();
    let action_b = engine.get_next_action(&plan_b, 2).unwrap();
    let client_order_id_b = match action_b {
        ExecutorAction::PlaceOrder { client_order_id, offset, .. } => {
            assert_eq!(offset, Offset::Close);
            client_order_id
        }
        other => panic!("expected PlaceOrder, got {other:?}"),
    };
    engine
        .on_order_event(
            &plan_b,
            OrderEvent {
                client_order_id: client_order_id_b,
                kind: OrderEventKind::Fill,
                filled_qty: 1,
                filled_price: Some(rust_decimal::Decimal::from(99)),
                remaining_qty: 0,
                error_code: None,
                error_msg: None,
                exchange_order_id: Some("X1".to_string()),
                ts: 2,
            },
            2,
        )
        .unwrap();

    assert_eq!(engine.get_plan(&plan_a).unwrap().filled_qty, 0);
    assert_eq!(engine.get_plan(&plan_b).unwrap().filled_qty, 1);

    let events = sink.drain();
    let rejected = events
        .iter()
        .filter(|e| e.event_type == AuditEventType::SliceRejected)
        .count();
    let filled = events
        .iter()
        .filter(|e| e.event_type == AuditEventType::SliceFilled)
        .count();
    assert_eq!(rejected, 1, "expected exactly one SliceRejected for the CLOSETODAY leg");
    assert_eq!(filled, 1, "expected exactly one SliceFilled for the retried CLOSE leg");
}

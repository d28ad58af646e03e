//! Audit Event Stream (C11, spec.md §4.11): a strongly-typed, time-ordered
//! record of every meaningful state transition. Emission must never block
//! the emitter, so the sink hands events to a `crossbeam_channel` and a
//! separate drain loop (or test harness) consumes them.

use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    IntentCreated,
    IntentRejected,
    IntentCompleted,
    IntentFailed,
    PlanCreated,
    PlanPaused,
    PlanResumed,
    PlanCancelled,
    SliceSent,
    SliceAck,
    SliceFilled,
    SliceRejected,
    SliceCancelled,
    ConfirmationStarted,
    ConfirmationLevelDetermined,
    ConfirmationSoft,
    ConfirmationHard,
    ConfirmationDegraded,
    ConfirmationCircuitBreak,
    ConfirmationCompleted,
    CircuitBreakerCheck,
    CircuitBreakerBlocked,
    CircuitBreakerTrigger,
    FallbackExecute,
    Var,
    Margin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub ts: i64,
    pub intent_id: Option<String>,
    pub plan_id: Option<String>,
    pub client_order_id: Option<String>,
    pub slice_index: Option<usize>,
    pub payload: Value,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, ts: i64, payload: Value) -> Self {
        Self {
            event_type,
            ts,
            intent_id: None,
            plan_id: None,
            client_order_id: None,
            slice_index: None,
            payload,
        }
    }

    pub fn with_intent(mut self, intent_id: impl Into<String>) -> Self {
        self.intent_id = Some(intent_id.into());
        self
    }

    pub fn with_plan(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }

    pub fn with_client_order_id(mut self, client_order_id: impl Into<String>) -> Self {
        self.client_order_id = Some(client_order_id.into());
        self
    }

    pub fn with_slice_index(mut self, slice_index: usize) -> Self {
        self.slice_index = Some(slice_index);
        self
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Non-blocking emission point. `emit` never awaits or locks anything the
/// pipeline holds; a full channel degrades to a dropped event plus a warn
/// log rather than backpressure into the caller.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

pub struct ChannelAuditSink {
    sender: Sender<AuditEvent>,
}

impl ChannelAuditSink {
    pub fn unbounded() -> (Self, Receiver<AuditEvent>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self { sender }, receiver)
    }
}

impl AuditSink for ChannelAuditSink {
    fn emit(&self, event: AuditEvent) {
        if self.sender.try_send(event).is_err() {
            warn!("audit channel full or disconnected, dropping event");
        }
    }
}

/// In-memory sink for tests and for drain loops that want to batch-forward
/// to an external store (NATS, a log file) on their own schedule.
pub struct MemoryAuditSink {
    events: parking_lot::Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self {
            events: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn drain(&self) -> Vec<AuditEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

/// Explicit no-op default for callers that haven't wired a sink yet —
/// spec.md §9 calls for explicit no-op defaults over null checks scattered
/// through the call sites.
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn emit(&self, _event: AuditEvent) {}
}

/// Republishes events onto NATS for an external collaborator to persist —
/// the teacher's one legitimate remaining use of `async-nats` once the
/// crypto-exchange wiring is gone. `emit` must not await, so it hands the
/// event to an unbounded `tokio::mpsc` channel; a spawned task owns the
/// client and does the actual publish.
pub struct NatsAuditSink {
    sender: tokio::sync::mpsc::UnboundedSender<AuditEvent>,
}

impl NatsAuditSink {
    pub fn spawn(client: async_nats::Client, subject: &'static str) -> Self {
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel::<AuditEvent>();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                match serde_json::to_vec(&event) {
                    Ok(payload) => {
                        if let Err(e) = client.publish(subject, payload.into()).await {
                            warn!("failed to publish audit event to nats: {}", e);
                        }
                    }
                    Err(e) => warn!("failed to serialize audit event: {}", e),
                }
            }
        });
        Self { sender }
    }
}

impl AuditSink for NatsAuditSink {
    fn emit(&self, event: AuditEvent) {
        if self.sender.send(event).is_err() {
            warn!("nats audit sink task gone, dropping event");
        }
    }
}

/// Drains a channel-backed sink's receiver until empty, forwarding each
/// event to a downstream sink (e.g. a NATS publisher). Intended to run on
/// its own task/thread outside the engine's hot path.
pub fn drain_into(receiver: &Receiver<AuditEvent>, downstream: &dyn AuditSink) -> usize {
    let mut count = 0;
    loop {
        match receiver.try_recv() {
            Ok(event) => {
                downstream.emit(event);
                count += 1;
            }
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_sink_records_events_in_order() {
        let sink = MemoryAuditSink::new();
        sink.emit(AuditEvent::new(AuditEventType::IntentCreated, 1, json!({})).with_intent("i1"));
        sink.emit(AuditEvent::new(AuditEventType::PlanCreated, 2, json!({})).with_plan("i1"));
        let events = sink.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, AuditEventType::IntentCreated);
        assert_eq!(events[1].event_type, AuditEventType::PlanCreated);
        assert!(sink.is_empty());
    }

    #[test]
    fn channel_sink_drains_into_downstream() {
        let (sink, receiver) = ChannelAuditSink::unbounded();
        sink.emit(AuditEvent::new(AuditEventType::SliceSent, 1, json!({"qty": 10})));
        sink.emit(AuditEvent::new(AuditEventType::SliceAck, 2, json!({})));
        let downstream = MemoryAuditSink::new();
        let drained = drain_into(&receiver, &downstream);
        assert_eq!(drained, 2);
        assert_eq!(downstream.len(), 2);
    }
}

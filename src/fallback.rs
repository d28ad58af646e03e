//! Fallback Executor (C9, spec.md §4.10).
//!
//! Grounded on `original_source/V4PRO/src/execution/fallback/fallback_executor.py`'s
//! `FallbackExecutor`/`ManualQueue`. `fallback_manager.py` (the level-holder
//! `FallbackExecutor` delegates to) is not present in the retrieval pack, so
//! `FallbackManager` here is reconstructed directly from spec.md §4.10's
//! level policy table rather than transliterated from a source file.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::audit::{now_ms, AuditEvent, AuditEventType, AuditSink, NoopAuditSink};
use crate::ctp_mapping::Offset;
use crate::intent::Algo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FallbackLevel {
    Normal,
    Graceful,
    Reduced,
    Manual,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Normal,
    Graceful,
    Reduced,
    Queued,
    CloseOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    pub manual_queue_size: usize,
    pub graceful_volume_scale: f64,
    pub reduced_volume_scale: f64,
    pub reduced_max_participation_rate: f64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            manual_queue_size: 100,
            graceful_volume_scale: 0.75,
            reduced_volume_scale: 0.5,
            reduced_max_participation_rate: 0.05,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub order_id: String,
    pub instrument: String,
    pub side: crate::ctp_mapping::Side,
    pub offset: Offset,
    pub volume: u64,
    pub price: rust_decimal::Decimal,
    pub algorithm: Algo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub success: bool,
    pub order_id: String,
    pub mode: ExecutionMode,
    pub adjusted_volume: u64,
    pub adjusted_algorithm: Option<Algo>,
    pub message: String,
    pub queued: bool,
    pub requires_confirmation: bool,
}

impl ExecutionResponse {
    fn ok(order_id: &str, mode: ExecutionMode, volume: u64, algo: Option<Algo>, message: &str) -> Self {
        Self {
            success: true,
            order_id: order_id.to_string(),
            mode,
            adjusted_volume: volume,
            adjusted_algorithm: algo,
            message: message.to_string(),
            queued: false,
            requires_confirmation: false,
        }
    }

    fn fail(order_id: &str, mode: ExecutionMode, message: &str) -> Self {
        Self {
            success: false,
            order_id: order_id.to_string(),
            mode,
            adjusted_volume: 0,
            adjusted_algorithm: None,
            message: message.to_string(),
            queued: false,
            requires_confirmation: false,
        }
    }
}

/// Downgrades `AGGRESSIVE`/`VWAP` toward `TWAP`, then `TWAP` toward
/// `ICEBERG`; `ICEBERG` is already the most conservative and stays put.
fn downgrade_algorithm(algo: Algo) -> Algo {
    match algo {
        Algo::Vwap | Algo::Pov | Algo::Adaptive => Algo::Twap,
        Algo::Twap | Algo::Immediate => Algo::Iceberg,
        Algo::Iceberg => Algo::Iceberg,
    }
}

#[derive(Debug, Default, serde::Serialize)]
pub struct ExecutionStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub queued: u64,
    pub rejected: u64,
}

/// Bounded FIFO of OPEN requests awaiting human review. `enqueue` fails
/// (returns false) rather than blocking when full.
pub struct ManualQueue {
    queue: ArrayQueue<ExecutionRequest>,
}

impl ManualQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: ArrayQueue::new(max_size.max(1)),
        }
    }

    pub fn enqueue(&self, request: ExecutionRequest) -> bool {
        self.queue.push(request).is_ok()
    }

    pub fn dequeue(&self) -> Option<ExecutionRequest> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Holds the current system-wide fallback level and the policy knobs that
/// shape how `FallbackExecutor` reshapes requests at each level.
pub struct FallbackManager {
    level: Mutex<FallbackLevel>,
    config: FallbackConfig,
    success_count: AtomicU64,
    failure_count: AtomicU64,
}

impl FallbackManager {
    pub fn new(config: FallbackConfig) -> Self {
        Self {
            level: Mutex::new(FallbackLevel::Normal),
            config,
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
        }
    }

    pub fn current_level(&self) -> FallbackLevel {
        *self.level.lock()
    }

    pub fn set_level(&self, level: FallbackLevel) {
        let mut current = self.level.lock();
        if *current != level {
            info!(from = ?*current, to = ?level, "fallback level changed");
        }
        *current = level;
    }

    pub fn is_operation_allowed(&self, operation: &str) -> bool {
        match (*self.level.lock(), operation) {
            (FallbackLevel::Reduced, "new_order") => false,
            _ => true,
        }
    }

    pub fn adjusted_volume(&self, level: FallbackLevel, volume: u64) -> u64 {
        let scale = match level {
            FallbackLevel::Graceful => self.config.graceful_volume_scale,
            FallbackLevel::Reduced => self.config.reduced_volume_scale,
            _ => 1.0,
        };
        ((volume as f64) * scale).round().max(1.0) as u64
    }

    pub fn report_success(&self) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Reshapes `ExecutionRequest`s according to the manager's current level
/// before handing them to the broker, per spec.md §4.10.
pub struct FallbackExecutor {
    manager: std::sync::Arc<FallbackManager>,
    manual_queue: ManualQueue,
    stats: Mutex<ExecutionStats>,
    audit: Arc<dyn AuditSink>,
}

impl FallbackExecutor {
    pub fn new(manager: std::sync::Arc<FallbackManager>) -> Self {
        let queue_size = manager.config.manual_queue_size;
        Self {
            manager,
            manual_queue: ManualQueue::new(queue_size),
            stats: Mutex::new(ExecutionStats::default()),
            audit: Arc::new(NoopAuditSink),
        }
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn manual_queue(&self) -> &ManualQueue {
        &self.manual_queue
    }

    pub fn stats(&self) -> ExecutionStats {
        let s = self.stats.lock();
        ExecutionStats {
            total: s.total,
            success: s.success,
            failed: s.failed,
            queued: s.queued,
            rejected: s.rejected,
        }
    }

    pub fn execute(&self, request: ExecutionRequest) -> ExecutionResponse {
        self.stats.lock().total += 1;
        let level = self.manager.current_level();
        let order_id = request.order_id.clone();
        let response = match level {
            FallbackLevel::Normal => self.execute_normal(request),
            FallbackLevel::Graceful => self.execute_graceful(request),
            FallbackLevel::Reduced => self.execute_reduced(request),
            FallbackLevel::Manual => self.execute_manual(request),
            FallbackLevel::Emergency => self.execute_emergency(request),
        };
        self.audit.emit(
            AuditEvent::new(
                AuditEventType::FallbackExecute,
                now_ms(),
                json!({"level": level, "mode": response.mode, "success": response.success, "queued": response.queued}),
            )
            .with_client_order_id(&order_id),
        );
        response
    }

    fn execute_normal(&self, request: ExecutionRequest) -> ExecutionResponse {
        self.stats.lock().success += 1;
        self.manager.report_success();
        ExecutionResponse::ok(
            &request.order_id,
            ExecutionMode::Normal,
            request.volume,
            Some(request.algorithm),
            "executed in normal mode",
        )
    }

    fn execute_graceful(&self, request: ExecutionRequest) -> ExecutionResponse {
        let adjusted_algorithm = downgrade_algorithm(request.algorithm);
        let adjusted_volume = self.manager.adjusted_volume(FallbackLevel::Graceful, request.volume);
        self.stats.lock().success += 1;
        self.manager.report_success();
        ExecutionResponse::ok(
            &request.order_id,
            ExecutionMode::Graceful,
            adjusted_volume,
            Some(adjusted_algorithm),
            "executed in graceful fallback mode",
        )
    }

    fn execute_reduced(&self, request: ExecutionRequest) -> ExecutionResponse {
        if request.offset == Offset::Open && !self.manager.is_operation_allowed("new_order") {
            self.stats.lock().rejected += 1;
            return ExecutionResponse::fail(
                &request.order_id,
                ExecutionMode::Reduced,
                "new orders not allowed in reduced mode",
            );
        }
        let adjusted_volume = self.manager.adjusted_volume(FallbackLevel::Reduced, request.volume);
        self.stats.lock().success += 1;
        self.manager.report_success();
        ExecutionResponse::ok(
            &request.order_id,
            ExecutionMode::Reduced,
            adjusted_volume,
            Some(Algo::Iceberg),
            "executed in reduced mode",
        )
    }

    fn execute_manual(&self, request: ExecutionRequest) -> ExecutionResponse {
        if request.offset != Offset::Open {
            return self.execute_close_only(request, ExecutionMode::Queued);
        }
        let order_id = request.order_id.clone();
        if self.manual_queue.enqueue(request) {
            self.stats.lock().queued += 1;
            let position = self.manual_queue.len();
            ExecutionResponse {
                success: true,
                order_id,
                mode: ExecutionMode::Queued,
                adjusted_volume: 0,
                adjusted_algorithm: None,
                message: format!("queued for manual review, position {position}"),
                queued: true,
                requires_confirmation: true,
            }
        } else {
            self.stats.lock().rejected += 1;
            ExecutionResponse::fail(&order_id, ExecutionMode::Queued, "manual queue is full")
        }
    }

    fn execute_emergency(&self, request: ExecutionRequest) -> ExecutionResponse {
        if request.offset != Offset::Close && request.offset != Offset::CloseToday {
            self.stats.lock().rejected += 1;
            return ExecutionResponse::fail(
                &request.order_id,
                ExecutionMode::CloseOnly,
                "only close positions allowed in emergency mode",
            );
        }
        self.execute_close_only(request, ExecutionMode::CloseOnly)
    }

    fn execute_close_only(&self, request: ExecutionRequest, mode: ExecutionMode) -> ExecutionResponse {
        self.stats.lock().success += 1;
        ExecutionResponse::ok(&request.order_id, mode, request.volume, None, "close position executed")
    }

    /// Drains the manual queue, re-running each entry under REDUCED rules;
    /// a rejecting `confirm` short-circuits that entry without executing it.
    pub fn process_manual_queue<F: Fn(&ExecutionRequest) -> bool>(
        &self,
        confirm: Option<F>,
    ) -> Vec<ExecutionResponse> {
        let mut results = Vec::new();
        while let Some(request) = self.manual_queue.dequeue() {
            if let Some(confirm) = &confirm {
                if !confirm(&request) {
                    results.push(ExecutionResponse::fail(
                        &request.order_id,
                        ExecutionMode::Queued,
                        "rejected by manual confirmation",
                    ));
                    continue;
                }
            }
            let order_id = request.order_id.clone();
            let response = self.execute_reduced(request);
            self.audit.emit(
                AuditEvent::new(
                    AuditEventType::FallbackExecute,
                    now_ms(),
                    json!({"level": "MANUAL_QUEUE_DRAIN", "mode": response.mode, "success": response.success}),
                )
                .with_client_order_id(&order_id),
            );
            results.push(response);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctp_mapping::Side;
    use rust_decimal::Decimal;

    fn request(order_id: &str, offset: Offset, volume: u64) -> ExecutionRequest {
        ExecutionRequest {
            order_id: order_id.to_string(),
            instrument: "rb2501".to_string(),
            side: Side::Buy,
            offset,
            volume,
            price: Decimal::from(4000),
            algorithm: Algo::Vwap,
        }
    }

    #[test]
    fn normal_mode_passes_through_unmodified() {
        let manager = std::sync::Arc::new(FallbackManager::new(FallbackConfig::default()));
        let executor = FallbackExecutor::new(manager);
        let response = executor.execute(request("o1", Offset::Open, 100));
        assert!(response.success);
        assert_eq!(response.adjusted_volume, 100);
    }

    #[test]
    fn graceful_mode_downgrades_algorithm_and_scales_volume() {
        let manager = std::sync::Arc::new(FallbackManager::new(FallbackConfig::default()));
        manager.set_level(FallbackLevel::Graceful);
        let executor = FallbackExecutor::new(manager);
        let response = executor.execute(request("o2", Offset::Open, 100));
        assert_eq!(response.adjusted_algorithm, Some(Algo::Twap));
        assert_eq!(response.adjusted_volume, 75);
    }

    #[test]
    fn reduced_mode_rejects_new_orders_when_disallowed() {
        let manager = std::sync::Arc::new(FallbackManager::new(FallbackConfig::default()));
        manager.set_level(FallbackLevel::Reduced);
        let executor = FallbackExecutor::new(manager);
        let response = executor.execute(request("o3", Offset::Open, 100));
        assert!(!response.success);
    }

    #[test]
    fn manual_mode_queues_open_and_closes_close_directly() {
        let manager = std::sync::Arc::new(FallbackManager::new(FallbackConfig::default()));
        manager.set_level(FallbackLevel::Manual);
        let executor = FallbackExecutor::new(manager);
        let queued = executor.execute(request("o4", Offset::Open, 10));
        assert!(queued.queued);
        assert!(queued.requires_confirmation);
        let closed = executor.execute(request("o5", Offset::Close, 10));
        assert!(closed.success);
        assert!(!closed.queued);
    }

    #[test]
    fn manual_queue_rejects_once_full() {
        let mut config = FallbackConfig::default();
        config.manual_queue_size = 1;
        let manager = std::sync::Arc::new(FallbackManager::new(config));
        manager.set_level(FallbackLevel::Manual);
        let executor = FallbackExecutor::new(manager);
        assert!(executor.execute(request("o6", Offset::Open, 10)).success);
        assert!(!executor.execute(request("o7", Offset::Open, 10)).success);
    }

    #[test]
    fn emergency_mode_allows_only_close() {
        let manager = std::sync::Arc::new(FallbackManager::new(FallbackConfig::default()));
        manager.set_level(FallbackLevel::Emergency);
        let executor = FallbackExecutor::new(manager);
        assert!(!executor.execute(request("o8", Offset::Open, 10)).success);
        assert!(executor.execute(request("o9", Offset::Close, 10)).success);
    }

    #[test]
    fn process_manual_queue_runs_reduced_after_confirmation() {
        let manager = std::sync::Arc::new(FallbackManager::new(FallbackConfig::default()));
        manager.set_level(FallbackLevel::Manual);
        let executor = FallbackExecutor::new(manager);
        executor.execute(request("o10", Offset::Open, 100));
        let results = executor.process_manual_queue(Some(|_: &ExecutionRequest| true));
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
    }
}

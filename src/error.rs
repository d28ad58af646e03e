//! Closed error surface for the execution pipeline.
//!
//! Every error that crosses the engine boundary is a `PipelineError`. Internal
//! helpers (id parsing, FSM transition guards) may still use `Result<T, String>`
//! the way the teacher's own leaf modules do, but nothing reaches a caller of
//! [`crate::engine::ExecutionEngine`] unchanged.

use thiserror::Error;

use crate::ctp_mapping::CtpMappingError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("intent {intent_id} is already registered")]
    DuplicateIntent { intent_id: String },

    #[error("intent {intent_id} expired at {expiry_ts}, now is {now}")]
    ExpiredIntent {
        intent_id: String,
        expiry_ts: i64,
        now: i64,
    },

    #[error("cost check failed for intent {intent_id}")]
    CostCheckFailed { intent_id: String },

    #[error("max concurrent plans ({limit}) reached")]
    MaxConcurrentPlans { limit: usize },

    #[error("plan {plan_id} exhausted retry limit for slice {slice_index}")]
    RetryLimitExceeded { plan_id: String, slice_index: usize },

    #[error("soft confirmation rejected: {failed_checks:?}")]
    SoftConfirmationRejected { failed_checks: Vec<String> },

    #[error("hard confirmation rejected by user")]
    HardConfirmationRejected,

    #[error("circuit breaker is OPEN, confirmation blocked")]
    CircuitBreakerBlocked,

    #[error("confirmation callback rejected split plan for intent {intent_id}")]
    ConfirmationDeclined { intent_id: String },

    #[error(transparent)]
    Mapping(#[from] CtpMappingError),

    #[error("manual fallback queue is full (capacity {capacity})")]
    ManualQueueFull { capacity: usize },

    #[error("unknown plan id: {plan_id}")]
    UnknownPlan { plan_id: String },

    #[error("malformed client order id: {raw}")]
    MalformedClientOrderId { raw: String },

    #[error("internal invariant violated: {detail}")]
    InvariantViolation { detail: String },
}

impl PipelineError {
    /// Closed string enumeration for the `(errorCode, humanMessage)` contract
    /// external callers (strategy layer, operator API) rely on.
    pub fn error_code(&self) -> &'static str {
        match self {
            PipelineError::DuplicateIntent { .. } => "DUPLICATE_INTENT",
            PipelineError::ExpiredIntent { .. } => "EXPIRED_INTENT",
            PipelineError::CostCheckFailed { .. } => "COST_CHECK_FAILED",
            PipelineError::MaxConcurrentPlans { .. } => "MAX_CONCURRENT",
            PipelineError::RetryLimitExceeded { .. } => "RETRY_LIMIT_EXCEEDED",
            PipelineError::SoftConfirmationRejected { .. } => "SOFT_CONFIRMATION_REJECTED",
            PipelineError::HardConfirmationRejected => "HARD_CONFIRMATION_REJECTED",
            PipelineError::CircuitBreakerBlocked => "M6_CIRCUIT_BREAKER_BLOCK",
            PipelineError::ConfirmationDeclined { .. } => "CONFIRMATION_DECLINED",
            PipelineError::Mapping(_) => "CTP_MAPPING_ERROR",
            PipelineError::ManualQueueFull { .. } => "MANUAL_QUEUE_FULL",
            PipelineError::UnknownPlan { .. } => "UNKNOWN_PLAN",
            PipelineError::MalformedClientOrderId { .. } => "MALFORMED_CLIENT_ORDER_ID",
            PipelineError::InvariantViolation { .. } => "INVARIANT_VIOLATION",
        }
    }
}

//! Risk/VaR Feedback Subsystem (C8, spec.md §4.9): adaptive VaR scheduler
//! and dynamic margin monitor, wired together so margin alerts can force a
//! VaR recompute without either component blocking the execution pipeline.

pub mod adaptive_var;
pub mod margin_monitor;

pub use adaptive_var::{AdaptiveVarConfig, AdaptiveVarScheduler, MarketRegime, VarEventType, VarMethod, VarResult};
pub use margin_monitor::{
    DynamicMarginMonitor, ForceCloseRisk, MarginAlertLevel, MarginCallAlert, MarginCallReason,
    MarginMonitorConfig, MarginRiskAction, MarginUpdateResult,
};

//! Exercises the margin-monitor → fallback-level coupling wired in the
//! process binary: a DANGER-or-above margin alert pushes the fallback
//! manager into REDUCED, and a drop back to SAFE restores NORMAL.

use execution_pipeline::fallback::{FallbackConfig, FallbackLevel, FallbackManager};
use execution_pipeline::risk::{MarginAlertLevel, MarginMonitorConfig};
use std::sync::Arc;

fn apply(monitor: &execution_pipeline::risk::DynamicMarginMonitor, fallback: &FallbackManager, equity: f64, used: f64) {
    let result = monitor.update_margin_status(equity, used, 0.0, None, 1);
    if result.alert_level >= MarginAlertLevel::Danger {
        fallback.set_level(FallbackLevel::Reduced);
    } else if result.level_changed && result.alert_level == MarginAlertLevel::Safe {
        fallback.set_level(FallbackLevel::Normal);
    }
}

#[test]
fn danger_alert_drops_fallback_to_reduced_and_recovers_on_safe() {
    let monitor = execution_pipeline::risk::DynamicMarginMonitor::new(MarginMonitorConfig::default());
    let fallback = Arc::new(FallbackManager::new(FallbackConfig::default()));

    assert_eq!(fallback.current_level(), FallbackLevel::Normal);

    apply(&monitor, &fallback, 1_000_000.0, 100_000.0);
    assert_eq!(fallback.current_level(), FallbackLevel::Normal);

    apply(&monitor, &fallback, 1_000_000.0, 920_000.0);
    assert_eq!(fallback.current_level(), FallbackLevel::Reduced);

    // new orders are rejected while REDUCED disallows them
    assert!(!fallback.is_operation_allowed("new_order"));

    apply(&monitor, &fallback, 1_000_000.0, 50_000.0);
    assert_eq!(fallback.current_level(), FallbackLevel::Normal);
    assert!(fallback.is_operation_allowed("new_order"));
}

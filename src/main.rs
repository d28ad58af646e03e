use std::env;
use std::fs;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use actix_web_prom::PrometheusMetricsBuilder;
use tracing::{error, info, warn, Level};

use execution_pipeline::armed_state::ArmedState;
use execution_pipeline::audit::{AuditEvent, AuditEventType, AuditSink, ChannelAuditSink, NatsAuditSink};
use execution_pipeline::broker::LoggingBroker;
use execution_pipeline::circuit_breaker::{BreakerAwareConfirmation, GlobalBreaker};
use execution_pipeline::confirmation::{
    ConfirmationContext, ConfirmationManager, ConfirmationResult, MarketCondition, SessionType, StrategyType,
};
use execution_pipeline::config::Settings;
use execution_pipeline::engine::ExecutionEngine;
use execution_pipeline::executor::{ExecutorAction, OrderEvent, OrderEventKind};
use execution_pipeline::fallback::{ExecutionRequest, FallbackExecutor, FallbackManager};
use execution_pipeline::intent::Intent;
use execution_pipeline::risk::{AdaptiveVarScheduler, DynamicMarginMonitor};
use execution_pipeline::subjects;

mod admin_api;

fn load_secrets_from_files() {
    const FILE_SUFFIX: &str = "_FILE";

    let vars: Vec<(String, String)> = env::vars().collect();
    for (key, value) in vars {
        if !key.ends_with(FILE_SUFFIX) {
            continue;
        }

        let target_key = key.trim_end_matches(FILE_SUFFIX);
        if env::var(target_key).is_ok() {
            continue;
        }

        if value.is_empty() {
            continue;
        }

        if let Ok(contents) = fs::read_to_string(&value) {
            let trimmed = contents.trim().to_string();
            if !trimmed.is_empty() {
                // SAFETY: called once before #[tokio::main] spawns any threads
                unsafe { env::set_var(target_key, trimmed) };
            }
        }
    }
}

fn init_tracing() {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{trace as sdktrace, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::Registry;

    let otlp_endpoint =
        env::var("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_else(|_| "http://tempo:4317".to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(otlp_endpoint))
        .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", "execution-pipeline"),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(opentelemetry_sdk::runtime::Tokio);

    let fmt_layer = tracing_subscriber::fmt::layer().json().with_target(false);
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into());

    match tracer {
        Ok(tracer) => {
            let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
            let subscriber = Registry::default().with(filter).with(fmt_layer).with(telemetry);
            tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
        }
        Err(e) => {
            // OTLP collector unreachable at boot is not fatal; fall back to stdout-only.
            let subscriber = Registry::default().with(filter).with(fmt_layer);
            tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
            warn!("OTel pipeline install failed, continuing with stdout logging only: {}", e);
        }
    }
}

/// Coarse day/night session classification from Shanghai local time (UTC+8).
/// Real session-calendar handling (holidays, half-days) is a market-data
/// concern and stays out of this crate per spec.md's scope.
fn session_for(now_ms: i64) -> SessionType {
    use chrono::{TimeZone, Timelike};
    let dt = chrono::Utc
        .timestamp_millis_opt(now_ms)
        .single()
        .unwrap_or_else(chrono::Utc::now);
    let shanghai_hour = (dt.hour() + 8) % 24;
    if (9..15).contains(&shanghai_hour) {
        SessionType::Day
    } else {
        SessionType::Night
    }
}

#[derive(Debug, serde::Deserialize)]
struct AccountMarginSnapshot {
    equity: f64,
    margin_used: f64,
    margin_frozen: f64,
    returns: Option<Vec<f64>>,
}

/// Drives one engine instance: polls `get_next_action` for every active plan,
/// dispatches `PlaceOrder`/`CancelOrder` to the broker, and feeds the broker's
/// reply back through `on_order_event` — matches SPEC_FULL.md §5's "driver
/// loop is a tokio task per engine instance calling get_next_action in a
/// loop, sleep_until on WAIT". Fallback level gates and scales every order
/// before it reaches the rate limiter.
async fn run_driver_loop(
    engine: Arc<ExecutionEngine>,
    broker: Arc<dyn execution_pipeline::broker::BrokerAdapter>,
    order_rate: Arc<execution_pipeline::rate_limiter::TokenBucket>,
    fallback: Arc<FallbackExecutor>,
) {
    loop {
        let now = execution_pipeline::audit::now_ms();
        let plan_ids = engine.get_active_plans();

        if plan_ids.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            continue;
        }

        let mut next_wait_ms: Option<i64> = None;

        for plan_id in plan_ids {
            let action = match engine.get_next_action(&plan_id, now) {
                Ok(a) => a,
                Err(e) => {
                    error!(plan_id, error_code = e.error_code(), "get_next_action failed");
                    continue;
                }
            };

            match action {
                ExecutorAction::PlaceOrder {
                    client_order_id,
                    instrument,
                    side,
                    offset,
                    price,
                    qty,
                    ..
                } => {
                    let algo = engine.get_plan(&plan_id).map(|s| s.algo).unwrap_or(execution_pipeline::intent::Algo::Immediate);
                    let response = fallback.execute(ExecutionRequest {
                        order_id: client_order_id.clone(),
                        instrument: instrument.clone(),
                        side,
                        offset,
                        volume: qty,
                        price: price.unwrap_or_default(),
                        algorithm: algo,
                    });
                    if response.queued {
                        info!(plan_id, client_order_id, "order queued for manual review under fallback");
                        continue;
                    }
                    if !response.success {
                        warn!(plan_id, client_order_id, message = response.message, "order blocked by fallback level");
                        continue;
                    }
                    let qty = response.adjusted_volume;

                    order_rate.acquire(1).await;
                    let result = broker.place_order(&client_order_id, &instrument, side, offset, price, qty).await;
                    let event = match result {
                        Ok(ack) => OrderEvent {
                            client_order_id: client_order_id.clone(),
                            kind: OrderEventKind::Ack,
                            filled_qty: 0,
                            filled_price: None,
                            remaining_qty: qty,
                            error_code: None,
                            error_msg: None,
                            exchange_order_id: Some(ack.exchange_order_id),
                            ts: now,
                        },
                        Err(rejected) => OrderEvent {
                            client_order_id: client_order_id.clone(),
                            kind: OrderEventKind::Reject,
                            filled_qty: 0,
                            filled_price: None,
                            remaining_qty: qty,
                            error_code: Some(rejected.error_code().to_string()),
                            error_msg: Some(rejected.to_string()),
                            exchange_order_id: None,
                            ts: now,
                        },
                    };
                    if let Err(e) = engine.on_order_event(&plan_id, event, now) {
                        error!(plan_id, error_code = e.error_code(), "on_order_event failed");
                    }
                }
                ExecutorAction::CancelOrder { client_order_id, reason } => {
                    info!(plan_id, client_order_id, reason, "dispatching cancel");
                    // exchange_order_id lookup lives with the broker's own order book in a
                    // real deployment; client_order_id alone is sufficient for the paper broker.
                    let _ = broker.cancel_order(&client_order_id, "").await;
                }
                ExecutorAction::Wait { until_ts, .. } => {
                    if let Some(until) = until_ts {
                        next_wait_ms = Some(next_wait_ms.map_or(until, |w| w.min(until)));
                    }
                }
                ExecutorAction::Complete | ExecutorAction::Abort { .. } => {}
            }
        }

        let sleep_ms = next_wait_ms.map(|until| (until - now).max(0)).unwrap_or(50).min(1000) as u64;
        tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    load_secrets_from_files();
    init_tracing();

    info!("execution pipeline starting up");

    dotenv::dotenv().ok();

    let settings = Settings::new().expect("critical: failed to load configuration");

    // Physical interlock: the engine refuses submit while disarmed regardless
    // of any upstream "strategy is live" flag.
    let armed_state = Arc::new(ArmedState::new());

    let registry = prometheus::default_registry().clone();
    let prometheus_metrics = PrometheusMetricsBuilder::new("execution_pipeline")
        .registry(registry)
        .endpoint("/metrics")
        .build()
        .unwrap();

    info!("connecting to NATS at {}", settings.server.nats_url);
    let nats_client = match async_nats::connect(&settings.server.nats_url).await {
        Ok(c) => {
            info!("connected to NATS");
            c
        }
        Err(e) => {
            error!("failed to connect to NATS: {}", e);
            std::process::exit(1);
        }
    };

    // Audit stream: engine emits onto an unbounded channel sink; a drain task
    // republishes every event onto NATS for an external collaborator to persist.
    // Built before confirmation/breaker/fallback so every one of them can be
    // handed the same sink at construction time.
    let (channel_sink, receiver) = ChannelAuditSink::unbounded();
    let nats_sink = NatsAuditSink::spawn(nats_client.clone(), subjects::EVT_AUDIT);
    // `Receiver::recv` blocks the calling thread while parked; run the drain
    // loop on a blocking thread rather than tying up a tokio worker.
    tokio::task::spawn_blocking(move || loop {
        match receiver.recv() {
            Ok(event) => nats_sink.emit(event),
            Err(_) => break,
        }
    });

    let audit_sink: Arc<dyn AuditSink> = Arc::new(channel_sink);

    let global_breaker = Arc::new(GlobalBreaker::new(std::path::PathBuf::from(&settings.server.breaker_lockfile)));

    let confirmation = Arc::new(
        BreakerAwareConfirmation::new(
            global_breaker.clone(),
            ConfirmationManager::new(settings.confirmation.clone()).with_audit_sink(audit_sink.clone()),
            settings.breaker.clone(),
        )
        .with_audit_sink(audit_sink.clone()),
    );
    let confirmation_seq = Arc::new(std::sync::atomic::AtomicU64::new(0));

    let engine =
        Arc::new(ExecutionEngine::new(settings.engine.clone()).with_audit_sink(audit_sink.clone()));

    let broker: Arc<dyn execution_pipeline::broker::BrokerAdapter> = Arc::new(LoggingBroker);
    let order_rate = Arc::new(execution_pipeline::rate_limiter::TokenBucket::new(10, 10.0));

    // --- fallback manager/executor ---
    // The manager holds the level (tracked here, not inside ExecutionEngine,
    // so an operator or the margin-monitor task can flip it independently of
    // any one plan); the executor reshapes every order against that level
    // before the driver loop ever reaches the broker.
    let fallback_manager = Arc::new(FallbackManager::new(settings.fallback.clone()));
    let fallback_executor =
        Arc::new(FallbackExecutor::new(fallback_manager.clone()).with_audit_sink(audit_sink.clone()));

    let driver_engine = engine.clone();
    let driver_broker = broker.clone();
    let driver_rate = order_rate.clone();
    let driver_fallback = fallback_executor.clone();
    let driver_handle = tokio::spawn(run_driver_loop(driver_engine, driver_broker, driver_rate, driver_fallback));

    // --- adaptive VaR / margin monitor ---
    // Fed by an external account-state collaborator over NATS (spec.md §4.9);
    // margin alert escalation force-triggers an out-of-cadence VaR recompute.
    let var_scheduler = Arc::new(AdaptiveVarScheduler::new(settings.adaptive_var.clone(), 0.95));
    let margin_monitor =
        Arc::new(DynamicMarginMonitor::new(settings.margin_monitor.clone()).with_var_scheduler(var_scheduler.clone()));

    let margin_audit_sink = audit_sink.clone();
    let client_for_margin = nats_client.clone();
    let fallback_for_margin = fallback_manager.clone();
    tokio::spawn(async move {
        use futures::StreamExt;
        let mut sub = match client_for_margin.subscribe(subjects::EVT_ACCOUNT_MARGIN).await {
            Ok(s) => s,
            Err(e) => {
                error!("failed to subscribe to account margin events: {}", e);
                return;
            }
        };
        while let Some(msg) = sub.next().await {
            let snapshot: AccountMarginSnapshot = match serde_json::from_slice(&msg.payload) {
                Ok(s) => s,
                Err(e) => {
                    warn!("malformed account margin snapshot: {}", e);
                    continue;
                }
            };
            let now = execution_pipeline::audit::now_ms();
            let result = margin_monitor.update_margin_status(
                snapshot.equity,
                snapshot.margin_used,
                snapshot.margin_frozen,
                snapshot.returns.as_deref(),
                now as u64,
            );
            margin_audit_sink.emit(
                AuditEvent::new(AuditEventType::Margin, now, serde_json::json!(result)),
            );
            if let Some(var) = var_scheduler.last_result() {
                margin_audit_sink.emit(AuditEvent::new(AuditEventType::Var, now, serde_json::json!(var)));
            }
            if result.alert_level >= execution_pipeline::risk::MarginAlertLevel::Danger {
                warn!(alert_level = ?result.alert_level, usage_ratio = result.usage_ratio, "margin alert escalated");
                fallback_for_margin.set_level(execution_pipeline::fallback::FallbackLevel::Reduced);
            } else if result.level_changed && result.alert_level == execution_pipeline::risk::MarginAlertLevel::Safe {
                fallback_for_margin.set_level(execution_pipeline::fallback::FallbackLevel::Normal);
            }
        }
    });

    // --- intent.submit subscriber ---
    // Every intent runs through the breaker-aware confirmation gate before it
    // ever reaches `Engine::submit` — AUTO/SOFT/HARD level selection, circuit
    // breaker OPEN/HALF_OPEN handling, and HF exemption all live upstream of
    // registration, matching spec.md §4.7/§4.8's "strategy threads call
    // Engine.submit" framing (confirmation is the strategy-side gate, not a
    // step inside submit).
    let engine_for_submit = engine.clone();
    let armed_for_submit = armed_state.clone();
    let client_for_submit = nats_client.clone();
    let confirmation_for_submit = confirmation.clone();
    tokio::spawn(async move {
        use futures::StreamExt;
        let mut sub = match client_for_submit.subscribe(subjects::CMD_INTENT_SUBMIT).await {
            Ok(s) => s,
            Err(e) => {
                error!("failed to subscribe to intent submit commands: {}", e);
                return;
            }
        };
        while let Some(msg) = sub.next().await {
            if !armed_for_submit.is_armed() {
                warn!("rejecting intent: execution is disarmed");
                continue;
            }
            let intent: Intent = match serde_json::from_slice(&msg.payload) {
                Ok(i) => i,
                Err(e) => {
                    warn!("malformed intent submission: {}", e);
                    continue;
                }
            };
            let now = execution_pipeline::audit::now_ms();
            let order_value = intent.limit_price.and_then(|p| p.to_string().parse::<f64>().ok()).unwrap_or(0.0)
                * intent.target_qty as f64;
            let ctx = ConfirmationContext {
                intent: intent.clone(),
                order_value,
                market: MarketCondition::default(),
                session: session_for(now),
                strategy: StrategyType::Production,
                ts: now,
            };
            let confirmation_id = confirmation_seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let decision = confirmation_for_submit.confirm(&confirmation_id.to_string(), ctx).await;
            if !matches!(decision.result, ConfirmationResult::Approved | ConfirmationResult::Degraded) {
                warn!(result = ?decision.result, reasons = ?decision.reasons, "intent confirmation declined");
                continue;
            }

            match engine_for_submit.submit(intent, now) {
                Ok(plan_id) => info!(plan_id, "intent accepted"),
                Err(e) => warn!(error_code = e.error_code(), "intent rejected"),
            }
        }
    });

    // --- operator ARM/DISARM listeners ---
    let armed_for_arm = armed_state.clone();
    let client_for_arm = nats_client.clone();
    tokio::spawn(async move {
        use futures::StreamExt;
        let mut sub = match client_for_arm.subscribe(subjects::CMD_SYS_HALT).await {
            Ok(s) => s,
            Err(e) => {
                error!("failed to subscribe to sys halt commands: {}", e);
                return;
            }
        };
        while let Some(msg) = sub.next().await {
            let reason = String::from_utf8_lossy(&msg.payload).to_string();
            warn!("received sys halt: {}", reason);
            armed_for_arm.set_armed(false, &reason);
            global_breaker.trip(&reason);
        }
    });

    let api_port = env::var("PORT").unwrap_or_else(|_| settings.server.port.to_string());
    let bind_address = format!("0.0.0.0:{}", api_port);
    info!("starting admin API on {}", bind_address);

    let engine_for_api = engine.clone();
    let armed_for_api = armed_state.clone();
    let fallback_for_api = fallback_executor.clone();

    HttpServer::new(move || {
        let cors = actix_cors::Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header();

        App::new()
            .wrap(cors)
            .wrap(prometheus_metrics.clone())
            .app_data(web::Data::new(engine_for_api.clone()))
            .app_data(web::Data::new(armed_for_api.clone()))
            .app_data(web::Data::new(fallback_for_api.clone()))
            .configure(admin_api::config)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    driver_handle.abort();
    info!("execution pipeline stopped");

    Ok(())
}

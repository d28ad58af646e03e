//! Operator HTTP surface (health, arm/disarm, plan queries) — SPEC_FULL.md
//! §1's "small operator HTTP surface" ambient layer, grounded on the
//! teacher's `api.rs` route-per-concern shape but trimmed to what this
//! pipeline actually exposes (no order book, no balances).

use actix_web::{get, post, web, HttpResponse, Responder};
use std::sync::Arc;

use execution_pipeline::armed_state::ArmedState;
use execution_pipeline::engine::ExecutionEngine;
use execution_pipeline::fallback::FallbackExecutor;

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

#[get("/stats")]
async fn stats(engine: web::Data<Arc<ExecutionEngine>>) -> impl Responder {
    HttpResponse::Ok().json(engine.statistics())
}

#[get("/plans")]
async fn active_plans(engine: web::Data<Arc<ExecutionEngine>>) -> impl Responder {
    HttpResponse::Ok().json(engine.get_active_plans())
}

#[get("/plans/{plan_id}")]
async fn plan(engine: web::Data<Arc<ExecutionEngine>>, path: web::Path<String>) -> impl Responder {
    match engine.get_plan(&path.into_inner()) {
        Some(summary) => HttpResponse::Ok().json(summary),
        None => HttpResponse::NotFound().finish(),
    }
}

#[post("/arm")]
async fn arm(armed: web::Data<Arc<ArmedState>>) -> impl Responder {
    armed.set_armed(true, "operator HTTP request");
    HttpResponse::Ok().json(serde_json::json!({"armed": true}))
}

#[post("/disarm")]
async fn disarm(armed: web::Data<Arc<ArmedState>>) -> impl Responder {
    armed.set_armed(false, "operator HTTP request");
    HttpResponse::Ok().json(serde_json::json!({"armed": false}))
}

/// Drains the MANUAL-level queue with no confirmation callback — every
/// queued order is re-run under REDUCED rules unconditionally. An operator
/// console with a real confirm prompt would pass a callback instead; this
/// surface is the unattended drain path.
#[post("/fallback/process_manual_queue")]
async fn process_manual_queue(fallback: web::Data<Arc<FallbackExecutor>>) -> impl Responder {
    let responses = fallback.process_manual_queue(None::<fn(&execution_pipeline::fallback::ExecutionRequest) -> bool>);
    HttpResponse::Ok().json(responses)
}

#[get("/fallback/stats")]
async fn fallback_stats(fallback: web::Data<Arc<FallbackExecutor>>) -> impl Responder {
    HttpResponse::Ok().json(fallback.stats())
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(stats)
        .service(active_plans)
        .service(plan)
        .service(arm)
        .service(disarm)
        .service(process_manual_queue)
        .service(fallback_stats);
}

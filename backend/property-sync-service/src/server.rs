//! Operational HTTP endpoints: liveness, readiness, metrics and, when enabled,
//! checkpoint administration.

use actix_web::dev::Server;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use std::sync::Arc;
use tracing::{error, info};

use crate::metrics;
use crate::services::cdc::checkpoint::CheckpointTracker;
use crate::services::cdc::health::PipelineHealth;

#[derive(Clone)]
pub struct AppState {
    pub health: Arc<PipelineHealth>,
    pub checkpoints: CheckpointTracker,
}

async fn ready(state: web::Data<AppState>) -> impl Responder {
    let report = state.health.report();
    if report.healthy {
        HttpResponse::Ok().json(report)
    } else {
        HttpResponse::ServiceUnavailable().json(report)
    }
}

async fn prometheus_metrics() -> impl Responder {
    match metrics::render() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            HttpResponse::InternalServerError().body(format!("error: {}", e))
        }
    }
}

async fn list_checkpoints(state: web::Data<AppState>) -> impl Responder {
    match state.checkpoints.list().await {
        Ok(records) => {
            let checkpoints: Vec<serde_json::Value> = records
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "consumer_group": r.consumer_group,
                        "topic": r.topic,
                        "partition": r.partition,
                        "last_applied_position": r.last_applied_position,
                        "updated_at": r.updated_at,
                    })
                })
                .collect();
            HttpResponse::Ok().json(serde_json::json!({ "checkpoints": checkpoints }))
        }
        Err(e) => HttpResponse::InternalServerError().body(format!("error: {}", e)),
    }
}

/// Delete a partition checkpoint. Takes effect the next time the partition is
/// assigned.
async fn reset_checkpoint(state: web::Data<AppState>, path: web::Path<i32>) -> impl Responder {
    let partition = path.into_inner();
    match state.checkpoints.reset(partition).await {
        Ok(removed) => HttpResponse::Ok().json(serde_json::json!({
            "topic": state.checkpoints.topic(),
            "partition": partition,
            "removed": removed,
        })),
        Err(e) => HttpResponse::InternalServerError().body(format!("error: {}", e)),
    }
}

pub fn configure(cfg: &mut web::ServiceConfig, admin_enabled: bool) {
    cfg.route("/health", web::get().to(|| async { "OK" }))
        .route("/ready", web::get().to(ready))
        .route("/metrics", web::get().to(prometheus_metrics));

    if admin_enabled {
        cfg.route("/admin/checkpoints", web::get().to(list_checkpoints))
            .route(
                "/admin/checkpoints/{partition}/reset",
                web::post().to(reset_checkpoint),
            );
    }
}

/// Bind and start the server; the caller awaits or stops the returned handle.
pub fn start(port: u16, state: AppState, admin_enabled: bool) -> std::io::Result<Server> {
    let addr = format!("0.0.0.0:{}", port);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(|cfg| configure(cfg, admin_enabled))
    })
    .workers(1)
    .disable_signals()
    .bind(&addr)?
    .run();

    info!(addr = %addr, admin_enabled, "HTTP server listening");
    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cdc::health::PartitionState;
    use crate::services::cdc::store::{MemoryStore, TargetStore};
    use actix_web::{http::StatusCode, test};

    fn state() -> AppState {
        let store: Arc<dyn TargetStore> = Arc::new(MemoryStore::new());
        AppState {
            health: Arc::new(PipelineHealth::new()),
            checkpoints: CheckpointTracker::new(store, "group", "appraisal.public.property"),
        }
    }

    #[actix_web::test]
    async fn test_ready_reflects_partition_health() {
        let state = state();
        let health = Arc::clone(&state.health);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(|cfg| configure(cfg, false)),
        )
        .await;

        health.set_partition(1200, PartitionState::Running { last_applied: Some(9) });
        let req = test::TestRequest::get().uri("/ready").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        health.set_partition(1200, PartitionState::Failed { error: "denied".into() });
        let req = test::TestRequest::get().uri("/ready").to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[actix_web::test]
    async fn test_admin_routes_only_when_enabled() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state()))
                .configure(|cfg| configure(cfg, false)),
        )
        .await;
        let req = test::TestRequest::get().uri("/admin/checkpoints").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state()))
                .configure(|cfg| configure(cfg, true)),
        )
        .await;
        let req = test::TestRequest::get().uri("/admin/checkpoints").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["checkpoints"], serde_json::json!([]));

        let req = test::TestRequest::post()
            .uri("/admin/checkpoints/3/reset")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["removed"], false);
    }
}

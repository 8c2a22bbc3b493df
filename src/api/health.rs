use actix_web::{get, web, HttpResponse, Responder};
use serde::Serialize;
use sqlx::{Pool, Postgres};
use tracing::error;

use crate::db::job_repository::{JobRepository, QueueStats};

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    queue: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    jobs: Option<QueueStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Queue database reachable, with pending and dead-lettered job counts
#[get("/health")]
async fn health_check(pool: web::Data<Pool<Postgres>>) -> impl Responder {
    match JobRepository::queue_stats(pool.get_ref()).await {
        Ok(stats) => HttpResponse::Ok().json(HealthResponse {
            status: "healthy",
            queue: "connected",
            jobs: Some(stats),
            error: None,
        }),
        Err(e) => {
            error!("Health check failed: {:?}", e);
            HttpResponse::ServiceUnavailable().json(HealthResponse {
                status: "unhealthy",
                queue: "disconnected",
                jobs: None,
                error: Some(format!("Queue database error: {}", e)),
            })
        }
    }
}

/// Ready to accept backup requests. 503 while the queue database is down.
#[get("/ready")]
async fn readiness_check(pool: web::Data<Pool<Postgres>>) -> impl Responder {
    match sqlx::query("SELECT 1").fetch_one(pool.get_ref()).await {
        Ok(_) => HttpResponse::Ok().json(HealthResponse {
            status: "ready",
            queue: "connected",
            jobs: None,
            error: None,
        }),
        Err(e) => {
            error!("Readiness check failed: queue database unavailable: {:?}", e);
            HttpResponse::ServiceUnavailable().json(HealthResponse {
                status: "not_ready",
                queue: "disconnected",
                jobs: None,
                error: Some(format!("Queue database unavailable: {}", e)),
            })
        }
    }
}

#[get("/live")]
async fn liveness_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "alive",
        queue: "not_checked",
        jobs: None,
        error: None,
    })
}

pub fn health_config(config: &mut web::ServiceConfig) {
    config
        .service(health_check)
        .service(readiness_check)
        .service(liveness_check);
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn live_needs_no_database() {
        let app = test::init_service(App::new().service(liveness_check)).await;
        let req = test::TestRequest::get().uri("/live").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "alive");
        assert!(body.get("jobs").is_none());
    }
}

//! Minimal quiesce example: JSON endpoints, error responses and health checks.
//!
//! Run with:
//!   RUST_LOG=info DRAIN_TIMEOUT_MS=10000 cargo run --example basic
//!
//! Try:
//!   curl -i http://localhost:3000/users/42
//!   curl -i http://localhost:3000/users/7          # 404 {"error":"no user 7"}
//!   curl -i http://localhost:3000/users/abc        # 400
//!   curl -i http://localhost:3000/report           # 500, cause only in the log
//!   curl -i http://localhost:3000/slow & kill -TERM <pid>   # drains, then exits

use std::time::Duration;

use quiesce::{Config, FailureRecord, Request, Response, Router, Server, health};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(2);
        }
    };

    let server = match Server::from_config(&config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(2);
        }
    };
    let shutdown = server.coordinator();

    let app = Router::new()
        .get("/users/{id}", get_user)
        .post("/users", create_user)
        .get("/report", report)
        .get("/slow", slow)
        .probe("/healthz", health::liveness(shutdown.clone()))
        .probe("/readyz", health::readiness(shutdown));

    match server.serve(app).await {
        Ok(reason) => tracing::info!(%reason, "exiting"),
        Err(e) => {
            tracing::error!("server error: {e}");
            std::process::exit(1);
        }
    }
}

// GET /users/{id}
async fn get_user(req: Request) -> Result<Response, FailureRecord> {
    let id: u64 = req
        .param("id")
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| FailureRecord::validation("id must be a number"))?;

    if id != 42 {
        return Err(FailureRecord::not_found(format!("no user {id}")));
    }
    Ok(Response::json(format!(r#"{{"id":{id},"name":"alice"}}"#)))
}

// POST /users
async fn create_user(req: Request) -> Result<Response, FailureRecord> {
    if req.body().is_empty() {
        return Err(FailureRecord::validation("body required").with_status(422));
    }
    Ok(Response::builder()
        .status(http::StatusCode::CREATED)
        .header("location", "/users/99")
        .json(r#"{"id":99,"name":"new_user"}"#))
}

// GET /report: a downstream failure. The client sees a generic 500.
async fn report(_req: Request) -> Result<Response, FailureRecord> {
    let downstream = std::io::Error::other("warehouse: connection refused");
    Err(FailureRecord::internal("").with_cause(downstream))
}

// GET /slow: keeps the drain open for a few seconds.
async fn slow(_req: Request) -> &'static str {
    tokio::time::sleep(Duration::from_secs(5)).await;
    "done"
}

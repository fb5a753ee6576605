//! `serve`: the HTTP endpoint devices push events to.
//!
//! Every route except the configured public paths sits behind
//! [`require_device_auth`]. Accepted events are written to stdout, one
//! JSON object per line, the same as `watch`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Extension;
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use chrono::Utc;
use gatewatch_api::VendorPayload;
use gatewatch_core::{AuthenticatedDevice, EventNormalizer, GuardConfig, require_device_auth};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::Context;
use crate::cli::ServeArgs;
use crate::error::CliError;
use crate::output;

pub const EVENTS_PATH: &str = "/api/device/events";

pub async fn handle(ctx: &Context, args: &ServeArgs) -> Result<(), CliError> {
    let guard = ctx.config.guard_config()?;
    let server = &ctx.config.server;

    if let Some(addr) = args.metrics_addr.as_deref().or(server.metrics_addr.as_deref()) {
        install_metrics(addr)?;
        info!(%addr, "prometheus exporter listening");
    }

    let listen = args.listen.as_deref().unwrap_or(&server.listen);
    let listener = TcpListener::bind(listen).await?;
    info!(addr = %listener.local_addr()?, "accepting device callbacks on {EVENTS_PATH}");

    axum::serve(listener, router(guard))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("could not install Ctrl-C handler");
            }
            info!("shutting down");
        })
        .await?;
    Ok(())
}

fn install_metrics(addr: &str) -> Result<(), CliError> {
    let invalid = |reason: String| CliError::Validation {
        field: "server.metrics_addr".into(),
        reason,
    };
    let addr: SocketAddr = addr.parse().map_err(|e| invalid(format!("{e}")))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| invalid(e.to_string()))
}

pub fn router(guard: GuardConfig) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(EVENTS_PATH, post(ingest))
        .layer(middleware::from_fn_with_state(
            Arc::new(guard),
            require_device_auth,
        ))
        .layer(TraceLayer::new_for_http())
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestSummary {
    accepted: usize,
    rejected: usize,
}

async fn ingest(
    Extension(device): Extension<AuthenticatedDevice>,
    body: String,
) -> Json<IngestSummary> {
    let normalizer = EventNormalizer::new(device.device_id.as_str(), None);
    let received_at = Utc::now();
    let mut summary = IngestSummary::default();

    for raw in VendorPayload::parse(&body).into_events() {
        let normalized = raw
            .map_err(|e| e.to_string())
            .and_then(|raw| normalizer.normalize(raw, received_at).map_err(|e| e.to_string()));
        match normalized {
            Ok(Some(event)) => {
                if let Err(e) = output::print_line(&event) {
                    warn!(error = %e, "could not write event");
                }
                summary.accepted += 1;
            }
            Ok(None) => {}
            Err(reason) => {
                debug!(device_id = %device.device_id, %reason, "dropping malformed event");
                summary.rejected += 1;
            }
        }
    }

    info!(
        device_id = %device.device_id,
        accepted = summary.accepted,
        rejected = summary.rejected,
        "callback processed"
    );
    Json(summary)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use gatewatch_core::guard::{HEADER_DEVICE_ID, HEADER_SIGNATURE, compute_signature};
    use secrecy::SecretString;
    use tower::ServiceExt;

    const SECRET: &str = "s3cret-shared";

    fn signed(body: &str) -> Request<Body> {
        let value = gatewatch_core::guard::body_value(body.as_bytes());
        let signature = compute_signature("lobby", &value, None, &SecretString::from(SECRET));
        Request::post(EVENTS_PATH)
            .header(HEADER_DEVICE_ID, "lobby")
            .header(HEADER_SIGNATURE, signature)
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn ingest_counts_accepted_and_rejected() {
        let app = router(GuardConfig::new(SecretString::from(SECRET)));
        let body = r#"[
            {"eventType": "doorOpen", "dateTime": "2024-06-15T10:30:05+08:00"},
            {"dateTime": "2024-06-15T10:30:06+08:00"},
            {"eventType": "alarm", "dateTime": "yesterday"}
        ]"#;

        let response = app.oneshot(signed(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "accepted": 1, "rejected": 2 }));
    }

    #[tokio::test]
    async fn unsigned_callback_is_rejected() {
        let app = router(GuardConfig::new(SecretString::from(SECRET)));
        let request = Request::post(EVENTS_PATH).body(Body::from("[]")).unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn health_is_public() {
        let app = router(GuardConfig::new(SecretString::from(SECRET)));
        let request = Request::get("/health").body(Body::empty()).unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "status": "ok" }));
    }
}

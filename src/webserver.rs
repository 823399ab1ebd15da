use crate::admission::AdmissionHandler;
use crate::config::Webserver;
use anyhow::Context;
use axum::body::Bytes;
use axum::extract::State;
use axum::{
    Json, Router,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use kube::core::DynamicObject;
use kube::core::admission::AdmissionReview;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

pub const DEPLOYMENT_WEBHOOK_PATH: &str = "/imageclone-v1-deployment";
pub const DAEMONSET_WEBHOOK_PATH: &str = "/imageclone-v1-daemonset";

pub async fn readiness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn mutate_deployment(
    State(handler): State<Arc<AdmissionHandler>>,
    body: Bytes,
) -> Json<AdmissionReview<DynamicObject>> {
    Json(handler.review::<Deployment>(&body).await)
}

async fn mutate_daemonset(
    State(handler): State<Arc<AdmissionHandler>>,
    body: Bytes,
) -> Json<AdmissionReview<DynamicObject>> {
    Json(handler.review::<DaemonSet>(&body).await)
}

pub fn create_app(handler: Arc<AdmissionHandler>) -> Router {
    Router::new()
        .route(DEPLOYMENT_WEBHOOK_PATH, post(mutate_deployment))
        .route(DAEMONSET_WEBHOOK_PATH, post(mutate_daemonset))
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .with_state(handler)
}

/// Serves `app` over HTTPS when TLS is configured, plain HTTP otherwise.
pub async fn serve(app: Router, config: &Webserver) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    match &config.tls {
        Some(tls) => {
            let tls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                .await
                .with_context(|| {
                    format!(
                        "Failed to load TLS certificate {} and key {}",
                        tls.cert_path.display(),
                        tls.key_path.display()
                    )
                })?;
            info!("Starting HTTPS webserver on {}", addr);
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            info!("Starting HTTP webserver on {}", addr);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}

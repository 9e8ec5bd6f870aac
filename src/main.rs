mod config;
mod handlers;
mod metrics;
mod rate_limit;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{Router, middleware, routing::get};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Args;
use crate::handlers::{health_handler, hello_handler, report_handler};
use crate::metrics::MetricsRegistry;
use crate::rate_limit::AdmissionControl;
use crate::state::AppState;

// Router with the middleware chain: metrics wraps admission wraps the
// route handlers, so timing covers denied requests too.
fn build_router(state: Arc<AppState>, metrics_path: &str) -> Router {
    Router::new()
        .route("/hello", get(hello_handler))
        .route("/health", get(health_handler))
        .route(metrics_path, get(report_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::admission_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            metrics::metrics_middleware,
        ))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    args.validate()?;

    let state = Arc::new(AppState {
        admission: Arc::new(AdmissionControl::new(
            args.requests_per_frame,
            Duration::from_secs(args.frame_duration),
            args.effective_bypass_routes(),
        )),
        metrics: Arc::new(MetricsRegistry::new()),
    });

    // background timers, stopped through the watch channel after the
    // server drains
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(rate_limit::frame_sweeper(
        state.admission.clone(),
        shutdown_rx.clone(),
    ));
    let rps_reset = tokio::spawn(metrics::requests_per_second_reset(
        state.metrics.clone(),
        shutdown_rx,
    ));

    let app = build_router(state, &args.metrics_path);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("could not bind {addr}"))?;

    info!("gateway running on http://localhost:{}", args.port);
    info!(
        "rate limit: {} requests per {} seconds",
        args.requests_per_frame, args.frame_duration
    );
    info!("metrics report at {}", args.metrics_path);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    let _ = shutdown_tx.send(true);
    let _ = sweeper.await;
    let _ = rps_reset.await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("could not listen for shutdown signal: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(max: u32) -> Arc<AppState> {
        Arc::new(AppState {
            admission: Arc::new(AdmissionControl::new(
                max,
                Duration::from_secs(10),
                vec!["/metrics".to_string()],
            )),
            metrics: Arc::new(MetricsRegistry::new()),
        })
    }

    fn request(path: &str, client: &str) -> Request<Body> {
        let addr: SocketAddr = client.parse().unwrap();
        Request::builder()
            .uri(path)
            .extension(ConnectInfo(addr))
            .body(Body::empty())
            .unwrap()
    }

    async fn body_of(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn limited_client_gets_429_with_denial_body() {
        let app = build_router(test_state(2), "/metrics");

        for _ in 0..2 {
            let res = app
                .clone()
                .oneshot(request("/hello", "10.0.0.1:5000"))
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::OK);
        }

        let res = app
            .clone()
            .oneshot(request("/hello", "10.0.0.1:5000"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_of(res).await, rate_limit::DENIAL_BODY);
    }

    #[tokio::test]
    async fn exhausted_window_does_not_affect_other_clients() {
        let app = build_router(test_state(1), "/metrics");

        let ok = app
            .clone()
            .oneshot(request("/hello", "10.0.0.1:5000"))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let denied = app
            .clone()
            .oneshot(request("/hello", "10.0.0.1:5000"))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);

        // same IP, fresh ephemeral port
        let other = app
            .clone()
            .oneshot(request("/hello", "10.0.0.1:5001"))
            .await
            .unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_path_is_never_limited() {
        let app = build_router(test_state(1), "/metrics");

        // exhaust the window
        for _ in 0..2 {
            app.clone()
                .oneshot(request("/hello", "10.0.0.1:5000"))
                .await
                .unwrap();
        }

        for _ in 0..3 {
            let res = app
                .clone()
                .oneshot(request("/metrics", "10.0.0.1:5000"))
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn denied_requests_still_appear_in_the_report() {
        let app = build_router(test_state(1), "/metrics");

        // one admitted, two denied, all three recorded
        for _ in 0..3 {
            app.clone()
                .oneshot(request("/hello", "10.0.0.1:5000"))
                .await
                .unwrap();
        }

        let res = app
            .clone()
            .oneshot(request("/metrics", "10.0.0.1:5000"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        // 3 hello requests plus the report request itself
        let report = body_of(res).await;
        assert!(report.contains("4 Requests:"), "{report}");
    }

    #[tokio::test]
    async fn hello_route_answers_through_the_full_chain() {
        let app = build_router(test_state(5), "/metrics");

        let res = app
            .clone()
            .oneshot(request("/hello", "10.0.0.1:5000"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_of(res).await, "hello!\n");
    }
}

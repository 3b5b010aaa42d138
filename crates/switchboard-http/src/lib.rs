//! # switchboard-http
//!
//! HTTP and WebSocket surface over a [`switchboard_core::Conductor`].
//!
//! - `POST /api/invoke/{command}`: every hook and remote operation
//! - `GET /ws/events`: live event stream with topic subscriptions
//! - `GET /health`: liveness probe, exempt from authentication

mod auth;
mod routes;
mod state;
mod websocket;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

pub use routes::{InvokeRequest, InvokeResponse};
pub use state::SharedState;

/// Build the application router.
pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/api/invoke/{command}", post(routes::invoke_handler))
        .route("/ws/events", get(websocket::ws_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .route("/health", get(routes::health))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve until `shutdown` completes.
pub async fn serve(
    state: Arc<SharedState>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("HTTP server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            log::info!("HTTP server shutting down");
        })
        .await
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use switchboard_core::Conductor;
    use tokio::sync::oneshot;
    use tower::ServiceExt;

    fn secured() -> Router {
        let state = SharedState::new(Conductor::default()).with_auth_token(Some("tok".into()));
        router(Arc::new(state))
    }

    fn list_sessions(token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/invoke/list_sessions")
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from("{}")).unwrap()
    }

    #[tokio::test]
    async fn token_is_required_when_configured() {
        let response = secured().oneshot(list_sessions(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = secured().oneshot(list_sessions(Some("bad"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = secured().oneshot(list_sessions(Some("tok"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_skips_authentication() {
        let response = secured()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn serve_returns_after_shutdown() {
        let state = Arc::new(SharedState::new(Conductor::default()));
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(state, "127.0.0.1:0".parse().unwrap(), async {
            rx.await.ok();
        }));

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}

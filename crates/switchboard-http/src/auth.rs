//! Bearer token authentication.
//!
//! REST calls send `Authorization: Bearer <token>`; WebSocket clients,
//! which cannot set headers, pass `?token=<token>` instead. Without a
//! configured token every request passes.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::SharedState;

fn bearer_token<B>(req: &axum::http::Request<B>) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

fn query_token<B>(req: &axum::http::Request<B>) -> Option<&str> {
    req.uri().query().and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find_map(|(key, value)| (key == "token").then_some(value))
    })
}

pub async fn auth_middleware(
    State(state): State<Arc<SharedState>>,
    req: Request,
    next: Next,
) -> Response {
    if state.auth_token.is_none() {
        return next.run(req).await;
    }

    let token = bearer_token(&req).or_else(|| query_token(&req));
    if state.validate_token(token) {
        next.run(req).await
    } else {
        log::warn!("Rejected unauthenticated request to {}", req.uri().path());
        (StatusCode::UNAUTHORIZED, "Invalid or missing authentication token").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_header() {
        let req = Request::builder()
            .header("Authorization", "Bearer tok-1")
            .body(())
            .unwrap();
        assert_eq!(bearer_token(&req), Some("tok-1"));
    }

    #[test]
    fn other_scheme_is_ignored() {
        let req = Request::builder()
            .header("Authorization", "Basic dXNlcjpwYXNz")
            .body(())
            .unwrap();
        assert_eq!(bearer_token(&req), None);
    }

    #[test]
    fn query_parameter() {
        let req = Request::builder()
            .uri("/ws/events?since=1&token=tok-2")
            .body(())
            .unwrap();
        assert_eq!(query_token(&req), Some("tok-2"));

        let req = Request::builder().uri("/ws/events?since=1").body(()).unwrap();
        assert_eq!(query_token(&req), None);
    }
}

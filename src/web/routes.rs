//! Web API router construction.

use axum::{
    Router,
    extract::{Request, State},
    http::{HeaderValue, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::state::AppState;
use crate::web::error::ApiError;
use crate::web::{cycles, sources, status};

/// Admin endpoints are never cached.
const ADMIN_CACHE_CONTROL: &str = "private, no-store, must-revalidate";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates the web server router
pub fn create_router(app_state: AppState) -> Router {
    let api_router = Router::new()
        .route("/health", get(status::health))
        .route("/cycles/active", get(cycles::active_cycles))
        .with_state(app_state.clone());

    let admin_router = Router::new()
        .route("/admin/sources", get(sources::list_sources))
        .route("/admin/sources/summary", get(sources::source_summary))
        .route("/admin/sources/{key}", get(sources::get_source))
        .route("/admin/sources/{key}/runs", get(sources::source_runs))
        .route("/admin/sources/{key}/toggle", post(sources::toggle_source))
        .route("/admin/sources/{key}/restart", post(sources::restart_source))
        .route("/admin/jobs/stuck", get(sources::stuck_jobs))
        .route(
            "/admin/cycles",
            get(cycles::list_cycles).post(cycles::create_cycle),
        )
        .route("/admin/cycles/active", get(cycles::list_active))
        .route("/admin/cycles/pending", get(cycles::list_pending))
        .route(
            "/admin/cycles/{id}",
            get(cycles::get_cycle).delete(cycles::delete_cycle),
        )
        .route("/admin/cycles/{id}/stage", post(cycles::stage_cycle))
        .route("/admin/cycles/{id}/activate", post(cycles::activate_cycle))
        .route("/admin/cycles/{id}/rollback", post(cycles::rollback_cycle))
        .route(
            "/admin/cycles/{id}/record-counts",
            axum::routing::patch(cycles::update_record_counts),
        )
        .layer(middleware::map_response(|mut resp: Response| async move {
            resp.headers_mut().insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static(ADMIN_CACHE_CONTROL),
            );
            resp
        }))
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            require_admin_token,
        ))
        .with_state(app_state);

    Router::new()
        .nest("/api", api_router.merge(admin_router))
        .layer((
            TraceLayer::new_for_http(),
            TimeoutLayer::new(REQUEST_TIMEOUT),
        ))
}

/// Reject admin requests without `Authorization: Bearer <ADMIN_TOKEN>` when a
/// token is configured.
async fn require_admin_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.admin_token.as_deref() else {
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    if provided.is_some_and(|token| tokens_match(token, expected)) {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "rejected admin request without a valid token");
        ApiError::unauthorized().into_response()
    }
}

/// Compare without short-circuiting on the first differing byte.
fn tokens_match(provided: &str, expected: &str) -> bool {
    let (provided, expected) = (provided.as_bytes(), expected.as_bytes());
    provided.len() == expected.len()
        && provided
            .iter()
            .zip(expected)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use super::tokens_match;

    #[test]
    fn token_comparison() {
        assert!(tokens_match("s3cret", "s3cret"));
        assert!(!tokens_match("s3cres", "s3cret"));
        assert!(!tokens_match("s3cre", "s3cret"));
        assert!(!tokens_match("", "s3cret"));
    }
}

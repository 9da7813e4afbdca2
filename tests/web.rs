//! HTTP API tests driven through the router with in-memory stores.

mod helpers;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use helpers::{Harness, ScriptedPoller};
use serde_json::{Value, json};
use skyfeed::cycles::CycleManager;
use skyfeed::cycles::lifecycle::CycleService;
use skyfeed::data::memory::MemoryCycleStore;
use skyfeed::state::{AppState, ServiceStatus, ServiceStatusRegistry};
use skyfeed::web::create_router;
use std::sync::Arc;
use tower::ServiceExt;

const TOKEN: &str = "s3cret";

fn app(admin_token: Option<&str>) -> (Router, AppState) {
    let h = Harness::new(vec![Arc::new(ScriptedPoller::new("metar_poll", 300))]);
    let store = Arc::new(MemoryCycleStore::new());
    let cycles = CycleService::new(store.clone(), Arc::new(CycleManager::new(store)));
    let state = AppState::new(
        h.operator,
        cycles,
        ServiceStatusRegistry::new(),
        admin_token.map(str::to_owned),
    );
    (create_router(state.clone()), state)
}

fn request(method: &str, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn health_reports_services() {
    let (router, state) = app(None);
    state.service_statuses.set("scheduler", ServiceStatus::Active);
    state.service_statuses.set("worker", ServiceStatus::Active);

    let (status, body) = send(
        &router,
        Request::get("/api/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "active");
    assert_eq!(body["services"].as_array().unwrap().len(), 2);
    assert_eq!(body["services"][0]["name"], "scheduler");
}

#[tokio::test]
async fn admin_routes_require_the_token() {
    let (router, _) = app(Some(TOKEN));

    let (status, body) = send(
        &router,
        Request::get("/api/admin/sources").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let (status, _) = send(
        &router,
        Request::get("/api/admin/sources")
            .header(header::AUTHORIZATION, "Bearer s3cres")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        &router,
        request("GET", "/api/admin/sources").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sources"][0]["key"], "metar_poll");
    assert_eq!(body["summary"]["total"], 1);

    // Public routes stay open.
    let (status, _) = send(
        &router,
        Request::get("/api/cycles/active").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn admin_responses_are_not_cached() {
    let (router, _) = app(None);
    let response = router
        .oneshot(request("GET", "/api/admin/sources/summary").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CACHE_CONTROL],
        "private, no-store, must-revalidate"
    );
}

#[tokio::test]
async fn unknown_source_is_a_json_404() {
    let (router, _) = app(None);
    let (status, body) = send(
        &router,
        request("GET", "/api/admin/sources/pirep_poll").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
    assert!(body["message"].as_str().unwrap().contains("pirep_poll"));
}

#[tokio::test]
async fn restart_then_toggle_source() {
    let (router, _) = app(None);

    let (status, body) = send(
        &router,
        request("POST", "/api/admin/sources/metar_poll/restart")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sourceKey"], "metar_poll");
    assert!(body["jobId"].is_string());

    let (status, body) = send(
        &router,
        request("POST", "/api/admin/sources/metar_poll/toggle")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], false);
    assert_eq!(body["status"], "queued");
}

#[tokio::test]
async fn cycle_lifecycle_over_http() {
    let (router, _) = app(None);

    let (status, created) = send(
        &router,
        request("POST", "/api/admin/cycles")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({
                    "data_group": "nasr",
                    "cycle_code": "2601",
                    "effective_date": "2026-01-22",
                    "expiration_date": "2026-02-19"
                })
                .to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "seeding");
    let id = created["id"].as_str().unwrap().to_owned();

    // Activating straight from seeding is rejected.
    let (status, body) = send(
        &router,
        request("POST", &format!("/api/admin/cycles/{id}/activate"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_TRANSITION");

    for action in ["stage", "activate"] {
        let (status, _) = send(
            &router,
            request("POST", &format!("/api/admin/cycles/{id}/{action}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{action} failed");
    }

    let (_, resolved) = send(
        &router,
        Request::get("/api/cycles/active").body(Body::empty()).unwrap(),
    )
    .await;
    let nasr = resolved
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["group"] == "nasr")
        .unwrap();
    assert_eq!(nasr["cycleId"], id.as_str());
    assert_eq!(nasr["overridden"], false);

    let (status, body) = send(
        &router,
        request("DELETE", &format!("/api/admin/cycles/{id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_TRANSITION");
}

#[tokio::test]
async fn duplicate_cycle_is_a_conflict() {
    let (router, _) = app(None);
    let body = json!({
        "data_group": "cifp",
        "cycle_code": "2601",
        "effective_date": "2026-01-22",
        "expiration_date": "2026-02-19"
    })
    .to_string();

    let mut statuses = Vec::new();
    for _ in 0..2 {
        let (status, _) = send(
            &router,
            request("POST", "/api/admin/cycles")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await;
        statuses.push(status);
    }
    assert_eq!(statuses, vec![StatusCode::CREATED, StatusCode::CONFLICT]);
}

#[tokio::test]
async fn cycle_override_header() {
    let (router, _) = app(None);
    let id = "5f0c9d8e-3b2a-4c1d-9e8f-7a6b5c4d3e2f";

    let (status, body) = send(
        &router,
        Request::get("/api/cycles/active")
            .header("x-cycle-id", id)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    for resolved in body.as_array().unwrap() {
        assert_eq!(resolved["cycleId"], id);
        assert_eq!(resolved["overridden"], true);
    }

    let (status, body) = send(
        &router,
        Request::get("/api/cycles/active")
            .header("x-cycle-id", "not-a-uuid")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
}

//! Integration tests for the daemon API endpoints

#[path = "../src/api.rs"]
#[allow(dead_code)]
mod api;

use api::{create_router, AppState};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use plane_lib::{
    catalog::{Catalog, CatalogEntity, MemoryCatalog},
    engine::{Engine, EngineConfig},
    health::{components, HealthRegistry},
    observability::{PlaneMetrics, StructuredLogger},
    orchestrator::Orchestrators,
    store::MemoryStore,
    Site,
};
use std::sync::Arc;
use tower::ServiceExt;

fn engine() -> Engine {
    Engine::new(
        EngineConfig::default(),
        Catalog::from_shared(Arc::new(MemoryCatalog::new())),
        Arc::new(MemoryStore::new()),
        Orchestrators::new(),
        StructuredLogger::new("test"),
    )
}

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::ENGINE).await;
    health_registry.register(components::JOB_CONTROLLER).await;

    let metrics = PlaneMetrics::new();
    let state = Arc::new(AppState::new(health_registry, metrics, engine()));
    let router = create_router(state.clone());

    (router, state)
}

async fn get(app: Router, uri: &str) -> axum::response::Response {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn text_body(response: axum::response::Response) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let response = get(app, "/healthz").await;
    assert_eq!(response.status(), StatusCode::OK);

    let health = json_body(response).await;
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::JOB_CONTROLLER, "orchestrator unreachable")
        .await;

    let response = get(app, "/healthz").await;
    assert_eq!(response.status(), StatusCode::OK);

    let health = json_body(response).await;
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::ENGINE, "store unavailable")
        .await;

    let response = get(app, "/healthz").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let health = json_body(response).await;
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_returns_503_when_not_ready() {
    let (app, _state) = setup_test_app().await;

    let response = get(app, "/readyz").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let readiness = json_body(response).await;
    assert_eq!(readiness["ready"], false);
}

#[tokio::test]
async fn test_readyz_returns_ok_when_ready() {
    let (app, state) = setup_test_app().await;
    state.health_registry.set_ready(true).await;

    let response = get(app, "/readyz").await;
    assert_eq!(response.status(), StatusCode::OK);

    let readiness = json_body(response).await;
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_ready_but_unhealthy() {
    let (app, state) = setup_test_app().await;
    state.health_registry.set_ready(true).await;
    state
        .health_registry
        .set_unhealthy(components::ENGINE, "store unavailable")
        .await;

    let response = get(app, "/readyz").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;

    state.metrics.observe_admission_latency(0.0002);
    state.metrics.observe_task("add_app", "success", 1.5);
    state.metrics.set_job_queue_depth(3);

    let response = get(app, "/metrics").await;
    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let metrics_text = text_body(response).await;
    assert!(metrics_text.contains("dbplane_admission_latency_seconds"));
    assert!(metrics_text.contains("dbplane_task_duration_seconds"));
    assert!(metrics_text.contains("dbplane_task_outcomes_total"));
    assert!(metrics_text.contains("dbplane_job_queue_depth"));
}

#[tokio::test]
async fn test_metrics_contains_histogram_buckets() {
    let (app, state) = setup_test_app().await;

    state.metrics.observe_task("delete_app", "success", 0.4);
    state.metrics.observe_task("delete_app", "failure", 30.0);

    let metrics_text = text_body(get(app, "/metrics").await).await;
    assert!(metrics_text.contains("dbplane_task_duration_seconds_bucket"));
    assert!(metrics_text.contains("dbplane_task_duration_seconds_count"));
    assert!(metrics_text.contains("dbplane_task_duration_seconds_sum"));
}

#[tokio::test]
async fn test_healthz_includes_component_details() {
    let (app, _state) = setup_test_app().await;

    let health = json_body(get(app, "/healthz").await).await;
    assert!(health["components"].is_object());
    assert!(health["components"]["engine"].is_object());
    assert!(health["components"]["job_controller"].is_object());
}

#[tokio::test]
async fn test_task_lookup() {
    let (app, state) = setup_test_app().await;

    let created = state
        .engine
        .add_entity(CatalogEntity::Site(Site {
            id: "s1".into(),
            name: "east".into(),
            domain: "k8s.east".into(),
            port: 6443,
            enabled: true,
        }))
        .await
        .unwrap();

    let response = get(app, &format!("/v1/tasks/{}", created.task_id)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let task = json_body(response).await;
    assert_eq!(task["id"], created.task_id.as_str());
    assert_eq!(task["action"], "add_site");
}

#[tokio::test]
async fn test_unknown_app_is_404() {
    let (app, _state) = setup_test_app().await;

    let response = get(app, "/v1/apps/missing").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let error = json_body(response).await;
    assert_eq!(error["kind"], "not_found");
}

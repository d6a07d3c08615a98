use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use coordinator::clock::SystemClock;
use coordinator::store::MemoryStore;
use coordinator::{build_router, AppState, Coordinator, CoordinatorSettings};

fn app(agent_key: Option<&str>) -> Router {
    let coord = Coordinator::new(
        Arc::new(MemoryStore::new()),
        Arc::new(SystemClock),
        CoordinatorSettings::default(),
    );
    build_router(AppState::new(
        Arc::new(coord),
        agent_key.map(str::to_string),
    ))
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
    key: Option<&str>,
) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(key) = key {
        req = req.header(common::AGENT_KEY_HEADER, key);
    }
    let req = match body {
        Some(body) => req
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };

    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn job_round_trip_over_http() {
    let app = app(None);

    let (status, created) = call(
        &app,
        Method::POST,
        "/api/v1/jobs",
        Some(json!({ "artifact": "opt.jar", "payloads": ["p1", "p2"], "maxAttempts": 3 })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["totalTasks"], 2);
    let job_id = created["jobId"].as_str().unwrap().to_string();

    let (status, hello) = call(&app, Method::POST, "/internal/v1/hello", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let spot_id = hello["spotId"].as_str().unwrap().to_string();
    assert!(hello["coordinatorVersion"].is_string());

    let (status, _) = call(
        &app,
        Method::POST,
        "/internal/v1/heartbeat",
        Some(json!({ "spotId": spot_id, "cpuLoad": 40.0, "runningTasks": 0, "totalCores": 4 })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, claimed) = call(
        &app,
        Method::POST,
        "/internal/v1/tasks/claim",
        Some(json!({ "spotId": spot_id, "maxTasks": 2 })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let tasks = claimed["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0]["payload"], "p1");
    let task_id = tasks[0]["taskId"].as_str().unwrap().to_string();

    let complete = json!({
        "spotId": spot_id, "runtimeMs": 10, "iter": 5, "fopt": 0.1, "result": "{}"
    });
    let uri = format!("/internal/v1/tasks/{task_id}/complete");
    let (status, body) = call(&app, Method::POST, &uri, Some(complete.clone()), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body.get("message").is_none());

    // duplicate report is still a success
    let (status, body) = call(&app, Method::POST, &uri, Some(complete), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].is_string());

    let (status, job) = call(&app, Method::GET, &format!("/api/v1/jobs/{job_id}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "RUNNING");
    assert_eq!(job["completedTasks"], 1);

    let (status, results) = call(
        &app,
        Method::GET,
        &format!("/api/v1/jobs/{job_id}/results"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(results["results"].as_array().unwrap().len(), 1);
    assert_eq!(results["results"][0]["iter"], 5);
}

#[tokio::test]
async fn report_outcomes_map_to_status_codes() {
    let app = app(None);
    call(
        &app,
        Method::POST,
        "/api/v1/jobs",
        Some(json!({ "artifact": "opt.jar", "payloads": [1] })),
        None,
    )
    .await;
    call(
        &app,
        Method::POST,
        "/internal/v1/heartbeat",
        Some(json!({ "spotId": "spot-a", "cpuLoad": 10.0, "runningTasks": 0, "totalCores": 2 })),
        None,
    )
    .await;
    let (_, claimed) = call(
        &app,
        Method::POST,
        "/internal/v1/tasks/claim",
        Some(json!({ "spotId": "spot-a", "maxTasks": 1 })),
        None,
    )
    .await;
    let task_id = claimed["tasks"][0]["taskId"].as_str().unwrap().to_string();

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/internal/v1/tasks/{task_id}/fail"),
        Some(json!({ "spotId": "spot-b", "error": "boom", "retriable": true })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].is_string());

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/internal/v1/tasks/{task_id}/fail"),
        Some(json!({ "spotId": "spot-a", "error": "boom", "retriable": true })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["willRetry"], true);

    let (status, _) = call(
        &app,
        Method::POST,
        "/internal/v1/tasks/nope/complete",
        Some(json!({ "spotId": "spot-a", "runtimeMs": 1 })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn internal_routes_require_the_agent_key_when_configured() {
    let app = app(Some("s3cret"));

    let (status, _) = call(&app, Method::POST, "/internal/v1/hello", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(&app, Method::POST, "/internal/v1/hello", None, Some("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(&app, Method::POST, "/internal/v1/hello", None, Some("s3cret")).await;
    assert_eq!(status, StatusCode::OK);

    // public namespace is not gated
    let (status, health) = call(&app, Method::GET, "/api/v1/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["activeSpots"], 1);
}

#[tokio::test]
async fn validation_and_lookup_errors() {
    let app = app(None);

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/jobs",
        Some(json!({ "artifact": "opt.jar", "payloads": [] })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("no payloads"));

    let (status, _) = call(
        &app,
        Method::POST,
        "/internal/v1/heartbeat",
        Some(json!({ "spotId": "s", "cpuLoad": 140.0, "runningTasks": 0, "totalCores": 4 })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, Method::GET, "/api/v1/jobs/missing", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(&app, Method::GET, "/api/v1/tasks/missing", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(&app, Method::DELETE, "/api/v1/spots/missing", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_and_ad_hoc_tasks() {
    let app = app(None);

    let (_, created) = call(
        &app,
        Method::POST,
        "/api/v1/jobs",
        Some(json!({ "artifact": "opt.jar", "algorithms": ["pso"], "dimension": { "min": 2, "max": 4 } })),
        None,
    )
    .await;
    assert_eq!(created["totalTasks"], 3);
    let job_id = created["jobId"].as_str().unwrap().to_string();

    let uri = format!("/api/v1/jobs/{job_id}/cancel");
    let (status, body) = call(&app, Method::POST, &uri, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "CANCELLED");
    assert_eq!(body["cancelledTasks"], 3);

    let (status, _) = call(&app, Method::POST, &uri, None, None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, task) = call(
        &app,
        Method::POST,
        "/api/v1/tasks",
        Some(json!({ "payload": { "x": 1 }, "priority": 3 })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let task_id = task["taskId"].as_str().unwrap();

    let (status, info) = call(&app, Method::GET, &format!("/api/v1/tasks/{task_id}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["status"], "NEW");
    assert_eq!(info["priority"], 3);
    assert_eq!(info["maxAttempts"], 3);
    assert!(info["jobId"].is_null());
}

#[tokio::test]
async fn deleting_a_spot_releases_its_work() {
    let app = app(None);
    let (_, hello) = call(&app, Method::POST, "/internal/v1/hello", None, None).await;
    let spot_id = hello["spotId"].as_str().unwrap().to_string();

    call(
        &app,
        Method::POST,
        "/api/v1/tasks",
        Some(json!({ "payload": 1 })),
        None,
    )
    .await;
    let (_, claimed) = call(
        &app,
        Method::POST,
        "/internal/v1/tasks/claim",
        Some(json!({ "spotId": spot_id, "maxTasks": 1 })),
        None,
    )
    .await;
    let task_id = claimed["tasks"][0]["taskId"].as_str().unwrap().to_string();

    let (status, _) = call(&app, Method::DELETE, &format!("/api/v1/spots/{spot_id}"), None, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, info) = call(&app, Method::GET, &format!("/api/v1/tasks/{task_id}"), None, None).await;
    assert_eq!(info["status"], "NEW");
    assert!(info["assignedTo"].is_null());

    let (_, spots) = call(&app, Method::GET, "/api/v1/spots", None, None).await;
    assert!(spots["spots"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_bodies_get_the_error_envelope() {
    let app = app(None);

    for (uri, body) in [
        ("/api/v1/jobs", "{not json"),
        ("/internal/v1/tasks/claim", r#"{"spotId": "s"}"#),
    ] {
        let req = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{uri}");
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value["error"]
            .as_str()
            .unwrap()
            .starts_with("invalid request body"));
    }
}

#[tokio::test]
async fn unregistered_spot_gets_no_work() {
    let app = app(None);
    call(
        &app,
        Method::POST,
        "/api/v1/tasks",
        Some(json!({ "payload": 1 })),
        None,
    )
    .await;

    let (status, claimed) = call(
        &app,
        Method::POST,
        "/internal/v1/tasks/claim",
        Some(json!({ "spotId": "ghost", "maxTasks": 1 })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(claimed["tasks"].as_array().unwrap().is_empty());
}

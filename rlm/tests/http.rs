use axum::{
    body::{to_bytes, Body},
    http::{header::CONTENT_TYPE, Request, StatusCode},
    Router,
};
use chrono::{TimeZone, Utc};
use rlm::{
    api::{router, AppState},
    auth::{HeaderPrincipalResolver, OpenAccessPolicy, PRINCIPAL_HEADER},
    service::LeaseService,
    store::memory::InMemoryLeaseStore,
    time::ManualClock,
    PrincipalId,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn app() -> (Router, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap()));
    let service = LeaseService::new(Arc::new(InMemoryLeaseStore::new()), clock.clone());
    let state = AppState::new(
        service,
        Arc::new(HeaderPrincipalResolver::default()),
        Arc::new(OpenAccessPolicy::new([PrincipalId::from("root")])),
    );
    (router(state), clock)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(path: &str, principal: &str, body: Value) -> Request<Body> {
    Request::post(path)
        .header(PRINCIPAL_HEADER, principal)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(path: &str, principal: &str) -> Request<Body> {
    Request::get(path)
        .header(PRINCIPAL_HEADER, principal)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_acquire_conflict_body() {
    let (app, clock) = app();
    let lock = json!({"resourceId": "U1", "scope": "ASSESS", "type": "EXCLUSIVE"});

    let (status, body) = send(&app, post_json("/locks/acquire", "alice", lock.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["acquired"], true);
    let expires_at = body["expiresAt"].clone();

    clock.set_minutes(5);
    let (status, body) = send(&app, post_json("/locks/acquire", "bob", lock)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["holder"], "alice");
    assert_eq!(body["expiresAt"], expires_at);
    assert_eq!(body["scope"], "ASSESS");
}

#[tokio::test]
async fn test_release_twice() {
    let (app, _) = app();
    let lock = json!({"resourceId": "U1", "type": "EXCLUSIVE"});
    send(&app, post_json("/locks/acquire", "alice", lock.clone())).await;

    let (status, body) = send(&app, post_json("/locks/release", "alice", lock.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"released": true}));

    let (status, body) = send(&app, post_json("/locks/release", "alice", lock)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"alreadyReleased": true}));
}

#[tokio::test]
async fn test_form_encoded_beacon_release() {
    let (app, _) = app();
    let lock = json!({"resourceId": "U1", "scope": "EDIT", "type": "EXCLUSIVE"});
    send(&app, post_json("/locks/acquire", "alice", lock)).await;

    let beacon = Request::post("/locks/release")
        .header(PRINCIPAL_HEADER, "alice")
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("resourceId=U1&scope=EDIT&lockType=EXCLUSIVE"))
        .unwrap();
    let (status, body) = send(&app, beacon).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["released"], true);

    let (_, status) = send(&app, get("/locks/status?resourceId=U1&scope=EDIT", "bob")).await;
    assert_eq!(status["hasExclusiveLock"], false);
    assert_eq!(status["canEdit"], true);
}

#[tokio::test]
async fn test_status_for_holder_and_others() {
    let (app, _) = app();
    send(
        &app,
        post_json("/locks/acquire", "alice", json!({"resourceId": "U1", "type": "EXCLUSIVE"})),
    )
    .await;

    let (_, own) = send(&app, get("/locks/status?resourceId=U1", "alice")).await;
    assert_eq!(own["hasExclusiveLock"], true);
    assert_eq!(own["canEdit"], true);
    assert_eq!(own["isOwnedByCurrentUser"], true);

    let (_, other) = send(&app, get("/locks/status?resourceId=U1", "bob")).await;
    assert_eq!(other["canEdit"], false);
    assert_eq!(other["holder"], "alice");
    assert!(other["expiresAt"].is_string());
}

#[tokio::test]
async fn test_rejected_requests() {
    let (app, _) = app();

    let anonymous = Request::get("/locks/status?resourceId=U1")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, anonymous).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        &app,
        post_json("/locks/acquire", "alice", json!({"resourceId": "U1", "scope": "NOPE", "type": "EXCLUSIVE"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("NOPE"));

    let (status, _) = send(
        &app,
        post_json("/locks/acquire", "alice", json!({"resourceId": " ", "type": "SHARED"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_debug_and_force_release_need_admin() {
    let (app, _) = app();
    send(
        &app,
        post_json("/locks/acquire", "alice", json!({"resourceId": "U1", "type": "EXCLUSIVE"})),
    )
    .await;
    send(
        &app,
        post_json(
            "/locks/acquire",
            "bob",
            json!({"resourceId": "U1", "scope": "EDIT", "type": "SHARED"}),
        ),
    )
    .await;

    let (status, _) = send(&app, get("/locks/debug?resourceId=U1", "alice")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, history) = send(&app, get("/locks/debug?resourceId=U1", "root")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history["summary"]["totalLocks"], 2);
    assert_eq!(history["summary"]["exclusiveLocks"], 1);

    let force_all = json!({"resourceId": "U1", "scope": "ALL", "action": "forceReleaseAll"});
    let (status, _) = send(&app, post_json("/locks/force-release", "alice", force_all.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&app, post_json("/locks/force-release", "root", force_all)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["releasedCount"], 2);
}

#[tokio::test]
async fn test_force_release_own_leases() {
    let (app, _) = app();
    for scope in ["ASSESS", "EDIT"] {
        send(
            &app,
            post_json(
                "/locks/acquire",
                "alice",
                json!({"resourceId": "U1", "scope": scope, "type": "EXCLUSIVE"}),
            ),
        )
        .await;
    }
    send(
        &app,
        post_json(
            "/locks/acquire",
            "bob",
            json!({"resourceId": "U1", "scope": "GOVERNANCE_UAE_AI", "type": "EXCLUSIVE"}),
        ),
    )
    .await;

    let (status, body) = send(
        &app,
        post_json(
            "/locks/force-release",
            "alice",
            json!({"resourceId": "U1", "scope": "ALL", "action": "forceReleaseUser"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["releasedCount"], 2);

    let (_, bob) = send(&app, get("/locks/status?resourceId=U1&scope=GOVERNANCE_UAE_AI", "alice")).await;
    assert_eq!(bob["holder"], "bob");
}

#[tokio::test]
async fn test_health() {
    let (app, _) = app();
    let (status, body) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_multipart_beacon_release() {
    let (app, _) = app();
    let lock = json!({"resourceId": "U1", "scope": "EDIT", "type": "EXCLUSIVE"});
    send(&app, post_json("/locks/acquire", "alice", lock)).await;

    let boundary = "rlm-beacon";
    let body: String = [("resourceId", "U1"), ("scope", "EDIT"), ("type", "EXCLUSIVE")]
        .iter()
        .map(|(name, value)| {
            format!("--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
        })
        .chain(std::iter::once(format!("--{boundary}--\r\n")))
        .collect();
    let beacon = Request::post("/locks/release")
        .header(PRINCIPAL_HEADER, "alice")
        .header(CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
        .body(Body::from(body))
        .unwrap();
    let (status, body) = send(&app, beacon).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["released"], true);

    let (_, status) = send(&app, get("/locks/status?resourceId=U1&scope=EDIT", "bob")).await;
    assert_eq!(status["hasExclusiveLock"], false);
}

#[tokio::test]
async fn test_anonymous_caller_is_rejected_before_body_checks() {
    let (app, _) = app();

    let garbage = Request::post("/locks/acquire")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = send(&app, garbage).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let bad_scope = Request::post("/locks/release")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"resourceId": "U1", "scope": "NOPE", "type": "EXCLUSIVE"}).to_string()))
        .unwrap();
    let (status, _) = send(&app, bad_scope).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let no_query = Request::get("/locks/status").body(Body::empty()).unwrap();
    let (status, _) = send(&app, no_query).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let force = Request::post("/locks/force-release")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from("[]"))
        .unwrap();
    let (status, _) = send(&app, force).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // With a principal the same malformed body is a plain bad request.
    let (status, _) = send(&app, get("/locks/status", "alice")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

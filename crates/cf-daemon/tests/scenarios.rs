//! End-to-end scenarios driven through the HTTP surface with a scripted
//! completion provider. Each test builds a full daemon (store on disk,
//! event bus, hub, router) inside a scratch directory.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use cf_agents::gates::{GateOutcome, QualityGate, ScriptedGateExecutor};
use cf_core::config::Config;
use cf_core::store::NewFinding;
use cf_core::types::{GateKind, Severity};
use cf_daemon::daemon::Daemon;
use cf_harness::provider::{CompletionError, ScriptStep, ScriptedProvider};

const ARTIFACT_REPLY: &str = r#"[{"path": "src/out.rs", "content": "pub fn out() {}"}]"#;
const COMPLETE: &str = "DISCOVERY_COMPLETE";

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

struct TestRig {
    daemon: Daemon,
    _dir: tempfile::TempDir,
}

impl TestRig {
    fn router(&self) -> Router {
        self.daemon.router()
    }
}

async fn rig(steps: Vec<ScriptStep>) -> TestRig {
    rig_with_gates(steps, passing_gates()).await
}

async fn rig_with_gates(steps: Vec<ScriptStep>, gates: QualityGate) -> TestRig {
    let dir = tempfile::tempdir().expect("scratch dir");
    let mut config = Config::default();
    config.database_path = dir.path().join("codeframe.db");
    config.workspaces_root = dir.path().join("workspaces");
    config.pause_grace_ms = 300;
    let provider = Arc::new(ScriptedProvider::new(steps).with_fallback(ARTIFACT_REPLY));
    let daemon = Daemon::with_gates(config, provider, gates)
        .await
        .expect("daemon");
    TestRig { daemon, _dir: dir }
}

fn passing_gates() -> QualityGate {
    QualityGate::from_executors(
        GateKind::execution_order()
            .iter()
            .map(|k| {
                Arc::new(ScriptedGateExecutor::passing(*k))
                    as Arc<dyn cf_agents::gates::GateExecutor>
            })
            .collect(),
    )
}

async fn send(router: &Router, method: &str, path: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
    let builder = Request::builder().method(method).uri(path);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    };
    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

async fn get(router: &Router, path: &str) -> (StatusCode, serde_json::Value) {
    send(router, "GET", path, None).await
}

async fn post(router: &Router, path: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    send(router, "POST", path, Some(body)).await
}

async fn create_project(router: &Router) -> i64 {
    let (status, body) = post(
        router,
        "/api/projects",
        serde_json::json!({"name": "hw", "description": "REST greet", "source_type": "empty"}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{:?}", body);
    body["id"].as_i64().expect("project id")
}

async fn counts(router: &Router, project: i64) -> serde_json::Value {
    let (status, body) = get(router, &format!("/api/projects/{}/tasks", project)).await;
    assert_eq!(status, StatusCode::OK);
    body["counts"].clone()
}

async fn wait_for_count(router: &Router, project: i64, field: &str, expected: i64) {
    for _ in 0..200 {
        if counts(router, project).await[field] == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("counts.{} never reached {}", field, expected);
}

async fn wait_for_phase(router: &Router, project: i64, phase: &str) {
    for _ in 0..200 {
        let (_, body) = get(router, &format!("/api/projects/{}", project)).await;
        if body["phase"] == phase {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("project never reached phase {}", phase);
}

// ---------------------------------------------------------------------------
// S1 — happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s1_hello_world_happy_path() {
    let steps = vec![
        ScriptStep::reply("What kind of interface should this be?"),
        ScriptStep::reply("What should the endpoints do?"),
        ScriptStep::reply("Does it need authentication?"),
        ScriptStep::reply(COMPLETE),
        ScriptStep::reply("# PRD\nA REST greeting service."),
        ScriptStep::reply(
            r#"[{"task_number":"1","title":"GET /health"},
                {"task_number":"2","title":"GET /hello"},
                {"task_number":"3","title":"GET /hello/{name}"}]"#,
        ),
    ];
    let rig = rig(steps).await;
    let router = rig.router();

    let project = create_project(&router).await;

    let (status, _) = post(&router, &format!("/api/projects/{}/discovery/start", project), serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);

    for answer in ["A REST API", "greet clients", "no auth yet"] {
        let (status, body) = post(
            &router,
            &format!("/api/projects/{}/discovery/answer", project),
            serde_json::json!({"text": answer}),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{:?}", body);
    }

    // PRD available, phase advanced to planning
    let (_, progress) = get(&router, &format!("/api/projects/{}/discovery/progress", project)).await;
    assert_eq!(progress["phase"], "planning");
    assert_eq!(progress["prd"]["status"], "available");
    assert_eq!(progress["approved"], false);

    let (status, _) = post(&router, &format!("/api/projects/{}/discovery/generate-tasks", project), serde_json::json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_for_count(&router, project, "pending", 3).await;

    let (status, approval) = post(
        &router,
        &format!("/api/projects/{}/tasks/approve", project),
        serde_json::json!({"approved": true, "excluded_task_ids": []}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(approval["success"], true);
    assert_eq!(approval["phase"], "active");
    assert_eq!(approval["approved_count"], 3);

    wait_for_count(&router, project, "completed", 3).await;
    wait_for_phase(&router, project, "complete").await;

    // idempotence: a second approval reports AlreadyApproved
    let (status, again) = post(
        &router,
        &format!("/api/projects/{}/tasks/approve", project),
        serde_json::json!({"approved": true, "excluded_task_ids": []}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["message"], "AlreadyApproved");
    assert_eq!(again["success"], false);
}

// ---------------------------------------------------------------------------
// S2 — dependency ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s2_dependency_ordering() {
    let steps = vec![
        ScriptStep::reply(COMPLETE),
        ScriptStep::reply("# PRD"),
        ScriptStep::reply(
            r#"[{"task_number":"1","title":"A"},
                {"task_number":"2","title":"B","depends_on":["1"]},
                {"task_number":"3","title":"C","depends_on":["1"]},
                {"task_number":"4","title":"D","depends_on":["2","3"]}]"#,
        ),
    ];
    let rig = rig(steps).await;
    let router = rig.router();
    let project = create_project(&router).await;

    post(&router, &format!("/api/projects/{}/discovery/start", project), serde_json::json!({})).await;
    post(&router, &format!("/api/projects/{}/discovery/generate-tasks", project), serde_json::json!({})).await;
    wait_for_count(&router, project, "pending", 4).await;
    post(
        &router,
        &format!("/api/projects/{}/tasks/approve", project),
        serde_json::json!({"approved": true, "excluded_task_ids": []}),
    )
    .await;
    wait_for_count(&router, project, "completed", 4).await;

    let (_, body) = get(&router, &format!("/api/projects/{}/tasks", project)).await;
    let tasks = body["tasks"].as_array().unwrap();
    let ts = |i: usize, field: &str| {
        let raw = tasks[i][field].as_str().expect("timestamp");
        chrono::DateTime::parse_from_rfc3339(raw).expect("rfc3339")
    };
    assert!(ts(0, "completed_at") <= ts(1, "started_at"));
    assert!(ts(0, "completed_at") <= ts(2, "started_at"));
    assert!(ts(1, "completed_at") <= ts(3, "started_at"));
    assert!(ts(2, "completed_at") <= ts(3, "started_at"));
}

// ---------------------------------------------------------------------------
// S3 — retry to success
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s3_timeout_twice_then_completes() {
    let steps = vec![
        ScriptStep::reply(COMPLETE),
        ScriptStep::reply("# PRD"),
        ScriptStep::reply(r#"[{"task_number":"1","title":"only task"}]"#),
        ScriptStep::Fail(CompletionError::Timeout),
        ScriptStep::Fail(CompletionError::Timeout),
        ScriptStep::reply(ARTIFACT_REPLY),
    ];
    let rig = rig(steps).await;
    let router = rig.router();
    let project = create_project(&router).await;

    post(&router, &format!("/api/projects/{}/discovery/start", project), serde_json::json!({})).await;
    post(&router, &format!("/api/projects/{}/discovery/generate-tasks", project), serde_json::json!({})).await;
    wait_for_count(&router, project, "pending", 1).await;
    post(
        &router,
        &format!("/api/projects/{}/tasks/approve", project),
        serde_json::json!({"approved": true, "excluded_task_ids": []}),
    )
    .await;

    wait_for_count(&router, project, "completed", 1).await;
    let (_, body) = get(&router, &format!("/api/projects/{}/tasks", project)).await;
    let task = &body["tasks"][0];
    assert_eq!(task["status"], "completed");
    assert_eq!(task["attempt_count"], 3);
}

// ---------------------------------------------------------------------------
// S4 — critical review finding
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s4_critical_review_finding_fails_task_into_review_phase() {
    let critical = NewFinding {
        gate: GateKind::Review,
        severity: Severity::Critical,
        file: None,
        line: None,
        message: "delivered work is unusable".into(),
        recommendation: None,
    };
    let mut executors: Vec<Arc<dyn cf_agents::gates::GateExecutor>> =
        vec![Arc::new(ScriptedGateExecutor::new(
            GateKind::Review,
            vec![
                GateOutcome::failed(vec![critical.clone()]),
                GateOutcome::failed(vec![critical.clone()]),
                GateOutcome::failed(vec![critical]),
            ],
        ))];
    for kind in &GateKind::execution_order()[1..] {
        executors.push(Arc::new(ScriptedGateExecutor::passing(*kind)));
    }

    let steps = vec![
        ScriptStep::reply(COMPLETE),
        ScriptStep::reply("# PRD"),
        ScriptStep::reply(r#"[{"task_number":"1","title":"only task"}]"#),
    ];
    let rig = rig_with_gates(steps, QualityGate::from_executors(executors)).await;
    let router = rig.router();
    let project = create_project(&router).await;

    post(&router, &format!("/api/projects/{}/discovery/start", project), serde_json::json!({})).await;
    post(&router, &format!("/api/projects/{}/discovery/generate-tasks", project), serde_json::json!({})).await;
    wait_for_count(&router, project, "pending", 1).await;
    post(
        &router,
        &format!("/api/projects/{}/tasks/approve", project),
        serde_json::json!({"approved": true, "excluded_task_ids": []}),
    )
    .await;

    wait_for_count(&router, project, "failed", 1).await;
    wait_for_phase(&router, project, "review").await;

    // the findings survived on the task detail view
    let (_, body) = get(&router, &format!("/api/projects/{}/tasks", project)).await;
    let task_id = body["tasks"][0]["id"].as_i64().unwrap();
    let (_, detail) = get(&router, &format!("/api/projects/{}/tasks/{}", project, task_id)).await;
    assert!(detail["findings"]
        .as_array()
        .unwrap()
        .iter()
        .any(|f| f["severity"] == "critical"));
}

// ---------------------------------------------------------------------------
// S5 — late joiner reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s5_late_joiner_sees_authoritative_state_without_replay() {
    let steps = vec![
        ScriptStep::reply(COMPLETE),
        ScriptStep::reply("# PRD"),
        ScriptStep::reply(
            r#"[{"task_number":"1","title":"A"},
                {"task_number":"2","title":"B"},
                {"task_number":"3","title":"C","depends_on":["1","2"]},
                {"task_number":"4","title":"D","depends_on":["1","2"]},
                {"task_number":"5","title":"E","depends_on":["1","2"]}]"#,
        ),
        ScriptStep::reply(ARTIFACT_REPLY),
        ScriptStep::reply(ARTIFACT_REPLY),
        ScriptStep::Hang,
        ScriptStep::Hang,
        ScriptStep::Hang,
    ];
    let rig = rig(steps).await;
    let router = rig.router();
    let project = create_project(&router).await;

    post(&router, &format!("/api/projects/{}/discovery/start", project), serde_json::json!({})).await;
    post(&router, &format!("/api/projects/{}/discovery/generate-tasks", project), serde_json::json!({})).await;
    wait_for_count(&router, project, "pending", 5).await;
    post(
        &router,
        &format!("/api/projects/{}/tasks/approve", project),
        serde_json::json!({"approved": true, "excluded_task_ids": []}),
    )
    .await;
    wait_for_count(&router, project, "completed", 2).await;

    // subscribe after the fact: no historical frames are delivered
    let late = rig.daemon.api_state().bus.subscribe(project);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(late.try_recv().is_err(), "late joiner must not see replay");

    // the query endpoints carry the authoritative state instead
    let (_, progress) = get(&router, &format!("/api/projects/{}/discovery/progress", project)).await;
    assert_eq!(progress["phase"], "active");
    assert_eq!(progress["approved"], true);
    assert_eq!(progress["prd"]["status"], "available");
    let c = counts(&router, project).await;
    assert_eq!(c["completed"], 2);
    assert_eq!(c["in_progress"], 3);

    let (status, _) = post(&router, &format!("/api/projects/{}/session/stop", project), serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);
}

// ---------------------------------------------------------------------------
// S6 — checkpoint restore guard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s6_restore_refused_while_active_then_allowed_after_stop() {
    let steps = vec![
        ScriptStep::reply(COMPLETE),
        ScriptStep::reply("# PRD"),
        ScriptStep::reply(r#"[{"task_number":"1","title":"only task"}]"#),
        ScriptStep::Hang,
    ];
    let rig = rig(steps).await;
    let router = rig.router();
    let project = create_project(&router).await;

    let (status, checkpoint) = post(
        &router,
        &format!("/api/projects/{}/checkpoints", project),
        serde_json::json!({"name": "c1"}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let checkpoint_id = checkpoint["id"].as_i64().unwrap();
    let sha = checkpoint["git_sha"].as_str().unwrap().to_string();

    // listed with the persisted SHA
    let (_, listed) = get(&router, &format!("/api/projects/{}/checkpoints", project)).await;
    assert_eq!(listed["checkpoints"][0]["git_sha"], sha.as_str());

    post(&router, &format!("/api/projects/{}/discovery/start", project), serde_json::json!({})).await;
    post(&router, &format!("/api/projects/{}/discovery/generate-tasks", project), serde_json::json!({})).await;
    wait_for_count(&router, project, "pending", 1).await;
    post(
        &router,
        &format!("/api/projects/{}/tasks/approve", project),
        serde_json::json!({"approved": true, "excluded_task_ids": []}),
    )
    .await;
    wait_for_count(&router, project, "in_progress", 1).await;

    let (status, _) = post(
        &router,
        &format!("/api/projects/{}/checkpoints/{}/restore", project, checkpoint_id),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = post(&router, &format!("/api/projects/{}/session/stop", project), serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = post(
        &router,
        &format!("/api/projects/{}/checkpoints/{}/restore", project, checkpoint_id),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, refreshed) = get(&router, &format!("/api/projects/{}", project)).await;
    assert_eq!(refreshed["current_commit"], sha.as_str());
}

// ---------------------------------------------------------------------------
// Boundary behaviors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_body_is_422_with_details() {
    let rig = rig(vec![]).await;
    let router = rig.router();
    let (status, body) = post(
        &router,
        "/api/projects",
        serde_json::json!({"name": "x", "description": "y", "source_type": "empty", "extra": 1}),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["kind"], "validation");
    // nothing was written
    let (_, listed) = get(&router, "/api/projects").await;
    assert_eq!(listed["projects"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn answer_without_pending_question_is_409() {
    let rig = rig(vec![]).await;
    let router = rig.router();
    let project = create_project(&router).await;
    let (status, body) = post(
        &router,
        &format!("/api/projects/{}/discovery/answer", project),
        serde_json::json!({"text": "hello"}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT, "{:?}", body);
    assert_eq!(body["error"]["kind"], "conflict");
}

#[tokio::test]
async fn health_and_ws_health_probes() {
    let rig = rig(vec![]).await;
    let router = rig.router();
    let (status, body) = get(&router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    let (status, body) = get(&router, "/ws/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn unknown_project_is_404() {
    let rig = rig(vec![]).await;
    let router = rig.router();
    let (status, body) = get(&router, "/api/projects/999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");
}

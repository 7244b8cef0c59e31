//! Deploy lifecycle: provision through the dashboard, restart survival.

use moltagent_tests::{TestHarness, minimal_manifest, wait_until};
use molt_proto::ActionCategory;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn spend_action(amount: f64) -> molt_proto::ActionLogEntry {
    molt_proto::ActionLogEntry {
        id: uuid::Uuid::new_v4().to_string(),
        timestamp: chrono::Utc::now(),
        category: ActionCategory::Spend,
        summary: "bought api credits".to_string(),
        details: Some(json!({"amount": amount})),
        duration_ms: None,
    }
}

fn plain_action() -> molt_proto::ActionLogEntry {
    molt_proto::ActionLogEntry {
        id: uuid::Uuid::new_v4().to_string(),
        timestamp: chrono::Utc::now(),
        category: ActionCategory::Execute,
        summary: "ran a script".to_string(),
        details: None,
        duration_ms: Some(12),
    }
}

#[tokio::test]
async fn happy_path_deploy_registers_agent() {
    let dir = tempfile::tempdir().unwrap();
    let harness = TestHarness::start(dir.path()).await;
    let agent_id = uuid::Uuid::new_v4().to_string();

    let (status, body) = harness
        .api_post("/dashboard/agents", minimal_manifest(&agent_id, "a1"))
        .await;
    assert_eq!(status, 201, "unexpected body: {body}");
    assert_eq!(body["agentId"], agent_id.as_str());
    assert_eq!(harness.create_calls.load(Ordering::SeqCst), 1);

    let (status, detail) = harness
        .api_get(&format!("/dashboard/agents/{agent_id}"))
        .await;
    assert_eq!(status, 200);
    assert_eq!(detail["connection"], "unknown");
    assert!(detail["deployedAt"].is_string());
    assert_eq!(detail["instance"]["provider"], "docker-local");
    // Control-plane token never leaves the server unredacted.
    assert_eq!(detail["manifest"]["controlPlane"]["token"], "***");

    harness.stop().await;
}

#[tokio::test]
async fn invalid_manifest_is_rejected_with_issues() {
    let dir = tempfile::tempdir().unwrap();
    let harness = TestHarness::start(dir.path()).await;

    let (status, body) = harness
        .api_post(
            "/dashboard/agents",
            json!({
                "identity": { "id": "not-a-uuid", "name": "" },
                "goals": [{ "id": "g1", "description": "win", "priority": 9 }]
            }),
        )
        .await;
    assert_eq!(status, 400);
    let issues = body["issues"].as_array().expect("issue list");
    assert!(issues.len() >= 3, "expected id, name, priority issues: {body}");
    assert_eq!(harness.create_calls.load(Ordering::SeqCst), 0);

    harness.stop().await;
}

#[tokio::test]
async fn delete_destroys_instance_and_removes_record() {
    let dir = tempfile::tempdir().unwrap();
    let harness = TestHarness::start(dir.path()).await;
    let agent_id = uuid::Uuid::new_v4().to_string();

    let (status, _) = harness
        .api_post("/dashboard/agents", minimal_manifest(&agent_id, "a1"))
        .await;
    assert_eq!(status, 201);

    let (status, body) = harness
        .api_delete(&format!("/dashboard/agents/{agent_id}"))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["removed"], true);
    assert_eq!(body["instanceDestroyed"], true);
    assert_eq!(harness.destroy_calls.load(Ordering::SeqCst), 1);

    let (status, _) = harness
        .api_get(&format!("/dashboard/agents/{agent_id}"))
        .await;
    assert_eq!(status, 404);

    harness.stop().await;
}

#[tokio::test]
async fn restart_preserves_fleet_state() {
    let dir = tempfile::tempdir().unwrap();
    let first = uuid::Uuid::new_v4().to_string();
    let second = uuid::Uuid::new_v4().to_string();

    {
        let harness = TestHarness::start(dir.path()).await;
        for (id, name) in [(&first, "a1"), (&second, "a2")] {
            let (status, _) = harness
                .api_post("/dashboard/agents", minimal_manifest(id, name))
                .await;
            assert_eq!(status, 201);
            for _ in 0..4 {
                harness.fleet.record_action(id, plain_action()).await;
            }
            harness.fleet.record_action(id, spend_action(3.0)).await;
        }
        harness.stop().await;
    }

    let harness = TestHarness::start(dir.path()).await;
    let (status, body) = harness.api_get("/dashboard/agents").await;
    assert_eq!(status, 200);
    assert_eq!(body["agents"].as_array().unwrap().len(), 2);

    for id in [&first, &second] {
        let (status, detail) = harness.api_get(&format!("/dashboard/agents/{id}")).await;
        assert_eq!(status, 200);
        assert_eq!(detail["connection"], "offline");
        assert_eq!(detail["totalActions"], 5);
        assert_eq!(detail["recentActions"].as_array().unwrap().len(), 5);
        assert!((detail["totalSpendUsd"].as_f64().unwrap() - 3.0).abs() < 1e-9);
    }

    // The actions endpoint pages the preserved ring.
    let (status, page) = harness
        .api_get(&format!("/dashboard/agents/{first}/actions?limit=2&offset=0"))
        .await;
    assert_eq!(status, 200);
    assert_eq!(page["actions"].as_array().unwrap().len(), 2);
    assert_eq!(page["totalActions"], 5);

    harness.stop().await;
}

#[tokio::test]
async fn overview_reports_fleet_and_approvals() {
    let dir = tempfile::tempdir().unwrap();
    let harness = TestHarness::start(dir.path()).await;
    let agent_id = uuid::Uuid::new_v4().to_string();

    harness
        .api_post("/dashboard/agents", minimal_manifest(&agent_id, "a1"))
        .await;

    let ok = wait_until(Duration::from_secs(2), || async {
        let (_, body) = harness.api_get("/dashboard/overview").await;
        body["fleet"]["totalAgents"] == 1 && body["approvals"]["pending"] == 0
    })
    .await;
    assert!(ok, "overview never settled");

    harness.stop().await;
}

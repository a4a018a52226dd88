//! REST/WebSocket façade tests, run in-process via `axum-test`.

use std::time::Duration;

use axum_test::TestServer;
use cardlink_client::run_session;
use cardlink_types::event::Event;
use serde_json::Value;

use crate::setup::{TestBench, wait_for_session};


fn rest(bench: &TestBench) -> TestServer {
    TestServer::builder()
        .http_transport()
        .build(bench.handle.api_router())
        .expect("can build test server")
}

#[tokio::test]
async fn server_status_reports_the_listener() -> eyre::Result<()> {
    let bench = TestBench::start(|_| {}).await?;
    let rest = rest(&bench);

    let status: Value = rest.get("/api/server/status").await.json();
    assert_eq!(status["running"], true);
    assert_eq!(status["port"], bench.handle.local_addr().port());
    assert_eq!(status["active_sessions"], 0);
    assert_eq!(status["total_sessions"], 0);

    bench.handle.shutdown().await
}

#[tokio::test]
async fn sessions_endpoints_cover_live_and_ended_sessions() -> eyre::Result<()> {
    let bench = TestBench::start(|_| {}).await?;
    let rest = rest(&bench);
    let mut events = bench.handle.event_bus.subscribe();

    let empty: Value = rest.get("/api/sessions").await.json();
    assert_eq!(empty.as_array().expect("array").len(), 0);
    rest.get("/api/sessions/00000000-0000-0000-0000-000000000000")
        .await
        .assert_status_not_found();

    // live session: stage one APDU over REST while the simulator waits
    let mut sim = bench.sim_config();
    sim.initial_pull_delay = Duration::from_secs(1);
    let client = tokio::spawn(async move { run_session(&sim).await });
    let session_id = wait_for_session(&mut events).await;

    let listed: Value = rest.get("/api/sessions").await.json();
    assert_eq!(listed.as_array().expect("array").len(), 1);
    assert_eq!(listed[0]["psk_identity"], "TEST_UICC_001");

    let queued: Value = rest
        .post(&format!("/api/sessions/{session_id}/apdus"))
        .json(&serde_json::json!({ "hex": "00A4040007A0000001510000" }))
        .await
        .json();
    assert_eq!(queued["queued_position"], 1);

    rest.post(&format!("/api/sessions/{session_id}/apdus"))
        .json(&serde_json::json!({ "hex": "zz" }))
        .await
        .assert_status_bad_request();

    let report = client.await??;
    assert_eq!(report.exchanges.len(), 1);
    setup::wait_for_event(&mut events, |e| matches!(e, Event::SessionEnded { .. })).await;

    // ended session is still resolvable with full history
    let session: Value = rest.get(&format!("/api/sessions/{session_id}")).await.json();
    assert_eq!(session["state"], "CLOSED");
    assert_eq!(session["history"].as_array().expect("array").len(), 2);

    bench.handle.shutdown().await
}

#[tokio::test]
async fn clear_queue_drops_pending_commands() -> eyre::Result<()> {
    let bench = TestBench::start(|_| {}).await?;
    let rest = rest(&bench);
    let mut events = bench.handle.event_bus.subscribe();

    let mut sim = bench.sim_config();
    sim.initial_pull_delay = Duration::from_secs(1);
    let client = tokio::spawn(async move { run_session(&sim).await });
    let session_id = wait_for_session(&mut events).await;

    for _ in 0..3 {
        rest.post(&format!("/api/sessions/{session_id}/apdus"))
            .json(&serde_json::json!({ "hex": "00A4040007A0000001510000" }))
            .await
            .assert_status_ok();
    }
    let cleared: Value = rest
        .delete(&format!("/api/sessions/{session_id}/apdus"))
        .await
        .json();
    assert_eq!(cleared["cleared"], 3);

    // nothing left to hand out: the simulator sees an immediate 204
    let report = client.await??;
    assert_eq!(report.exchanges.len(), 0);

    bench.handle.shutdown().await
}

#[tokio::test]
async fn ws_streams_events_as_json() -> eyre::Result<()> {
    let bench = TestBench::start(|_| {}).await?;
    let rest = rest(&bench);

    let mut ws = rest.get_websocket("/ws").await.into_websocket().await;
    bench.handle.event_bus.publish(Event::ServerStopped {});
    let line: Value = ws.receive_json().await;
    assert_eq!(line["type"], "server_stopped");
    assert!(line["seq"].is_number());

    bench.handle.shutdown().await
}

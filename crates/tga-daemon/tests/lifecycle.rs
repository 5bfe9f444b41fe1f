//! End-to-end lifecycle tests: authorization through completion against a
//! real store, with the log inspected after every scenario.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::{default_claims, mint_token, request, runtime_over, TestClock, NOW};
use tga_core::capability::Rejection;
use tga_core::chain;
use tga_core::record::ExecutionState;
use tga_core::store::{SqliteStateStore, StateStore};
use tga_daemon::machine::GovernanceError;

fn setup() -> (Arc<SqliteStateStore>, Arc<TestClock>) {
    (
        Arc::new(SqliteStateStore::in_memory().unwrap()),
        Arc::new(TestClock::new(NOW)),
    )
}

#[tokio::test]
async fn happy_path_commits_four_linked_records() {
    let (store, clock) = setup();
    let runtime = runtime_over(Arc::clone(&store), clock);

    let token = mint_token(&default_claims("cap-001", "fs.read", json!({"one_shot": true})));
    let input = json!({"path": "/etc/hosts"});

    let authorized = runtime
        .authorize("T1", &token, &request("fs.read", input))
        .await
        .unwrap();
    assert!(!authorized.session_id.is_empty());
    assert_eq!(authorized.sequence, 2);

    let dispatched = runtime.dispatch("T1", None).await.unwrap();
    assert_eq!(dispatched.sequence, 3);

    let completed = runtime
        .complete("T1", &json!({"bytes": 1234}), None)
        .await
        .unwrap();
    assert_eq!(completed.sequence, 4);
    assert_eq!(
        completed.output_hash,
        chain::digest_bytes(br#"{"bytes":1234}"#)
    );

    let records = store.load_all().unwrap();
    let states: Vec<ExecutionState> = records.iter().map(|r| r.state).collect();
    assert_eq!(
        states,
        vec![
            ExecutionState::Pending,
            ExecutionState::Authorized,
            ExecutionState::Executing,
            ExecutionState::Completed,
        ]
    );
    assert!(records.iter().all(|r| r.trace_id == "T1"));
    assert!(chain::verify(&records).is_ok());

    // The input hash lands at AUTHORIZED, the output hash at COMPLETED
    assert!(records[0].input_hash.is_none());
    assert_eq!(records[1].input_hash, Some(authorized.input_hash));
    assert_eq!(records[3].output_hash, Some(completed.output_hash));
}

#[tokio::test]
async fn expired_capability_is_rejected_on_the_log() {
    let (store, clock) = setup();
    let runtime = runtime_over(Arc::clone(&store), clock);

    let mut claims = default_claims("cap-001", "fs.read", json!({}));
    claims["issued_at"] = json!(NOW - 100);
    claims["expires_at"] = json!(NOW - 10);
    let token = mint_token(&claims);

    let err = runtime
        .authorize("T1", &token, &request("fs.read", json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "EXPIRED");

    let records = store.load_all().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].state, ExecutionState::Rejected);
    assert_eq!(records[1].reason.as_deref(), Some("EXPIRED"));
    assert!(chain::verify(&records).is_ok());
}

#[tokio::test]
async fn audience_mismatch_is_rejected_with_sub_reason() {
    let (store, clock) = setup();
    let runtime = runtime_over(Arc::clone(&store), clock);

    let mut claims = default_claims("cap-001", "fs.read", json!({}));
    claims["audience"] = json!("tga-2");
    let token = mint_token(&claims);

    let err = runtime
        .authorize("T1", &token, &request("fs.read", json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "UNAUTHORIZED/AUDIENCE");

    let records = store.load_all().unwrap();
    assert_eq!(records[1].state, ExecutionState::Rejected);
    assert_eq!(records[1].reason.as_deref(), Some("UNAUTHORIZED/AUDIENCE"));
}

#[tokio::test]
async fn one_shot_capability_replays_as_rejected() {
    let (store, clock) = setup();
    let runtime = runtime_over(Arc::clone(&store), clock);

    let token = mint_token(&default_claims("cap-001", "fs.read", json!({"one_shot": true})));

    runtime
        .authorize("T1", &token, &request("fs.read", json!({"path": "/a"})))
        .await
        .unwrap();
    runtime.dispatch("T1", None).await.unwrap();
    runtime.complete("T1", &json!({"ok": true}), None).await.unwrap();

    // The same token on a fresh trace must be refused
    let err = runtime
        .authorize("T2", &token, &request("fs.read", json!({"path": "/a"})))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GovernanceError::Rejected {
            rejection: Rejection::Replay,
            ..
        }
    ));

    let records = store.load_all().unwrap();
    let last = records.last().unwrap();
    assert_eq!(last.trace_id, "T2");
    assert_eq!(last.state, ExecutionState::Rejected);
    assert_eq!(last.reason.as_deref(), Some("REPLAY"));
}

#[tokio::test]
async fn missing_token_is_rejected_as_missing_credentials() {
    let (store, clock) = setup();
    let runtime = runtime_over(Arc::clone(&store), clock);

    let err = runtime
        .authorize("T1", b"", &request("fs.read", json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "MISSING_CREDENTIALS");

    let records = store.load_all().unwrap();
    assert_eq!(records[1].reason.as_deref(), Some("MISSING_CREDENTIALS"));
}

#[tokio::test]
async fn unsupported_input_is_rejected_on_the_log() {
    let (store, clock) = setup();
    let runtime = runtime_over(Arc::clone(&store), clock);

    let token = mint_token(&default_claims("cap-001", "fs.read", json!({})));
    let err = runtime
        .authorize("T1", &token, &request("fs.read", json!({"ratio": 0.5})))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "CANONICAL_UNSUPPORTED");

    let records = store.load_all().unwrap();
    assert_eq!(records[1].state, ExecutionState::Rejected);
    assert_eq!(
        records[1].reason.as_deref(),
        Some("CANONICAL_UNSUPPORTED")
    );
}

#[tokio::test]
async fn warm_path_authorizes_repeat_call_without_token() {
    let (store, clock) = setup();
    let runtime = runtime_over(Arc::clone(&store), clock);

    let token = mint_token(&default_claims("cap-001", "fs.read", json!({})));

    let first = runtime
        .authorize("T1", &token, &request("fs.read", json!({"path": "/a"})))
        .await
        .unwrap();
    runtime.dispatch("T1", None).await.unwrap();
    runtime.complete("T1", &json!({}), None).await.unwrap();

    // Repeat call on a new trace through the cached session
    let second = runtime
        .authorize_session("T2", &first.session_id, &request("fs.read", json!({"path": "/b"})))
        .await
        .unwrap();
    assert_eq!(second.capability_hash, first.capability_hash);

    let records = store.load_all().unwrap();
    let t2_states: Vec<ExecutionState> = records
        .iter()
        .filter(|r| r.trace_id == "T2")
        .map(|r| r.state)
        .collect();
    assert_eq!(
        t2_states,
        vec![ExecutionState::Pending, ExecutionState::Authorized]
    );
}

#[tokio::test]
async fn warm_path_misses_fall_back_to_the_cold_path() {
    let (store, clock) = setup();
    let runtime = runtime_over(Arc::clone(&store), clock);

    let err = runtime
        .authorize_session("T1", "no-such-session", &request("fs.read", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, GovernanceError::UnknownSession { .. }));

    // A miss writes nothing; the caller retries with the full token
    assert!(store.load_all().unwrap().is_empty());
}

#[tokio::test]
async fn warm_path_enforces_constraints_per_request() {
    let (store, clock) = setup();
    let runtime = runtime_over(Arc::clone(&store), clock);

    let token = mint_token(&default_claims("cap-001", "fs.read", json!({})));
    let first = runtime
        .authorize("T1", &token, &request("fs.read", json!({})))
        .await
        .unwrap();

    // The cached capability only grants fs.read
    let err = runtime
        .authorize_session("T2", &first.session_id, &request("fs.write", json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "UNAUTHORIZED/TOOL_MISMATCH");
}

#[tokio::test]
async fn events_on_a_terminal_trace_are_refused() {
    let (store, clock) = setup();
    let runtime = runtime_over(Arc::clone(&store), clock);

    let token = mint_token(&default_claims("cap-001", "fs.read", json!({})));
    runtime
        .authorize("T1", &token, &request("fs.read", json!({})))
        .await
        .unwrap();
    runtime.dispatch("T1", None).await.unwrap();
    runtime.complete("T1", &json!({}), None).await.unwrap();

    let record_count = store.load_all().unwrap().len();

    let err = runtime.dispatch("T1", None).await.unwrap_err();
    assert_eq!(err.error_code(), "ALREADY_TERMINAL");
    let err = runtime.complete("T1", &json!({}), None).await.unwrap_err();
    assert_eq!(err.error_code(), "ALREADY_TERMINAL");
    let err = runtime.fail("T1", "TOOL_ERROR", None).await.unwrap_err();
    assert_eq!(err.error_code(), "ALREADY_TERMINAL");

    // Terminal no-ops write nothing
    assert_eq!(store.load_all().unwrap().len(), record_count);
}

#[tokio::test]
async fn tool_failure_is_recorded_with_its_reason() {
    let (store, clock) = setup();
    let runtime = runtime_over(Arc::clone(&store), clock);

    let token = mint_token(&default_claims("cap-001", "fs.read", json!({})));
    runtime
        .authorize("T1", &token, &request("fs.read", json!({})))
        .await
        .unwrap();
    runtime.dispatch("T1", None).await.unwrap();
    runtime.fail("T1", "TOOL_ERROR", None).await.unwrap();

    let tail = store.tail().unwrap().unwrap();
    assert_eq!(tail.state, ExecutionState::Failed);
    assert_eq!(tail.reason.as_deref(), Some("TOOL_ERROR"));
}

#[tokio::test]
async fn capability_expiring_before_dispatch_fails_the_trace() {
    let (store, clock) = setup();
    let runtime = runtime_over(Arc::clone(&store), Arc::clone(&clock));

    let token = mint_token(&default_claims("cap-001", "fs.read", json!({})));
    runtime
        .authorize("T1", &token, &request("fs.read", json!({})))
        .await
        .unwrap();

    // The capability lapses while the caller holds the authorization
    clock.set(NOW + 120);

    let err = runtime.dispatch("T1", None).await.unwrap_err();
    assert_eq!(err.error_code(), "EXPIRED");

    let tail = store.tail().unwrap().unwrap();
    assert_eq!(tail.state, ExecutionState::Failed);
    assert_eq!(tail.reason.as_deref(), Some("EXPIRED"));
}

#[tokio::test]
async fn concurrent_authorize_on_one_trace_yields_one_success() {
    let (store, clock) = setup();
    let runtime = Arc::new(runtime_over(Arc::clone(&store), clock));

    let token = mint_token(&default_claims("cap-001", "fs.read", json!({})));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let runtime = Arc::clone(&runtime);
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            runtime
                .authorize("T1", &token, &request("fs.read", json!({})))
                .await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(e) => assert!(
                matches!(e.error_code(), "TRACE_BUSY" | "ALREADY_TERMINAL"),
                "unexpected error: {e}"
            ),
        }
    }
    assert_eq!(successes, 1);

    // One PENDING and one AUTHORIZED record for the trace, nothing torn
    let records = store.load_all().unwrap();
    assert_eq!(records.len(), 2);
    assert!(chain::verify(&records).is_ok());
}

#[tokio::test]
async fn distinct_traces_progress_in_parallel() {
    let (store, clock) = setup();
    let runtime = Arc::new(runtime_over(Arc::clone(&store), clock));

    let mut handles = Vec::new();
    for i in 0..8 {
        let runtime = Arc::clone(&runtime);
        handles.push(tokio::spawn(async move {
            let claims = default_claims(&format!("cap-{i:03}"), "fs.read", json!({}));
            let token = mint_token(&claims);
            let trace_id = format!("T{i}");
            runtime
                .authorize(&trace_id, &token, &request("fs.read", json!({})))
                .await?;
            runtime.dispatch(&trace_id, None).await?;
            runtime.complete(&trace_id, &json!({"i": i}), None).await?;
            Ok::<(), GovernanceError>(())
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let records = store.load_all().unwrap();
    assert_eq!(records.len(), 32);
    assert!(chain::verify(&records).is_ok());
}

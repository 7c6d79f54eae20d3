// End-to-end transition behaviour through the service boundary:
// role checks, history, optimistic concurrency and named guards.

mod common;

use chrono::Duration;
use common::{admin, lead, org_admin, program_manager, system, Harness};
use review_workflow::{ExecuteTransitionPayload, Session, TransitionRequest, WorkflowError};
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_submit_requires_org_admin_role() {
    let h = Harness::new().await;
    h.start_review("r-1").await;

    let staff = Session::new("staff-1", "STAFF");
    let err = h.transition(&staff, "r-1", "submit").await.unwrap_err();
    assert!(matches!(err, WorkflowError::Forbidden { ref role, .. } if role == "STAFF"));

    let current = h.service.current_state("REVIEW", "r-1").await.unwrap();
    assert_eq!(current.state.code, "DRAFT");
    assert_eq!(current.execution.version, 1);

    let outcome = h.transition(&org_admin(), "r-1", "submit").await.unwrap();
    assert_eq!(outcome.state.code, "SUBMITTED");
    assert_eq!(outcome.event.from_state, "DRAFT");
    assert!(!outcome.event.reached_terminal);

    let current = h.service.current_state("REVIEW", "r-1").await.unwrap();
    assert_eq!(current.state.code, "SUBMITTED");
    assert_eq!(current.execution.version, 2);
}

#[tokio::test]
async fn test_unknown_edge_is_invalid_transition() {
    let h = Harness::new().await;
    h.start_review("r-1").await;

    let err = h.transition(&lead(), "r-1", "accept").await.unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::InvalidTransition { ref from_state, ref transition_code, .. }
            if from_state == "DRAFT" && transition_code == "accept"
    ));
    assert!(h.service.history("REVIEW", "r-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_execution_is_not_found() {
    let h = Harness::new().await;
    let err = h.transition(&org_admin(), "nope", "submit").await.unwrap_err();
    assert!(matches!(err, WorkflowError::NotFound { .. }));
}

#[tokio::test]
async fn test_history_records_round_trip_with_durations() {
    let h = Harness::new().await;
    h.start_review("r-1").await;

    h.time.advance(Duration::hours(4));
    h.transition(&org_admin(), "r-1", "submit").await.unwrap();
    h.time.advance(Duration::days(1));
    h.service
        .execute_transition(
            &program_manager(),
            "REVIEW",
            "r-1",
            ExecuteTransitionPayload {
                transition_code: "return_to_draft".to_string(),
                comment: Some("missing scope statement".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.time.advance(Duration::hours(2));
    h.transition(&org_admin(), "r-1", "submit").await.unwrap();

    let history = h.service.history("REVIEW", "r-1").await.unwrap();
    let path: Vec<(&str, &str)> = history
        .iter()
        .map(|e| (e.from_state.as_str(), e.to_state.as_str()))
        .collect();
    assert_eq!(
        path,
        vec![("DRAFT", "SUBMITTED"), ("SUBMITTED", "DRAFT"), ("DRAFT", "SUBMITTED")]
    );
    assert_eq!(history[0].duration_in_state_secs, 4 * 3600);
    assert_eq!(history[1].duration_in_state_secs, 86_400);
    assert_eq!(history[1].comment.as_deref(), Some("missing scope statement"));
    assert_eq!(history[1].performed_by, "pm-1");
    assert_eq!(history[2].duration_in_state_secs, 2 * 3600);

    let current = h.service.current_state("REVIEW", "r-1").await.unwrap();
    assert_eq!(current.execution.version, 4);
}

#[tokio::test]
async fn test_concurrent_transitions_exactly_one_wins() {
    let h = Harness::new().await;
    h.start_review("r-1").await;
    h.transition(&org_admin(), "r-1", "submit").await.unwrap();
    let observed = h.service.current_state("REVIEW", "r-1").await.unwrap().execution.version;

    let engine = h.service.engine().clone();
    let first = TransitionRequest::new("start_review", lead().actor()).expecting_version(observed);
    let second = TransitionRequest::new("start_review", program_manager().actor()).expecting_version(observed);

    let (a, b) = tokio::join!(
        engine.execute_transition("REVIEW", "r-1", first),
        engine.execute_transition("REVIEW", "r-1", second),
    );

    let results = [a, b];
    let wins = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(WorkflowError::StateConflict { .. })))
        .count();
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 1);

    let history = h.service.history("REVIEW", "r-1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].to_state, "IN_REVIEW");
}

#[tokio::test]
async fn test_many_contenders_on_one_version() {
    let h = Harness::new().await;
    h.start_review("r-1").await;

    let engine = h.service.engine().clone();
    let attempts = (0..8).map(|i| {
        let engine = engine.clone();
        async move {
            let request = TransitionRequest::new("submit", Session::new(format!("oa-{i}"), "ORG_ADMIN").actor())
                .expecting_version(1);
            engine.execute_transition("REVIEW", "r-1", request).await
        }
    });
    let results = futures::future::join_all(attempts).await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(WorkflowError::is_retryable));
    assert_eq!(h.service.history("REVIEW", "r-1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_stale_expected_version_is_rejected() {
    let h = Harness::new().await;
    h.start_review("r-1").await;

    let err = h
        .service
        .execute_transition(
            &org_admin(),
            "REVIEW",
            "r-1",
            ExecuteTransitionPayload {
                transition_code: "submit".to_string(),
                expected_version: Some(7),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::StateConflict { expected_version: 7, actual_version: 1, .. }
    ));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_named_guard_blocks_until_findings_close() {
    let h = Harness::new().await;
    h.start_review("r-1").await;
    h.transition(&org_admin(), "r-1", "submit").await.unwrap();
    h.transition(&lead(), "r-1", "start_review").await.unwrap();
    h.transition(&lead(), "r-1", "accept").await.unwrap();

    h.open_findings.open.store(2, Ordering::SeqCst);
    let err = h.transition(&system(), "r-1", "close").await.unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::GuardFailed { ref guard, ref reason } if guard == "no_open_findings" && reason.contains('2')
    ));

    h.open_findings.open.store(0, Ordering::SeqCst);
    let outcome = h.transition(&system(), "r-1", "close").await.unwrap();
    assert_eq!(outcome.state.code, "CLOSED");
    assert!(outcome.event.reached_terminal);
    assert!(h.service.sla_current("REVIEW", "r-1").await.unwrap().is_none());

    // Terminal: nothing leaves CLOSED.
    let available = h.service.transitions(&admin(), "REVIEW", "r-1").await.unwrap();
    assert!(available.is_empty());
}

#[tokio::test]
async fn test_available_transitions_filtered_by_role() {
    let h = Harness::new().await;
    h.start_review("r-1").await;

    let mut codes: Vec<String> = h
        .service
        .transitions(&org_admin(), "REVIEW", "r-1")
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.code)
        .collect();
    codes.sort();
    assert_eq!(codes, vec!["submit", "withdraw"]);

    let reviewer = h.service.transitions(&lead(), "REVIEW", "r-1").await.unwrap();
    assert!(reviewer.is_empty());
}

#[tokio::test]
async fn test_republished_definition_does_not_move_running_executions() {
    let h = Harness::new().await;
    h.start_review("r-1").await;

    let mut next = h.service.engine().definitions().draft_from_active("REVIEW").await.unwrap();
    next.transitions.retain(|t| t.code != "withdraw");
    next.states.retain(|s| s.code != "WITHDRAWN");
    let published = h.service.publish_definition(&admin(), next).await.unwrap();
    assert_eq!(published.version, 2);

    // r-1 stays pinned to version 1 and still offers withdraw.
    let codes: Vec<String> = h
        .service
        .transitions(&org_admin(), "REVIEW", "r-1")
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.code)
        .collect();
    assert!(codes.contains(&"withdraw".to_string()));

    h.start_review("r-2").await;
    let current = h.service.current_state("REVIEW", "r-2").await.unwrap();
    assert_eq!(current.execution.definition_version, 2);
}

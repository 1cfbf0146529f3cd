//! Engine behavior against the mock upstream, in-process.
//!
//! Each test builds its own `MockState` and engine, so nothing is shared
//! between cases.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{engine, engine_with, seed_tasks};
use mock_server::{Budget, MockState};
use serde_json::json;
use todo_batch::{
    BudgetClass, BulkAction, BulkRequest, Command, CommandKind, EngineConfig, EngineError,
    RetryPolicy, ValidationError,
};

// ---------------------------------------------------------------------------
// Bulk
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bulk_update_fifteen_tasks() {
    let state = MockState::new();
    let ids = seed_tasks(&state, 15).await;

    let request = BulkRequest::new(BulkAction::Update, ids.clone())
        .with_field("due_string", json!("tomorrow"));
    let result = engine(&state).execute_bulk(&request).await.unwrap();

    assert_eq!(result.total_tasks, 15);
    assert_eq!(result.successful, 15);
    assert_eq!(result.failed, 0);
    let reported: Vec<&str> = result.results.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(reported, ids.iter().map(String::as_str).collect::<Vec<_>>());

    for id in &ids {
        let task = state.task(id).await.unwrap();
        assert_eq!(task.due_string.as_deref(), Some("tomorrow"));
    }
}

#[tokio::test]
async fn bulk_complete_with_missing_ids_is_partial() {
    let state = MockState::new();
    let mut ids = seed_tasks(&state, 17).await;
    ids.insert(3, "missing-a".to_string());
    ids.insert(10, "missing-b".to_string());
    ids.push("missing-c".to_string());

    let request = BulkRequest::new(BulkAction::Complete, ids.clone());
    let result = engine(&state).execute_bulk(&request).await.unwrap();

    assert_eq!(result.total_tasks, 20);
    assert_eq!(result.successful, 17);
    assert_eq!(result.failed, 3);

    let failures: Vec<_> = result.results.iter().filter(|r| !r.success).collect();
    assert_eq!(failures.len(), 3);
    for failure in failures {
        assert!(failure.task_id.starts_with("missing-"));
        assert!(failure.error.as_deref().unwrap().contains("not found"));
    }

    // No rollback: every valid task stayed completed.
    for id in ids.iter().filter(|id| !id.starts_with("missing-")) {
        assert!(state.task(id).await.unwrap().checked);
    }
}

#[tokio::test]
async fn bulk_duplicates_are_reported_once_in_input_order() {
    let state = MockState::new();
    let ids = seed_tasks(&state, 3).await;
    let input = vec![
        ids[2].clone(),
        ids[0].clone(),
        ids[2].clone(),
        ids[1].clone(),
        ids[0].clone(),
    ];

    let result = engine(&state)
        .execute_bulk(&BulkRequest::new(BulkAction::Complete, input))
        .await
        .unwrap();

    assert_eq!(result.total_tasks, 3);
    let reported: Vec<&str> = result.results.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(reported, vec![ids[2].as_str(), ids[0].as_str(), ids[1].as_str()]);
    assert_eq!(state.requests(Budget::Rest), 3);
}

#[tokio::test]
async fn bulk_content_update_is_rejected_before_any_call() {
    let state = MockState::new();
    let ids = seed_tasks(&state, 2).await;

    let request =
        BulkRequest::new(BulkAction::Update, ids).with_field("content", json!("new title"));
    let err = engine(&state).execute_bulk(&request).await.unwrap_err();

    assert!(matches!(
        &err,
        EngineError::Validation(ValidationError::DisallowedField { field, .. })
            if field == "content"
    ));
    assert!(err.to_string().contains("content"));
    assert!(!err.is_retryable());
    assert_eq!(state.requests(Budget::Rest), 0);
}

#[tokio::test]
async fn bulk_task_id_cannot_reach_another_endpoint() {
    let state = MockState::new();
    let ids = seed_tasks(&state, 1).await;

    let request = BulkRequest::new(BulkAction::Update, [format!("{}/close", ids[0])])
        .with_field("due_string", json!("tomorrow"));
    let err = engine(&state).execute_bulk(&request).await.unwrap_err();

    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::InvalidTaskId { position: 0, .. })
    ));
    assert_eq!(state.requests(Budget::Rest), 0);
    let task = state.task(&ids[0]).await.unwrap();
    assert!(!task.checked);
    assert_eq!(task.due_string, None);
}

#[tokio::test]
async fn bulk_over_fifty_unique_ids_is_rejected() {
    let state = MockState::new();
    let ids: Vec<String> = (0..51).map(|i| format!("id-{i}")).collect();

    let err = engine(&state)
        .execute_bulk(&BulkRequest::new(BulkAction::Complete, ids))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::TooManyTaskIds { count: 51, max: 50 })
    ));
    assert_eq!(state.requests(Budget::Rest), 0);
}

#[tokio::test]
async fn bulk_move_and_uncomplete() {
    let state = MockState::new();
    let ids = seed_tasks(&state, 4).await;
    let project = state.seed_project("Errands").await;
    let engine = engine(&state);

    let request =
        BulkRequest::new(BulkAction::Move, ids.clone()).with_field("project_id", json!(project));
    let moved = engine.execute_bulk(&request).await.unwrap();
    assert_eq!(moved.successful, 4);

    engine
        .execute_bulk(&BulkRequest::new(BulkAction::Complete, ids.clone()))
        .await
        .unwrap();
    let reopened = engine
        .execute_bulk(&BulkRequest::new(BulkAction::Uncomplete, ids.clone()))
        .await
        .unwrap();
    assert_eq!(reopened.successful, 4);

    for id in &ids {
        let task = state.task(id).await.unwrap();
        assert_eq!(task.project_id, project);
        assert!(!task.checked);
    }
}

#[tokio::test]
async fn bulk_move_to_unknown_project_fails_per_task() {
    let state = MockState::new();
    let ids = seed_tasks(&state, 2).await;

    let request =
        BulkRequest::new(BulkAction::Move, ids).with_field("project_id", json!("nowhere"));
    let result = engine(&state).execute_bulk(&request).await.unwrap();

    assert_eq!(result.failed, 2);
    assert!(result.results[0].error.as_deref().unwrap().contains("Project not found"));
}

#[tokio::test]
async fn bulk_recovers_from_a_single_429() {
    let state = MockState::new();
    let ids = seed_tasks(&state, 5).await;
    state.throttle(Budget::Rest, 1, Duration::from_millis(100));

    let started = Instant::now();
    let result = engine(&state)
        .execute_bulk(&BulkRequest::new(BulkAction::Complete, ids))
        .await
        .unwrap();

    assert_eq!(result.successful, 5);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(state.requests(Budget::Rest), 6);
}

#[tokio::test]
async fn bulk_persistent_429_fails_the_whole_request() {
    let state = MockState::new();
    let ids = seed_tasks(&state, 3).await;
    state.throttle(Budget::Rest, u32::MAX, Duration::from_millis(20));

    let err = engine(&state)
        .execute_bulk(&BulkRequest::new(BulkAction::Complete, ids.clone()))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::RateLimited { .. }));
    assert!(err.is_retryable());
    assert_eq!(err.retry_after(), Some(Duration::from_millis(20)));
    for id in &ids {
        assert!(!state.task(id).await.unwrap().checked);
    }
}

#[tokio::test]
async fn bulk_deadline_keeps_finished_tasks_and_fails_the_rest() {
    let state = MockState::new();
    let ids = seed_tasks(&state, 5).await;
    state.throttle_after(Budget::Rest, 2, u32::MAX, Duration::from_secs(30));
    let config = EngineConfig {
        max_concurrency: 1,
        deadline: Duration::from_secs(5),
        ..EngineConfig::default()
    };

    let started = Instant::now();
    let result = engine_with(&state, config)
        .execute_bulk(&BulkRequest::new(BulkAction::Complete, ids.clone()))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result.total_tasks, 5);
    assert_eq!(result.successful, 2);
    assert_eq!(result.failed, 3);
    for (outcome, id) in result.results.iter().zip(&ids) {
        assert_eq!(&outcome.task_id, id);
    }
    for outcome in &result.results[2..] {
        assert_eq!(outcome.error.as_deref(), Some("deadline exceeded"));
    }
    assert!(state.task(&ids[0]).await.unwrap().checked);
    assert!(state.task(&ids[1]).await.unwrap().checked);
    assert!(!state.task(&ids[2]).await.unwrap().checked);
    // The third call saw the 429; the others never left the engine.
    assert_eq!(state.requests(Budget::Rest), 3);
}

#[tokio::test]
async fn engines_sharing_a_tracker_share_the_backoff() {
    let state = MockState::new();
    let ids = seed_tasks(&state, 1).await;
    let first = engine(&state);
    let second = engine(&state).with_tracker(Arc::clone(first.tracker()));
    assert!(Arc::ptr_eq(first.tracker(), second.tracker()));

    first
        .tracker()
        .mark_limited(BudgetClass::Rest, Duration::from_millis(150));

    let started = Instant::now();
    let result = second
        .execute_bulk(&BulkRequest::new(BulkAction::Complete, ids))
        .await
        .unwrap();

    assert_eq!(result.successful, 1);
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn sync_throttling_does_not_slow_rest_calls() {
    let state = MockState::new();
    let ids = seed_tasks(&state, 2).await;
    state.throttle(Budget::Sync, u32::MAX, Duration::from_secs(30));

    let engine = engine(&state);
    let result = engine
        .execute_bulk(&BulkRequest::new(BulkAction::Complete, ids))
        .await
        .unwrap();

    assert_eq!(result.successful, 2);
    assert_eq!(state.requests(Budget::Sync), 0);
    assert!(!engine.tracker().snapshot(BudgetClass::Rest).is_limited);
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batch_with_some_failures_is_accepted() {
    let state = MockState::new();
    let ids = seed_tasks(&state, 3).await;
    let commands = vec![
        Command::new(CommandKind::ItemClose, json!({"id": ids[0]})),
        Command::new(CommandKind::ItemClose, json!({"id": "ghost-1"})),
        Command::new(CommandKind::ItemUpdate, json!({"id": ids[1], "priority": 4})),
        Command::new(CommandKind::ItemDelete, json!({"id": "ghost-2"})),
        Command::new(CommandKind::LabelAdd, json!({"name": "urgent"})).with_temp_id("label"),
    ];

    let result = engine(&state).execute_batch(&commands).await.unwrap();

    assert!(result.accepted);
    assert_eq!(result.completed_count, 3);
    assert_eq!(result.failed_count, 2);
    assert_eq!(result.errors.len(), 2);
    assert_eq!(result.errors[0].command_index, 1);
    assert_eq!(result.errors[1].command_index, 3);
    assert!(result.errors[0].error.contains("not found"));
    assert!(result.temp_id_mapping.contains_key("label"));
    assert_eq!(state.requests(Budget::Sync), 1);
    assert!(state.task(&ids[0]).await.unwrap().checked);
}

#[tokio::test]
async fn batch_resolves_forward_references() {
    let state = MockState::new();
    let commands = vec![
        Command::new(CommandKind::ProjectAdd, json!({"name": "Trip"})).with_temp_id("proj"),
        Command::new(CommandKind::ItemAdd, json!({"content": "Pack", "project_id": "proj"}))
            .with_temp_id("pack"),
        Command::new(CommandKind::ItemAdd, json!({"content": "Socks", "parent_id": "pack"}))
            .with_temp_id("socks"),
        Command::new(
            CommandKind::ReminderAdd,
            json!({"item_id": "socks", "due": {"string": "tomorrow 9am"}}),
        ),
    ];

    let result = engine(&state).execute_batch(&commands).await.unwrap();

    assert_eq!(result.completed_count, 4, "errors: {:?}", result.errors);
    assert_eq!(result.temp_id_mapping.len(), 3);
    assert_eq!(state.requests(Budget::Sync), 4);

    let socks = state.task(&result.temp_id_mapping["socks"]).await.unwrap();
    assert_eq!(socks.parent_id.as_deref(), Some(result.temp_id_mapping["pack"].as_str()));
    assert_eq!(socks.project_id, result.temp_id_mapping["proj"]);
}

#[tokio::test]
async fn batch_without_references_is_one_request() {
    let state = MockState::new();
    let commands: Vec<Command> = (0..10)
        .map(|i| {
            Command::new(CommandKind::ItemAdd, json!({"content": format!("t{i}")}))
                .with_temp_id(format!("t{i}"))
        })
        .collect();

    let result = engine(&state).execute_batch(&commands).await.unwrap();

    assert_eq!(result.completed_count, 10);
    assert_eq!(result.temp_id_mapping.len(), 10);
    assert_eq!(state.requests(Budget::Sync), 1);
}

#[tokio::test]
async fn failed_create_propagates_to_dependents() {
    let state = MockState::new();
    let commands = vec![
        Command::new(
            CommandKind::ItemAdd,
            json!({"content": "Orphan", "project_id": "no-such-project"}),
        )
        .with_temp_id("orphan"),
        Command::new(CommandKind::ItemAdd, json!({"content": "Child", "parent_id": "orphan"}))
            .with_temp_id("child"),
        Command::new(CommandKind::NoteAdd, json!({"item_id": "child", "content": "note"})),
        Command::new(CommandKind::ItemAdd, json!({"content": "Independent"})).with_temp_id("ok"),
    ];

    let result = engine(&state).execute_batch(&commands).await.unwrap();

    assert!(result.accepted);
    assert_eq!(result.completed_count, 1);
    assert_eq!(result.failed_count, 3);
    assert!(!result.temp_id_mapping.contains_key("orphan"));
    assert!(!result.temp_id_mapping.contains_key("child"));
    assert!(result.temp_id_mapping.contains_key("ok"));
    assert_eq!(result.errors[1].error, "dependency failed: temp_id 'orphan' was not created");
    assert_eq!(result.errors[2].error, "dependency failed: temp_id 'child' was not created");
    // Only the first stage ever reached the upstream.
    assert_eq!(state.requests(Budget::Sync), 1);
}

#[tokio::test]
async fn duplicate_temp_id_fails_before_any_call() {
    let state = MockState::new();
    let commands = vec![
        Command::new(CommandKind::ItemAdd, json!({"content": "a"})).with_temp_id("dup"),
        Command::new(CommandKind::ItemAdd, json!({"content": "b"})).with_temp_id("dup"),
    ];

    let err = engine(&state).execute_batch(&commands).await.unwrap_err();

    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::DuplicateTempId { index: 1, .. })
    ));
    assert_eq!(state.requests(Budget::Sync), 0);
}

#[tokio::test]
async fn batch_from_json_rejects_unknown_type() {
    let state = MockState::new();
    let input = json!([
        {"type": "create-task", "correlation_id": "a", "args": {"content": "x"}},
        {"type": "archive-everything", "correlation_id": "b", "args": {}},
    ]);

    let err = engine(&state).execute_batch_json(&input).await.unwrap_err();

    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::UnknownCommandType { index: 1, .. })
    ));
    assert_eq!(state.requests(Budget::Sync), 0);
}

#[tokio::test]
async fn batch_retries_once_after_advertised_wait() {
    let state = MockState::new();
    state.throttle(Budget::Sync, 1, Duration::from_millis(100));
    let commands =
        vec![Command::new(CommandKind::LabelAdd, json!({"name": "later"})).with_temp_id("l")];

    let started = Instant::now();
    let result = engine(&state).execute_batch(&commands).await.unwrap();

    assert!(result.accepted);
    assert_eq!(result.completed_count, 1);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(state.requests(Budget::Sync), 2);
}

#[tokio::test]
async fn batch_persistent_429_is_a_retryable_top_level_error() {
    let state = MockState::new();
    state.throttle(Budget::Sync, u32::MAX, Duration::from_millis(20));
    let commands = vec![
        Command::new(CommandKind::LabelAdd, json!({"name": "a"})),
        Command::new(CommandKind::LabelAdd, json!({"name": "b"})),
    ];

    let err = engine(&state).execute_batch(&commands).await.unwrap_err();

    assert!(matches!(err, EngineError::RateLimited { .. }));
    assert!(err.is_retryable());
    assert_eq!(state.requests(Budget::Sync), 3);
    assert_eq!(state.inspect(|store| store.labels.len()).await, 0);
}

#[tokio::test]
async fn later_stage_rate_limit_keeps_earlier_stages() {
    let state = MockState::new();
    state.throttle_after(Budget::Sync, 1, u32::MAX, Duration::from_millis(20));
    let commands = vec![
        Command::new(CommandKind::ProjectAdd, json!({"name": "Home"})).with_temp_id("home"),
        Command::new(CommandKind::ItemAdd, json!({"content": "Paint", "project_id": "home"}))
            .with_temp_id("paint"),
        Command::new(CommandKind::ItemAdd, json!({"content": "Trim", "parent_id": "paint"}))
            .with_temp_id("trim"),
    ];

    let result = engine(&state).execute_batch(&commands).await.unwrap();

    assert!(result.accepted);
    assert_eq!(result.completed_count, 1);
    assert_eq!(result.failed_count, 2);
    assert_eq!(result.temp_id_mapping.len(), 1);
    assert!(result.temp_id_mapping.contains_key("home"));

    assert_eq!(result.errors[0].command_index, 1);
    assert!(result.errors[0]
        .error
        .starts_with("batch submission failed: rate limited"));
    assert_eq!(result.errors[1].command_index, 2);
    assert_eq!(
        result.errors[1].error,
        "dependency failed: temp_id 'paint' was not created"
    );
    // One accepted stage, then three throttled attempts at the second.
    assert_eq!(state.requests(Budget::Sync), 4);
    assert_eq!(state.inspect(|store| store.projects.len()).await, 2);
}

#[tokio::test]
async fn retry_budget_follows_configuration() {
    let state = MockState::new();
    state.throttle(Budget::Sync, u32::MAX, Duration::from_millis(10));
    let config = EngineConfig {
        retry: RetryPolicy {
            max_attempts: 5,
            ..RetryPolicy::default()
        },
        ..EngineConfig::default()
    };

    let commands = vec![Command::new(CommandKind::LabelAdd, json!({"name": "a"}))];
    let err = engine_with(&state, config).execute_batch(&commands).await.unwrap_err();

    assert!(matches!(err, EngineError::RateLimited { .. }));
    assert_eq!(state.requests(Budget::Sync), 5);
}

#[tokio::test]
async fn deadline_shorter_than_advertised_wait_gives_up_early() {
    let state = MockState::new();
    state.throttle(Budget::Sync, 1, Duration::from_secs(30));
    let config = EngineConfig {
        deadline: Duration::from_secs(1),
        ..EngineConfig::default()
    };

    let started = Instant::now();
    let commands = vec![Command::new(CommandKind::LabelAdd, json!({"name": "a"}))];
    let err = engine_with(&state, config).execute_batch(&commands).await.unwrap_err();

    assert!(matches!(err, EngineError::DeadlineExceeded));
    assert!(started.elapsed() < Duration::from_secs(1));
}

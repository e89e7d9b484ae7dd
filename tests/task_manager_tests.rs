//! Manager surface tests that do not require the control loops: scheduling,
//! metadata lookups, updates, cancellation of inactive tasks, and promises.

#[macro_use]
mod test_helpers;

use std::sync::Arc;

use serde_json::json;

use keeper::{
    HandlerRegistry, TaskFailure, TaskId, TaskManagerError, TaskOrder, TaskPatch, TaskSpec,
    TaskStatus,
};
use test_helpers::{assert_store_drained, open_manager_at, open_temp_manager};

#[tokio::test]
async fn schedule_persists_record_and_metadata() {
    with_timeout!(10_000, {
        let (_tmp, manager) = open_temp_manager(Arc::new(HandlerRegistry::new())).await;

        let mut spec = TaskSpec::new("renew_certificate");
        spec.parameters = vec![json!({"domain": "example.com"})];
        spec.delay_ms = 60_000;
        spec.deadline_ms = Some(30_000);
        spec.priority = 5;
        spec.path = vec!["certs".to_string()];
        let task = manager.schedule_task(spec).await.unwrap();

        let info = manager.get_task(task.id()).await.unwrap().unwrap();
        assert_eq!(info.id, task.id());
        assert_eq!(info.status, TaskStatus::Scheduled);
        assert_eq!(info.handler_id, "renew_certificate");
        assert_eq!(info.parameters, vec![json!({"domain": "example.com"})]);
        assert_eq!(info.delay_ms, 60_000);
        assert_eq!(info.deadline_ms, Some(30_000));
        assert_eq!(info.priority, 5);
        assert_eq!(info.path, vec!["certs".to_string()]);
        assert_eq!(info.scheduled_ms, info.created_ms + 60_000);

        manager.close().await.unwrap();
    })
}

#[tokio::test]
async fn negative_delay_and_extreme_priority_are_clamped() {
    with_timeout!(10_000, {
        let (_tmp, manager) = open_temp_manager(Arc::new(HandlerRegistry::new())).await;

        let mut spec = TaskSpec::new("noop");
        spec.delay_ms = -500;
        spec.priority = 9_999;
        let task = manager.schedule_task(spec).await.unwrap();

        let info = manager.get_task(task.id()).await.unwrap().unwrap();
        assert_eq!(info.delay_ms, 0);
        assert_eq!(info.scheduled_ms, info.created_ms);
        assert_eq!(info.priority, 127);

        manager.close().await.unwrap();
    })
}

#[tokio::test]
async fn path_tags_may_not_contain_separators() {
    with_timeout!(10_000, {
        let (_tmp, manager) = open_temp_manager(Arc::new(HandlerRegistry::new())).await;

        let mut spec = TaskSpec::new("noop");
        spec.path = vec!["certs/renew".to_string()];
        let err = manager.schedule_task(spec).await.unwrap_err();
        assert!(matches!(err, TaskManagerError::InvalidPathTag(_)));

        manager.close().await.unwrap();
    })
}

#[tokio::test]
async fn get_tasks_orders_by_id_and_filters_by_path_prefix() {
    with_timeout!(10_000, {
        let (_tmp, manager) = open_temp_manager(Arc::new(HandlerRegistry::new())).await;

        let mut ids = Vec::new();
        for path in [
            vec!["certs".to_string()],
            vec!["certs".to_string(), "renew".to_string()],
            vec!["vault".to_string()],
        ] {
            let mut spec = TaskSpec::new("noop");
            spec.delay_ms = 60_000;
            spec.path = path;
            ids.push(manager.schedule_task(spec).await.unwrap().id());
        }

        let all = manager.get_tasks(TaskOrder::Asc, None).await.unwrap();
        assert_eq!(all.iter().map(|t| t.id).collect::<Vec<_>>(), ids);

        let reversed = manager.get_tasks(TaskOrder::Desc, None).await.unwrap();
        let mut expected = ids.clone();
        expected.reverse();
        assert_eq!(reversed.iter().map(|t| t.id).collect::<Vec<_>>(), expected);

        // Path filters cover nested tags but not siblings.
        let certs = manager
            .get_tasks(TaskOrder::Asc, Some(&["certs".to_string()][..]))
            .await
            .unwrap();
        assert_eq!(
            certs.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![ids[0], ids[1]]
        );

        manager.close().await.unwrap();
    })
}

#[tokio::test]
async fn update_rewrites_schedule_and_indices() {
    with_timeout!(10_000, {
        let (_tmp, manager) = open_temp_manager(Arc::new(HandlerRegistry::new())).await;

        let mut spec = TaskSpec::new("noop");
        spec.delay_ms = 60_000;
        spec.path = vec!["old".to_string()];
        let task = manager.schedule_task(spec).await.unwrap();

        let patch = TaskPatch {
            handler_id: Some("other".to_string()),
            delay_ms: Some(120_000),
            deadline_ms: Some(Some(5_000)),
            priority: Some(7),
            path: Some(vec!["new".to_string()]),
            ..Default::default()
        };
        let info = manager.update_task(task.id(), patch).await.unwrap();
        assert_eq!(info.handler_id, "other");
        assert_eq!(info.delay_ms, 120_000);
        assert_eq!(info.deadline_ms, Some(5_000));
        assert_eq!(info.priority, 7);
        assert_eq!(info.scheduled_ms, info.created_ms + 120_000);

        // The path index moved with the patch.
        let old = manager
            .get_tasks(TaskOrder::Asc, Some(&["old".to_string()][..]))
            .await
            .unwrap();
        assert!(old.is_empty());
        let new = manager
            .get_tasks(TaskOrder::Asc, Some(&["new".to_string()][..]))
            .await
            .unwrap();
        assert_eq!(new.len(), 1);

        manager.close().await.unwrap();
    })
}

#[tokio::test]
async fn update_of_unknown_task_fails() {
    with_timeout!(10_000, {
        let (_tmp, manager) = open_temp_manager(Arc::new(HandlerRegistry::new())).await;

        let bogus = TaskId::from_parts(1, 0, 1);
        let err = manager
            .update_task(bogus, TaskPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskManagerError::TaskMissing(id) if id == bogus));

        manager.close().await.unwrap();
    })
}

#[tokio::test]
async fn cancel_before_dispatch_settles_with_the_reason() {
    with_timeout!(10_000, {
        let (_tmp, manager) = open_temp_manager(Arc::new(HandlerRegistry::new())).await;

        let mut spec = TaskSpec::new("noop");
        spec.delay_ms = 60_000;
        let task = manager.schedule_task(spec).await.unwrap();
        let promise = task.promise().await.unwrap();

        task.cancel("operator request").await.unwrap();

        assert_eq!(
            promise.wait().await,
            Err(TaskFailure::Cancelled("operator request".to_string()))
        );
        assert!(manager.get_task(task.id()).await.unwrap().is_none());
        assert_store_drained(&manager).await;

        // Cancelling again reports the task as gone.
        let err = task.cancel("again").await.unwrap_err();
        assert!(matches!(err, TaskManagerError::TaskMissing(_)));

        manager.close().await.unwrap();
    })
}

#[tokio::test]
async fn promises_are_memoized_per_task() {
    with_timeout!(10_000, {
        let (_tmp, manager) = open_temp_manager(Arc::new(HandlerRegistry::new())).await;

        let mut spec = TaskSpec::new("noop");
        spec.delay_ms = 60_000;
        let task = manager.schedule_task(spec).await.unwrap();

        let first = manager.get_task_promise(task.id()).await.unwrap();
        let second = manager.get_task_promise(task.id()).await.unwrap();

        task.cancel("stop").await.unwrap();

        let expected = Err(TaskFailure::Cancelled("stop".to_string()));
        assert_eq!(first.wait().await, expected);
        assert_eq!(second.wait().await, expected);

        manager.close().await.unwrap();
    })
}

#[tokio::test]
async fn promise_for_untracked_task_resolves_missing() {
    with_timeout!(10_000, {
        let (_tmp, manager) = open_temp_manager(Arc::new(HandlerRegistry::new())).await;

        let bogus = TaskId::from_parts(1, 0, 2);
        let promise = manager.get_task_promise(bogus).await.unwrap();
        assert_eq!(promise.wait().await, Err(TaskFailure::Missing(bogus)));

        manager.close().await.unwrap();
    })
}

#[tokio::test]
async fn ids_stay_monotonic_across_reopen() {
    with_timeout!(20_000, {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().to_string_lossy().to_string();

        let manager = open_manager_at(&path, Arc::new(HandlerRegistry::new())).await;
        let mut spec = TaskSpec::new("noop");
        spec.delay_ms = 60_000;
        spec.lazy = true;
        let first = manager.schedule_task(spec.clone()).await.unwrap().id();
        let second = manager.schedule_task(spec.clone()).await.unwrap().id();
        assert!(second > first);
        manager.close().await.unwrap();

        let reopened = open_manager_at(&path, Arc::new(HandlerRegistry::new())).await;
        let third = reopened.schedule_task(spec).await.unwrap().id();
        assert!(third > second, "{third} does not extend {second}");
        reopened.close().await.unwrap();
    })
}

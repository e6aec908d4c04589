//! End-to-end scenarios for the durable workflow execution engine.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use durable_workflow_engine::database::Database;
use durable_workflow_engine::error::{CoreError, CoreResult};
use durable_workflow_engine::models::{
    Backoff, RetryPolicy, StepInstanceStatus, StepOptions, WorkflowEnv, WorkflowStatus,
};
use durable_workflow_engine::step_executor::StepExecutor;
use durable_workflow_engine::workflow_runner::{WorkflowDefinition, WorkflowRunner};
use uuid::Uuid;

/// Scenario A — Memoized replay.
///
/// Two steps, "a" and "b". After one successful run, re-invoking the
/// workflow against the same instance id must not re-call either step
/// function, and must return the same output.
#[tokio::test]
async fn scenario_a_memoized_replay() {
    struct TwoSteps {
        a_calls: Arc<AtomicU32>,
        b_calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl WorkflowDefinition for TwoSteps {
        fn name(&self) -> &str {
            "two-steps"
        }

        async fn run(
            &self,
            executor: &StepExecutor,
            _input: serde_json::Value,
        ) -> CoreResult<serde_json::Value> {
            let a_calls = self.a_calls.clone();
            let x: i32 = executor
                .do_task("a", move || {
                    let a_calls = a_calls.clone();
                    async move {
                        a_calls.fetch_add(1, Ordering::SeqCst);
                        Ok(1)
                    }
                })
                .await?;

            let b_calls = self.b_calls.clone();
            let y: i32 = executor
                .do_task("b", move || {
                    let b_calls = b_calls.clone();
                    async move {
                        b_calls.fetch_add(1, Ordering::SeqCst);
                        Ok(2)
                    }
                })
                .await?;

            Ok(serde_json::json!({ "x": x, "y": y }))
        }
    }

    let db = Arc::new(Database::new(":memory:").unwrap());
    let runner = WorkflowRunner::new(db.clone());
    let a_calls = Arc::new(AtomicU32::new(0));
    let b_calls = Arc::new(AtomicU32::new(0));

    let first = runner
        .start(
            TwoSteps {
                a_calls: a_calls.clone(),
                b_calls: b_calls.clone(),
            },
            serde_json::json!({}),
            WorkflowEnv::new(),
        )
        .await
        .unwrap();

    assert_eq!(first.status, WorkflowStatus::Completed);
    let expected = serde_json::json!({ "x": 1, "y": 2 });
    assert_eq!(first.output, Some(expected.clone()));

    let second = runner
        .resume(
            TwoSteps {
                a_calls: a_calls.clone(),
                b_calls: b_calls.clone(),
            },
            first.id,
            WorkflowEnv::new(),
        )
        .await
        .unwrap();

    assert_eq!(second.output, Some(expected));
    assert_eq!(a_calls.load(Ordering::SeqCst), 1, "step \"a\" re-invoked");
    assert_eq!(b_calls.load(Ordering::SeqCst), 1, "step \"b\" re-invoked");
}

/// Scenario B — Exponential backoff exhaustion.
#[tokio::test]
async fn scenario_b_exponential_backoff_exhaustion() {
    let db = Arc::new(Database::new(":memory:").unwrap());
    let workflow_id = Uuid::new_v4();
    let now = chrono::Utc::now();
    db.insert_workflow_instance(&durable_workflow_engine::models::WorkflowInstance {
        id: workflow_id,
        name: "flaky-workflow".to_string(),
        status: WorkflowStatus::Running,
        input: serde_json::json!({}),
        output: None,
        failed_reason: None,
        created_at: now,
        updated_at: now,
        completed_at: None,
    })
    .unwrap();

    let executor = StepExecutor::new(workflow_id, db.clone());
    let options = StepOptions {
        retries: Some(RetryPolicy {
            limit: 3,
            delay: "100 milliseconds".to_string(),
            backoff: Backoff::Exponential,
        }),
        timeout: None,
    };

    let started = Instant::now();
    let result: CoreResult<serde_json::Value> = executor
        .do_step("flaky", Some(options), || async {
            Err(CoreError::StepFailed("boom".into()))
        })
        .await;
    let elapsed = started.elapsed();

    assert!(result.is_err());
    assert!(
        elapsed >= Duration::from_millis(700),
        "expected at least 700ms of backoff sleep, got {elapsed:?}"
    );

    let instances = db.get_step_instances_for_workflow(workflow_id).unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].status, StepInstanceStatus::Failed);
    assert_eq!(instances[0].retries, 3);
    assert_eq!(instances[0].failed_reason.as_deref(), Some("Step failed: boom"));

    let workflow = db.get_workflow_instance(workflow_id).unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert_eq!(
        workflow.failed_reason.as_deref(),
        Some("Step \"flaky\" failed: Step failed: boom")
    );
}

/// Scenario C — Timeout then retry succeeds.
#[tokio::test]
async fn scenario_c_timeout_then_retry_succeeds() {
    let db = Arc::new(Database::new(":memory:").unwrap());
    let workflow_id = Uuid::new_v4();
    let now = chrono::Utc::now();
    db.insert_workflow_instance(&durable_workflow_engine::models::WorkflowInstance {
        id: workflow_id,
        name: "slow-workflow".to_string(),
        status: WorkflowStatus::Running,
        input: serde_json::json!({}),
        output: None,
        failed_reason: None,
        created_at: now,
        updated_at: now,
        completed_at: None,
    })
    .unwrap();

    let executor = StepExecutor::new(workflow_id, db.clone());
    let options = StepOptions {
        retries: Some(RetryPolicy {
            limit: 1,
            delay: "10 milliseconds".to_string(),
            backoff: Backoff::Fixed,
        }),
        timeout: Some("50 milliseconds".to_string()),
    };

    let attempt = AtomicU32::new(0);
    let result: i32 = executor
        .do_step("slow", Some(options), || async {
            let n = attempt.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(0)
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();

    assert_eq!(result, 42);

    let instances = db.get_step_instances_for_workflow(workflow_id).unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].status, StepInstanceStatus::Completed);
    assert_eq!(instances[0].retries, 1);
    assert_eq!(instances[0].output, Some(serde_json::json!(42)));
}

/// Scenario D — Durable sleep across a simulated restart.
#[tokio::test]
async fn scenario_d_durable_sleep_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sleep.db");
    let path_str = path.to_str().unwrap().to_string();

    let db = Arc::new(Database::new(&path_str).unwrap());
    let workflow_id = Uuid::new_v4();
    let now = chrono::Utc::now();
    db.insert_workflow_instance(&durable_workflow_engine::models::WorkflowInstance {
        id: workflow_id,
        name: "nap-workflow".to_string(),
        status: WorkflowStatus::Running,
        input: serde_json::json!({}),
        output: None,
        failed_reason: None,
        created_at: now,
        updated_at: now,
        completed_at: None,
    })
    .unwrap();

    let started = Instant::now();

    // First call: starts the sleep, then the "process" exits mid-wait by
    // racing the sleep against a short timeout.
    let executor = StepExecutor::new(workflow_id, db.clone());
    let _ = tokio::time::timeout(
        Duration::from_millis(300),
        executor.sleep("nap", "1200 milliseconds"),
    )
    .await;

    let workflow = db.get_workflow_instance(workflow_id).unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Sleeping);

    let sleeps = db.get_sleep_instances_for_workflow(workflow_id).unwrap();
    assert_eq!(sleeps.len(), 1);
    assert!(sleeps[0].completed_at.is_none());

    // Simulate a restart: a fresh Database/StepExecutor pair over the same
    // on-disk file, with no in-memory state carried over.
    drop(executor);
    let resumed_db = Arc::new(Database::new(&path_str).unwrap());
    let resumed_executor = StepExecutor::new(workflow_id, resumed_db.clone());
    resumed_executor.sleep("nap", "1200 milliseconds").await.unwrap();

    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(1100) && elapsed < Duration::from_millis(2500),
        "expected roughly the original 1200ms duration to elapse in total, got {elapsed:?}"
    );

    let sleeps = resumed_db.get_sleep_instances_for_workflow(workflow_id).unwrap();
    assert_eq!(sleeps.len(), 1, "resuming must not create a second row");
    assert!(sleeps[0].completed_at.is_some());

    let workflow = resumed_db.get_workflow_instance(workflow_id).unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Running);
}

/// Scenario E — Unknown unit fails the workflow.
#[tokio::test]
async fn scenario_e_unknown_unit_fails_workflow() {
    struct BadSleep;

    #[async_trait]
    impl WorkflowDefinition for BadSleep {
        fn name(&self) -> &str {
            "bad-sleep"
        }

        async fn run(
            &self,
            executor: &StepExecutor,
            _input: serde_json::Value,
        ) -> CoreResult<serde_json::Value> {
            executor.sleep("x", "3 fortnights").await?;
            Ok(serde_json::json!(null))
        }
    }

    let db = Arc::new(Database::new(":memory:").unwrap());
    let runner = WorkflowRunner::new(db);

    let instance = runner
        .start(BadSleep, serde_json::json!({}), WorkflowEnv::new())
        .await
        .unwrap();

    assert_eq!(instance.status, WorkflowStatus::Failed);
    assert!(instance
        .failed_reason
        .as_deref()
        .unwrap_or("")
        .contains("fortnights"));
}

/// Scenario F — Concurrent independent workflows.
#[tokio::test]
async fn scenario_f_concurrent_independent_workflows() {
    struct ThreeSteps;

    #[async_trait]
    impl WorkflowDefinition for ThreeSteps {
        fn name(&self) -> &str {
            "three-steps"
        }

        async fn run(
            &self,
            executor: &StepExecutor,
            _input: serde_json::Value,
        ) -> CoreResult<serde_json::Value> {
            for step in ["one", "two", "three"] {
                executor.do_task(step, || async { Ok(step) }).await?;
            }
            Ok(serde_json::json!("done"))
        }
    }

    let db = Arc::new(Database::new(":memory:").unwrap());
    let runner = Arc::new(WorkflowRunner::new(db.clone()));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let runner = runner.clone();
        handles.push(tokio::spawn(async move {
            runner
                .start(ThreeSteps, serde_json::json!({}), WorkflowEnv::new())
                .await
        }));
    }

    let mut instance_ids = Vec::new();
    for handle in handles {
        let instance = handle.await.unwrap().unwrap();
        assert_eq!(instance.status, WorkflowStatus::Completed);
        instance_ids.push(instance.id);
    }

    for id in instance_ids {
        let steps = db.get_steps_for_workflow(id).unwrap();
        assert_eq!(steps.len(), 3);
        let mut names: Vec<_> = steps.iter().map(|s| s.name.clone()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 3, "duplicate (workflow, name) pair detected");
    }
}

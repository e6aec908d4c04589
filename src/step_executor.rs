//! The step executor: memoization, resumption, retry/backoff, timeout,
//! and the durable sleep primitive.
//!
//! Bound to a single workflow instance. Holds two pieces of in-memory
//! state, discarded on process exit:
//! - `step_id_cache`: step name -> `Step` id, a write-through cache over
//!   the `(workflow_instance_id, name)` unique index.
//! - `step_state`: step name -> last result produced during this run, so
//!   later steps can read prior outputs without re-querying.
//!
//! `do` is a reserved word in Rust, so the memoized-execution operation
//! is named `do_step`; the two-arity form from the public API is
//! `do_task`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::database::Database;
use crate::duration::{parse_duration, parse_duration_checked};
use crate::error::{CoreError, CoreResult};
use crate::models::StepOptions;

/// Per-workflow-instance façade offering `do_step`/`do_task` and `sleep`.
pub struct StepExecutor {
    workflow_instance_id: Uuid,
    db: Arc<Database>,
    step_id_cache: Mutex<HashMap<String, Uuid>>,
    step_state: Mutex<HashMap<String, serde_json::Value>>,
}

impl StepExecutor {
    pub fn new(workflow_instance_id: Uuid, db: Arc<Database>) -> Self {
        Self {
            workflow_instance_id,
            db,
            step_id_cache: Mutex::new(HashMap::new()),
            step_state: Mutex::new(HashMap::new()),
        }
    }

    fn get_or_create_step(&self, name: &str) -> CoreResult<Uuid> {
        if let Some(id) = self.step_id_cache.lock().unwrap().get(name) {
            return Ok(*id);
        }

        let step = match self.db.find_step_by_name(self.workflow_instance_id, name)? {
            Some(step) => step,
            None => self.db.create_step(self.workflow_instance_id, name)?,
        };

        self.step_id_cache
            .lock()
            .unwrap()
            .insert(name.to_string(), step.id);
        Ok(step.id)
    }

    /// Two-arity form: `do(name, fn)`, no retry or timeout policy.
    pub async fn do_task<T, F, Fut>(&self, name: &str, f: F) -> CoreResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        self.do_step(name, None, f).await
    }

    /// Three-arity form: memoize, resume, retry-with-backoff, and
    /// optionally time out a named step.
    pub async fn do_step<T, F, Fut>(
        &self,
        name: &str,
        options: Option<StepOptions>,
        f: F,
    ) -> CoreResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        if name.is_empty() {
            return Err(CoreError::Validation(
                "step name must not be empty".to_string(),
            ));
        }

        let step_id = self.get_or_create_step(name)?;

        if let Some(completed) = self.db.find_completed_step_instance(step_id)? {
            log::info!("step \"{name}\" memoized, skipping execution");
            let output = completed.output.ok_or_else(|| {
                CoreError::Internal(format!(
                    "completed step instance for \"{name}\" is missing its output"
                ))
            })?;
            let value: T = serde_json::from_value(output.clone())?;
            self.step_state
                .lock()
                .unwrap()
                .insert(name.to_string(), output);
            return Ok(value);
        }

        let (instance_id, mut attempts) =
            match self.db.find_latest_non_terminal_step_instance(step_id)? {
                Some(existing) => {
                    log::info!(
                        "resuming step \"{name}\" from a prior attempt (retries so far: {})",
                        existing.retries
                    );
                    (existing.id, existing.retries)
                }
                None => {
                    let instance = self.db.create_step_instance(step_id)?;
                    log::info!("step \"{name}\" started");
                    (instance.id, 0)
                }
            };

        let limit = options
            .as_ref()
            .and_then(|o| o.retries.as_ref())
            .map(|r| r.limit)
            .unwrap_or(0);
        let timeout_ms = options
            .as_ref()
            .and_then(|o| o.timeout.as_deref())
            .map(parse_duration)
            .transpose()?;

        loop {
            let attempt_result = match timeout_ms {
                Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), f()).await {
                    Ok(result) => result,
                    Err(_) => Err(CoreError::StepTimeout(format!(
                        "step \"{name}\" exceeded its timeout"
                    ))),
                },
                None => f().await,
            };

            match attempt_result {
                Ok(value) => {
                    let output = serde_json::to_value(&value)?;
                    self.db.complete_step_instance(instance_id, &output)?;
                    self.step_state
                        .lock()
                        .unwrap()
                        .insert(name.to_string(), output);
                    log::info!("step \"{name}\" completed");
                    return Ok(value);
                }
                Err(err) => {
                    if attempts >= limit {
                        let workflow_reason = format!("Step \"{name}\" failed: {err}");
                        self.db.fail_step_instance_and_workflow(
                            instance_id,
                            self.workflow_instance_id,
                            attempts,
                            &err.to_string(),
                            &workflow_reason,
                        )?;
                        log::error!("step \"{name}\" failed with retries exhausted: {err}");
                        return Err(err);
                    }

                    attempts += 1;
                    self.db
                        .mark_step_instance_retrying(instance_id, attempts)?;
                    log::warn!(
                        "step \"{name}\" failed (attempt {attempts}/{}), retrying: {err}",
                        limit + 1
                    );

                    if let Some(retry) = options.as_ref().and_then(|o| o.retries.as_ref()) {
                        let base_delay_ms = parse_duration(&retry.delay)?;
                        let delay_ms =
                            base_delay_ms.saturating_mul(retry.backoff.factor(attempts));
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }

                    self.db.mark_step_instance_running(instance_id)?;
                }
            }
        }
    }

    /// Durable timer. See module docs and the design notes on the
    /// persist-then-wait pattern this relies on to survive a restart
    /// mid-sleep.
    pub async fn sleep(&self, name: &str, duration: &str) -> CoreResult<()> {
        if name.is_empty() {
            return Err(CoreError::Validation(
                "sleep name must not be empty".to_string(),
            ));
        }

        let duration_ms = parse_duration_checked(duration)?;

        if let Some(existing) = self
            .db
            .find_sleep_instance(self.workflow_instance_id, name)?
        {
            if existing.completed_at.is_some() {
                log::info!("sleep \"{name}\" memoized, already completed");
                return Ok(());
            }

            let elapsed_ms = chrono::Utc::now()
                .signed_duration_since(existing.started_at)
                .num_milliseconds();
            let remaining_ms = existing.duration_ms - elapsed_ms;

            log::info!("resuming sleep \"{name}\", {remaining_ms}ms remaining");
            if remaining_ms > 0 {
                tokio::time::sleep(Duration::from_millis(remaining_ms as u64)).await;
            }

            self.db
                .complete_sleep(existing.id, self.workflow_instance_id)?;
            return Ok(());
        }

        let instance = self
            .db
            .start_sleep(self.workflow_instance_id, name, duration_ms)?;
        log::info!("sleep \"{name}\" started for {duration_ms}ms");

        if duration_ms > 0 {
            tokio::time::sleep(Duration::from_millis(duration_ms as u64)).await;
        }

        self.db
            .complete_sleep(instance.id, self.workflow_instance_id)?;
        log::info!("sleep \"{name}\" completed");
        Ok(())
    }

    /// In-memory-only read of a step's result within this run. Not a
    /// durable read; returns `None` if `do_step`/`do_task` hasn't
    /// returned for `name` yet during this process's lifetime.
    pub fn get_state_from_step<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.step_state
            .lock()
            .unwrap()
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

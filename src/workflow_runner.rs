//! Workflow lifecycle orchestration: start, resume, cancel, and inspect.
//!
//! `WorkflowRunner` owns the `Pending -> Running -> (Sleeping <-> Running)* ->
//! {Completed|Failed|Canceled}` transitions around a user-supplied
//! `WorkflowDefinition`, handing it a `StepExecutor` for the step/sleep
//! primitives and recording the terminal state it returns with.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::models::{WorkflowEnv, WorkflowInstance, WorkflowInstanceView, WorkflowStatus};
use crate::step_executor::StepExecutor;

/// A runnable workflow. Implementors describe one logical workflow;
/// `WorkflowRunner` supplies the durable step executor and persists the
/// surrounding lifecycle.
#[async_trait]
pub trait WorkflowDefinition: Send + Sync {
    /// Stable name recorded on the `WorkflowInstance` row.
    fn name(&self) -> &str;

    /// Inject environment bindings before `run` is invoked. The default
    /// is a no-op for workflows that don't need one.
    fn set_env(&mut self, _env: WorkflowEnv) {}

    /// The workflow body. Receives the step executor bound to this
    /// instance and the instance's input payload.
    async fn run(
        &self,
        executor: &StepExecutor,
        input: serde_json::Value,
    ) -> CoreResult<serde_json::Value>;
}

/// Drives `WorkflowDefinition`s to completion against a shared database.
pub struct WorkflowRunner {
    db: Arc<Database>,
}

impl WorkflowRunner {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Start a brand-new workflow instance.
    pub async fn start<W: WorkflowDefinition>(
        &self,
        workflow: W,
        input: serde_json::Value,
        env: WorkflowEnv,
    ) -> CoreResult<WorkflowInstance> {
        self.run_instance(workflow, Uuid::new_v4(), input, env).await
    }

    /// Resume an existing, non-terminal workflow instance after a
    /// restart. `workflow` must be the same logical definition the
    /// instance was started with; its `run` body re-executes from the
    /// top, with `StepExecutor` memoizing anything already completed.
    pub async fn resume<W: WorkflowDefinition>(
        &self,
        workflow: W,
        workflow_instance_id: Uuid,
        env: WorkflowEnv,
    ) -> CoreResult<WorkflowInstance> {
        let existing = self
            .db
            .get_workflow_instance(workflow_instance_id)?
            .ok_or_else(|| CoreError::WorkflowNotFound(workflow_instance_id.to_string()))?;

        if existing.status.is_terminal() {
            return Ok(existing);
        }

        let input = existing.input.clone();
        self.run_instance(workflow, workflow_instance_id, input, env)
            .await
    }

    async fn run_instance<W: WorkflowDefinition>(
        &self,
        mut workflow: W,
        id: Uuid,
        input: serde_json::Value,
        env: WorkflowEnv,
    ) -> CoreResult<WorkflowInstance> {
        match self.db.get_workflow_instance(id)? {
            None => {
                let now = Utc::now();
                self.db.insert_workflow_instance(&WorkflowInstance {
                    id,
                    name: workflow.name().to_string(),
                    status: WorkflowStatus::Pending,
                    input: input.clone(),
                    output: None,
                    failed_reason: None,
                    created_at: now,
                    updated_at: now,
                    completed_at: None,
                })?;
                log::info!("workflow \"{}\" ({id}) created", workflow.name());
                self.db.update_workflow_status(id, WorkflowStatus::Running)?;
                log::info!("workflow \"{}\" ({id}) started", workflow.name());
            }
            Some(existing) if existing.status.is_terminal() => {
                return Ok(existing);
            }
            Some(_) => {
                self.db.update_workflow_status(id, WorkflowStatus::Running)?;
                log::info!("workflow \"{}\" ({id}) resumed", workflow.name());
            }
        }

        workflow.set_env(env);
        let executor = StepExecutor::new(id, self.db.clone());

        match workflow.run(&executor, input).await {
            Ok(output) => {
                self.db.complete_workflow(id, &output)?;
                log::info!("workflow \"{}\" ({id}) completed", workflow.name());
            }
            Err(err) => {
                // A step exhausting its retries already commits the
                // workflow's FAILED status atomically (see
                // `Database::fail_step_instance_and_workflow`). Anything
                // else the workflow body returns still needs recording.
                let already_terminal = self
                    .db
                    .get_workflow_instance(id)?
                    .map(|w| w.status.is_terminal())
                    .unwrap_or(false);

                if !already_terminal {
                    self.db.fail_workflow(id, &err.to_string())?;
                    log::error!("workflow \"{}\" ({id}) failed: {err}", workflow.name());
                }
            }
        }

        self.db
            .get_workflow_instance(id)?
            .ok_or_else(|| CoreError::Internal(format!("workflow instance {id} vanished")))
    }

    /// Unconditionally move a workflow instance to CANCELED, including
    /// over a terminal status. See DESIGN.md for the cancel-vs-terminal
    /// race decision.
    pub fn cancel(&self, workflow_instance_id: Uuid) -> CoreResult<()> {
        self.db.cancel_workflow(workflow_instance_id)
    }

    /// An eagerly-loaded read of a workflow instance and everything
    /// recorded against it.
    pub fn get_workflow_state(
        &self,
        workflow_instance_id: Uuid,
    ) -> CoreResult<Option<WorkflowInstanceView>> {
        let workflow = match self.db.get_workflow_instance(workflow_instance_id)? {
            Some(workflow) => workflow,
            None => return Ok(None),
        };

        Ok(Some(WorkflowInstanceView {
            steps: self.db.get_steps_for_workflow(workflow_instance_id)?,
            step_instances: self.db.get_step_instances_for_workflow(workflow_instance_id)?,
            sleep_instances: self.db.get_sleep_instances_for_workflow(workflow_instance_id)?,
            workflow,
        }))
    }
}

//! Data models for the durable workflow execution engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A workflow instance's lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Sleeping,
    Completed,
    Failed,
    Canceled,
}

impl WorkflowStatus {
    /// Terminal statuses are sink states: no further transitions occur.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "Pending",
            WorkflowStatus::Running => "Running",
            WorkflowStatus::Sleeping => "Sleeping",
            WorkflowStatus::Completed => "Completed",
            WorkflowStatus::Failed => "Failed",
            WorkflowStatus::Canceled => "Canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(WorkflowStatus::Pending),
            "Running" => Some(WorkflowStatus::Running),
            "Sleeping" => Some(WorkflowStatus::Sleeping),
            "Completed" => Some(WorkflowStatus::Completed),
            "Failed" => Some(WorkflowStatus::Failed),
            "Canceled" => Some(WorkflowStatus::Canceled),
            _ => None,
        }
    }
}

/// A step instance's (one attempt's) lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum StepInstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
}

impl StepInstanceStatus {
    /// A step instance's status never transitions out of a terminal value.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepInstanceStatus::Completed | StepInstanceStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepInstanceStatus::Pending => "Pending",
            StepInstanceStatus::Running => "Running",
            StepInstanceStatus::Completed => "Completed",
            StepInstanceStatus::Failed => "Failed",
            StepInstanceStatus::Retrying => "Retrying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(StepInstanceStatus::Pending),
            "Running" => Some(StepInstanceStatus::Running),
            "Completed" => Some(StepInstanceStatus::Completed),
            "Failed" => Some(StepInstanceStatus::Failed),
            "Retrying" => Some(StepInstanceStatus::Retrying),
            _ => None,
        }
    }
}

/// Persistent row for one execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub name: String,
    pub status: WorkflowStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A named, durable handle for a logical step within a workflow.
///
/// Decouples the name used in user code from the one-or-more invocation
/// attempts (`StepInstance`) recorded against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub workflow_instance_id: Uuid,
    pub name: String,
}

/// One attempt at executing a `Step`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInstance {
    pub id: Uuid,
    pub step_id: Uuid,
    pub status: StepInstanceStatus,
    pub output: Option<serde_json::Value>,
    pub retries: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
}

/// A durable timer bound to a workflow by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepInstance {
    pub id: Uuid,
    pub workflow_instance_id: Uuid,
    pub name: String,
    pub duration_ms: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Backoff scaling applied to the retry delay after attempt `k` fails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    Exponential,
}

impl Backoff {
    /// Scaling factor for the delay before attempt `k` (1-indexed).
    pub fn factor(&self, k: u32) -> u64 {
        match self {
            Backoff::Fixed => 1,
            Backoff::Exponential => 1u64 << (k.saturating_sub(1)),
        }
    }
}

/// Retry policy for a `do` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub limit: u32,
    pub delay: String,
    pub backoff: Backoff,
}

/// Options accepted by the three-arity form of `StepExecutor::do_step`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOptions {
    pub retries: Option<RetryPolicy>,
    pub timeout: Option<String>,
}

/// Opaque, string-keyed bindings injected into a workflow definition
/// instance before its `run` method is invoked. The engine never
/// inspects the values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowEnv(HashMap<String, serde_json::Value>);

impl WorkflowEnv {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }
}

impl From<HashMap<String, serde_json::Value>> for WorkflowEnv {
    fn from(map: HashMap<String, serde_json::Value>) -> Self {
        Self(map)
    }
}

/// A read-only, eagerly-loaded view of a workflow instance plus its
/// steps, step instances, and sleep instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstanceView {
    pub workflow: WorkflowInstance,
    pub steps: Vec<Step>,
    pub step_instances: Vec<StepInstance>,
    pub sleep_instances: Vec<SleepInstance>,
}

/// Summary counts derived from an eagerly-loaded workflow view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct WorkflowStats {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub total_sleeps: usize,
    pub completed_sleeps: usize,
}

impl WorkflowInstanceView {
    /// Summarize step/sleep completion, one row per `Step`/`SleepInstance`
    /// rather than per attempt.
    pub fn stats(&self) -> WorkflowStats {
        let mut stats = WorkflowStats {
            total_steps: self.steps.len(),
            total_sleeps: self.sleep_instances.len(),
            ..Default::default()
        };

        for step in &self.steps {
            let latest = self
                .step_instances
                .iter()
                .filter(|si| si.step_id == step.id)
                .max_by_key(|si| si.started_at);

            match latest.map(|si| si.status) {
                Some(StepInstanceStatus::Completed) => stats.completed_steps += 1,
                Some(StepInstanceStatus::Failed) => stats.failed_steps += 1,
                _ => {}
            }
        }

        stats.completed_sleeps = self
            .sleep_instances
            .iter()
            .filter(|s| s.completed_at.is_some())
            .count();

        stats
    }
}

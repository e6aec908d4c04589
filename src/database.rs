//! SQLite-backed persistence for the durable workflow execution engine
//!
//! Concrete implementation of the persistence surface described in the
//! design: insert/update/find-unique/find-first over the four entities,
//! plus transactional grouping for the writes that must commit as one
//! unit (§5: the step-failure bundle and the sleep start/end bundle).

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::{
    SleepInstance, Step, StepInstance, StepInstanceStatus, WorkflowInstance, WorkflowStatus,
};

/// SQLite connection wrapper. All access goes through a single `Mutex`,
/// matching the single-writer assumption of §5: one process owns a
/// workflow instance's writes at a time, so a plain lock (no pooling) is
/// sufficient.
pub struct Database {
    conn: Mutex<Connection>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn parse_dt(s: &str) -> CoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn parse_dt_opt(s: Option<String>) -> CoreResult<Option<DateTime<Utc>>> {
    s.map(|s| parse_dt(&s)).transpose()
}

impl Database {
    /// Open (creating if needed) a database at `path` and apply the schema.
    pub fn new(path: &str) -> CoreResult<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let db = Database {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> CoreResult<()> {
        let schema = include_str!("schema.sql");
        self.conn.lock().unwrap().execute_batch(schema)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // WorkflowInstance
    // ------------------------------------------------------------------

    fn row_to_workflow_instance(row: &Row) -> rusqlite::Result<(
        String,
        String,
        String,
        String,
        Option<String>,
        Option<String>,
        String,
        String,
        Option<String>,
    )> {
        Ok((
            row.get(0)?, // id
            row.get(1)?, // name
            row.get(2)?, // status
            row.get(3)?, // input
            row.get(4)?, // output
            row.get(5)?, // failed_reason
            row.get(6)?, // created_at
            row.get(7)?, // updated_at
            row.get(8)?, // completed_at
        ))
    }

    fn build_workflow_instance(
        fields: (
            String,
            String,
            String,
            String,
            Option<String>,
            Option<String>,
            String,
            String,
            Option<String>,
        ),
    ) -> CoreResult<WorkflowInstance> {
        let (id, name, status, input, output, failed_reason, created_at, updated_at, completed_at) =
            fields;
        Ok(WorkflowInstance {
            id: Uuid::parse_str(&id)?,
            name,
            status: WorkflowStatus::parse(&status)
                .ok_or_else(|| CoreError::Internal(format!("invalid workflow status: {status}")))?,
            input: serde_json::from_str(&input)?,
            output: output.map(|s| serde_json::from_str(&s)).transpose()?,
            failed_reason,
            created_at: parse_dt(&created_at)?,
            updated_at: parse_dt(&updated_at)?,
            completed_at: parse_dt_opt(completed_at)?,
        })
    }

    pub fn insert_workflow_instance(&self, workflow: &WorkflowInstance) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO workflow_instances
                (id, name, status, input, output, failed_reason, created_at, updated_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                workflow.id.to_string(),
                &workflow.name,
                workflow.status.as_str(),
                serde_json::to_string(&workflow.input)?,
                workflow.output.as_ref().map(serde_json::to_string).transpose()?,
                &workflow.failed_reason,
                workflow.created_at.to_rfc3339(),
                workflow.updated_at.to_rfc3339(),
                workflow.completed_at.map(|dt| dt.to_rfc3339()),
            ),
        )?;
        Ok(())
    }

    pub fn get_workflow_instance(&self, id: Uuid) -> CoreResult<Option<WorkflowInstance>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, status, input, output, failed_reason, created_at, updated_at, completed_at
             FROM workflow_instances WHERE id = ?",
        )?;
        let row = stmt
            .query_row([id.to_string()], Self::row_to_workflow_instance)
            .optional()?;
        row.map(Self::build_workflow_instance).transpose()
    }

    pub fn update_workflow_status(&self, id: Uuid, status: WorkflowStatus) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE workflow_instances SET status = ?, updated_at = ? WHERE id = ?",
            (status.as_str(), now_rfc3339(), id.to_string()),
        )?;
        Ok(())
    }

    pub fn complete_workflow(&self, id: Uuid, output: &serde_json::Value) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_rfc3339();
        conn.execute(
            "UPDATE workflow_instances
             SET status = ?, output = ?, completed_at = ?, updated_at = ?
             WHERE id = ?",
            (
                WorkflowStatus::Completed.as_str(),
                serde_json::to_string(output)?,
                &now,
                &now,
                id.to_string(),
            ),
        )?;
        Ok(())
    }

    pub fn fail_workflow(&self, id: Uuid, failed_reason: &str) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_rfc3339();
        conn.execute(
            "UPDATE workflow_instances
             SET status = ?, failed_reason = ?, completed_at = ?, updated_at = ?
             WHERE id = ?",
            (
                WorkflowStatus::Failed.as_str(),
                failed_reason,
                &now,
                &now,
                id.to_string(),
            ),
        )?;
        Ok(())
    }

    /// Unconditional status overwrite, including over a terminal status.
    /// See DESIGN.md for the cancel-vs-terminal race decision.
    pub fn cancel_workflow(&self, id: Uuid) -> CoreResult<()> {
        self.update_workflow_status(id, WorkflowStatus::Canceled)
    }

    // ------------------------------------------------------------------
    // Step
    // ------------------------------------------------------------------

    fn row_to_step(row: &Row) -> rusqlite::Result<(String, String, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    }

    fn build_step(fields: (String, String, String)) -> CoreResult<Step> {
        let (id, workflow_instance_id, name) = fields;
        Ok(Step {
            id: Uuid::parse_str(&id)?,
            workflow_instance_id: Uuid::parse_str(&workflow_instance_id)?,
            name,
        })
    }

    pub fn find_step_by_name(
        &self,
        workflow_instance_id: Uuid,
        name: &str,
    ) -> CoreResult<Option<Step>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, workflow_instance_id, name FROM steps
             WHERE workflow_instance_id = ? AND name = ?",
        )?;
        let row = stmt
            .query_row((workflow_instance_id.to_string(), name), Self::row_to_step)
            .optional()?;
        row.map(Self::build_step).transpose()
    }

    pub fn create_step(&self, workflow_instance_id: Uuid, name: &str) -> CoreResult<Step> {
        let step = Step {
            id: Uuid::new_v4(),
            workflow_instance_id,
            name: name.to_string(),
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO steps (id, workflow_instance_id, name) VALUES (?, ?, ?)",
            (
                step.id.to_string(),
                step.workflow_instance_id.to_string(),
                &step.name,
            ),
        )?;
        Ok(step)
    }

    pub fn get_steps_for_workflow(&self, workflow_instance_id: Uuid) -> CoreResult<Vec<Step>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, workflow_instance_id, name FROM steps WHERE workflow_instance_id = ?",
        )?;
        let rows = stmt
            .query_map([workflow_instance_id.to_string()], Self::row_to_step)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(Self::build_step).collect()
    }

    // ------------------------------------------------------------------
    // StepInstance
    // ------------------------------------------------------------------

    #[allow(clippy::type_complexity)]
    fn row_to_step_instance(
        row: &Row,
    ) -> rusqlite::Result<(
        String,
        String,
        String,
        Option<String>,
        u32,
        String,
        Option<String>,
        Option<String>,
    )> {
        Ok((
            row.get(0)?, // id
            row.get(1)?, // step_id
            row.get(2)?, // status
            row.get(3)?, // output
            row.get(4)?, // retries
            row.get(5)?, // started_at
            row.get(6)?, // completed_at
            row.get(7)?, // failed_reason
        ))
    }

    fn build_step_instance(
        fields: (
            String,
            String,
            String,
            Option<String>,
            u32,
            String,
            Option<String>,
            Option<String>,
        ),
    ) -> CoreResult<StepInstance> {
        let (id, step_id, status, output, retries, started_at, completed_at, failed_reason) =
            fields;
        Ok(StepInstance {
            id: Uuid::parse_str(&id)?,
            step_id: Uuid::parse_str(&step_id)?,
            status: StepInstanceStatus::parse(&status).ok_or_else(|| {
                CoreError::Internal(format!("invalid step instance status: {status}"))
            })?,
            output: output.map(|s| serde_json::from_str(&s)).transpose()?,
            retries,
            started_at: parse_dt(&started_at)?,
            completed_at: parse_dt_opt(completed_at)?,
            failed_reason,
        })
    }

    pub fn find_completed_step_instance(&self, step_id: Uuid) -> CoreResult<Option<StepInstance>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, step_id, status, output, retries, started_at, completed_at, failed_reason
             FROM step_instances WHERE step_id = ? AND status = ?
             ORDER BY started_at DESC LIMIT 1",
        )?;
        let row = stmt
            .query_row(
                (step_id.to_string(), StepInstanceStatus::Completed.as_str()),
                Self::row_to_step_instance,
            )
            .optional()?;
        row.map(Self::build_step_instance).transpose()
    }

    /// The most recent instance that hasn't reached a terminal status.
    /// By invariant, a FAILED instance only ever appears alongside a
    /// FAILED workflow (§5), so a workflow still running never has one
    /// to adopt here.
    pub fn find_latest_non_terminal_step_instance(
        &self,
        step_id: Uuid,
    ) -> CoreResult<Option<StepInstance>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, step_id, status, output, retries, started_at, completed_at, failed_reason
             FROM step_instances
             WHERE step_id = ? AND status IN (?, ?, ?)
             ORDER BY started_at DESC LIMIT 1",
        )?;
        let row = stmt
            .query_row(
                (
                    step_id.to_string(),
                    StepInstanceStatus::Pending.as_str(),
                    StepInstanceStatus::Running.as_str(),
                    StepInstanceStatus::Retrying.as_str(),
                ),
                Self::row_to_step_instance,
            )
            .optional()?;
        row.map(Self::build_step_instance).transpose()
    }

    pub fn create_step_instance(&self, step_id: Uuid) -> CoreResult<StepInstance> {
        let instance = StepInstance {
            id: Uuid::new_v4(),
            step_id,
            status: StepInstanceStatus::Running,
            output: None,
            retries: 0,
            started_at: Utc::now(),
            completed_at: None,
            failed_reason: None,
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO step_instances
                (id, step_id, status, output, retries, started_at, completed_at, failed_reason)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            (
                instance.id.to_string(),
                instance.step_id.to_string(),
                instance.status.as_str(),
                None::<String>,
                instance.retries,
                instance.started_at.to_rfc3339(),
                None::<String>,
                None::<String>,
            ),
        )?;
        Ok(instance)
    }

    pub fn mark_step_instance_retrying(&self, id: Uuid, retries: u32) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE step_instances SET status = ?, retries = ? WHERE id = ?",
            (StepInstanceStatus::Retrying.as_str(), retries, id.to_string()),
        )?;
        Ok(())
    }

    pub fn mark_step_instance_running(&self, id: Uuid) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE step_instances SET status = ? WHERE id = ?",
            (StepInstanceStatus::Running.as_str(), id.to_string()),
        )?;
        Ok(())
    }

    pub fn complete_step_instance(&self, id: Uuid, output: &serde_json::Value) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE step_instances SET status = ?, output = ?, completed_at = ? WHERE id = ?",
            (
                StepInstanceStatus::Completed.as_str(),
                serde_json::to_string(output)?,
                now_rfc3339(),
                id.to_string(),
            ),
        )?;
        Ok(())
    }

    /// Atomically fail a step instance and its owning workflow instance,
    /// per the exhausted-retry bundle in §5: an external observer must
    /// never see a FAILED step under a still-RUNNING workflow.
    pub fn fail_step_instance_and_workflow(
        &self,
        step_instance_id: Uuid,
        workflow_instance_id: Uuid,
        retries: u32,
        step_failed_reason: &str,
        workflow_failed_reason: &str,
    ) -> CoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = now_rfc3339();

        tx.execute(
            "UPDATE step_instances SET status = ?, retries = ?, failed_reason = ?, completed_at = ?
             WHERE id = ?",
            (
                StepInstanceStatus::Failed.as_str(),
                retries,
                step_failed_reason,
                &now,
                step_instance_id.to_string(),
            ),
        )?;

        tx.execute(
            "UPDATE workflow_instances
             SET status = ?, failed_reason = ?, completed_at = ?, updated_at = ?
             WHERE id = ?",
            (
                WorkflowStatus::Failed.as_str(),
                workflow_failed_reason,
                &now,
                &now,
                workflow_instance_id.to_string(),
            ),
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn get_step_instances_for_workflow(
        &self,
        workflow_instance_id: Uuid,
    ) -> CoreResult<Vec<StepInstance>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT si.id, si.step_id, si.status, si.output, si.retries, si.started_at,
                    si.completed_at, si.failed_reason
             FROM step_instances si
             JOIN steps s ON s.id = si.step_id
             WHERE s.workflow_instance_id = ?
             ORDER BY si.started_at ASC",
        )?;
        let rows = stmt
            .query_map([workflow_instance_id.to_string()], Self::row_to_step_instance)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(Self::build_step_instance).collect()
    }

    // ------------------------------------------------------------------
    // SleepInstance
    // ------------------------------------------------------------------

    fn row_to_sleep_instance(
        row: &Row,
    ) -> rusqlite::Result<(String, String, String, i64, String, Option<String>)> {
        Ok((
            row.get(0)?, // id
            row.get(1)?, // workflow_instance_id
            row.get(2)?, // name
            row.get(3)?, // duration_ms
            row.get(4)?, // started_at
            row.get(5)?, // completed_at
        ))
    }

    fn build_sleep_instance(
        fields: (String, String, String, i64, String, Option<String>),
    ) -> CoreResult<SleepInstance> {
        let (id, workflow_instance_id, name, duration_ms, started_at, completed_at) = fields;
        Ok(SleepInstance {
            id: Uuid::parse_str(&id)?,
            workflow_instance_id: Uuid::parse_str(&workflow_instance_id)?,
            name,
            duration_ms,
            started_at: parse_dt(&started_at)?,
            completed_at: parse_dt_opt(completed_at)?,
        })
    }

    pub fn find_sleep_instance(
        &self,
        workflow_instance_id: Uuid,
        name: &str,
    ) -> CoreResult<Option<SleepInstance>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, workflow_instance_id, name, duration_ms, started_at, completed_at
             FROM sleep_instances WHERE workflow_instance_id = ? AND name = ?",
        )?;
        let row = stmt
            .query_row(
                (workflow_instance_id.to_string(), name),
                Self::row_to_sleep_instance,
            )
            .optional()?;
        row.map(Self::build_sleep_instance).transpose()
    }

    /// Create a sleep instance and move the workflow to SLEEPING as one
    /// transaction (§5).
    pub fn start_sleep(
        &self,
        workflow_instance_id: Uuid,
        name: &str,
        duration_ms: i64,
    ) -> CoreResult<SleepInstance> {
        let instance = SleepInstance {
            id: Uuid::new_v4(),
            workflow_instance_id,
            name: name.to_string(),
            duration_ms,
            started_at: Utc::now(),
            completed_at: None,
        };

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO sleep_instances
                (id, workflow_instance_id, name, duration_ms, started_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            (
                instance.id.to_string(),
                instance.workflow_instance_id.to_string(),
                &instance.name,
                instance.duration_ms,
                instance.started_at.to_rfc3339(),
                None::<String>,
            ),
        )?;

        tx.execute(
            "UPDATE workflow_instances SET status = ?, updated_at = ? WHERE id = ?",
            (
                WorkflowStatus::Sleeping.as_str(),
                now_rfc3339(),
                workflow_instance_id.to_string(),
            ),
        )?;

        tx.commit()?;
        Ok(instance)
    }

    /// Complete a sleep instance and move the workflow back to RUNNING
    /// as one transaction (§5).
    pub fn complete_sleep(
        &self,
        sleep_instance_id: Uuid,
        workflow_instance_id: Uuid,
    ) -> CoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = now_rfc3339();

        tx.execute(
            "UPDATE sleep_instances SET completed_at = ? WHERE id = ?",
            (&now, sleep_instance_id.to_string()),
        )?;

        tx.execute(
            "UPDATE workflow_instances SET status = ?, updated_at = ? WHERE id = ?",
            (
                WorkflowStatus::Running.as_str(),
                &now,
                workflow_instance_id.to_string(),
            ),
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn get_sleep_instances_for_workflow(
        &self,
        workflow_instance_id: Uuid,
    ) -> CoreResult<Vec<SleepInstance>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, workflow_instance_id, name, duration_ms, started_at, completed_at
             FROM sleep_instances WHERE workflow_instance_id = ?",
        )?;
        let rows = stmt
            .query_map(
                [workflow_instance_id.to_string()],
                Self::row_to_sleep_instance,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(Self::build_sleep_instance).collect()
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    /// Database-wide counters for simple diagnostics.
    pub fn get_stats(&self) -> CoreResult<serde_json::Value> {
        let conn = self.conn.lock().unwrap();
        let workflow_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM workflow_instances", [], |row| row.get(0))?;
        let active_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM workflow_instances WHERE status IN ('Pending', 'Running', 'Sleeping')",
            [],
            |row| row.get(0),
        )?;

        Ok(serde_json::json!({
            "workflows": workflow_count,
            "active_workflows": active_count,
        }))
    }
}

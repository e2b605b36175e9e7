use async_trait::async_trait;
use chrono::{DateTime, Utc};
use postgres_types::Json;
use scheduler_core::database::{validate_job_status, validate_status, HasFieldChanges, JobStore};
use scheduler_core::error::StoreResult;
use serde_json::Value;
use std::sync::Arc;
use types::{Job, JobFilter, JobStatus, JobUpdate, OrderBy, Party, Task, TaskFilter, TaskStatus, TaskUpdate};

use super::sql::{get, get_parsed, page_clause, strings, where_clause, Params};
use crate::connection::{db_error, Database};

const JOB_COLUMNS: &str = "job_id, role, party_id, protocol, dag, parties, initiator_party_id, \
    scheduler_party_id, status, status_code, progress, priority, error_message, create_time, \
    update_time, start_time, end_time, elapsed";

const TASK_COLUMNS: &str = "job_id, role, party_id, task_name, component, task_id, task_version, \
    status, party_status, parameters, inputs, conf, dependencies, worker_id, run_pid, run_ip, \
    error_report, create_time, update_time, start_time, end_time, elapsed";

pub struct PostgresJobStore {
    db: Arc<Database>,
}

impl PostgresJobStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create_job(&self, job: &Job) -> StoreResult<()> {
        let query = format!(
            "INSERT INTO t_job ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
            JOB_COLUMNS
        );
        let client = self.db.client().await?;
        client
            .execute(
                &query,
                &[
                    &job.job_id,
                    &job.role.as_str(),
                    &job.party_id,
                    &job.protocol,
                    &Json(&job.dag),
                    &Json(&job.parties),
                    &job.initiator_party_id,
                    &job.scheduler_party_id,
                    &job.status.as_str(),
                    &job.status_code,
                    &job.progress,
                    &job.priority,
                    &job.error_message,
                    &job.create_time,
                    &job.update_time,
                    &job.start_time,
                    &job.end_time,
                    &job.elapsed,
                ],
            )
            .await
            .map_err(|e| db_error(&format!("job {} {} {}", job.job_id, job.role, job.party_id), e))?;
        Ok(())
    }

    async fn update_job(&self, update: &JobUpdate) -> StoreResult<bool> {
        let key = &update.key;
        let mut client = self.db.client().await?;
        let transaction = client
            .transaction()
            .await
            .map_err(|e| db_error("Failed to start transaction", e))?;

        let row = transaction
            .query_opt(
                "SELECT status FROM t_job WHERE job_id = $1 AND role = $2 AND party_id = $3 FOR UPDATE",
                &[&key.job_id, &key.role.as_str(), &key.party_id],
            )
            .await
            .map_err(|e| db_error("Failed to lock job", e))?;
        let Some(row) = row else {
            return Ok(false);
        };
        let current: JobStatus = get_parsed(&row, "status")?;
        if update.expected_status.map_or(false, |expected| expected != current) {
            return Ok(false);
        }
        let next = validate_job_status(current, update.status, update.rerun)?;
        if next.is_none() && !update.has_field_changes() {
            return Ok(false);
        }

        let mut params = Params::default();
        let mut fields = vec!["update_time = NOW()".to_string()];
        if let Some(status) = next {
            fields.push(format!("status = {}", params.push(status.to_string())));
        }
        if let Some(status_code) = update.status_code {
            fields.push(format!("status_code = {}", params.push(status_code)));
        }
        if let Some(progress) = update.progress {
            fields.push(format!("progress = {}", params.push(progress)));
        }
        if let Some(ref error_message) = update.error_message {
            fields.push(format!("error_message = {}", params.push(error_message.clone())));
        }
        push_times(&mut fields, &mut params, update.start_time, update.end_time, update.elapsed);

        let query = format!(
            "UPDATE t_job SET {} WHERE job_id = {} AND role = {} AND party_id = {}",
            fields.join(", "),
            params.push(key.job_id.clone()),
            params.push(key.role.to_string()),
            params.push(key.party_id.clone()),
        );
        let rows_affected = transaction
            .execute(&query, &params.refs())
            .await
            .map_err(|e| db_error("Failed to update job", e))?;
        transaction
            .commit()
            .await
            .map_err(|e| db_error("Failed to commit job update", e))?;

        Ok(rows_affected > 0)
    }

    async fn query_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let mut params = Params::default();
        let mut conditions = Vec::new();
        if let Some(ref job_id) = filter.job_id {
            conditions.push(format!("job_id = {}", params.push(job_id.clone())));
        }
        if let Some(role) = filter.role {
            conditions.push(format!("role = {}", params.push(role.to_string())));
        }
        if let Some(ref party_id) = filter.party_id {
            conditions.push(format!("party_id = {}", params.push(party_id.clone())));
        }
        if !filter.statuses.is_empty() {
            conditions.push(format!("status = ANY({})", params.push(strings(&filter.statuses))));
        }
        if let Some(ref protocol) = filter.protocol {
            conditions.push(format!("protocol = {}", params.push(protocol.clone())));
        }

        let order = match filter.order_by {
            OrderBy::CreateTimeAsc => "create_time ASC",
            OrderBy::PriorityThenCreateTime => "priority DESC, create_time ASC",
        };
        let query = format!(
            "SELECT {} FROM t_job {} ORDER BY {}{}",
            JOB_COLUMNS,
            where_clause(&conditions),
            order,
            page_clause(filter.limit, filter.offset, &mut params),
        );

        let client = self.db.client().await?;
        let rows = client
            .query(&query, &params.refs())
            .await
            .map_err(|e| db_error("Failed to query jobs", e))?;
        rows.iter().map(map_row_to_job).collect()
    }

    async fn create_task(&self, task: &Task) -> StoreResult<()> {
        let query = format!(
            "INSERT INTO t_task ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)",
            TASK_COLUMNS
        );
        let client = self.db.client().await?;
        client
            .execute(
                &query,
                &[
                    &task.job_id,
                    &task.role.as_str(),
                    &task.party_id,
                    &task.task_name,
                    &task.component,
                    &task.task_id,
                    &task.task_version,
                    &task.status.as_str(),
                    &task.party_status.as_str(),
                    &Json(&task.parameters),
                    &Json(&task.inputs),
                    &Json(&task.conf),
                    &task.dependencies,
                    &task.worker_id,
                    &task.run_pid,
                    &task.run_ip,
                    &task.error_report,
                    &task.create_time,
                    &task.update_time,
                    &task.start_time,
                    &task.end_time,
                    &task.elapsed,
                ],
            )
            .await
            .map_err(|e| {
                db_error(
                    &format!("task {} v{} {} {}", task.task_id, task.task_version, task.role, task.party_id),
                    e,
                )
            })?;
        Ok(())
    }

    async fn update_task(&self, update: &TaskUpdate) -> StoreResult<bool> {
        let key = &update.key;
        let mut client = self.db.client().await?;
        let transaction = client
            .transaction()
            .await
            .map_err(|e| db_error("Failed to start transaction", e))?;

        let row = transaction
            .query_opt(
                "SELECT status, party_status FROM t_task \
                 WHERE job_id = $1 AND task_id = $2 AND task_version = $3 AND role = $4 AND party_id = $5 \
                 FOR UPDATE",
                &[
                    &key.job_id,
                    &key.task_id,
                    &key.task_version,
                    &key.role.as_str(),
                    &key.party_id,
                ],
            )
            .await
            .map_err(|e| db_error("Failed to lock task", e))?;
        let Some(row) = row else {
            return Ok(false);
        };
        let status: TaskStatus = get_parsed(&row, "status")?;
        let party_status: TaskStatus = get_parsed(&row, "party_status")?;
        if update
            .expected_party_status
            .map_or(false, |expected| expected != party_status)
        {
            return Ok(false);
        }
        let next_status = validate_status(status, update.status)?;
        let next_party_status = validate_status(party_status, update.party_status)?;
        if next_status.is_none() && next_party_status.is_none() && !update.has_field_changes() {
            return Ok(false);
        }

        let mut params = Params::default();
        let mut fields = vec!["update_time = NOW()".to_string()];
        if let Some(status) = next_status {
            fields.push(format!("status = {}", params.push(status.to_string())));
        }
        if let Some(party_status) = next_party_status {
            fields.push(format!("party_status = {}", params.push(party_status.to_string())));
        }
        if let Some(ref worker_id) = update.worker_id {
            fields.push(format!("worker_id = {}", params.push(worker_id.clone())));
        }
        if let Some(run_pid) = update.run_pid {
            fields.push(format!("run_pid = {}", params.push(run_pid)));
        }
        if let Some(ref run_ip) = update.run_ip {
            fields.push(format!("run_ip = {}", params.push(run_ip.clone())));
        }
        if let Some(ref error_report) = update.error_report {
            fields.push(format!("error_report = {}", params.push(error_report.clone())));
        }
        push_times(&mut fields, &mut params, update.start_time, update.end_time, update.elapsed);

        let query = format!(
            "UPDATE t_task SET {} WHERE job_id = {} AND task_id = {} AND task_version = {} AND role = {} AND party_id = {}",
            fields.join(", "),
            params.push(key.job_id.clone()),
            params.push(key.task_id.clone()),
            params.push(key.task_version),
            params.push(key.role.to_string()),
            params.push(key.party_id.clone()),
        );
        let rows_affected = transaction
            .execute(&query, &params.refs())
            .await
            .map_err(|e| db_error("Failed to update task", e))?;
        transaction
            .commit()
            .await
            .map_err(|e| db_error("Failed to commit task update", e))?;

        Ok(rows_affected > 0)
    }

    async fn query_tasks(&self, filter: &TaskFilter) -> StoreResult<Vec<Task>> {
        let mut params = Params::default();
        let mut conditions = Vec::new();
        if let Some(ref job_id) = filter.job_id {
            conditions.push(format!("t.job_id = {}", params.push(job_id.clone())));
        }
        if let Some(role) = filter.role {
            conditions.push(format!("t.role = {}", params.push(role.to_string())));
        }
        if let Some(ref party_id) = filter.party_id {
            conditions.push(format!("t.party_id = {}", params.push(party_id.clone())));
        }
        if let Some(ref task_name) = filter.task_name {
            conditions.push(format!("t.task_name = {}", params.push(task_name.clone())));
        }
        if let Some(ref task_id) = filter.task_id {
            conditions.push(format!("t.task_id = {}", params.push(task_id.clone())));
        }
        if let Some(task_version) = filter.task_version {
            conditions.push(format!("t.task_version = {}", params.push(task_version)));
        }
        if !filter.statuses.is_empty() {
            conditions.push(format!("t.status = ANY({})", params.push(strings(&filter.statuses))));
        }
        if !filter.party_statuses.is_empty() {
            conditions.push(format!(
                "t.party_status = ANY({})",
                params.push(strings(&filter.party_statuses))
            ));
        }
        if filter.only_latest {
            conditions.push(
                "t.task_version = (SELECT MAX(l.task_version) FROM t_task l \
                 WHERE l.job_id = t.job_id AND l.task_id = t.task_id \
                 AND l.role = t.role AND l.party_id = t.party_id)"
                    .to_string(),
            );
        }

        let query = format!(
            "SELECT {} FROM t_task t {} ORDER BY t.create_time ASC, t.task_version ASC{}",
            prefixed(TASK_COLUMNS, "t"),
            where_clause(&conditions),
            page_clause(filter.limit, filter.offset, &mut params),
        );

        let client = self.db.client().await?;
        let rows = client
            .query(&query, &params.refs())
            .await
            .map_err(|e| db_error("Failed to query tasks", e))?;
        rows.iter().map(map_row_to_task).collect()
    }
}

pub(crate) fn push_times(
    fields: &mut Vec<String>,
    params: &mut Params,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    elapsed: Option<i64>,
) {
    if let Some(start_time) = start_time {
        fields.push(format!("start_time = {}", params.push(start_time)));
    }
    if let Some(end_time) = end_time {
        fields.push(format!("end_time = {}", params.push(end_time)));
    }
    if let Some(elapsed) = elapsed {
        fields.push(format!("elapsed = {}", params.push(elapsed)));
    }
}

pub(crate) fn prefixed(columns: &str, alias: &str) -> String {
    columns
        .split(',')
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn map_row_to_job(row: &tokio_postgres::Row) -> StoreResult<Job> {
    let dag: Json<Value> = get(row, "dag")?;
    let parties: Json<Vec<Party>> = get(row, "parties")?;
    Ok(Job {
        job_id: get(row, "job_id")?,
        role: get_parsed(row, "role")?,
        party_id: get(row, "party_id")?,
        protocol: get(row, "protocol")?,
        dag: dag.0,
        parties: parties.0,
        initiator_party_id: get(row, "initiator_party_id")?,
        scheduler_party_id: get(row, "scheduler_party_id")?,
        status: get_parsed(row, "status")?,
        status_code: get(row, "status_code")?,
        progress: get(row, "progress")?,
        priority: get(row, "priority")?,
        error_message: get(row, "error_message")?,
        create_time: get(row, "create_time")?,
        update_time: get(row, "update_time")?,
        start_time: get(row, "start_time")?,
        end_time: get(row, "end_time")?,
        elapsed: get(row, "elapsed")?,
    })
}

fn map_row_to_task(row: &tokio_postgres::Row) -> StoreResult<Task> {
    let parameters: Json<Value> = get(row, "parameters")?;
    let inputs: Json<Value> = get(row, "inputs")?;
    let conf: Json<Value> = get(row, "conf")?;
    Ok(Task {
        job_id: get(row, "job_id")?,
        role: get_parsed(row, "role")?,
        party_id: get(row, "party_id")?,
        task_name: get(row, "task_name")?,
        component: get(row, "component")?,
        task_id: get(row, "task_id")?,
        task_version: get(row, "task_version")?,
        status: get_parsed(row, "status")?,
        party_status: get_parsed(row, "party_status")?,
        parameters: parameters.0,
        inputs: inputs.0,
        conf: conf.0,
        dependencies: get(row, "dependencies")?,
        worker_id: get(row, "worker_id")?,
        run_pid: get(row, "run_pid")?,
        run_ip: get(row, "run_ip")?,
        error_report: get(row, "error_report")?,
        create_time: get(row, "create_time")?,
        update_time: get(row, "update_time")?,
        start_time: get(row, "start_time")?,
        end_time: get(row, "end_time")?,
        elapsed: get(row, "elapsed")?,
    })
}

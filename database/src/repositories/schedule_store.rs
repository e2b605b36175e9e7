use async_trait::async_trait;
use chrono::{DateTime, Utc};
use postgres_types::Json;
use scheduler_core::database::{validate_job_status, validate_status, HasFieldChanges, ScheduleStore};
use scheduler_core::error::StoreResult;
use serde_json::Value;
use std::sync::Arc;
use types::{
    JobStatus, OrderBy, Party, ScheduleJob, ScheduleJobFilter, ScheduleJobUpdate, ScheduleTask,
    ScheduleTaskFilter, ScheduleTaskUpdate, TaskStatus,
};

use super::job_store::{prefixed, push_times};
use super::sql::{get, get_parsed, get_parsed_opt, page_clause, strings, where_clause, Params};
use crate::connection::{db_error, Database};

const SCHEDULE_JOB_COLUMNS: &str = "job_id, protocol, dag, parties, initiator_party_id, \
    scheduler_party_id, status, status_code, progress, priority, schedule_signal, schedule_time, \
    cancel_signal, cancel_time, stop_status, rerun_signal, rerun_tasks, created_parties, \
    error_message, create_time, update_time, start_time, end_time, elapsed";

const SCHEDULE_TASK_COLUMNS: &str = "job_id, role, party_id, task_name, component, task_id, \
    task_version, status, auto_retries, error_report, create_time, update_time, start_time, \
    end_time, elapsed";

pub struct PostgresScheduleStore {
    db: Arc<Database>,
}

impl PostgresScheduleStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ScheduleStore for PostgresScheduleStore {
    async fn create_schedule_job(&self, job: &ScheduleJob) -> StoreResult<()> {
        let query = format!(
            "INSERT INTO t_schedule_job ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, \
              $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)",
            SCHEDULE_JOB_COLUMNS
        );
        let stop_status = job.stop_status.map(|s| s.as_str());
        let client = self.db.client().await?;
        client
            .execute(
                &query,
                &[
                    &job.job_id,
                    &job.protocol,
                    &Json(&job.dag),
                    &Json(&job.parties),
                    &job.initiator_party_id,
                    &job.scheduler_party_id,
                    &job.status.as_str(),
                    &job.status_code,
                    &job.progress,
                    &job.priority,
                    &job.schedule_signal,
                    &job.schedule_time,
                    &job.cancel_signal,
                    &job.cancel_time,
                    &stop_status,
                    &job.rerun_signal,
                    &job.rerun_tasks,
                    &job.created_parties,
                    &job.error_message,
                    &job.create_time,
                    &job.update_time,
                    &job.start_time,
                    &job.end_time,
                    &job.elapsed,
                ],
            )
            .await
            .map_err(|e| db_error(&format!("schedule job {}", job.job_id), e))?;
        Ok(())
    }

    async fn update_schedule_job(&self, update: &ScheduleJobUpdate) -> StoreResult<bool> {
        let mut client = self.db.client().await?;
        let transaction = client
            .transaction()
            .await
            .map_err(|e| db_error("Failed to start transaction", e))?;

        let row = transaction
            .query_opt(
                "SELECT status, schedule_signal, schedule_time FROM t_schedule_job \
                 WHERE job_id = $1 FOR UPDATE",
                &[&update.job_id],
            )
            .await
            .map_err(|e| db_error("Failed to lock schedule job", e))?;
        let Some(row) = row else {
            return Ok(false);
        };
        let current: JobStatus = get_parsed(&row, "status")?;
        let schedule_signal: bool = get(&row, "schedule_signal")?;
        let schedule_time: Option<DateTime<Utc>> = get(&row, "schedule_time")?;

        if update.expected_status.map_or(false, |expected| expected != current)
            || update
                .expected_schedule_signal
                .map_or(false, |expected| expected != schedule_signal)
            || update
                .expected_schedule_time
                .map_or(false, |expected| Some(expected) != schedule_time)
        {
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
        if let Some(schedule_signal) = update.schedule_signal {
            fields.push(format!("schedule_signal = {}", params.push(schedule_signal)));
        }
        if let Some(schedule_time) = update.schedule_time {
            fields.push(format!("schedule_time = {}", params.push(schedule_time)));
        }
        if let Some(cancel_signal) = update.cancel_signal {
            fields.push(format!("cancel_signal = {}", params.push(cancel_signal)));
        }
        if let Some(cancel_time) = update.cancel_time {
            fields.push(format!("cancel_time = {}", params.push(cancel_time)));
        }
        if let Some(stop_status) = update.stop_status {
            fields.push(format!("stop_status = {}", params.push(stop_status.to_string())));
        }
        if let Some(rerun_signal) = update.rerun_signal {
            fields.push(format!("rerun_signal = {}", params.push(rerun_signal)));
        }
        if let Some(ref rerun_tasks) = update.rerun_tasks {
            fields.push(format!("rerun_tasks = {}", params.push(rerun_tasks.clone())));
        }
        if let Some(ref created_parties) = update.created_parties {
            fields.push(format!("created_parties = {}", params.push(created_parties.clone())));
        }
        if let Some(ref error_message) = update.error_message {
            fields.push(format!("error_message = {}", params.push(error_message.clone())));
        }
        push_times(&mut fields, &mut params, update.start_time, update.end_time, update.elapsed);

        let query = format!(
            "UPDATE t_schedule_job SET {} WHERE job_id = {}",
            fields.join(", "),
            params.push(update.job_id.clone()),
        );
        let rows_affected = transaction
            .execute(&query, &params.refs())
            .await
            .map_err(|e| db_error("Failed to update schedule job", e))?;
        transaction
            .commit()
            .await
            .map_err(|e| db_error("Failed to commit schedule job update", e))?;

        Ok(rows_affected > 0)
    }

    async fn query_schedule_jobs(&self, filter: &ScheduleJobFilter) -> StoreResult<Vec<ScheduleJob>> {
        let mut params = Params::default();
        let mut conditions = Vec::new();
        if let Some(ref job_id) = filter.job_id {
            conditions.push(format!("job_id = {}", params.push(job_id.clone())));
        }
        if !filter.statuses.is_empty() {
            conditions.push(format!("status = ANY({})", params.push(strings(&filter.statuses))));
        }
        if let Some(ref protocol) = filter.protocol {
            conditions.push(format!("protocol = {}", params.push(protocol.clone())));
        }
        if let Some(cancel_signal) = filter.cancel_signal {
            conditions.push(format!("cancel_signal = {}", params.push(cancel_signal)));
        }
        if let Some(rerun_signal) = filter.rerun_signal {
            conditions.push(format!("rerun_signal = {}", params.push(rerun_signal)));
        }

        let order = match filter.order_by {
            OrderBy::CreateTimeAsc => "create_time ASC",
            OrderBy::PriorityThenCreateTime => "priority DESC, create_time ASC",
        };
        let query = format!(
            "SELECT {} FROM t_schedule_job {} ORDER BY {}{}",
            SCHEDULE_JOB_COLUMNS,
            where_clause(&conditions),
            order,
            page_clause(filter.limit, filter.offset, &mut params),
        );

        let client = self.db.client().await?;
        let rows = client
            .query(&query, &params.refs())
            .await
            .map_err(|e| db_error("Failed to query schedule jobs", e))?;
        rows.iter().map(map_row_to_schedule_job).collect()
    }

    async fn create_schedule_task(&self, task: &ScheduleTask) -> StoreResult<()> {
        let query = format!(
            "INSERT INTO t_schedule_task ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
            SCHEDULE_TASK_COLUMNS
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
                    &task.auto_retries,
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
                    &format!(
                        "schedule task {} v{} {} {}",
                        task.task_id, task.task_version, task.role, task.party_id
                    ),
                    e,
                )
            })?;
        Ok(())
    }

    async fn update_schedule_task(&self, update: &ScheduleTaskUpdate) -> StoreResult<bool> {
        let key = &update.key;
        let mut client = self.db.client().await?;
        let transaction = client
            .transaction()
            .await
            .map_err(|e| db_error("Failed to start transaction", e))?;

        let row = transaction
            .query_opt(
                "SELECT status FROM t_schedule_task \
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
            .map_err(|e| db_error("Failed to lock schedule task", e))?;
        let Some(row) = row else {
            return Ok(false);
        };
        let current: TaskStatus = get_parsed(&row, "status")?;
        if update.expected_status.map_or(false, |expected| expected != current) {
            return Ok(false);
        }
        let next = validate_status(current, update.status)?;
        if next.is_none() && !update.has_field_changes() {
            return Ok(false);
        }

        let mut params = Params::default();
        let mut fields = vec!["update_time = NOW()".to_string()];
        if let Some(status) = next {
            fields.push(format!("status = {}", params.push(status.to_string())));
        }
        if let Some(auto_retries) = update.auto_retries {
            fields.push(format!("auto_retries = {}", params.push(auto_retries)));
        }
        if let Some(ref error_report) = update.error_report {
            fields.push(format!("error_report = {}", params.push(error_report.clone())));
        }
        push_times(&mut fields, &mut params, update.start_time, update.end_time, update.elapsed);

        let query = format!(
            "UPDATE t_schedule_task SET {} WHERE job_id = {} AND task_id = {} AND task_version = {} AND role = {} AND party_id = {}",
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
            .map_err(|e| db_error("Failed to update schedule task", e))?;
        transaction
            .commit()
            .await
            .map_err(|e| db_error("Failed to commit schedule task update", e))?;

        Ok(rows_affected > 0)
    }

    async fn query_schedule_tasks(
        &self,
        filter: &ScheduleTaskFilter,
    ) -> StoreResult<Vec<ScheduleTask>> {
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
        if filter.only_latest {
            conditions.push(
                "t.task_version = (SELECT MAX(l.task_version) FROM t_schedule_task l \
                 WHERE l.job_id = t.job_id AND l.task_id = t.task_id \
                 AND l.role = t.role AND l.party_id = t.party_id)"
                    .to_string(),
            );
        }

        let query = format!(
            "SELECT {} FROM t_schedule_task t {} ORDER BY t.create_time ASC, t.task_version ASC{}",
            prefixed(SCHEDULE_TASK_COLUMNS, "t"),
            where_clause(&conditions),
            page_clause(filter.limit, filter.offset, &mut params),
        );

        let client = self.db.client().await?;
        let rows = client
            .query(&query, &params.refs())
            .await
            .map_err(|e| db_error("Failed to query schedule tasks", e))?;
        rows.iter().map(map_row_to_schedule_task).collect()
    }
}

fn map_row_to_schedule_job(row: &tokio_postgres::Row) -> StoreResult<ScheduleJob> {
    let dag: Json<Value> = get(row, "dag")?;
    let parties: Json<Vec<Party>> = get(row, "parties")?;
    Ok(ScheduleJob {
        job_id: get(row, "job_id")?,
        protocol: get(row, "protocol")?,
        dag: dag.0,
        parties: parties.0,
        initiator_party_id: get(row, "initiator_party_id")?,
        scheduler_party_id: get(row, "scheduler_party_id")?,
        status: get_parsed(row, "status")?,
        status_code: get(row, "status_code")?,
        progress: get(row, "progress")?,
        priority: get(row, "priority")?,
        schedule_signal: get(row, "schedule_signal")?,
        schedule_time: get(row, "schedule_time")?,
        cancel_signal: get(row, "cancel_signal")?,
        cancel_time: get(row, "cancel_time")?,
        stop_status: get_parsed_opt(row, "stop_status")?,
        rerun_signal: get(row, "rerun_signal")?,
        rerun_tasks: get(row, "rerun_tasks")?,
        created_parties: get(row, "created_parties")?,
        error_message: get(row, "error_message")?,
        create_time: get(row, "create_time")?,
        update_time: get(row, "update_time")?,
        start_time: get(row, "start_time")?,
        end_time: get(row, "end_time")?,
        elapsed: get(row, "elapsed")?,
    })
}

fn map_row_to_schedule_task(row: &tokio_postgres::Row) -> StoreResult<ScheduleTask> {
    Ok(ScheduleTask {
        job_id: get(row, "job_id")?,
        role: get_parsed(row, "role")?,
        party_id: get(row, "party_id")?,
        task_name: get(row, "task_name")?,
        component: get(row, "component")?,
        task_id: get(row, "task_id")?,
        task_version: get(row, "task_version")?,
        status: get_parsed(row, "status")?,
        auto_retries: get(row, "auto_retries")?,
        error_report: get(row, "error_report")?,
        create_time: get(row, "create_time")?,
        update_time: get(row, "update_time")?,
        start_time: get(row, "start_time")?,
        end_time: get(row, "end_time")?,
        elapsed: get(row, "elapsed")?,
    })
}

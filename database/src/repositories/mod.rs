pub mod job_store;
pub mod schedule_store;
mod sql;

pub use job_store::PostgresJobStore;
pub use schedule_store::PostgresScheduleStore;

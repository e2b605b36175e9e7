pub mod config;
pub mod controller;
pub mod database;
pub mod detector;
pub mod error;
pub mod federation;
pub mod party;
pub mod resource;
pub mod scheduler;
pub mod scheduler_api;

pub use config::{EngineConfig, FederatedConfig, SchedulerConfig};
pub use controller::{
    worker_name, EngineAdapter, EngineRegistry, TaskController, WorkerHandle, WorkerSpec,
};
pub use database::{Database, JobStore, ScheduleStore};
pub use detector::{DetectReport, Detector};
pub use error::{
    EngineError, FederatedError, Result, SchedulerError, StoreError, StoreResult,
};
pub use federation::{
    CommandHandler, FederatedResult, FederatedScheduler, FederatedTransport, LoopbackTransport,
    NoRemoteTransport,
};
pub use party::PartyService;
pub use resource::{Admission, ResourceManager};
pub use scheduler::JobScheduler;
pub use scheduler_api::SchedulerApi;

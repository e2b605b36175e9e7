use database::{DatabaseConfig, PostgresJobStore, PostgresScheduleStore};
use federated_client::{HttpTransport, RouteTable};
use scheduler_core::database::{Database, JobStore, ScheduleStore};
use scheduler_core::{
    Detector, FederatedScheduler, JobScheduler, LoopbackTransport, PartyService, SchedulerApi,
    SchedulerConfig, TaskController,
};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = SchedulerConfig::from_env()?;
    let instance_id = hostname::get()
        .map(|h| format!("fate-flow-{}", h.to_string_lossy()))
        .unwrap_or_else(|_| "fate-flow-unknown".to_string());
    info!(
        party_id = config.party_id,
        is_scheduler = config.is_scheduler,
        device = %config.engine.device,
        instance_id,
        "FATE Flow configuration loaded"
    );

    let db = Arc::new(
        database::Database::new(DatabaseConfig::default())
            .map_err(|e| format!("Failed to create database: {}", e))?,
    );
    if !db.health_check().await {
        error!("Failed to connect to database");
        std::process::exit(1);
    }
    db.migrate().await?;

    let job_store: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(Arc::clone(&db)));
    let schedule_store: Arc<dyn ScheduleStore> =
        Arc::new(PostgresScheduleStore::new(Arc::clone(&db)));

    let engines = Arc::new(engine_adapter::build_registry(&config.engine).await?);
    let controller = Arc::new(TaskController::new(
        Arc::clone(&job_store),
        engines,
        config.engine.clone(),
        config.job_defaults.clone(),
    ));

    let routes = RouteTable::from_env()?;
    let remote = Arc::new(HttpTransport::new(config.party_id.clone(), routes)?);
    let party_federation = Arc::new(FederatedScheduler::new(remote.clone(), config.federated.clone()));

    let api = Arc::new(SchedulerApi::new(
        config.party_id.clone(),
        schedule_store,
        config.job_defaults.clone(),
    ));

    let mut party_service = PartyService::new(
        config.party_id.clone(),
        Arc::clone(&job_store),
        Arc::clone(&controller),
        party_federation,
        config.job_defaults.clone(),
    );
    if config.is_scheduler {
        party_service = party_service.with_scheduler(Arc::clone(&api));
    }
    let party_service = Arc::new(party_service);

    // Commands addressed to this party skip the network.
    let loopback = Arc::new(LoopbackTransport::new(
        config.party_id.clone(),
        party_service,
        remote,
    ));
    let federation = Arc::new(FederatedScheduler::new(loopback, config.federated.clone()));

    let detector = Arc::new(Detector::new(
        config.party_id.clone(),
        job_store,
        controller,
        Arc::clone(&federation),
        config.detect_interval,
        config.detector_grace_period,
    ));
    let detector_handle = Arc::clone(&detector).start().await;

    let scheduler = if config.is_scheduler {
        let scheduler = Arc::new(JobScheduler::new(config.clone(), api, federation));
        let handle = Arc::clone(&scheduler).start().await;
        Some((scheduler, handle))
    } else {
        None
    };

    info!("FATE Flow started");
    tokio::signal::ctrl_c().await?;
    info!("Received SIGINT/SIGTERM, shutting down gracefully...");

    detector.stop().await;
    if let Some((scheduler, handle)) = scheduler {
        scheduler.stop().await;
        let _ = handle.await;
    }
    let _ = detector_handle.await;
    db.close().await;

    Ok(())
}

mod command;
pub mod docker;
pub mod k8s;
pub mod local;

pub use docker::DockerEngine;
pub use k8s::K8sEngine;
pub use local::LocalProcessEngine;

use scheduler_core::config::EngineConfig;
use scheduler_core::controller::EngineRegistry;
use scheduler_core::error::EngineError;
use std::sync::Arc;
use tracing::info;
use types::EngineDevice;

/// Build the adapters for the configured device and check the default resolves.
///
/// The local adapter is always present; the cluster adapter is only built
/// when selected since it needs a reachable API server.
pub async fn build_registry(config: &EngineConfig) -> Result<EngineRegistry, EngineError> {
    let mut registry = EngineRegistry::new(config.device)
        .register(Arc::new(LocalProcessEngine::new()))
        .register(Arc::new(DockerEngine::new(config.docker_image.clone())));

    if config.device == EngineDevice::K8s {
        let engine = K8sEngine::new(config.k8s_namespace.clone(), config.k8s_image.clone()).await?;
        registry = registry.register(Arc::new(engine));
    }

    registry.validate()?;
    info!(device = %config.device, "Engine registry ready");
    Ok(registry)
}

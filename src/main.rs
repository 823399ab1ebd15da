use crate::admission::AdmissionHandler;
use crate::backup::{BackupPolicy, ImageBackupService};
use crate::registry::OciRegistry;
use crate::workload::WorkloadMutator;
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod admission;
mod backup;
mod config;
mod credentials;
mod image_reference;
mod registry;
mod webserver;
mod workload;

static DEFAULT_CONFIG_PATH: &str = "/etc/image-backup-webhook/config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    info!("Starting image-backup-webhook {}", env!("CARGO_PKG_VERSION"));

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install the rustls crypto provider"))?;

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = config::load_config(&config_path)?;

    let registry = OciRegistry::new(registry::create_client(&config.registry_client)?);
    let policy = BackupPolicy::new(config.backup.registry.clone(), config.backup.credential())
        .with_timeout(config.backup.timeout());
    info!(
        "Backing up images into {} with credential {:?} and timeout {:?}",
        policy.backup_registry, policy.credential, policy.timeout
    );

    let backup = Arc::new(ImageBackupService::new(policy, Arc::new(registry)));
    let handler = Arc::new(AdmissionHandler::new(WorkloadMutator::new(backup)));

    let app = webserver::create_app(handler);
    webserver::serve(app, &config.webserver).await
}

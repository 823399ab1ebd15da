use crate::credentials::RegistryCredential;
use crate::registry::{ImageRegistry, TransportError};
use oci_distribution::Reference;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("invalid image reference {image}: {reason}")]
    InvalidReference { image: String, reason: String },

    #[error("failed to pull image {image}: {source}")]
    PullFailed {
        image: String,
        #[source]
        source: TransportError,
    },

    #[error("invalid backup tag {tag}: {reason}")]
    InvalidTag { tag: String, reason: String },

    #[error("failed to push image {tag}: {source}")]
    PushFailed {
        tag: String,
        #[source]
        source: TransportError,
    },

    #[error("backup of image {image} did not finish within {timeout:?}")]
    TimedOut { image: String, timeout: Duration },
}

/// Where backups go and how to get there. Built once at startup.
#[derive(Debug, Clone)]
pub struct BackupPolicy {
    pub backup_registry: String,
    pub credential: RegistryCredential,
    pub timeout: Option<Duration>,
}

impl BackupPolicy {
    pub fn new(backup_registry: impl Into<String>, credential: RegistryCredential) -> Self {
        Self {
            backup_registry: backup_registry.into(),
            credential,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Clones images from their source registry into the backup registry.
pub struct ImageBackupService {
    policy: BackupPolicy,
    registry: Arc<dyn ImageRegistry>,
}

impl ImageBackupService {
    pub fn new(policy: BackupPolicy, registry: Arc<dyn ImageRegistry>) -> Self {
        Self { policy, registry }
    }

    pub fn policy(&self) -> &BackupPolicy {
        &self.policy
    }

    pub async fn backup(&self, image: &str) -> Result<(), BackupError> {
        match self.policy.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.copy_image(image))
                .await
                .map_err(|_| BackupError::TimedOut {
                    image: image.to_string(),
                    timeout,
                })?,
            None => self.copy_image(image).await,
        }
    }

    async fn copy_image(&self, image: &str) -> Result<(), BackupError> {
        let source = image
            .parse::<Reference>()
            .map_err(|e| BackupError::InvalidReference {
                image: image.to_string(),
                reason: e.to_string(),
            })?;

        let pulled = self
            .registry
            .pull(&source)
            .await
            .map_err(|source| BackupError::PullFailed {
                image: image.to_string(),
                source,
            })?;

        // the destination keeps the full original reference, registry included
        let destination = backup_tag(&self.policy.backup_registry, image)?;
        debug!("Backing up image {} as {}", image, destination);

        self.registry
            .push(&destination, pulled, &self.policy.credential)
            .await
            .map_err(|source| BackupError::PushFailed {
                tag: destination.to_string(),
                source,
            })?;

        info!("Backed up image {} to {}", image, destination);
        Ok(())
    }
}

/// Parses `<backup_registry>/<image>` as a tagged reference.
fn backup_tag(backup_registry: &str, image: &str) -> Result<Reference, BackupError> {
    let tag = format!("{}/{}", backup_registry, image);
    let reference = tag
        .parse::<Reference>()
        .map_err(|e| BackupError::InvalidTag {
            tag: tag.clone(),
            reason: e.to_string(),
        })?;

    if reference.digest().is_some() {
        return Err(BackupError::InvalidTag {
            tag,
            reason: "digest references cannot be used as a backup tag".to_string(),
        });
    }
    Ok(reference)
}

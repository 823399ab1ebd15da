use crate::config::RegistryClient;
use crate::credentials::RegistryCredential;
use anyhow::{Context, Result};
use async_trait::async_trait;
use oci_distribution::client::{
    Certificate, CertificateEncoding, ClientConfig, ClientProtocol, Config, ImageLayer,
};
use oci_distribution::manifest::{self, OciImageManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use std::fs;
use tracing::{debug, info};

pub type TransportError = Box<dyn std::error::Error + Send + Sync>;

/// Layer media types copied between registries
const ACCEPTED_LAYER_MEDIA_TYPES: [&str; 4] = [
    manifest::IMAGE_LAYER_MEDIA_TYPE,
    manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE,
    manifest::IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
    manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
];

/// Image content held in memory between pull and push.
pub struct PulledImage {
    pub layers: Vec<ImageLayer>,
    pub config: Config,
    pub manifest: Option<OciImageManifest>,
}

/// Pull and push capabilities the backup service depends on.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    async fn pull(&self, reference: &Reference) -> Result<PulledImage, TransportError>;

    async fn push(
        &self,
        reference: &Reference,
        image: PulledImage,
        credential: &RegistryCredential,
    ) -> Result<(), TransportError>;
}

/// `ImageRegistry` backed by the OCI distribution API.
pub struct OciRegistry {
    client: Client,
}

impl OciRegistry {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

pub fn create_client(config: &RegistryClient) -> Result<Client> {
    info!("Initializing OCI Registry client");
    let mut extra_root_certificates = Vec::new();

    for file_path in &config.ca_certificate_paths {
        let data = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        extra_root_certificates.push(Certificate {
            encoding: CertificateEncoding::Pem,
            data,
        });
    }

    let protocol = if config.insecure_registries.is_empty() {
        ClientProtocol::Https
    } else {
        info!(
            "Using plain HTTP for registries {:?}",
            config.insecure_registries
        );
        ClientProtocol::HttpsExcept(config.insecure_registries.clone())
    };

    Ok(Client::new(ClientConfig {
        protocol,
        extra_root_certificates,
        ..Default::default()
    }))
}

#[async_trait]
impl ImageRegistry for OciRegistry {
    async fn pull(&self, reference: &Reference) -> Result<PulledImage, TransportError> {
        info!("Pulling image {}", reference);
        let image = self
            .client
            .pull(
                reference,
                &RegistryAuth::Anonymous,
                ACCEPTED_LAYER_MEDIA_TYPES.to_vec(),
            )
            .await?;
        debug!(
            "Pulled {} layers for {} with digest {:?}",
            image.layers.len(),
            reference,
            image.digest
        );

        Ok(PulledImage {
            layers: image.layers,
            config: image.config,
            manifest: image.manifest,
        })
    }

    async fn push(
        &self,
        reference: &Reference,
        image: PulledImage,
        credential: &RegistryCredential,
    ) -> Result<(), TransportError> {
        info!("Pushing image {}", reference);
        let response = self
            .client
            .push(
                reference,
                &image.layers,
                image.config,
                &RegistryAuth::from(credential),
                image.manifest,
            )
            .await?;
        debug!("Pushed manifest to {}", response.manifest_url);
        Ok(())
    }
}

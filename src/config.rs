use crate::credentials::{RegistryCredential, SecretString};
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs, path::Path};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub webserver: Webserver,
    pub backup: Backup,
    #[serde(default, rename = "registryClient")]
    pub registry_client: RegistryClient,
}

#[derive(Debug, Deserialize)]
pub struct Webserver {
    pub port: u16,
    pub tls: Option<Tls>,
}

#[derive(Debug, Deserialize)]
pub struct Tls {
    #[serde(rename = "certPath")]
    pub cert_path: PathBuf,
    #[serde(rename = "keyPath")]
    pub key_path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct Backup {
    pub registry: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    #[serde(rename = "timeoutSeconds")]
    pub timeout_seconds: Option<u64>,
}

impl Backup {
    pub fn credential(&self) -> RegistryCredential {
        RegistryCredential::from_parts(self.username.clone(), self.password.clone())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RegistryClient {
    #[serde(default, rename = "caCertificatePaths")]
    pub ca_certificate_paths: Vec<PathBuf>,
    /// Registries reached over plain HTTP
    #[serde(default, rename = "insecureRegistries")]
    pub insecure_registries: Vec<String>,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    if config.backup.registry.is_empty() {
        warn!("Backup registry is empty, every container image will be treated as untrusted");
    }

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming the first missing variable.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| var_name.to_string());
            String::new()
        })
    });

    if let Some(var_name) = missing {
        anyhow::bail!("Missing environment variable: {}", var_name);
    }

    Ok(result.into_owned())
}

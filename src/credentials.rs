use oci_distribution::secrets::RegistryAuth;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wrapper for secret strings (e.g., registry passwords) that prints a "<REDACTED, length {length of the secret}>" string for Debug/Display
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: impl Into<String>) -> Self {
        SecretString(s.into())
    }

    /// Access the raw secret if explicitly needed
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    fn fmt_redacted_secret(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<REDACTED, length {}>", self.0.len())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_redacted_secret(f)
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_redacted_secret(f)
    }
}

/// Credential used when pushing into the backup registry.
///
/// Only the registry transport looks inside it; matching and rewriting never do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCredential {
    Anonymous,
    Basic {
        username: String,
        password: SecretString,
    },
}

impl RegistryCredential {
    pub fn from_parts(username: Option<String>, password: Option<SecretString>) -> Self {
        match (username, password) {
            (Some(username), Some(password)) => RegistryCredential::Basic { username, password },
            _ => RegistryCredential::Anonymous,
        }
    }
}

impl From<&RegistryCredential> for RegistryAuth {
    fn from(credential: &RegistryCredential) -> Self {
        match credential {
            RegistryCredential::Anonymous => RegistryAuth::Anonymous,
            RegistryCredential::Basic { username, password } => {
                RegistryAuth::Basic(username.clone(), password.expose_secret().to_owned())
            }
        }
    }
}

//! API key resolution
//!
//! Sources are tried in priority order; the first non-blank key wins. A source
//! that fails is logged and skipped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CREDENTIALS_FILE: &str = "credentials.json";

/// Environment variables consulted, in order.
pub const API_KEY_ENV_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential store {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("credential store {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// A place an API key may be found.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    fn name(&self) -> &str;

    /// The stored key, `Ok(None)` if this source has none.
    async fn lookup(&self) -> Result<Option<String>, CredentialError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredCredentials {
    api_key: String,
}

/// Local key store: a JSON file readable only by the user.
#[derive(Debug, Clone)]
pub struct KeyStore {
    path: PathBuf,
}

impl KeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `credentials.json` in the per-user config directory.
    pub fn default_location() -> Option<Self> {
        crate::config::config_dir().map(|dir| Self::new(dir.join(CREDENTIALS_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `api_key`, replacing any stored key.
    pub fn save(&self, api_key: &str) -> Result<(), CredentialError> {
        let io_error = |source| CredentialError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }

        let body = serde_json::to_string_pretty(&StoredCredentials {
            api_key: api_key.trim().to_string(),
        })
        .map_err(|source| CredentialError::Malformed {
            path: self.path.clone(),
            source,
        })?;

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path).map_err(io_error)?;

        // `mode` only applies on creation; tighten a file that already existed.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(io_error)?;
        }
        file.write_all(body.as_bytes()).map_err(io_error)?;

        info!("🔑 API key saved to {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl CredentialSource for KeyStore {
    fn name(&self) -> &str {
        "key store"
    }

    async fn lookup(&self) -> Result<Option<String>, CredentialError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CredentialError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let stored: StoredCredentials =
            serde_json::from_str(&text).map_err(|source| CredentialError::Malformed {
                path: self.path.clone(),
                source,
            })?;
        Ok(Some(stored.api_key))
    }
}

/// Process environment.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    vars: Vec<String>,
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new(API_KEY_ENV_VARS)
    }
}

impl EnvCredentials {
    pub fn new<I, S>(vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            vars: vars.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl CredentialSource for EnvCredentials {
    fn name(&self) -> &str {
        "environment"
    }

    async fn lookup(&self) -> Result<Option<String>, CredentialError> {
        Ok(self
            .vars
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|value| !value.trim().is_empty()))
    }
}

/// Ordered list of sources.
#[derive(Default)]
pub struct CredentialChain {
    sources: Vec<Box<dyn CredentialSource>>,
}

impl CredentialChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key store (when a config directory exists) then environment.
    pub fn standard() -> Self {
        let mut chain = Self::new();
        if let Some(store) = KeyStore::default_location() {
            chain = chain.with(store);
        }
        chain.with(EnvCredentials::default())
    }

    pub fn with(mut self, source: impl CredentialSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// First non-blank key, trimmed.
    pub async fn resolve(&self) -> Option<String> {
        for source in &self.sources {
            match source.lookup().await {
                Ok(Some(key)) if !key.trim().is_empty() => {
                    debug!("API key found in {}", source.name());
                    return Some(key.trim().to_string());
                }
                Ok(_) => debug!("No API key in {}", source.name()),
                Err(e) => warn!("Skipping {}: {}", source.name(), e),
            }
        }
        None
    }
}

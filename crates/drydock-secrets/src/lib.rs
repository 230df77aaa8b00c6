//! drydock-secrets — secret resolution for build and runtime environments.
//!
//! A capability interface with two backends, selected by configuration at
//! startup:
//!
//! - **`EnvFileProvider`** — parses a `.env`-style file once at startup
//! - **`ExecProvider`** — shells out to a configured lookup command per
//!   key (the stand-in for a cloud parameter store; the command wraps
//!   whatever CLI the deployment environment provides)
//!
//! Resolved values are wrapped in `secrecy::SecretString` so they never
//! land in debug output, and cached after the first successful lookup.
//! A missing key surfaces as `SecretsError::Unavailable`, which fails the
//! requesting deployment stage rather than starting an app with missing
//! configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Result type alias for secret lookups.
pub type SecretsResult<T> = Result<T, SecretsError>;

/// Errors from secret resolution.
#[derive(Debug, Error)]
pub enum SecretsError {
    /// The key has no value in the configured backend.
    #[error("secret unavailable: {0}")]
    Unavailable(String),

    #[error("secrets backend error: {0}")]
    Backend(String),

    #[error("secret lookup timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Resolves secret values for injection into app environments.
#[async_trait]
pub trait SecretsProvider: Send + Sync {
    async fn get(&self, key: &str) -> SecretsResult<SecretString>;
}

// ── Env-file backend ──────────────────────────────────────────────

/// Secrets loaded from a `KEY=VALUE` file.
pub struct EnvFileProvider {
    values: HashMap<String, SecretString>,
}

impl EnvFileProvider {
    /// Parse the file once; later lookups are in-memory.
    pub fn load(path: &Path) -> SecretsResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SecretsError::Backend(format!("cannot read {}: {e}", path.display()))
        })?;
        let values = parse_env_file(&raw);
        debug!(path = %path.display(), keys = values.len(), "env-file secrets loaded");
        Ok(Self { values })
    }
}

#[async_trait]
impl SecretsProvider for EnvFileProvider {
    async fn get(&self, key: &str) -> SecretsResult<SecretString> {
        self.values
            .get(key)
            .cloned()
            .ok_or_else(|| SecretsError::Unavailable(key.to_string()))
    }
}

/// Parse `KEY=VALUE` lines; `#` comments and blank lines are skipped,
/// single/double quotes around the value are stripped. Empty values are
/// treated as absent.
fn parse_env_file(raw: &str) -> HashMap<String, SecretString> {
    let mut values = HashMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().trim_start_matches("export ").trim();
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        if !key.is_empty() && !value.is_empty() {
            values.insert(key.to_string(), SecretString::from(value.to_string()));
        }
    }
    values
}

// ── Exec backend ──────────────────────────────────────────────────

/// Secrets resolved by an external lookup command.
///
/// The configured argv is invoked with the key appended; stdout (trimmed)
/// is the value. Non-zero exit means the key is unavailable.
pub struct ExecProvider {
    argv: Vec<String>,
    timeout: Duration,
    cache: Mutex<HashMap<String, SecretString>>,
}

impl ExecProvider {
    pub fn new(argv: Vec<String>, timeout: Duration) -> SecretsResult<Self> {
        if argv.is_empty() {
            return Err(SecretsError::Backend("empty lookup command".to_string()));
        }
        Ok(Self {
            argv,
            timeout,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn cached(&self, key: &str) -> Option<SecretString> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn store(&self, key: &str, value: SecretString) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
    }
}

#[async_trait]
impl SecretsProvider for ExecProvider {
    async fn get(&self, key: &str) -> SecretsResult<SecretString> {
        if let Some(hit) = self.cached(key) {
            return Ok(hit);
        }

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.argv[0])
                .args(&self.argv[1..])
                .arg(key)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .map_err(|_| SecretsError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(SecretsError::Unavailable(key.to_string()));
        }

        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if value.is_empty() {
            return Err(SecretsError::Unavailable(key.to_string()));
        }

        let secret = SecretString::from(value);
        // Only successful, non-empty lookups are cached.
        self.store(key, secret.clone());
        Ok(secret)
    }
}

//! Broker credential handling.
//!
//! The API key pair never lives in the YAML config. It is read either from a
//! key=value secrets file (path in `TRAILBOT_SECRETS_FILE`) or from the
//! `APCA_API_KEY_ID` / `APCA_API_SECRET_KEY` environment variables, and is
//! held in `Zeroizing` buffers so the material is wiped from memory on drop.
//! Credentials are never logged.

use std::collections::HashMap;
use std::env;
use std::path::Path;

use tracing::{info, warn};
use zeroize::Zeroizing;

pub const KEY_ID_VAR: &str = "APCA_API_KEY_ID";
pub const SECRET_KEY_VAR: &str = "APCA_API_SECRET_KEY";
pub const SECRETS_FILE_VAR: &str = "TRAILBOT_SECRETS_FILE";

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Secret not found: {0}")]
    NotFound(String),

    #[error("Failed to read secrets file: {0}")]
    FileUnreadable(String),

    #[error("Secret validation failed: {0}")]
    ValidationFailed(String),
}

/// Broker API key pair, zeroized on drop.
pub struct BrokerCredentials {
    key_id: Zeroizing<String>,
    secret_key: Zeroizing<String>,
}

impl BrokerCredentials {
    pub fn new(key_id: String, secret_key: String) -> Result<Self, SecretError> {
        validate_credential(KEY_ID_VAR, &key_id)?;
        validate_credential(SECRET_KEY_VAR, &secret_key)?;
        Ok(Self {
            key_id: Zeroizing::new(key_id),
            secret_key: Zeroizing::new(secret_key),
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }
}

impl std::fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose the material, even in debug output.
        f.debug_struct("BrokerCredentials")
            .field("key_id", &"***")
            .field("secret_key", &"***")
            .finish()
    }
}

/// Load broker credentials. A secrets file takes priority; environment
/// variables are the fallback.
pub fn load_broker_credentials() -> Result<BrokerCredentials, SecretError> {
    if let Ok(path) = env::var(SECRETS_FILE_VAR) {
        info!(path = %path, "loading broker credentials from secrets file");
        return load_from_file(Path::new(&path));
    }

    warn!(
        "loading broker credentials from environment variables; prefer a \
         secrets file via {}",
        SECRETS_FILE_VAR
    );
    let key_id = env::var(KEY_ID_VAR).map_err(|_| SecretError::NotFound(KEY_ID_VAR.into()))?;
    let secret_key =
        env::var(SECRET_KEY_VAR).map_err(|_| SecretError::NotFound(SECRET_KEY_VAR.into()))?;
    BrokerCredentials::new(key_id, secret_key)
}

/// Parse a `KEY=VALUE` secrets file. Blank lines and `#` comments are
/// skipped.
fn load_from_file(path: &Path) -> Result<BrokerCredentials, SecretError> {
    let raw = Zeroizing::new(
        std::fs::read_to_string(path)
            .map_err(|e| SecretError::FileUnreadable(format!("{}: {}", path.display(), e)))?,
    );

    let mut values: HashMap<&str, &str> = HashMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            values.insert(key.trim(), value.trim());
        }
    }

    let key_id = values
        .get(KEY_ID_VAR)
        .ok_or_else(|| SecretError::NotFound(KEY_ID_VAR.into()))?;
    let secret_key = values
        .get(SECRET_KEY_VAR)
        .ok_or_else(|| SecretError::NotFound(SECRET_KEY_VAR.into()))?;

    BrokerCredentials::new(key_id.to_string(), secret_key.to_string())
}

fn validate_credential(name: &str, value: &str) -> Result<(), SecretError> {
    if value.trim().is_empty() {
        return Err(SecretError::ValidationFailed(format!("{} is empty", name)));
    }
    if value.chars().any(|c| c.is_whitespace()) {
        return Err(SecretError::ValidationFailed(format!(
            "{} contains whitespace",
            name
        )));
    }
    Ok(())
}

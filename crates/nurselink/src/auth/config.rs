//! Authentication configuration.

use super::Role;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum accepted HS256 secret length outside dev mode.
const MIN_SECRET_LEN: usize = 32;

/// Authentication configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable development mode (`dev:<user_id>` tokens are accepted).
    pub dev_mode: bool,

    /// JWT secret for HS256. Supports `env:VAR_NAME`.
    /// REQUIRED when dev_mode is false.
    pub jwt_secret: Option<String>,

    /// Lifetime of tokens minted by `nurselink token`, in seconds.
    pub token_ttl_secs: i64,

    /// Development users (only used in dev mode).
    pub dev_users: Vec<DevUser>,

    /// Allowed CORS origins. If empty, CORS is disabled.
    pub allowed_origins: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            dev_mode: false,
            // No default JWT secret - must be explicitly configured
            jwt_secret: None,
            token_ttl_secs: 3600 * 24,
            dev_users: Vec::new(),
            allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

impl AuthConfig {
    /// Resolve the JWT secret, expanding `env:VAR_NAME` syntax.
    pub fn resolve_jwt_secret(&self) -> Result<Option<String>, ConfigValidationError> {
        match &self.jwt_secret {
            None => Ok(None),
            Some(value) => {
                if let Some(var_name) = value.strip_prefix("env:") {
                    match std::env::var(var_name) {
                        Ok(secret) if !secret.is_empty() => Ok(Some(secret)),
                        Ok(_) => Err(ConfigValidationError::EnvVarEmpty(var_name.to_string())),
                        Err(_) => Err(ConfigValidationError::EnvVarNotFound(var_name.to_string())),
                    }
                } else {
                    Ok(Some(value.clone()))
                }
            }
        }
    }

    /// Validate the configuration for the current mode.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.dev_mode {
            return Ok(());
        }

        let secret = self
            .resolve_jwt_secret()?
            .ok_or(ConfigValidationError::MissingJwtSecret)?;

        if secret == "change-me" {
            return Err(ConfigValidationError::InsecureJwtSecret);
        }
        if secret.len() < MIN_SECRET_LEN {
            return Err(ConfigValidationError::JwtSecretTooShort);
        }

        Ok(())
    }

    /// Find a dev user by id.
    pub fn dev_user(&self, id: &str) -> Option<&DevUser> {
        self.dev_users.iter().find(|u| u.id == id)
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigValidationError {
    #[error(
        "JWT secret is required when dev_mode is false. Set NURSELINK__AUTH__JWT_SECRET or auth.jwt_secret in config."
    )]
    MissingJwtSecret,

    #[error("JWT secret cannot be the placeholder value outside dev mode.")]
    InsecureJwtSecret,

    #[error("JWT secret must be at least 32 characters long.")]
    JwtSecretTooShort,

    #[error("Environment variable '{0}' not found (referenced via env:{0} in config).")]
    EnvVarNotFound(String),

    #[error("Environment variable '{0}' is empty (referenced via env:{0} in config).")]
    EnvVarEmpty(String),
}

/// Development user configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevUser {
    /// User ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Role.
    pub role: Role,
}

//! Server settings: a TOML file layered with `NURSELINK__*` environment
//! variables.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use nurselink::auth::AuthConfig;
use nurselink::chat::ChatConfig;

pub const APP_NAME: &str = "nurselink";
pub const ENV_PREFIX: &str = "NURSELINK";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub storage: StorageSettings,
    pub auth: AuthConfig,
    pub chat: ChatConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Level used when neither `RUST_LOG` nor `-v`/`-q` say otherwise.
    pub level: String,
    /// Also append plain-text logs to this file.
    pub file: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory holding `chat.db`. Defaults to the platform data dir.
    pub data_dir: Option<String>,
}

impl Settings {
    /// Read `path` (if it exists) and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings: Settings = Config::builder()
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .with_context(|| format!("reading settings from {}", path.display()))?
            .try_deserialize()
            .context("parsing settings")?;

        if let Some(file) = settings.logging.file.take() {
            settings.logging.file = Some(expand(&file)?.display().to_string());
        }
        Ok(settings)
    }

    /// Where the message database lives.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match self.storage.data_dir {
            Some(ref dir) => expand(dir),
            None => dirs::data_dir()
                .map(|dir| dir.join(APP_NAME))
                .ok_or_else(|| anyhow!("unable to determine data directory")),
        }
    }

    /// Write the default settings to `path`, creating parent directories.
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let body = toml::to_string_pretty(&Settings::default())
            .context("serializing default settings")?;
        let header = format!(
            "# {APP_NAME} settings\n# Override any key with {ENV_PREFIX}__SECTION__KEY\n\n"
        );
        fs::write(path, header + &body).with_context(|| format!("writing {}", path.display()))
    }
}

/// `--config` wins; a directory means `<dir>/config.toml`.
pub fn settings_path(explicit: Option<&Path>) -> Result<PathBuf> {
    let path = match explicit {
        Some(path) => expand(&path.to_string_lossy())?,
        None => dirs::config_dir()
            .map(|dir| dir.join(APP_NAME))
            .ok_or_else(|| anyhow!("unable to determine config directory"))?,
    };
    if explicit.is_none() || path.is_dir() {
        Ok(path.join("config.toml"))
    } else {
        Ok(path)
    }
}

fn expand(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).with_context(|| format!("expanding {text}"))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

use crate::keymgr::KmgrSettings;
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const CONFIG_ENV: &str = "CLUSTERKEY_CONFIG";
const APP_DIR: &str = "clusterkey";
const CONFIG_FILE_NAME: &str = "config.toml";
const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug)]
pub enum ConfigError {
    ConfigDirUnavailable,
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
    UnsupportedSchemaVersion(u32),
    MissingPassphraseCommand,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ConfigDirUnavailable => {
                write!(f, "unable to determine configuration directory")
            }
            ConfigError::Io(err) => write!(f, "filesystem error: {err}"),
            ConfigError::Parse(err) => write!(f, "failed to parse config: {err}"),
            ConfigError::Serialize(err) => write!(f, "failed to serialize config: {err}"),
            ConfigError::UnsupportedSchemaVersion(version) => {
                write!(f, "config schema version '{version}' is not supported")
            }
            ConfigError::MissingPassphraseCommand => {
                write!(f, "cluster_passphrase_command is not configured")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(err) => Some(err),
            ConfigError::Parse(err) => Some(err),
            ConfigError::Serialize(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

/// On-disk configuration, read once at process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    schema_version: Option<u32>,

    #[serde(default)]
    pub key_management_enabled: bool,

    #[serde(default)]
    pub cluster_passphrase_command: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            schema_version: Some(CURRENT_SCHEMA_VERSION),
            key_management_enabled: false,
            cluster_passphrase_command: None,
        }
    }
}

impl Settings {
    fn schema_version(&self) -> u32 {
        self.schema_version.unwrap_or(0)
    }

    fn ensure_current_version(&mut self) {
        self.schema_version = Some(CURRENT_SCHEMA_VERSION);
    }

    /// Resolve into key-manager settings; requires a command template when
    /// the feature is enabled.
    pub fn to_kmgr_settings(&self) -> Result<KmgrSettings, ConfigError> {
        let command = match &self.cluster_passphrase_command {
            Some(command) => command.clone(),
            None if self.key_management_enabled => {
                return Err(ConfigError::MissingPassphraseCommand);
            }
            None => String::new(),
        };
        Ok(KmgrSettings {
            enabled: self.key_management_enabled,
            passphrase_command: command,
        })
    }
}

pub fn config_path(override_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = override_path {
        return Ok(path.to_path_buf());
    }

    if let Ok(path) = env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }

    let mut dir = config_dir().ok_or(ConfigError::ConfigDirUnavailable)?;
    dir.push(APP_DIR);
    dir.push(CONFIG_FILE_NAME);
    Ok(dir)
}

/// Load settings; a missing file yields the defaults.
pub fn load(override_path: Option<&Path>) -> Result<Settings, ConfigError> {
    let path = config_path(override_path)?;
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Settings::default());
        }
        Err(err) => return Err(ConfigError::Io(err)),
    };

    let settings: Settings = toml::from_str(&contents).map_err(ConfigError::Parse)?;
    if settings.schema_version() > CURRENT_SCHEMA_VERSION {
        return Err(ConfigError::UnsupportedSchemaVersion(
            settings.schema_version(),
        ));
    }
    Ok(settings)
}

/// Persist settings with the write-temp, atomic-rename pattern.
pub fn save(override_path: Option<&Path>, settings: &Settings) -> Result<(), ConfigError> {
    let path = config_path(override_path)?;
    let parent = path.parent().ok_or(ConfigError::ConfigDirUnavailable)?;
    fs::create_dir_all(parent)?;

    let mut to_write = settings.clone();
    to_write.ensure_current_version();
    let contents = toml::to_string_pretty(&to_write).map_err(ConfigError::Serialize)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(&path).map_err(std::io::Error::from)?;
    Ok(())
}

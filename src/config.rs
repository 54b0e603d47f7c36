use std::{
    env, fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{NestError, Result};

pub const DEFAULT_PORT: u16 = 3318;
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    /// JSON Schema applied to every document body. `None` accepts all bodies.
    pub schema_file: Option<PathBuf>,
    /// JSON map of usernames to bootstrap bearer tokens, loaded at startup.
    pub token_file: Option<PathBuf>,
    pub token_ttl_secs: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Config {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            port: DEFAULT_PORT,
            schema_file: None,
            token_file: None,
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub port: Option<u16>,
    pub schema_file: Option<PathBuf>,
    pub token_file: Option<PathBuf>,
    pub token_ttl_secs: Option<u64>,
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut path = env::current_dir().map_err(|err| NestError::Config(err.to_string()))?;
    path.push(".nestdbx");
    path.push("config.toml");
    Ok(path)
}

pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let config_path = if let Some(path) = path {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        path
    } else {
        default_config_path()?
    };

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let cfg: Config = toml::from_str(&contents)?;
        Ok((cfg, config_path))
    } else {
        let cfg = Config::default();
        cfg.save(&config_path)?;
        Ok((cfg, config_path))
    }
}

impl Config {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn apply_update(&mut self, update: ConfigUpdate) {
        if let Some(port) = update.port {
            self.port = port;
        }
        if let Some(schema) = update.schema_file {
            self.schema_file = Some(schema);
        }
        if let Some(tokens) = update.token_file {
            self.token_file = Some(tokens);
        }
        if let Some(ttl) = update.token_ttl_secs {
            self.token_ttl_secs = ttl;
        }
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_through_disk() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.toml");

        let (mut cfg, loaded_path) = load_or_default(Some(path.clone())).unwrap();
        assert_eq!(loaded_path, path);
        assert_eq!(cfg.port, DEFAULT_PORT);

        cfg.apply_update(ConfigUpdate {
            port: Some(4000),
            token_ttl_secs: Some(60),
            ..ConfigUpdate::default()
        });
        cfg.save(&path).unwrap();

        let (reloaded, _) = load_or_default(Some(path)).unwrap();
        assert_eq!(reloaded.port, 4000);
        assert_eq!(reloaded.token_ttl_secs, 60);
    }
}

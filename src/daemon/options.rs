//! Daemon option block.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_SHM_DIR, PBDLEN_MAX, WORKER_MAX};

/// Options for one daemon instance. Loadable from a partial TOML file;
/// unspecified fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonOptions {
    /// Channel pollers
    #[serde(default = "default_pollers")]
    pub pollers: i32,

    /// Worker threads serving client slots
    #[serde(default = "default_workers")]
    pub workers: i32,

    /// Worker idle sleep interval in microseconds
    #[serde(default = "default_usleep")]
    pub usleep: i32,

    /// PBD name, like `1-1`
    #[serde(default)]
    pub pbdname: String,

    /// Directory for the shared-memory region and pid file
    #[serde(default = "default_shm_dir")]
    pub shm_dir: PathBuf,

    /// Detach into the background on start
    #[serde(default)]
    pub daemon: bool,

    /// Bump the write epoch when a writer mounts
    #[serde(default)]
    pub auto_increase_epoch: bool,

    /// Server instance id
    #[serde(default)]
    pub server_id: i32,
}

fn default_pollers() -> i32 {
    2
}

fn default_workers() -> i32 {
    20
}

fn default_usleep() -> i32 {
    1
}

fn default_shm_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SHM_DIR)
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            pollers: default_pollers(),
            workers: default_workers(),
            usleep: default_usleep(),
            pbdname: String::new(),
            shm_dir: default_shm_dir(),
            daemon: false,
            auto_increase_epoch: false,
            server_id: 0,
        }
    }
}

/// Option load/validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read options: {0}")]
    ReadError(String),
    #[error("failed to parse options: {0}")]
    ParseError(String),
    #[error("option validation error: {0}")]
    ValidationError(String),
}

impl DaemonOptions {
    /// Load options from a TOML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path, e)))?;
        let options: DaemonOptions =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Enforce the option ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers < 1 || self.workers > WORKER_MAX {
            return Err(ConfigError::ValidationError(format!(
                "workers must be between 1 and {}",
                WORKER_MAX
            )));
        }
        if self.usleep < 0 || self.usleep > 1000 {
            return Err(ConfigError::ValidationError(
                "usleep must be between 0 and 1000".to_string(),
            ));
        }
        if self.pbdname.is_empty() {
            return Err(ConfigError::ValidationError("pbdname is empty".to_string()));
        }
        if self.pbdname.len() >= PBDLEN_MAX {
            return Err(ConfigError::ValidationError("pbdname too long".to_string()));
        }
        if self.pollers < 1 {
            return Err(ConfigError::ValidationError(
                "pollers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> DaemonOptions {
        DaemonOptions {
            pbdname: "1-1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let opt = DaemonOptions::default();
        assert_eq!(opt.pollers, 2);
        assert_eq!(opt.workers, 20);
        assert_eq!(opt.usleep, 1);
        assert!(!opt.daemon);
    }

    #[test]
    fn test_validation_ranges() {
        let mut opt = valid();
        assert!(opt.validate().is_ok());

        opt.workers = 0;
        assert!(opt.validate().is_err());
        opt.workers = WORKER_MAX + 1;
        assert!(opt.validate().is_err());
        opt = valid();

        opt.usleep = 1001;
        assert!(opt.validate().is_err());
        opt = valid();

        opt.pbdname.clear();
        assert!(opt.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let opt: DaemonOptions = toml::from_str("pbdname = \"2-2\"\nworkers = 4\n").unwrap();
        assert_eq!(opt.pbdname, "2-2");
        assert_eq!(opt.workers, 4);
        assert_eq!(opt.pollers, 2);
        assert!(opt.validate().is_ok());
    }
}

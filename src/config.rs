use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::fast_cgi::transport::FcgiListener;
use crate::service::{RouteConfig, ServiceSettings};
use crate::transport::ListenAddress;
use crate::worker_pool::WorkerPoolConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceSection {
    pub name: String,
    pub listen: ListenAddress,
    pub backlog: u32,
    pub workers: usize,
    pub queue_bound: usize,
    pub max_connections: usize,
    pub request_timeout_ms: Option<u64>,
}

impl Default for ServiceSection {
    fn default() -> Self {
        let pool = WorkerPoolConfig::default();
        ServiceSection {
            name: env!("CARGO_PKG_NAME").to_string(),
            listen: ListenAddress::Tcp("127.0.0.1:9000".to_string()),
            backlog: 128,
            workers: pool.num_workers,
            queue_bound: pool.queue_bound,
            max_connections: 256,
            request_timeout_ms: None,
        }
    }
}

/// Contents of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub service: ServiceSection,
    #[serde(rename = "route")]
    pub routes: Vec<RouteConfig>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Config::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Config, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn settings(&self) -> ServiceSettings {
        ServiceSettings {
            name: self.service.name.clone(),
            pool: WorkerPoolConfig {
                num_workers: self.service.workers,
                queue_bound: self.service.queue_bound,
            },
            request_timeout: self.service.request_timeout_ms.map(Duration::from_millis),
            ..ServiceSettings::default()
        }
    }

    pub fn listener(&self) -> FcgiListener {
        FcgiListener {
            address: self.service.listen.clone(),
            backlog: self.service.backlog,
            max_connections: self.service.max_connections,
        }
    }
}

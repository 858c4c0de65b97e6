//! Server configuration loading.
//!
//! Settings come from an optional TOML file (`--config` or the user config
//! dir) with `EPHEMERA_*` environment overrides layered on top.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

const APP_NAME: &str = "ephemera";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the listener on.
    pub host: String,
    pub port: u16,
    /// Origins allowed to open relay connections, matched exactly. An
    /// empty list rejects every browser origin.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            allowed_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Default config file location (`<config dir>/ephemera/config.toml`).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_NAME).join("config.toml"))
}

/// Load configuration. An explicitly passed file must exist; the default
/// location is optional.
pub fn load(path: Option<&Path>) -> Result<ServerConfig> {
    let mut builder = Config::builder();

    match path {
        Some(path) => {
            builder = builder.add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }
        None => {
            if let Some(default) = default_config_path() {
                builder = builder.add_source(
                    File::from(default).format(FileFormat::Toml).required(false),
                );
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("EPHEMERA")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("allowed_origins"),
    );

    builder
        .build()
        .context("assembling configuration")?
        .try_deserialize()
        .context("parsing configuration")
}

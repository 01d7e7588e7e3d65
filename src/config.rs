// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The global configuration store. Workflows read operating defaults from
//! here; everything has a sensible built-in value so a store constructed
//! with `Config::default()` behaves like a fresh installation.

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Operating system installed when a deployment does not name one.
    pub default_osystem: String,
    pub default_distro_series: String,

    /// When set, releasing a node routes through disk erasing first.
    pub enable_disk_erasing_on_release: bool,
    pub disk_erase_with_secure_erase: bool,
    pub disk_erase_with_quick_erase: bool,

    /// Passive network observation policy pushed down to controllers.
    pub network_discovery: String,

    /// Deadlines, in seconds, installed when a node enters a monitored
    /// status. A separate sweeper fails nodes whose deadline expires.
    pub commissioning_timeout: u64,
    pub deploying_timeout: u64,
    pub releasing_timeout: u64,
    pub entering_rescue_mode_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_osystem: "ubuntu".to_string(),
            default_distro_series: "xenial".to_string(),
            enable_disk_erasing_on_release: false,
            disk_erase_with_secure_erase: true,
            disk_erase_with_quick_erase: false,
            network_discovery: "enabled".to_string(),
            commissioning_timeout: 20 * 60,
            deploying_timeout: 40 * 60,
            releasing_timeout: 5 * 60,
            entering_rescue_mode_timeout: 10 * 60,
        }
    }
}

impl Config {
    /// Load the config from a TOML file, or from the default path when
    /// `path` is `None`. Missing keys fall back to their defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_string(),
            None => crate::default_config_path(),
        };
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            Error::NotFound {
                entity: "config file",
                value: format!("{path}: {e}"),
            }
        })?;
        toml::from_str(&raw).map_err(|e| Error::BadReport(format!("bad config {path}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = Config::default();
        assert_eq!(config.commissioning_timeout, 1200);
        assert!(!config.enable_disk_erasing_on_release);
    }

    #[test]
    fn partial_toml_overlays_defaults() {
        let config: Config =
            toml::from_str("enable_disk_erasing_on_release = true\n").unwrap();
        assert!(config.enable_disk_erasing_on_release);
        assert_eq!(config.default_osystem, "ubuntu");
    }
}

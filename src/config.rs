// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Loads application settings, writing the defaults on first run.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::bluetooth::SPP_UUID;

const APP_DIR: &str = "logtooth";

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for the stored device list.
    #[serde(skip)]
    pub data_dir: PathBuf,

    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,

    /// Console settings.
    pub console: ConsoleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Adapter to use, e.g. "hci0". The default adapter when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,

    /// Service every sensor connection targets.
    pub service_uuid: Uuid,

    /// Ask a device for its services when it is added.
    pub resolve_services: bool,

    /// Add bonded devices on start-up.
    pub list_paired_on_start: bool,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            service_uuid: SPP_UUID,
            resolve_services: true,
            list_paired_on_start: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Print received bytes as hex instead of text.
    pub hex: bool,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bluetooth: BluetoothConfig::default(),
            console: ConsoleConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        let config_dir = config_dir();
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml_str(&content)?
        } else {
            let config = Self::default();
            let content = toml::to_string_pretty(&config)?;
            std::fs::write(&config_path, content)?;
            config
        };

        // Set data directory
        config.data_dir = default_data_dir();
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(config)
    }

    /// Parse configuration text; missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

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

//! Stored list of device addresses.

use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::info;

/// Device addresses kept across restarts, as a JSON array.
pub struct KnownDeviceStore {
    path: PathBuf,
}

impl KnownDeviceStore {
    /// Open the store in `data_dir`.
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        Ok(Self {
            path: data_dir.join("known_devices.json"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load stored addresses. A missing file is an empty set.
    pub fn load(&self) -> Result<HashSet<String>> {
        if !self.path.exists() {
            return Ok(HashSet::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let addresses: HashSet<String> = serde_json::from_str(&content)
            .with_context(|| format!("Malformed device list {:?}", self.path))?;
        Ok(addresses)
    }

    /// Replace the stored addresses.
    pub fn save(&self, addresses: &HashSet<String>) -> Result<()> {
        // Sorted so the file is stable between saves.
        let sorted: BTreeSet<&String> = addresses.iter().collect();
        let content = serde_json::to_string_pretty(&sorted)?;
        std::fs::write(&self.path, content)?;
        info!("Saved {} device addresses to {:?}", addresses.len(), self.path);
        Ok(())
    }
}

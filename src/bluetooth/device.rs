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

//! Remote device identity.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use uuid::Uuid;

/// Immutable identity of a remote device.
///
/// Equality and hashing ignore ASCII case in the address, so
/// `00:11:22:AA:BB:CC` and `00:11:22:aa:bb:cc` name the same device.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    address: Arc<str>,
    services: Option<Arc<[Uuid]>>,
}

impl DeviceHandle {
    /// Create a handle for the given address.
    pub fn new(address: impl Into<String>) -> Self {
        let address: String = address.into();
        Self {
            address: Arc::from(address.trim()),
            services: None,
        }
    }

    /// Return a new handle for the same device carrying a service list.
    pub fn with_services(&self, services: impl Into<Vec<Uuid>>) -> Self {
        Self {
            address: self.address.clone(),
            services: Some(Arc::from(services.into())),
        }
    }

    /// Device address as reported by the radio stack.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Cached service identifiers, if any were resolved.
    pub fn services(&self) -> Option<&[Uuid]> {
        self.services.as_deref()
    }

    /// Case-insensitive address comparison.
    pub fn has_address(&self, address: &str) -> bool {
        self.address.eq_ignore_ascii_case(address.trim())
    }

    /// Canonical (lowercase) form of the address, used as a persistence key.
    pub fn key(&self) -> String {
        self.address.to_ascii_lowercase()
    }
}

impl PartialEq for DeviceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.has_address(&other.address)
    }
}

impl Eq for DeviceHandle {}

impl Hash for DeviceHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.address.bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

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

//! Radio notifications and their delivery to the registry.

use tokio::sync::mpsc;
use uuid::Uuid;

use super::device::DeviceHandle;
use crate::registry::DeviceRegistry;

/// Asynchronous notifications from the radio stack.
///
/// No ordering is guaranteed across devices.
#[derive(Debug, Clone)]
pub enum RadioEvent {
    /// Discovery found a device.
    DeviceFound(DeviceHandle),
    /// Service identifiers were resolved for a device.
    ServicesResolved { address: String, services: Vec<Uuid> },
}

/// Receiving end of the radio event channel.
pub struct DiscoveryAgent {
    events: mpsc::Receiver<RadioEvent>,
}

impl DiscoveryAgent {
    /// Create the channel. The sender goes to the radio backend.
    pub fn channel(capacity: usize) -> (mpsc::Sender<RadioEvent>, Self) {
        let (tx, events) = mpsc::channel(capacity);
        (tx, Self { events })
    }

    /// Wait for the next event. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<RadioEvent> {
        self.events.recv().await
    }

    /// Forward every event already queued into `registry`.
    pub fn drain_into(&mut self, registry: &mut DeviceRegistry) -> usize {
        let mut forwarded = 0;
        while let Ok(event) = self.events.try_recv() {
            registry.handle_radio_event(event);
            forwarded += 1;
        }
        forwarded
    }
}

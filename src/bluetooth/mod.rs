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

//! Bluetooth communication module.
//!
//! RFCOMM client side: device identities, single-device connections, the
//! sensor session protocol, and the BlueZ backend.

mod bluez;
mod connection;
mod device;
mod discovery;
mod error;
mod session;
pub mod transport;

pub use bluez::{BluezBackend, BluezRadio, BluezSockets};
pub use connection::{Connection, ConnectionState, StreamReader, StreamWriter};
pub use device::DeviceHandle;
pub use discovery::{DiscoveryAgent, RadioEvent};
pub use error::ConnectionError;
pub use session::{DataSink, SensorSession};
pub use transport::{BoxedStream, Radio, RfcommSocket, RfcommStream, SocketFactory, SPP_UUID};

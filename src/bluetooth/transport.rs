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

//! Platform seams: stream sockets and the host radio.

use futures::future::BoxFuture;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use super::device::DeviceHandle;
use super::error::ConnectionError;

/// Standard Serial Port Profile service UUID.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// An ordered, reliable byte stream to a remote device.
pub trait RfcommStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RfcommStream for T {}

/// Type-erased connected stream.
pub type BoxedStream = Box<dyn RfcommStream>;

/// A socket bound to one device and service, not yet connected.
pub trait RfcommSocket: Send {
    /// Connect to the remote service. Resolves only when the platform stack
    /// succeeds or gives up.
    fn connect(self: Box<Self>) -> BoxFuture<'static, io::Result<BoxedStream>>;
}

/// Allocates platform sockets.
pub trait SocketFactory: Send + Sync {
    fn create_socket(
        &self,
        device: &DeviceHandle,
        service: Uuid,
    ) -> Result<Box<dyn RfcommSocket>, ConnectionError>;
}

/// The host radio, as seen by the registry.
///
/// Discovery and service resolution are fire-and-forget; their results
/// come back as [`RadioEvent`](super::RadioEvent)s.
pub trait Radio: Send + Sync {
    /// Begin scanning for nearby devices.
    fn start_discovery(&self);

    /// Stop any scan in progress. No-op when idle.
    fn cancel_discovery(&self);

    /// Ask the remote device for its service identifiers.
    fn request_services(&self, device: &DeviceHandle);

    /// Devices already bonded with this host.
    fn bonded_devices(&self) -> BoxFuture<'_, anyhow::Result<Vec<DeviceHandle>>>;
}

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

//! BlueZ backend for sockets and the host radio.

use anyhow::Result;
use bluer::rfcomm::{Profile, ProfileHandle, Role, Stream};
use bluer::{Adapter, AdapterEvent, Address, Device, Session};
use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::device::DeviceHandle;
use super::discovery::RadioEvent;
use super::error::ConnectionError;
use super::transport::{BoxedStream, Radio, RfcommSocket, SocketFactory};

/// Connection to the local BlueZ daemon and one adapter.
pub struct BluezBackend {
    session: Session,
    adapter: Adapter,
}

impl BluezBackend {
    /// Open a BlueZ session on the named adapter, or the default one.
    pub async fn new(adapter_name: Option<&str>) -> Result<Self> {
        info!("Initializing Bluetooth...");

        let session = bluer::Session::new().await?;
        info!("BlueZ session created");

        let adapter = match adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        let address = adapter.address().await?;
        info!("This device: {} @{}", adapter.name(), address);

        Ok(Self { session, adapter })
    }

    /// Socket factory bound to this adapter.
    pub fn sockets(&self) -> Arc<BluezSockets> {
        Arc::new(BluezSockets {
            session: self.session.clone(),
            adapter: self.adapter.clone(),
        })
    }

    /// Radio that reports into `events`.
    pub fn radio(&self, events: mpsc::Sender<RadioEvent>) -> Arc<BluezRadio> {
        Arc::new(BluezRadio {
            adapter: self.adapter.clone(),
            events,
            discovery: Mutex::new(None),
        })
    }
}

fn parse_address(device: &DeviceHandle) -> Result<Address, ConnectionError> {
    device.address().parse().map_err(|e| {
        ConnectionError::SocketUnavailable(format!("invalid address {}: {}", device, e))
    })
}

fn to_io(err: bluer::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

/// Allocates RFCOMM client sockets through BlueZ profiles.
pub struct BluezSockets {
    session: Session,
    adapter: Adapter,
}

impl SocketFactory for BluezSockets {
    fn create_socket(
        &self,
        device: &DeviceHandle,
        service: Uuid,
    ) -> Result<Box<dyn RfcommSocket>, ConnectionError> {
        let address = parse_address(device)?;
        let device = self
            .adapter
            .device(address)
            .map_err(|e| ConnectionError::SocketUnavailable(e.to_string()))?;

        Ok(Box::new(BluezSocket {
            session: self.session.clone(),
            device,
            service,
        }))
    }
}

struct BluezSocket {
    session: Session,
    device: Device,
    service: Uuid,
}

impl RfcommSocket for BluezSocket {
    fn connect(self: Box<Self>) -> BoxFuture<'static, io::Result<BoxedStream>> {
        let BluezSocket {
            session,
            device,
            service,
        } = *self;

        Box::pin(async move {
            let profile = Profile {
                uuid: service,
                role: Some(Role::Client),
                require_authentication: Some(false),
                require_authorization: Some(false),
                auto_connect: Some(false),
                ..Default::default()
            };
            let mut profile_handle = session.register_profile(profile).await.map_err(to_io)?;
            debug!("Registered client profile {}", service);

            // BlueZ answers a profile connect with a connection request on the handle.
            let connect = device.connect_profile(&service);
            tokio::pin!(connect);
            let mut requested = false;

            let request = loop {
                tokio::select! {
                    result = &mut connect, if !requested => {
                        result.map_err(to_io)?;
                        requested = true;
                    }
                    request = profile_handle.next() => {
                        break request.ok_or_else(|| {
                            io::Error::new(io::ErrorKind::ConnectionAborted, "profile unregistered")
                        })?;
                    }
                }
            };

            let stream = request.accept()?;
            Ok(Box::new(ProfileStream {
                stream,
                _profile: profile_handle,
            }) as BoxedStream)
        })
    }
}

pin_project! {
    /// RFCOMM stream that keeps its client profile registered while alive.
    struct ProfileStream {
        #[pin]
        stream: Stream,
        _profile: ProfileHandle,
    }
}

impl AsyncRead for ProfileStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().stream.poll_read(cx, buf)
    }
}

impl AsyncWrite for ProfileStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().stream.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_shutdown(cx)
    }
}

/// Host radio backed by a BlueZ adapter.
pub struct BluezRadio {
    adapter: Adapter,
    events: mpsc::Sender<RadioEvent>,
    discovery: Mutex<Option<JoinHandle<()>>>,
}

impl Radio for BluezRadio {
    fn start_discovery(&self) {
        let mut discovery = self.discovery.lock();
        if discovery.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("Discovery already running");
            return;
        }

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        *discovery = Some(tokio::spawn(async move {
            if let Err(e) = discover(adapter, events).await {
                error!("Discovery failed: {}", e);
            }
        }));
        info!("Discovery started");
    }

    fn cancel_discovery(&self) {
        // Dropping the discovery stream stops the scan.
        if let Some(task) = self.discovery.lock().take() {
            task.abort();
            info!("Discovery cancelled");
        }
    }

    fn request_services(&self, device: &DeviceHandle) {
        let address = match parse_address(device) {
            Ok(address) => address,
            Err(e) => {
                warn!("Cannot resolve services: {}", e);
                return;
            }
        };

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let reported = device.address().to_string();
        tokio::spawn(async move {
            match resolve_services(&adapter, address).await {
                Ok(services) => {
                    let _ = events
                        .send(RadioEvent::ServicesResolved {
                            address: reported,
                            services,
                        })
                        .await;
                }
                Err(e) => warn!("Service lookup for {} failed: {}", reported, e),
            }
        });
    }

    fn bonded_devices(&self) -> BoxFuture<'_, Result<Vec<DeviceHandle>>> {
        Box::pin(async move {
            let mut devices = Vec::new();

            for addr in self.adapter.device_addresses().await? {
                let device = self.adapter.device(addr)?;
                if device.is_paired().await? {
                    devices.push(DeviceHandle::new(addr.to_string()));
                }
            }

            Ok(devices)
        })
    }
}

async fn discover(adapter: Adapter, events: mpsc::Sender<RadioEvent>) -> bluer::Result<()> {
    let discovered = adapter.discover_devices().await?;
    tokio::pin!(discovered);

    while let Some(event) = discovered.next().await {
        if let AdapterEvent::DeviceAdded(address) = event {
            debug!("Device found: {}", address);
            let found = RadioEvent::DeviceFound(DeviceHandle::new(address.to_string()));
            if events.send(found).await.is_err() {
                break;
            }
        }
    }

    Ok(())
}

async fn resolve_services(adapter: &Adapter, address: Address) -> bluer::Result<Vec<Uuid>> {
    let device = adapter.device(address)?;
    let mut services: Vec<Uuid> = device.uuids().await?.unwrap_or_default().into_iter().collect();
    services.sort();
    Ok(services)
}

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

//! Device registry: known devices, their sessions, and the single active
//! connection.
//!
//! The registry is owned by one control-path task. Connection workers never
//! touch it; they report through [`RegistryEvent`]s, and the control path
//! calls [`DeviceRegistry::reap_closed`] to fold finished sessions back in.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Span};
use uuid::Uuid;

use crate::bluetooth::{
    Connection, ConnectionState, DataSink, DeviceHandle, Radio, RadioEvent, SensorSession,
    SocketFactory,
};

/// Output of the registry, for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// Human-readable status line.
    Status(String),
    /// Bytes read from the active device.
    Received { address: String, data: Vec<u8> },
    /// A session's pump has finished; call `reap_closed`.
    SessionEnded { address: String },
}

/// One row of the device listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownDevice {
    pub address: String,
    pub active: bool,
}

/// Manager for known devices and the active session.
pub struct DeviceRegistry {
    known: Vec<DeviceHandle>,
    sessions: Vec<SensorSession>,
    /// Index into `sessions`.
    active: Option<usize>,
    radio: Arc<dyn Radio>,
    sockets: Arc<dyn SocketFactory>,
    service: Uuid,
    events: mpsc::UnboundedSender<RegistryEvent>,
    span: Span,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new(
        radio: Arc<dyn Radio>,
        sockets: Arc<dyn SocketFactory>,
        service: Uuid,
        events: mpsc::UnboundedSender<RegistryEvent>,
    ) -> Self {
        Self::with_span(radio, sockets, service, events, info_span!("registry"))
    }

    /// Create an empty registry logging under `span`.
    pub fn with_span(
        radio: Arc<dyn Radio>,
        sockets: Arc<dyn SocketFactory>,
        service: Uuid,
        events: mpsc::UnboundedSender<RegistryEvent>,
        span: Span,
    ) -> Self {
        Self {
            known: Vec::new(),
            sessions: Vec::new(),
            active: None,
            radio,
            sockets,
            service,
            events,
            span,
        }
    }

    /// Add a device unless one with the same address is already known.
    pub fn add_device(&mut self, device: DeviceHandle) -> bool {
        if self.known.contains(&device) {
            return false;
        }
        self.span.in_scope(|| info!("Added device {}", device));
        self.known.push(device);
        true
    }

    /// Get or create the session for `device`, optionally asking the radio
    /// for its services.
    pub fn add_sensor_for(&mut self, device: DeviceHandle, resolve_services: bool) -> &SensorSession {
        let index = self.ensure_session(&device);
        if resolve_services {
            self.list_services(&device);
            self.radio.request_services(&device);
        }
        &self.sessions[index]
    }

    /// Make `device` the one active connection.
    ///
    /// Returns whether the connect worker was launched; the outcome of the
    /// connect itself arrives later.
    pub fn connect_one(&mut self, device: &DeviceHandle) -> bool {
        self.reap_closed();

        // Discovery starves the connect of radio time.
        self.radio.cancel_discovery();
        self.disconnect();

        let index = match self.session_index(device) {
            Some(index) => index,
            None if self.known.contains(device) => self.ensure_session(device),
            None => {
                self.report(format!("could not find device {} to connect", device));
                return false;
            }
        };

        let sink = self.forwarding_sink(device);
        if self.sessions[index].connect_and_pump(sink) {
            self.active = Some(index);
            self.report(format!("connecting {}", device));
            true
        } else {
            self.report(format!("could not connect to {}", device));
            false
        }
    }

    /// Close the active session, if any.
    pub fn disconnect(&mut self) {
        if let Some(index) = self.active.take() {
            let session = &self.sessions[index];
            session.disconnect();
            let line = format!("disconnected {}", session.address());
            self.report(line);
        }
    }

    /// Disconnect and drop every device and session.
    pub fn forget_all(&mut self) {
        self.disconnect();
        self.sessions.clear();
        self.known.clear();
        self.report("forgot all devices".to_string());
    }

    /// Send a command byte to the active device.
    pub fn send_command(&mut self, byte: u8) {
        self.reap_closed();
        match self.active {
            Some(index) => self.sessions[index].send_command(byte),
            None => self.span.in_scope(|| debug!("No active device for command {:#04x}", byte)),
        }
    }

    /// Start scanning for devices.
    pub fn start_discovery(&mut self) {
        self.radio.start_discovery();
        self.report("discovering...".to_string());
    }

    /// Stop scanning.
    pub fn cancel_discovery(&mut self) {
        self.radio.cancel_discovery();
    }

    /// Add every device bonded with this host. Returns how many were new.
    pub async fn add_bonded(&mut self) -> usize {
        let radio = self.radio.clone();
        match radio.bonded_devices().await {
            Ok(devices) => devices
                .into_iter()
                .filter(|device| self.add_device(device.clone()))
                .count(),
            Err(e) => {
                self.report(format!("could not list paired devices: {}", e));
                0
            }
        }
    }

    /// Fold a radio notification into the registry.
    pub fn handle_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::DeviceFound(device) => {
                let line = format!("found {}", device);
                if self.add_device(device) {
                    self.report(line);
                }
            }
            RadioEvent::ServicesResolved { address, services } => {
                if services.is_empty() {
                    self.report(format!("sdp uuid {}: none", address));
                }
                for uuid in &services {
                    self.report(format!("sdp uuid {} {}", address, uuid));
                }
                if let Some(entry) = self.known.iter_mut().find(|d| d.has_address(&address)) {
                    *entry = entry.with_services(services);
                }
            }
        }
    }

    /// Clear `active` if its connection has finished.
    ///
    /// Returns whether anything changed.
    pub fn reap_closed(&mut self) -> bool {
        let Some(index) = self.active else {
            return false;
        };
        let session = &self.sessions[index];
        if !session.state().is_finished() {
            return false;
        }
        let line = format!("connection to {} ended", session.address());
        self.active = None;
        self.report(line);
        true
    }

    /// Known devices in insertion order, marking the active one.
    pub fn list_known(&self) -> Vec<KnownDevice> {
        let active = self.active_device();
        self.known
            .iter()
            .map(|device| KnownDevice {
                address: device.address().to_string(),
                active: active == Some(device),
            })
            .collect()
    }

    /// Known device by address.
    pub fn device(&self, address: &str) -> Option<&DeviceHandle> {
        self.known.iter().find(|device| device.has_address(address))
    }

    /// Device of the active session.
    pub fn active_device(&self) -> Option<&DeviceHandle> {
        self.active.map(|index| self.sessions[index].device())
    }

    /// Session for `device`, if one was created.
    pub fn session(&self, device: &DeviceHandle) -> Option<&SensorSession> {
        self.session_index(device).map(|index| &self.sessions[index])
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Addresses to persist across suspend.
    pub fn export_addresses(&self) -> HashSet<String> {
        self.known
            .iter()
            .map(|device| device.address().to_string())
            .collect()
    }

    /// Re-hydrate known devices. Sessions are created on first connect.
    pub fn import_addresses(&mut self, addresses: impl IntoIterator<Item = String>) -> usize {
        addresses
            .into_iter()
            .filter(|address| !address.trim().is_empty())
            .filter(|address| self.add_device(DeviceHandle::new(address.as_str())))
            .count()
    }

    fn session_index(&self, device: &DeviceHandle) -> Option<usize> {
        self.sessions.iter().position(|session| session.wraps(device))
    }

    fn ensure_session(&mut self, device: &DeviceHandle) -> usize {
        self.add_device(device.clone());
        if let Some(index) = self.session_index(device) {
            return index;
        }

        let connection =
            Connection::create(device.clone(), self.service, self.sockets.clone(), &self.span);
        if connection.state() == ConnectionState::Unavailable {
            self.span
                .in_scope(|| warn!("Session for {} has no socket", device));
        }
        self.sessions.push(SensorSession::new(connection));
        self.sessions.len() - 1
    }

    fn list_services(&self, device: &DeviceHandle) {
        let cached = self
            .device(device.address())
            .and_then(|known| known.services())
            .map(|services| services.to_vec());

        match cached {
            Some(services) if !services.is_empty() => {
                self.report(format!("Uuids recorded for {}", device));
                for uuid in services {
                    self.report(uuid.to_string());
                }
            }
            _ => self.report(format!("No uuids recorded for {}", device)),
        }
    }

    fn forwarding_sink(&self, device: &DeviceHandle) -> DataSink {
        let notice = SessionEndNotice {
            address: device.address().to_string(),
            events: self.events.clone(),
        };
        Box::new(move |data: &[u8]| {
            let _ = notice.events.send(RegistryEvent::Received {
                address: notice.address.clone(),
                data: data.to_vec(),
            });
        })
    }

    fn report(&self, line: String) {
        self.span.in_scope(|| info!("{}", line));
        let _ = self.events.send(RegistryEvent::Status(line));
    }
}

/// Travels inside a session's sink; announces the end of the pump when the
/// sink is dropped.
struct SessionEndNotice {
    address: String,
    events: mpsc::UnboundedSender<RegistryEvent>,
}

impl Drop for SessionEndNotice {
    fn drop(&mut self) {
        let _ = self.events.send(RegistryEvent::SessionEnded {
            address: std::mem::take(&mut self.address),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::transport::mock::{MockRadio, MockSockets, Outcome};
    use crate::bluetooth::transport::SPP_UUID;
    use std::io;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Fixture {
        registry: DeviceRegistry,
        sockets: Arc<MockSockets>,
        radio: Arc<MockRadio>,
        events: mpsc::UnboundedReceiver<RegistryEvent>,
    }

    fn fixture() -> Fixture {
        let sockets = MockSockets::new();
        let radio = MockRadio::new();
        let (tx, events) = mpsc::unbounded_channel();
        let registry = DeviceRegistry::new(radio.clone(), sockets.clone(), SPP_UUID, tx);
        Fixture {
            registry,
            sockets,
            radio,
            events,
        }
    }

    fn statuses(events: &mut mpsc::UnboundedReceiver<RegistryEvent>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RegistryEvent::Status(line) = event {
                lines.push(line);
            }
        }
        lines
    }

    async fn wait_for(registry: &DeviceRegistry, device: &DeviceHandle, state: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.session(device).map(|s| s.state()) != Some(state) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("state not reached");
    }

    fn open_sessions(registry: &DeviceRegistry) -> usize {
        registry
            .sessions
            .iter()
            .filter(|s| s.state() == ConnectionState::Open)
            .count()
    }

    #[test]
    fn test_add_device_dedups_case_insensitively() {
        let mut f = fixture();
        assert!(f.registry.add_device(DeviceHandle::new("00:11:22:AA:BB:CC")));
        assert!(!f.registry.add_device(DeviceHandle::new("00:11:22:aa:bb:cc")));
        assert!(!f.registry.add_device(DeviceHandle::new("00:11:22:Aa:bB:cC")));
        assert!(f.registry.add_device(DeviceHandle::new("00:11:22:AA:BB:CD")));

        let listed = f.registry.list_known();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].address, "00:11:22:AA:BB:CC");
        assert_eq!(listed[1].address, "00:11:22:AA:BB:CD");
    }

    #[test]
    fn test_add_sensor_for_dedups_and_resolves() {
        let mut f = fixture();
        let device = DeviceHandle::new("00:11:22:33:44:55");

        f.registry.add_sensor_for(device.clone(), true);
        f.registry
            .add_sensor_for(DeviceHandle::new("00:11:22:33:44:55"), false);

        assert_eq!(f.registry.session_count(), 1);
        assert_eq!(f.registry.known_count(), 1);
        assert_eq!(*f.radio.service_requests.lock(), vec!["00:11:22:33:44:55"]);
        assert!(statuses(&mut f.events).contains(&"No uuids recorded for 00:11:22:33:44:55".to_string()));
    }

    #[tokio::test]
    async fn test_connect_one_sets_active_and_cancels_discovery() {
        let mut f = fixture();
        let device = DeviceHandle::new("00:11:22:33:44:55");
        let _remote = f.sockets.push_stream();
        f.registry.add_sensor_for(device.clone(), false);
        f.registry.start_discovery();

        assert!(f.registry.connect_one(&device));
        assert!(!*f.radio.discovering.lock());
        assert_eq!(f.registry.active_device(), Some(&device));

        wait_for(&f.registry, &device, ConnectionState::Open).await;
        let listed = f.registry.list_known();
        assert!(listed[0].active);

        f.registry.disconnect();
        assert!(f.registry.active_device().is_none());
    }

    #[tokio::test]
    async fn test_connect_replaces_active() {
        let mut f = fixture();
        let a = DeviceHandle::new("00:11:22:33:44:0A");
        let b = DeviceHandle::new("00:11:22:33:44:0B");
        // Sockets are allocated when the session is created.
        let _remote_a = f.sockets.push_stream();
        f.registry.add_sensor_for(a.clone(), false);
        let _remote_b = f.sockets.push_stream();
        f.registry.add_sensor_for(b.clone(), false);

        assert!(f.registry.connect_one(&a));
        wait_for(&f.registry, &a, ConnectionState::Open).await;

        assert!(f.registry.connect_one(&b));
        assert_eq!(f.registry.session(&a).unwrap().state(), ConnectionState::Closed);
        wait_for(&f.registry, &b, ConnectionState::Open).await;

        assert_eq!(f.registry.active_device(), Some(&b));
        assert_eq!(open_sessions(&f.registry), 1);
    }

    #[tokio::test]
    async fn test_at_most_one_open_across_sequences() {
        let mut f = fixture();
        let devices: Vec<_> = (0..3)
            .map(|i| DeviceHandle::new(format!("00:11:22:33:44:{:02X}", i)))
            .collect();
        let mut remotes = Vec::new();

        for round in 0..6 {
            let device = &devices[round % devices.len()];
            f.registry.add_device(device.clone());
            remotes.push(f.sockets.push_stream());
            assert!(f.registry.connect_one(device));
            wait_for(&f.registry, device, ConnectionState::Open).await;
            assert_eq!(open_sessions(&f.registry), 1);
            assert_eq!(f.registry.active_device(), Some(device));

            if round % 2 == 1 {
                f.registry.disconnect();
                assert_eq!(open_sessions(&f.registry), 0);
                assert!(f.registry.active_device().is_none());
            }
        }
    }

    #[tokio::test]
    async fn test_connect_unknown_device_reports() {
        let mut f = fixture();
        assert!(!f.registry.connect_one(&DeviceHandle::new("00:00:00:00:00:01")));
        assert!(f.registry.active_device().is_none());
        assert!(statuses(&mut f.events)
            .contains(&"could not find device 00:00:00:00:00:01 to connect".to_string()));
    }

    #[tokio::test]
    async fn test_connect_with_unavailable_socket_leaves_no_active() {
        let mut f = fixture();
        f.sockets.set_unavailable(true);
        let device = DeviceHandle::new("00:11:22:33:44:55");
        f.registry.add_device(device.clone());

        assert!(!f.registry.connect_one(&device));
        assert!(f.registry.active_device().is_none());
        assert_eq!(f.sockets.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_connect_is_reaped() {
        let mut f = fixture();
        let device = DeviceHandle::new("00:11:22:33:44:55");
        f.sockets.push(Outcome::Fail(io::ErrorKind::ConnectionRefused));
        f.registry.add_device(device.clone());

        assert!(f.registry.connect_one(&device));
        wait_for(&f.registry, &device, ConnectionState::Closed).await;

        assert!(f.registry.reap_closed());
        assert!(f.registry.active_device().is_none());
        assert!(!f.registry.reap_closed());
    }

    #[tokio::test]
    async fn test_forget_all_resets_everything() {
        let mut f = fixture();
        let device = DeviceHandle::new("00:11:22:33:44:55");
        let _remote = f.sockets.push_stream();
        f.registry.add_sensor_for(device.clone(), false);
        f.registry.add_device(DeviceHandle::new("00:11:22:33:44:66"));
        assert!(f.registry.connect_one(&device));
        wait_for(&f.registry, &device, ConnectionState::Open).await;
        let connection = f.registry.session(&device).unwrap().connection().clone();

        f.registry.forget_all();

        assert_eq!(f.registry.known_count(), 0);
        assert_eq!(f.registry.session_count(), 0);
        assert!(f.registry.active_device().is_none());
        assert!(f.registry.list_known().is_empty());
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_received_bytes_are_forwarded() {
        let mut f = fixture();
        let device = DeviceHandle::new("00:11:22:33:44:55");
        let mut remote = f.sockets.push_stream();
        f.registry.add_device(device.clone());
        assert!(f.registry.connect_one(&device));

        remote.write_all(b"hi").await.unwrap();
        drop(remote);

        let mut data = Vec::new();
        let ended = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(event) = f.events.recv().await {
                match event {
                    RegistryEvent::Received { data: chunk, .. } => data.extend(chunk),
                    RegistryEvent::SessionEnded { address } => return address,
                    RegistryEvent::Status(_) => {}
                }
            }
            String::new()
        })
        .await
        .unwrap();

        assert_eq!(data, b"hi");
        assert_eq!(ended, "00:11:22:33:44:55");
        assert!(f.registry.reap_closed());
        assert!(f.registry.active_device().is_none());
    }

    async fn next_ended(events: &mut mpsc::UnboundedReceiver<RegistryEvent>) -> String {
        tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(event) = events.recv().await {
                if let RegistryEvent::SessionEnded { address } = event {
                    return address;
                }
            }
            String::new()
        })
        .await
        .expect("session never ended")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_session_end_is_reaped_immediately() {
        let mut f = fixture();
        let device = DeviceHandle::new("00:11:22:33:44:55");
        f.registry.add_device(device.clone());

        for _ in 0..20 {
            let remote = f.sockets.push_stream();
            assert!(f.registry.connect_one(&device));
            wait_for(&f.registry, &device, ConnectionState::Open).await;

            drop(remote);
            assert_eq!(next_ended(&mut f.events).await, "00:11:22:33:44:55");
            assert!(f.registry.reap_closed());
            assert!(f.registry.active_device().is_none());
            assert!(f.registry.list_known().iter().all(|d| !d.active));
        }
    }

    #[tokio::test]
    async fn test_reconnect_to_active_device_releases_old_stream() {
        let mut f = fixture();
        let device = DeviceHandle::new("00:11:22:33:44:55");
        let mut first = f.sockets.push_stream();
        f.registry.add_device(device.clone());
        assert!(f.registry.connect_one(&device));
        wait_for(&f.registry, &device, ConnectionState::Open).await;

        let mut second = f.sockets.push_stream();
        assert!(f.registry.connect_one(&device));
        assert_eq!(f.registry.active_device(), Some(&device));

        // The previous attempt's stream is released.
        let mut buf = [0u8; 4];
        let read = tokio::time::timeout(Duration::from_secs(2), first.read(&mut buf))
            .await
            .expect("previous stream still open");
        assert_eq!(read.unwrap(), 0);
        assert!(first.write_all(b"OLD").await.is_err());
        assert_eq!(next_ended(&mut f.events).await, "00:11:22:33:44:55");

        wait_for(&f.registry, &device, ConnectionState::Open).await;
        second.write_all(b"new").await.unwrap();

        let mut data = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), async {
            while data.len() < 3 {
                match f.events.recv().await {
                    Some(RegistryEvent::Received { data: chunk, .. }) => data.extend(chunk),
                    Some(_) => {}
                    None => break,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(data, b"new");

        // The old session's end must not clear the new attempt.
        assert!(!f.registry.reap_closed());
        assert_eq!(f.registry.active_device(), Some(&device));
    }

    #[test]
    fn test_radio_events_update_known() {
        let mut f = fixture();
        let spp = SPP_UUID;
        f.registry
            .handle_radio_event(RadioEvent::DeviceFound(DeviceHandle::new("00:11:22:33:44:55")));
        f.registry
            .handle_radio_event(RadioEvent::DeviceFound(DeviceHandle::new("00:11:22:33:44:55")));
        f.registry.handle_radio_event(RadioEvent::ServicesResolved {
            address: "00:11:22:33:44:55".to_string(),
            services: vec![spp],
        });

        assert_eq!(f.registry.known_count(), 1);
        let device = f.registry.device("00:11:22:33:44:55").unwrap();
        assert_eq!(device.services(), Some(&[spp][..]));

        let lines = statuses(&mut f.events);
        assert_eq!(
            lines,
            vec![
                "found 00:11:22:33:44:55".to_string(),
                format!("sdp uuid 00:11:22:33:44:55 {}", spp),
            ]
        );
    }

    #[test]
    fn test_export_import_round_trip() {
        let mut f = fixture();
        f.registry.add_device(DeviceHandle::new("00:11:22:33:44:55"));
        f.registry.add_device(DeviceHandle::new("00:11:22:33:44:66"));
        let exported = f.registry.export_addresses();

        let mut g = fixture();
        let added = g.registry.import_addresses(exported.clone());
        assert_eq!(added, 2);
        assert_eq!(g.registry.session_count(), 0);
        assert_eq!(g.registry.export_addresses(), exported);
    }

    #[tokio::test]
    async fn test_imported_device_connects_lazily() {
        let mut f = fixture();
        f.registry
            .import_addresses(vec!["00:11:22:33:44:55".to_string()]);
        let _remote = f.sockets.push_stream();

        let device = DeviceHandle::new("00:11:22:33:44:55");
        assert!(f.registry.connect_one(&device));
        assert_eq!(f.registry.session_count(), 1);
        wait_for(&f.registry, &device, ConnectionState::Open).await;
        f.registry.disconnect();
    }

    #[tokio::test]
    async fn test_add_bonded_adds_paired_devices() {
        let mut f = fixture();
        f.radio.bonded.lock().push(DeviceHandle::new("00:11:22:33:44:55"));
        f.radio.bonded.lock().push(DeviceHandle::new("00:11:22:33:44:55"));
        assert_eq!(f.registry.add_bonded().await, 1);
        assert_eq!(f.registry.known_count(), 1);
    }
}

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

//! Single-device stream connection.
//!
//! A [`Connection`] owns the platform socket for one device. Opening it
//! spawns a dedicated worker task that awaits the connect; once connected,
//! the worker runs the caller's `on_ready` future and closes the connection
//! when that future returns or the attempt is closed. The worker's lifetime
//! is the open lifetime of the socket.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use super::device::DeviceHandle;
use super::error::ConnectionError;
use super::transport::{BoxedStream, RfcommSocket, SocketFactory};

/// Read half of an open stream.
pub type StreamReader = ReadHalf<BoxedStream>;

/// Write half of an open stream.
pub type StreamWriter = WriteHalf<BoxedStream>;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket allocated, never opened.
    Idle,
    /// Worker is blocked on connect.
    Connecting,
    /// Stream is up.
    Open,
    /// Released.
    Closed,
    /// Socket allocation failed; open always fails.
    Unavailable,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Open => "Open",
            ConnectionState::Closed => "Closed",
            ConnectionState::Unavailable => "Unavailable",
        }
    }

    /// Whether the connection has reached a terminal state for its current attempt.
    pub fn is_finished(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Unavailable)
    }
}

struct Slot {
    state: ConnectionState,
    /// Bumped on every open so a stale worker cannot close a newer attempt.
    generation: u64,
    socket: Option<Box<dyn RfcommSocket>>,
    reader: Option<StreamReader>,
    writer: Option<StreamWriter>,
    shutdown: watch::Sender<bool>,
}

struct Inner {
    device: DeviceHandle,
    service: Uuid,
    sockets: Arc<dyn SocketFactory>,
    slot: Mutex<Slot>,
    span: Span,
}

/// Connection to one remote device.
///
/// Cloning is cheap and yields another handle to the same socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Allocate the socket for `device` and `service`.
    ///
    /// Allocation failure does not propagate: the connection is created in
    /// the [`ConnectionState::Unavailable`] state instead.
    pub fn create(
        device: DeviceHandle,
        service: Uuid,
        sockets: Arc<dyn SocketFactory>,
        parent: &Span,
    ) -> Self {
        let span = info_span!(parent: parent, "connection", address = %device);

        let (state, socket) = match sockets.create_socket(&device, service) {
            Ok(socket) => (ConnectionState::Idle, Some(socket)),
            Err(e) => {
                span.in_scope(|| error!("Failed to create socket: {}", e));
                (ConnectionState::Unavailable, None)
            }
        };

        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                device,
                service,
                sockets,
                slot: Mutex::new(Slot {
                    state,
                    generation: 0,
                    socket,
                    reader: None,
                    writer: None,
                    shutdown,
                }),
                span,
            }),
        }
    }

    /// Device this connection targets.
    pub fn device(&self) -> &DeviceHandle {
        &self.inner.device
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.slot.lock().state
    }

    /// Launch the connect worker.
    ///
    /// Returns `true` when the worker was spawned, which says nothing about
    /// whether the connect will succeed. On success the worker awaits
    /// `on_ready`, then closes the connection. Closing this attempt drops the
    /// `on_ready` future. Whatever it returns is dropped only after the
    /// connection is closed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open<F, Fut, T>(&self, on_ready: F) -> bool
    where
        F: FnOnce(Connection) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let _entered = self.inner.span.enter();
        let mut slot = self.inner.slot.lock();

        let state = slot.state;
        match state {
            ConnectionState::Unavailable => {
                debug!("Open refused: socket unavailable");
                return false;
            }
            ConnectionState::Connecting | ConnectionState::Open => {
                warn!("Open refused: already {}", state.as_str());
                return false;
            }
            ConnectionState::Closed => {
                // The previous socket was consumed; allocate a fresh one.
                match self
                    .inner
                    .sockets
                    .create_socket(&self.inner.device, self.inner.service)
                {
                    Ok(socket) => slot.socket = Some(socket),
                    Err(e) => {
                        error!("Failed to create socket: {}", e);
                        slot.state = ConnectionState::Unavailable;
                        return false;
                    }
                }
            }
            ConnectionState::Idle => {}
        }

        let Some(socket) = slot.socket.take() else {
            error!("No socket to open");
            slot.state = ConnectionState::Unavailable;
            return false;
        };

        slot.generation += 1;
        let generation = slot.generation;
        let (shutdown, cancelled) = watch::channel(false);
        slot.shutdown = shutdown;
        slot.state = ConnectionState::Connecting;
        drop(slot);

        info!("Connecting...");
        let worker = self
            .clone()
            .run_worker(generation, socket, cancelled, on_ready)
            .instrument(self.inner.span.clone());
        tokio::spawn(worker);

        true
    }

    /// Release the socket. Idempotent, and safe to race with the worker.
    pub fn close(&self) {
        let _entered = self.inner.span.enter();
        Self::release(&mut self.inner.slot.lock());
    }

    /// Claim the read half of the open stream.
    pub fn reader(&self) -> Result<StreamReader, ConnectionError> {
        let mut slot = self.inner.slot.lock();
        if slot.state != ConnectionState::Open {
            return Err(ConnectionError::NotConnected);
        }
        slot.reader.take().ok_or(ConnectionError::NotConnected)
    }

    /// Claim the write half of the open stream.
    pub fn writer(&self) -> Result<StreamWriter, ConnectionError> {
        let mut slot = self.inner.slot.lock();
        if slot.state != ConnectionState::Open {
            return Err(ConnectionError::NotConnected);
        }
        slot.writer.take().ok_or(ConnectionError::NotConnected)
    }

    /// Wait until the current attempt ends: the connection is closed, is
    /// unavailable, or has been reopened.
    pub async fn closed(&self) {
        let (generation, mut shutdown) = {
            let slot = self.inner.slot.lock();
            if slot.state.is_finished() {
                return;
            }
            (slot.generation, slot.shutdown.subscribe())
        };
        loop {
            // An error means a newer attempt replaced the sender.
            let _ = shutdown.wait_for(|closed| *closed).await;
            let slot = self.inner.slot.lock();
            if slot.generation != generation || slot.state.is_finished() {
                return;
            }
            shutdown = slot.shutdown.subscribe();
        }
    }

    async fn run_worker<F, Fut, T>(
        self,
        generation: u64,
        socket: Box<dyn RfcommSocket>,
        mut cancelled: watch::Receiver<bool>,
        on_ready: F,
    ) where
        F: FnOnce(Connection) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let _guard = CloseOnExit {
            connection: self.clone(),
            generation,
        };

        let result = tokio::select! {
            result = socket.connect() => result,
            _ = cancelled.wait_for(|closed| *closed) => {
                debug!("Connect abandoned: connection closed");
                return;
            }
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!("{}", ConnectionError::ConnectFailed(e));
                return;
            }
        };

        if !self.mark_open(generation, stream) {
            debug!("Closed while connecting, dropping stream");
            return;
        }

        info!("Connected");
        let output = tokio::select! {
            biased;
            _ = cancelled.wait_for(|closed| *closed) => {
                debug!("Stream consumer stopped by close");
                None
            }
            output = on_ready(self.clone()) => {
                debug!("Stream consumer finished");
                Some(output)
            }
        };

        self.close_attempt(generation);
        drop(output);
    }

    fn mark_open(&self, generation: u64, stream: BoxedStream) -> bool {
        let mut slot = self.inner.slot.lock();
        if slot.generation != generation || slot.state != ConnectionState::Connecting {
            return false;
        }

        let (reader, writer) = tokio::io::split(stream);
        slot.reader = Some(reader);
        slot.writer = Some(writer);
        slot.state = ConnectionState::Open;
        true
    }

    fn close_attempt(&self, generation: u64) {
        let _entered = self.inner.span.enter();
        let mut slot = self.inner.slot.lock();
        if slot.generation == generation {
            Self::release(&mut slot);
        }
    }

    fn release(slot: &mut Slot) {
        match slot.state {
            ConnectionState::Idle | ConnectionState::Closed | ConnectionState::Unavailable => {}
            ConnectionState::Connecting | ConnectionState::Open => {
                slot.state = ConnectionState::Closed;
                slot.reader = None;
                slot.writer = None;
                slot.shutdown.send_replace(true);
                info!("Connection closed");
            }
        }
    }
}

/// Closes the worker's attempt on every exit path, including a panicking
/// `on_ready`.
struct CloseOnExit {
    connection: Connection,
    generation: u64,
}

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.connection.close_attempt(self.generation);
    }
}

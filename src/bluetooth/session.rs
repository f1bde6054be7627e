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

//! Sensor protocol on top of a connection: single-byte commands out,
//! arbitrary bytes in.

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionState, StreamWriter};
use super::device::DeviceHandle;
use super::error::ConnectionError;

/// Size of one read from the stream.
const READ_CHUNK: usize = 1024;

/// Receives every chunk read from the device, in order.
pub type DataSink = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// A sensor reachable over one connection.
pub struct SensorSession {
    connection: Connection,
    /// Latest command for the running pump. Only the newest byte is kept.
    commands: Mutex<Option<watch::Sender<Option<u8>>>>,
}

impl SensorSession {
    /// Wrap a connection.
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            commands: Mutex::new(None),
        }
    }

    /// Connect in the background and pump received bytes into `sink`.
    ///
    /// Returns whether the connect worker was launched.
    pub fn connect_and_pump(&self, sink: DataSink) -> bool {
        let (commands, pending) = watch::channel(None);
        *self.commands.lock() = Some(commands);

        let launched = self
            .connection
            .open(move |connection| pump(connection, sink, pending));
        if !launched {
            self.commands.lock().take();
        }
        launched
    }

    /// Send one command byte. Silently dropped unless the stream is open.
    pub fn send_command(&self, byte: u8) {
        if self.connection.state() != ConnectionState::Open {
            debug!("Not connected, dropping command {:#04x}", byte);
            return;
        }
        if let Some(commands) = self.commands.lock().as_ref() {
            commands.send_replace(Some(byte));
        }
    }

    /// Whether this session talks to `device`.
    pub fn wraps(&self, device: &DeviceHandle) -> bool {
        self.connection.device() == device
    }

    pub fn device(&self) -> &DeviceHandle {
        self.connection.device()
    }

    pub fn address(&self) -> &str {
        self.connection.device().address()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Close the underlying connection.
    pub fn disconnect(&self) {
        self.connection.close();
        self.commands.lock().take();
    }
}

/// Runs on the connection worker until the stream ends. The worker drops
/// this future when the attempt is closed.
///
/// Hands the sink back so the worker drops it after releasing the
/// connection.
async fn pump(
    connection: Connection,
    mut sink: DataSink,
    mut commands: watch::Receiver<Option<u8>>,
) -> DataSink {
    let (mut reader, mut writer) = match (connection.reader(), connection.writer()) {
        (Ok(reader), Ok(writer)) => (reader, writer),
        (Err(e), _) | (_, Err(e)) => {
            warn!("Cannot start pump: {}", e);
            return sink;
        }
    };

    let inbound = async {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    info!("{}", ConnectionError::StreamClosed);
                    break;
                }
                Ok(n) => sink(&buf[..n]),
                Err(e) => {
                    warn!("Read error: {}", e);
                    break;
                }
            }
        }
    };

    let outbound = async {
        loop {
            if commands.changed().await.is_err() {
                // Session dropped its sender; keep reading.
                futures::future::pending::<()>().await;
            }
            let latest = *commands.borrow_and_update();
            let Some(byte) = latest else {
                continue;
            };
            if let Err(e) = write_command(&mut writer, byte).await {
                warn!("Write error: {}", e);
                return;
            }
            debug!("Sent command {:#04x}", byte);
        }
    };

    tokio::select! {
        _ = inbound => {}
        _ = outbound => {}
    }
    sink
}

async fn write_command(writer: &mut StreamWriter, byte: u8) -> std::io::Result<()> {
    writer.write_all(&[byte]).await?;
    writer.flush().await
}

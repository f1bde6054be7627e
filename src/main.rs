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

//! LogTooth desktop console.

use anyhow::Result;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use logtooth::bluetooth::{BluezBackend, DeviceHandle, DiscoveryAgent};
use logtooth::config::Config;
use logtooth::console::{self, ConsoleCommand};
use logtooth::registry::{DeviceRegistry, RegistryEvent};
use logtooth::storage::KnownDeviceStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging; stdout belongs to the console.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("logtooth=info")),
        )
        .init();

    info!("Starting LogTooth v{}...", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("Configuration loaded");

    let store = KnownDeviceStore::new(&config.data_dir)?;

    let backend = match BluezBackend::new(config.bluetooth.adapter.as_deref()).await {
        Ok(backend) => backend,
        Err(e) => {
            println!("Bluetooth not available on this host: {}", e);
            return Err(e);
        }
    };

    let (radio_tx, mut agent) = DiscoveryAgent::channel(32);
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut registry = DeviceRegistry::new(
        backend.radio(radio_tx),
        backend.sockets(),
        config.bluetooth.service_uuid,
        event_tx,
    );

    let stored = store.load()?;
    if !stored.is_empty() {
        println!("{} devices stored", stored.len());
        registry.import_addresses(stored);
        println!("Configured devices:");
        print!("{}", console::render_known(&registry.list_known()));
    }

    if config.bluetooth.list_paired_on_start {
        let added = registry.add_bonded().await;
        info!("Added {} paired devices", added);
    }

    println!("{}", console::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut received = console::ReceivedRenderer::new(config.console.hex);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => match ConsoleCommand::parse(&line) {
                        Ok(Some(command)) => {
                            if !run_command(command, &mut registry, &store, &config).await {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => println!("{}", e),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        error!("Console read error: {}", e);
                        break;
                    }
                }
            }
            Some(event) = agent.recv() => {
                registry.handle_radio_event(event);
            }
            Some(event) = event_rx.recv() => {
                match event {
                    RegistryEvent::Status(line) => println!("{}", line),
                    RegistryEvent::Received { data, .. } => {
                        print!("{}", received.render(&data));
                        let _ = std::io::stdout().flush();
                    }
                    RegistryEvent::SessionEnded { .. } => {
                        print!("{}", received.flush());
                        registry.reap_closed();
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    // Release the link so the device accepts a reconnect sooner.
    registry.disconnect();
    registry.cancel_discovery();
    if let Err(e) = store.save(&registry.export_addresses()) {
        error!("Failed to save device list: {}", e);
    }

    info!("LogTooth stopped");
    Ok(())
}

/// Apply one console command. Returns `false` to quit.
async fn run_command(
    command: ConsoleCommand,
    registry: &mut DeviceRegistry,
    store: &KnownDeviceStore,
    config: &Config,
) -> bool {
    match command {
        ConsoleCommand::List => {
            registry.reap_closed();
            print!("{}", console::render_known(&registry.list_known()));
        }
        ConsoleCommand::Paired => {
            let added = registry.add_bonded().await;
            println!("{} paired devices added", added);
        }
        ConsoleCommand::Discover => registry.start_discovery(),
        ConsoleCommand::StopDiscovery => registry.cancel_discovery(),
        ConsoleCommand::Add(address) => {
            registry.add_sensor_for(DeviceHandle::new(address), config.bluetooth.resolve_services);
        }
        ConsoleCommand::Services(address) => {
            registry.add_sensor_for(DeviceHandle::new(address), true);
        }
        ConsoleCommand::Connect(address) => {
            registry.connect_one(&DeviceHandle::new(address));
        }
        ConsoleCommand::Disconnect => registry.disconnect(),
        ConsoleCommand::Send(byte) => registry.send_command(byte),
        ConsoleCommand::Clean => registry.forget_all(),
        ConsoleCommand::Save => match store.save(&registry.export_addresses()) {
            Ok(()) => println!("device list saved"),
            Err(e) => println!("could not save device list: {}", e),
        },
        ConsoleCommand::Help => println!("{}", console::HELP),
        ConsoleCommand::Quit => return false,
    }
    true
}

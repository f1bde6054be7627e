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

//! Line-oriented operator console.

use anyhow::{anyhow, bail, Result};

use crate::registry::KnownDevice;

/// Help text for the console.
pub const HELP: &str = "\
commands:
  list              show known devices (* marks the connected one)
  paired            add devices bonded with this host
  discover          scan for nearby devices
  stop              stop scanning
  add <addr>        track a device and look up its services
  services <addr>   look up a device's services
  connect <addr>    connect to a device, dropping any current connection
  disconnect        drop the current connection
  send <c|0xNN>     send one command byte to the connected device
  clean             disconnect and forget every device
  save              store the device list
  help              show this text
  quit              store the device list and exit";

/// Actions an operator can request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    List,
    Paired,
    Discover,
    StopDiscovery,
    Add(String),
    Services(String),
    Connect(String),
    Disconnect,
    Send(u8),
    Clean,
    Save,
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let arg = words.next();

        let command = match verb.to_lowercase().as_str() {
            "list" | "ls" => Self::List,
            "paired" => Self::Paired,
            "discover" | "scan" => Self::Discover,
            "stop" => Self::StopDiscovery,
            "add" => Self::Add(required(verb, arg)?.to_string()),
            "services" => Self::Services(required(verb, arg)?.to_string()),
            "connect" => Self::Connect(required(verb, arg)?.to_string()),
            "disconnect" => Self::Disconnect,
            "send" => Self::Send(parse_command_byte(required(verb, arg)?)?),
            "clean" | "!clean" => Self::Clean,
            "save" => Self::Save,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command '{}', try 'help'", other),
        };
        Ok(Some(command))
    }
}

fn required<'a>(verb: &str, arg: Option<&'a str>) -> Result<&'a str> {
    arg.ok_or_else(|| anyhow!("'{}' needs an argument", verb))
}

/// `0xNN` is a hex byte; anything else sends its first byte.
fn parse_command_byte(arg: &str) -> Result<u8> {
    if let Some(hex) = arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
        return u8::from_str_radix(hex, 16).map_err(|_| anyhow!("invalid hex byte '{}'", arg));
    }
    arg.bytes()
        .next()
        .ok_or_else(|| anyhow!("nothing to send"))
}

/// Renders received bytes for display.
///
/// Text mode holds back an incomplete UTF-8 sequence at the end of a chunk
/// until the next chunk completes it.
#[derive(Debug)]
pub struct ReceivedRenderer {
    hex: bool,
    pending: Vec<u8>,
}

impl ReceivedRenderer {
    pub fn new(hex: bool) -> Self {
        Self {
            hex,
            pending: Vec::new(),
        }
    }

    /// Render one chunk as read from the device.
    pub fn render(&mut self, data: &[u8]) -> String {
        if self.hex {
            return data
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ")
                + "\n";
        }

        self.pending.extend_from_slice(data);
        let mut text = String::new();
        let mut rest = self.pending.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        text
    }

    /// Render whatever is held back, e.g. when the session ends.
    pub fn flush(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Render the device listing, one address per line.
pub fn render_known(devices: &[KnownDevice]) -> String {
    if devices.is_empty() {
        return "no devices\n".to_string();
    }
    devices
        .iter()
        .map(|d| format!("{}{}\n", if d.active { "*" } else { " " }, d.address))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(ConsoleCommand::parse("list").unwrap(), Some(ConsoleCommand::List));
        assert_eq!(ConsoleCommand::parse("  DISCOVER ").unwrap(), Some(ConsoleCommand::Discover));
        assert_eq!(ConsoleCommand::parse("!CLEAN").unwrap(), Some(ConsoleCommand::Clean));
        assert_eq!(ConsoleCommand::parse("").unwrap(), None);
        assert_eq!(ConsoleCommand::parse("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_address_commands() {
        assert_eq!(
            ConsoleCommand::parse("connect 00:11:22:33:44:55").unwrap(),
            Some(ConsoleCommand::Connect("00:11:22:33:44:55".to_string()))
        );
        assert_eq!(
            ConsoleCommand::parse("add aa:bb:cc:dd:ee:ff").unwrap(),
            Some(ConsoleCommand::Add("aa:bb:cc:dd:ee:ff".to_string()))
        );
        assert!(ConsoleCommand::parse("connect").is_err());
    }

    #[test]
    fn test_parse_send() {
        assert_eq!(ConsoleCommand::parse("send /").unwrap(), Some(ConsoleCommand::Send(b'/')));
        assert_eq!(ConsoleCommand::parse("send abc").unwrap(), Some(ConsoleCommand::Send(b'a')));
        assert_eq!(ConsoleCommand::parse("send 0x0d").unwrap(), Some(ConsoleCommand::Send(0x0d)));
        assert!(ConsoleCommand::parse("send 0xzz").is_err());
        assert!(ConsoleCommand::parse("send").is_err());
    }

    #[test]
    fn test_unknown_command() {
        assert!(ConsoleCommand::parse("frobnicate").is_err());
    }

    #[test]
    fn test_render_received() {
        assert_eq!(ReceivedRenderer::new(false).render(b"ABC"), "ABC");
        assert_eq!(
            ReceivedRenderer::new(true).render(&[0x41, 0x0d, 0xff]),
            "41 0d ff\n"
        );
    }

    #[test]
    fn test_render_joins_character_split_across_chunks() {
        let mut renderer = ReceivedRenderer::new(false);
        let degrees = "21.5\u{00b0}C".as_bytes();
        let (head, tail) = degrees.split_at(5);
        assert_eq!(renderer.render(head), "21.5");
        assert_eq!(renderer.render(tail), "\u{00b0}C");
        assert_eq!(renderer.flush(), "");
    }

    #[test]
    fn test_render_replaces_invalid_bytes() {
        let mut renderer = ReceivedRenderer::new(false);
        assert_eq!(renderer.render(&[b'a', 0xff, b'b']), "a\u{fffd}b");
        assert_eq!(renderer.render(&[0xe2, 0x82]), "");
        assert_eq!(renderer.flush(), "\u{fffd}");
    }

    #[test]
    fn test_render_known_marks_active() {
        let devices = vec![
            KnownDevice {
                address: "00:11:22:33:44:55".to_string(),
                active: false,
            },
            KnownDevice {
                address: "00:11:22:33:44:66".to_string(),
                active: true,
            },
        ];
        assert_eq!(
            render_known(&devices),
            " 00:11:22:33:44:55\n*00:11:22:33:44:66\n"
        );
        assert_eq!(render_known(&[]), "no devices\n");
    }
}

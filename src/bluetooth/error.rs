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

//! Connection error taxonomy.

use std::io;

/// Failures a connection can run into. None of these are fatal; they are
/// logged and turned into a closed or idle state.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The platform socket could not be allocated.
    #[error("socket unavailable: {0}")]
    SocketUnavailable(String),

    /// The blocking connect raised an I/O condition.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] io::Error),

    /// The operation needs an open stream.
    #[error("not connected")]
    NotConnected,

    /// The remote end closed the stream.
    #[error("stream closed")]
    StreamClosed,
}

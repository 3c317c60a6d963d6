// Copyright 2025 Chris Custine
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

//! Receiver-side input feed.
//!
//! Buffers inbound bytes from the receiver endpoint, runs the packetizer
//! over them and surfaces decoded messages in stream order.

use thiserror::Error;

use crate::protocol::{Message, Packetizer};
use crate::tcp::Endpoint;

/// A residual buffer larger than this means the packetizer is not making
/// progress, which indicates a framing bug rather than a slow stream.
const MAX_PENDING: usize = 512;

/// Fatal input-feed failures.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("input parser stuck: {0} bytes buffered without progress")]
    ParserStuck(usize),
}

/// Feed from the local receiver.
pub struct InputFeed {
    endpoint: Endpoint,
    packetizer: Box<dyn Packetizer + Send>,
    buffer: Vec<u8>,
}

impl std::fmt::Debug for InputFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputFeed")
            .field("endpoint", &self.endpoint)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl InputFeed {
    #[must_use]
    pub fn new(endpoint: Endpoint, packetizer: Box<dyn Packetizer + Send>) -> Self {
        Self {
            endpoint,
            packetizer,
            buffer: Vec::new(),
        }
    }

    /// Ask the endpoint for a connection attempt.
    pub fn connect(&self) {
        self.endpoint.connect();
    }

    /// Tear the endpoint down without scheduling a reconnect.
    pub fn disconnect(&self, reason: &str) {
        self.endpoint.disconnect(reason);
    }

    /// A fresh connection starts with an empty frame buffer.
    pub fn on_connected(&mut self) {
        self.buffer.clear();
    }

    /// Append received bytes and packetize as much as possible.
    pub fn on_data(&mut self, data: &[u8]) -> Result<Vec<Message>, FeedError> {
        self.buffer.extend_from_slice(data);
        let (consumed, messages) = self.packetizer.packetize(&self.buffer);
        if consumed > 0 {
            self.buffer.drain(..consumed);
        }
        if self.buffer.len() > MAX_PENDING {
            return Err(FeedError::ParserStuck(self.buffer.len()));
        }
        Ok(messages)
    }
}

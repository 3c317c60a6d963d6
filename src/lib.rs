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

//! Client library for feeding a Mode S multilateration network.
//!
//! A locally attached receiver produces a stream of demodulated Mode S
//! frames in the Beast binary format. This library consumes that stream,
//! tracks per-aircraft state, and forwards to a remote multilateration
//! server only the frames that are useful for time-difference-of-arrival
//! solutions and currently wanted by that server. The layers:
//!
//! - **Protocol layer**: Beast framing and the minimal Mode S field
//!   extraction the selection rules need
//! - **Endpoint layer**: async TCP with automatic reconnection for both the
//!   receiver feed and the server link
//! - **Server link**: JSON handshake, line-delimited downlink commands,
//!   plaintext or zlib-framed uplink
//! - **Coordinator**: per-aircraft tracking, frame selection, reporting and
//!   expiry
//!
//! All protocol state lives in a single task; the endpoint tasks do nothing
//! but socket I/O.
//!
//! # Quick Start
//!
//! ```no_run
//! use mlat_client::{Client, Config, ReceiverInfo};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = Client::spawn(Config {
//!         input_address: "localhost:30005".to_string(),
//!         server_address: "mlat.mutability.co.uk:40147".to_string(),
//!         receiver: ReceiverInfo {
//!             lat: 52.2,
//!             lon: 0.1,
//!             alt: 15.0,
//!             user: "example".to_string(),
//!             random_drop: 0.0,
//!         },
//!         offer_zlib: true,
//!     });
//!
//!     if let Err(e) = client.run(CancellationToken::new()).await {
//!         eprintln!("fatal: {e}");
//!     }
//! }
//! ```

pub mod clock;
pub mod coordinator;
pub mod feed;
pub mod link;
pub mod protocol;
pub mod tcp;

use std::time::Duration;

use chrono::Utc;
use log::warn;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub use coordinator::{Aircraft, Coordinator};
pub use feed::{FeedError, InputFeed};
pub use link::{MlatResult, ReceiverInfo, ServerLink};
pub use protocol::{BeastPacketizer, Message, Packetizer};
pub use tcp::{Endpoint, EndpointEvent, RECONNECT_DELAY};

/// Configuration for the full client.
#[derive(Debug, Clone)]
pub struct Config {
    /// Receiver feed address in "host:port" format.
    pub input_address: String,
    /// Multilateration server address in "host:port" format.
    pub server_address: String,
    /// Receiver coordinates and identity for the handshake.
    pub receiver: ReceiverInfo,
    /// Offer zlib uplink compression to the server.
    pub offer_zlib: bool,
}

/// Failures that end the client. Transient network trouble is handled
/// internally by the reconnect schedule and never surfaces here.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error("endpoint task exited unexpectedly")]
    EndpointExited,
}

/// The full client: two endpoints wired to a coordinator.
#[derive(Debug)]
pub struct Client {
    coordinator: Coordinator,
    input_events: mpsc::Receiver<EndpointEvent>,
    server_events: mpsc::Receiver<EndpointEvent>,
}

impl Client {
    /// Spawn the endpoint tasks and wire everything together. Nothing
    /// connects until [`Client::run`] is called.
    #[must_use]
    pub fn spawn(config: Config) -> Self {
        let (input_endpoint, input_events) =
            Endpoint::spawn("input", config.input_address, RECONNECT_DELAY);
        let (server_endpoint, server_events) =
            Endpoint::spawn("server", config.server_address, RECONNECT_DELAY);

        let feed = InputFeed::new(input_endpoint, Box::new(BeastPacketizer::new()));
        let random_drop = config.receiver.random_drop;
        let link = ServerLink::new(server_endpoint, config.receiver, config.offer_zlib);
        let coordinator = Coordinator::new(feed, link, random_drop);

        Self {
            coordinator,
            input_events,
            server_events,
        }
    }

    /// The event loop. Every piece of protocol state is mutated here and
    /// nowhere else; the 1 Hz tick drives heartbeats, reporting and expiry.
    ///
    /// Runs until `shutdown` is cancelled or a fatal error occurs.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), ClientError> {
        self.coordinator.start();

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = self.input_events.recv() => match event {
                    Some(EndpointEvent::Connected) => self.coordinator.input_connected(),
                    Some(EndpointEvent::Data(data)) => self.coordinator.input_data(&data)?,
                    Some(EndpointEvent::Lost) => self.coordinator.input_disconnected(),
                    None => return Err(ClientError::EndpointExited),
                },
                event = self.server_events.recv() => match event {
                    Some(EndpointEvent::Connected) => self.coordinator.server_endpoint_connected(),
                    Some(EndpointEvent::Data(data)) => {
                        if let Err(e) = self.coordinator.server_data(&data) {
                            warn!("server link failed: {e}");
                            self.coordinator.server_link_failed("protocol failure");
                        }
                    }
                    Some(EndpointEvent::Lost) => self.coordinator.server_endpoint_lost(),
                    None => return Err(ClientError::EndpointExited),
                },
                _ = tick.tick() => self.coordinator.heartbeat(Utc::now()),
                () = shutdown.cancelled() => {
                    self.coordinator.shutdown();
                    return Ok(());
                }
            }

            if let Err(e) = self.coordinator.flush_uplink() {
                warn!("uplink framing failed: {e}");
                self.coordinator.server_link_failed("uplink framing failure");
            }
        }
    }
}

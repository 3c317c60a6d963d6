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

//! Link to the multilateration server.
//!
//! The downlink is newline-delimited JSON. The uplink starts with a single
//! plaintext handshake line; after the server's response it is either more
//! JSON lines or a stream of length-prefixed zlib SYNC_FLUSH blocks,
//! depending on the compression method the server picked.

use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::{Compress, Compression, FlushCompress};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::clock;
use crate::protocol::Message;
use crate::tcp::Endpoint;

/// Interval between application-level heartbeats, when the server asks for
/// them.
pub const HEARTBEAT_INTERVAL: i64 = 120;

/// Compressed bytes accumulated before a SYNC_FLUSH block is emitted.
const FLUSH_THRESHOLD: usize = 32768;

/// Every SYNC_FLUSH block ends with an empty stored block.
const SYNC_FLUSH_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Server-link failures. All of them tear the connection down; none of them
/// are fatal to the process, since the endpoint reconnects on schedule.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("server rejected our connection attempt")]
    Rejected,

    #[error("server asked for compression method {0:?}, which we do not support")]
    UnsupportedCompression(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("compressed block too large ({0} bytes)")]
    OversizedBlock(usize),

    #[error("compression failed: {0}")]
    Compress(#[from] flate2::CompressError),
}

/// Receiver coordinates and identity, forwarded verbatim to the server in
/// the handshake.
#[derive(Debug, Clone)]
pub struct ReceiverInfo {
    /// Latitude in decimal degrees.
    pub lat: f64,
    /// Longitude in decimal degrees.
    pub lon: f64,
    /// Altitude AMSL in metres.
    pub alt: f64,
    /// Contact string for the server operator.
    pub user: String,
    /// Fraction of messages dropped locally, 0.0..=1.0.
    pub random_drop: f64,
}

#[derive(Serialize)]
struct Handshake<'a> {
    version: u32,
    compress: &'a [&'static str],
    selective_traffic: bool,
    heartbeat: bool,
    return_results: bool,
    lat: f64,
    lon: f64,
    alt: f64,
    user: &'a str,
    random_drop: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HandshakeResponse {
    reconnect_in: Option<f64>,
    deny: Option<Vec<String>>,
    motd: Option<String>,
    compress: Option<String>,
    selective_traffic: bool,
    heartbeat: bool,
}

/// A computed position fix returned by the server.
#[derive(Debug, Clone, Deserialize)]
pub struct MlatResult {
    pub addr: u32,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub callsign: Option<String>,
    pub squawk: Option<String>,
    pub hdop: f64,
    pub vdop: f64,
    pub tdop: f64,
    pub gdop: f64,
    pub nstations: u32,
}

/// Parsed downlink traffic handed to the coordinator.
#[derive(Debug)]
pub enum DownlinkEvent {
    /// The handshake response was accepted; the link is ready.
    HandshakeComplete,
    /// The server wants traffic for these aircraft.
    StartSending(Vec<u32>),
    /// The server no longer wants traffic for these aircraft.
    StopSending(Vec<u32>),
    /// A computed position fix.
    Result(MlatResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    /// No connection (the endpoint task may be connecting or backing off).
    Disconnected,
    /// Connected, handshake line sent, waiting for the response.
    Handshaking,
    /// Handshake accepted; normal traffic.
    Ready,
}

enum UplinkFraming {
    Plain,
    Zlib(Compress),
}

impl std::fmt::Debug for UplinkFraming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain => f.write_str("Plain"),
            Self::Zlib(_) => f.write_str("Zlib"),
        }
    }
}

/// Connection to the multilateration server.
#[derive(Debug)]
pub struct ServerLink {
    endpoint: Endpoint,
    receiver: ReceiverInfo,
    offer_zlib: bool,
    state: LinkState,
    readbuf: Vec<u8>,
    linebuf: Vec<String>,
    framing: UplinkFraming,
    selective_traffic: bool,
    heartbeat_at: Option<DateTime<Utc>>,
}

impl ServerLink {
    #[must_use]
    pub fn new(endpoint: Endpoint, receiver: ReceiverInfo, offer_zlib: bool) -> Self {
        Self {
            endpoint,
            receiver,
            offer_zlib,
            state: LinkState::Disconnected,
            readbuf: Vec::new(),
            linebuf: Vec::new(),
            framing: UplinkFraming::Plain,
            selective_traffic: false,
            heartbeat_at: None,
        }
    }

    pub fn connect(&self) {
        self.endpoint.connect();
    }

    pub fn disconnect(&self, reason: &str) {
        self.endpoint.disconnect(reason);
    }

    /// Tear the connection down on a link-level failure; the endpoint
    /// schedules a reconnect.
    pub fn close_lost(&self, reason: &str) {
        self.endpoint.close_lost(reason);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready
    }

    /// Whether the server decides which aircraft it wants traffic for. When
    /// false, every reported aircraft is implicitly requested.
    #[must_use]
    pub fn selective_traffic(&self) -> bool {
        self.selective_traffic
    }

    /// The endpoint connected: send the handshake line. The handshake always
    /// goes out in plaintext, before any line queuing or compression.
    pub fn on_connected(&mut self) {
        self.reset();
        self.state = LinkState::Handshaking;

        let methods: &[&'static str] = if self.offer_zlib {
            &["none", "zlib"]
        } else {
            &["none"]
        };
        let handshake = Handshake {
            version: 2,
            compress: methods,
            selective_traffic: true,
            heartbeat: true,
            return_results: true,
            lat: self.receiver.lat,
            lon: self.receiver.lon,
            alt: self.receiver.alt,
            user: &self.receiver.user,
            random_drop: self.receiver.random_drop,
        };
        // Serializing a struct of plain fields cannot fail.
        let mut line = serde_json::to_string(&handshake).unwrap_or_default();
        line.push('\n');

        info!("connected to multilateration server, handshaking");
        self.endpoint.send(line.into_bytes());
    }

    /// The endpoint went away; drop all connection-scoped state.
    pub fn on_lost(&mut self) {
        self.reset();
    }

    fn reset(&mut self) {
        self.state = LinkState::Disconnected;
        self.readbuf.clear();
        self.linebuf.clear();
        self.framing = UplinkFraming::Plain;
        self.selective_traffic = false;
        self.heartbeat_at = None;
    }

    /// Parse downlink bytes into complete JSON lines and handle each one.
    pub fn on_data(&mut self, data: &[u8]) -> Result<Vec<DownlinkEvent>, LinkError> {
        self.readbuf.extend_from_slice(data);
        let mut events = Vec::new();

        while let Some(newline) = self.readbuf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.readbuf.drain(..=newline).collect();
            let line = std::str::from_utf8(&raw[..raw.len() - 1])
                .map_err(|_| LinkError::Protocol("downlink line is not valid UTF-8".into()))?;

            match self.state {
                LinkState::Handshaking => {
                    self.handle_handshake_response(line)?;
                    events.push(DownlinkEvent::HandshakeComplete);
                }
                LinkState::Ready => {
                    if let Some(event) = self.handle_request(line)? {
                        events.push(event);
                    }
                }
                LinkState::Disconnected => {}
            }
        }

        Ok(events)
    }

    fn handle_handshake_response(&mut self, line: &str) -> Result<(), LinkError> {
        let response: HandshakeResponse = serde_json::from_str(line)
            .map_err(|e| LinkError::Protocol(format!("bad handshake response: {e}")))?;

        if let Some(seconds) = response.reconnect_in {
            self.endpoint
                .set_reconnect_delay(Duration::from_secs_f64(seconds.max(0.0)));
        }

        if let Some(reasons) = response.deny {
            warn!("server explicitly rejected our connection, saying:");
            for reason in &reasons {
                warn!("  {reason}");
            }
            return Err(LinkError::Rejected);
        }

        if let Some(motd) = &response.motd {
            info!("server says: {motd}");
        }

        let compress = response.compress.as_deref().unwrap_or("none");
        self.framing = match compress {
            "none" => UplinkFraming::Plain,
            "zlib" if self.offer_zlib => UplinkFraming::Zlib(Compress::new(Compression::new(1), true)),
            other => return Err(LinkError::UnsupportedCompression(other.to_string())),
        };

        self.selective_traffic = response.selective_traffic;
        if response.heartbeat {
            self.heartbeat_at = Some(Utc::now() + chrono::Duration::seconds(HEARTBEAT_INTERVAL));
        }

        info!("handshake complete");
        info!("  compression:       {compress}");
        info!(
            "  selective traffic: {}",
            if self.selective_traffic { "enabled" } else { "disabled" }
        );
        info!(
            "  heartbeats:        {}",
            if self.heartbeat_at.is_some() { "enabled" } else { "disabled" }
        );

        self.state = LinkState::Ready;
        Ok(())
    }

    fn handle_request(&mut self, line: &str) -> Result<Option<DownlinkEvent>, LinkError> {
        let request: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| LinkError::Protocol(format!("bad downlink line: {e}")))?;
        let Some(object) = request.as_object() else {
            return Err(LinkError::Protocol("downlink line is not a JSON object".into()));
        };

        if let Some(list) = object.get("start_sending") {
            return Ok(Some(DownlinkEvent::StartSending(parse_icao_list(list)?)));
        }
        if let Some(list) = object.get("stop_sending") {
            return Ok(Some(DownlinkEvent::StopSending(parse_icao_list(list)?)));
        }
        if object.contains_key("heartbeat") {
            return Ok(None);
        }
        if let Some(result) = object.get("result") {
            let result: MlatResult = serde_json::from_value(result.clone())
                .map_err(|e| LinkError::Protocol(format!("bad result: {e}")))?;
            return Ok(Some(DownlinkEvent::Result(result)));
        }

        info!("ignoring request from server: {line}");
        Ok(None)
    }

    /// Queue a line for the uplink. Lines are only accepted while a
    /// connection exists; they are framed and written out on `flush`.
    fn push_line(&mut self, line: String) {
        if self.state != LinkState::Disconnected {
            self.linebuf.push(line);
        }
    }

    pub fn send_seen(&mut self, addresses: impl IntoIterator<Item = u32>) {
        self.push_line(json!({ "seen": hex_addresses(addresses) }).to_string());
    }

    pub fn send_lost(&mut self, addresses: impl IntoIterator<Item = u32>) {
        self.push_line(json!({ "lost": hex_addresses(addresses) }).to_string());
    }

    pub fn send_mlat(&mut self, message: &Message) {
        self.push_line(format!(
            r#"{{"mlat":{{"t":{},"m":"{}"}}}}"#,
            message.timestamp,
            message.hex()
        ));
    }

    pub fn send_mlat_and_alt(&mut self, message: &Message, altitude: i32) {
        self.push_line(format!(
            r#"{{"mlat":{{"t":{},"m":"{}","a":{}}}}}"#,
            message.timestamp,
            message.hex(),
            altitude
        ));
    }

    pub fn send_sync(&mut self, even: &Message, odd: &Message) {
        self.push_line(format!(
            r#"{{"sync":{{"et":{},"em":"{}","ot":{},"om":"{}"}}}}"#,
            even.timestamp,
            even.hex(),
            odd.timestamp,
            odd.hex()
        ));
    }

    pub fn send_input_status(&mut self, connected: bool) {
        let line = if connected {
            json!({ "input_connected": "OK" })
        } else {
            json!({ "input_disconnected": "no longer connected" })
        };
        self.push_line(line.to_string());
    }

    /// Emit the periodic heartbeat when due.
    pub fn heartbeat(&mut self, now: DateTime<Utc>) {
        if self.heartbeat_at.is_some_and(|at| now >= at) {
            self.heartbeat_at = Some(now + chrono::Duration::seconds(HEARTBEAT_INTERVAL));
            let seconds = clock::round_tenths(clock::wall_seconds(now));
            self.push_line(json!({ "heartbeat": seconds }).to_string());
        }
    }

    /// Frame all pending lines and hand them to the endpoint.
    ///
    /// Called after every processed event so that deadline-bound messages
    /// never linger in the compressor.
    pub fn flush(&mut self) -> Result<(), LinkError> {
        if self.state != LinkState::Ready || self.linebuf.is_empty() {
            return Ok(());
        }
        let lines = std::mem::take(&mut self.linebuf);
        let wire = match &mut self.framing {
            UplinkFraming::Plain => fill_plain(&lines),
            UplinkFraming::Zlib(compressor) => fill_zlib(compressor, &lines)?,
        };
        if !wire.is_empty() {
            self.endpoint.send(wire);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pending_lines(&self) -> &[String] {
        &self.linebuf
    }
}

fn hex_addresses(addresses: impl IntoIterator<Item = u32>) -> Vec<String> {
    addresses
        .into_iter()
        .map(|icao| format!("{icao:06x}"))
        .collect()
}

fn parse_icao_list(value: &serde_json::Value) -> Result<Vec<u32>, LinkError> {
    let Some(items) = value.as_array() else {
        return Err(LinkError::Protocol("aircraft list is not an array".into()));
    };
    items
        .iter()
        .map(|item| {
            item.as_str()
                .and_then(|s| u32::from_str_radix(s, 16).ok())
                .ok_or_else(|| LinkError::Protocol(format!("bad ICAO address {item}")))
        })
        .collect()
}

/// Uncompressed uplink: the concatenation of the JSON lines, each terminated
/// by a newline.
fn fill_plain(lines: &[String]) -> Vec<u8> {
    let mut wire = Vec::new();
    for line in lines {
        wire.extend_from_slice(line.as_bytes());
        wire.push(b'\n');
    }
    wire
}

/// Compressed uplink: feed lines through the shared compressor and emit a
/// length-prefixed SYNC_FLUSH block whenever enough output has accumulated,
/// plus one for any trailing residue.
fn fill_zlib(compressor: &mut Compress, lines: &[String]) -> Result<Vec<u8>, LinkError> {
    let mut wire = Vec::new();
    let mut block = Vec::new();
    let mut pending = false;

    for line in lines {
        deflate(compressor, line.as_bytes(), FlushCompress::None, &mut block)?;
        deflate(compressor, b"\n", FlushCompress::None, &mut block)?;
        pending = true;

        if block.len() >= FLUSH_THRESHOLD {
            frame_block(compressor, &mut block, &mut wire)?;
            pending = false;
        }
    }
    if pending {
        frame_block(compressor, &mut block, &mut wire)?;
    }

    Ok(wire)
}

/// SYNC_FLUSH the compressor, strip the empty-block trailer and prepend the
/// big-endian length of what remains.
fn frame_block(
    compressor: &mut Compress,
    block: &mut Vec<u8>,
    wire: &mut Vec<u8>,
) -> Result<(), LinkError> {
    deflate(compressor, &[], FlushCompress::Sync, block)?;
    if !block.ends_with(&SYNC_FLUSH_TRAILER) {
        return Err(LinkError::Protocol(
            "sync flush did not end with the empty-block marker".into(),
        ));
    }
    block.truncate(block.len() - SYNC_FLUSH_TRAILER.len());

    let length = u16::try_from(block.len()).map_err(|_| LinkError::OversizedBlock(block.len()))?;
    wire.extend_from_slice(&length.to_be_bytes());
    wire.extend_from_slice(block);
    block.clear();
    Ok(())
}

fn deflate(
    compressor: &mut Compress,
    input: &[u8],
    flush: FlushCompress,
    out: &mut Vec<u8>,
) -> Result<(), LinkError> {
    let mut offset = 0;
    loop {
        if out.capacity() - out.len() < 128 {
            out.reserve(4096);
        }
        let before = compressor.total_in();
        compressor.compress_vec(&input[offset..], out, flush)?;
        offset += usize::try_from(compressor.total_in() - before).unwrap_or(usize::MAX);

        // Finished once all input is in and the last call left spare output
        // space, meaning zlib had nothing further to emit.
        if offset >= input.len() && out.len() < out.capacity() {
            return Ok(());
        }
    }
}

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

//! Coordinator: per-aircraft tracking and frame selection.
//!
//! The coordinator sits between the receiver feed and the server link. It
//! tracks every aircraft heard, decides which received frames are worth
//! forwarding for multilateration, announces newly seen and lost aircraft,
//! honours the server's selective-traffic requests, and drives the periodic
//! report and expiry cycles.
//!
//! The selection rules are deliberately conservative: frames are only
//! forwarded once an aircraft has stabilised (ten accepted messages), is
//! wanted by the server, has not reported its own ADS-B position recently
//! (such aircraft need no multilateration) and has usable altitude context.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};

use crate::clock::ts;
use crate::feed::{FeedError, InputFeed};
use crate::link::{DownlinkEvent, LinkError, MlatResult, ServerLink};
use crate::protocol::Message;

/// Seconds between `seen` reports of newly observed aircraft.
const REPORT_INTERVAL: i64 = 15;

/// Seconds between expiry sweeps.
const EXPIRY_INTERVAL: i64 = 60;

/// Accepted messages before an aircraft is considered stable.
const MIN_MESSAGES: u32 = 10;

/// Tracking state for one ICAO address.
#[derive(Debug, Clone)]
pub struct Aircraft {
    pub icao: u32,
    /// Count of accepted frames.
    pub messages: u32,
    pub last_message_timestamp: u64,
    /// Sample count of the most recent ES position frame.
    pub last_position_timestamp: u64,
    /// Sample count of the most recent altitude-bearing frame.
    pub last_altitude_timestamp: u64,
    /// Most recent pressure altitude in feet.
    pub altitude: Option<i32>,
    pub even_message: Option<Message>,
    pub odd_message: Option<Message>,
    /// Whether this aircraft has been announced to the server.
    pub reported: bool,
    /// Whether the server currently wants traffic for this aircraft.
    pub requested: bool,
}

impl Aircraft {
    fn new(icao: u32) -> Self {
        Self {
            icao,
            messages: 0,
            last_message_timestamp: 0,
            last_position_timestamp: 0,
            last_altitude_timestamp: 0,
            altitude: None,
            even_message: None,
            odd_message: None,
            reported: false,
            requested: true,
        }
    }
}

/// The state machine tying the receiver feed and the server link together.
#[derive(Debug)]
pub struct Coordinator {
    feed: InputFeed,
    link: ServerLink,
    random_drop_cutoff: u8,

    aircraft: HashMap<u32, Aircraft>,
    requested_traffic: HashSet<u32>,
    newly_seen: HashSet<u32>,
    last_rcv_timestamp: u64,
    next_report: Option<DateTime<Utc>>,
    next_expiry: Option<DateTime<Utc>>,
    input_ready: bool,
}

impl Coordinator {
    #[must_use]
    pub fn new(feed: InputFeed, link: ServerLink, random_drop: f64) -> Self {
        Self {
            feed,
            link,
            random_drop_cutoff: (255.0 * random_drop).floor() as u8,
            aircraft: HashMap::new(),
            requested_traffic: HashSet::new(),
            newly_seen: HashSet::new(),
            last_rcv_timestamp: 0,
            next_report: None,
            next_expiry: None,
            input_ready: false,
        }
    }

    /// Kick off the initial server connection attempt.
    pub fn start(&self) {
        self.link.connect();
    }

    /// Disconnect both endpoints for process shutdown.
    pub fn shutdown(&self) {
        self.feed.disconnect("client shutting down");
        self.link.disconnect("client shutting down");
    }

    /// One-second logical tick: endpoint heartbeats, periodic reporting and
    /// expiry.
    pub fn heartbeat(&mut self, now: DateTime<Utc>) {
        self.link.heartbeat(now);

        if self.next_report.is_some_and(|at| now >= at) {
            self.next_report = Some(now + Duration::seconds(REPORT_INTERVAL));
            self.send_aircraft_report();
        }
        if self.next_expiry.is_some_and(|at| now >= at) {
            self.next_expiry = Some(now + Duration::seconds(EXPIRY_INTERVAL));
            self.expire();
        }
    }

    /// Frame and transmit any queued uplink lines.
    pub fn flush_uplink(&mut self) -> Result<(), LinkError> {
        self.link.flush()
    }

    /// Tear the server link down after a link-level failure; the reconnect
    /// schedule takes it from there.
    pub fn server_link_failed(&mut self, reason: &str) {
        self.link.close_lost(reason);
    }

    // --- receiver feed events ---

    pub fn input_connected(&mut self) {
        self.input_ready = true;
        self.feed.on_connected();
        self.link.send_input_status(true);
    }

    pub fn input_disconnected(&mut self) {
        self.input_ready = false;
        self.link.send_input_status(false);
    }

    /// Bytes arrived from the receiver. A `ParserStuck` failure here is
    /// fatal to the process.
    pub fn input_data(&mut self, data: &[u8]) -> Result<(), FeedError> {
        let messages = self.feed.on_data(data)?;
        if !messages.is_empty() {
            self.input_received_messages(messages);
        }
        Ok(())
    }

    // --- server link events ---

    /// The server endpoint connected: run the handshake.
    pub fn server_endpoint_connected(&mut self) {
        self.link.on_connected();
    }

    /// The server endpoint went away.
    pub fn server_endpoint_lost(&mut self) {
        self.link.on_lost();
        self.server_disconnected();
    }

    /// Parse downlink bytes and apply the resulting commands.
    pub fn server_data(&mut self, data: &[u8]) -> Result<(), LinkError> {
        let events = self.link.on_data(data)?;
        for event in events {
            match event {
                DownlinkEvent::HandshakeComplete => self.server_connected(),
                DownlinkEvent::StartSending(addresses) => self.start_sending(&addresses),
                DownlinkEvent::StopSending(addresses) => self.stop_sending(&addresses),
                DownlinkEvent::Result(result) => self.received_mlat_result(&result),
            }
        }
        Ok(())
    }

    /// Handshake accepted: tracking state restarts from scratch.
    fn server_connected(&mut self) {
        self.aircraft.clear();
        self.requested_traffic.clear();
        self.newly_seen.clear();
        let now = Utc::now();
        self.next_report = Some(now + Duration::seconds(REPORT_INTERVAL));
        self.next_expiry = Some(now + Duration::seconds(EXPIRY_INTERVAL));
        if !self.input_ready {
            self.feed.connect();
        }
    }

    fn server_disconnected(&mut self) {
        self.feed
            .disconnect("lost connection to multilateration server, no need for input data");
        self.next_report = None;
        self.next_expiry = None;
    }

    // --- the receiver-message pipeline ---

    pub fn input_received_messages(&mut self, messages: Vec<Message>) {
        for message in messages {
            // The trailing checksum byte is close enough to uniform to act
            // as the random-drop selector.
            if self.random_drop_cutoff > 0 && message.random_byte() < self.random_drop_cutoff {
                continue;
            }

            // The receiver's clock jumped backwards, typically after a
            // reconnect. Drop the rest of the batch and wait for sample
            // counts to pass the stored maximum.
            if message.timestamp < self.last_rcv_timestamp {
                return;
            }
            self.last_rcv_timestamp = message.timestamp;

            if !message.valid {
                return;
            }

            match message.df {
                0 | 4 | 16 | 20 => self.received_df_misc_alt(&message),
                5 | 21 => self.received_df_misc_noalt(&message),
                11 => self.received_df11(&message),
                17 => self.received_df17(message),
                _ => {}
            }
        }
    }

    /// DF 0/4/16/20: surveillance replies carrying an altitude of their own.
    fn received_df_misc_alt(&mut self, message: &Message) {
        let altitude = match message.altitude {
            Some(alt) if alt != 0 => alt,
            _ => return,
        };

        let Self {
            aircraft,
            link,
            newly_seen,
            ..
        } = self;
        let Some(ac) = aircraft.get_mut(&message.address) else {
            return;
        };

        ac.messages += 1;
        ac.last_message_timestamp = message.timestamp;
        ac.last_altitude_timestamp = message.timestamp;
        ac.altitude = Some(altitude);

        if ac.messages < MIN_MESSAGES {
            return;
        }
        if ac.reported && !ac.requested {
            return;
        }
        if message.timestamp - ac.last_position_timestamp < ts(60) {
            return; // reported its own position recently, no need for mlat
        }
        if !ac.reported {
            report_aircraft(ac, link.selective_traffic(), newly_seen);
            return;
        }

        link.send_mlat(message);
    }

    /// DF 5/21: identity replies; usable only with fresh altitude context.
    fn received_df_misc_noalt(&mut self, message: &Message) {
        let Self {
            aircraft,
            link,
            newly_seen,
            ..
        } = self;
        let Some(ac) = aircraft.get_mut(&message.address) else {
            return;
        };

        ac.messages += 1;
        ac.last_message_timestamp = message.timestamp;

        if ac.messages < MIN_MESSAGES {
            return;
        }
        if ac.reported && !ac.requested {
            return;
        }
        if message.timestamp - ac.last_position_timestamp < ts(60) {
            return;
        }
        if message.timestamp - ac.last_altitude_timestamp > ts(15) {
            return; // too long since an altitude was heard
        }
        if !ac.reported {
            report_aircraft(ac, link.selective_traffic(), newly_seen);
            return;
        }

        let Some(altitude) = ac.altitude else { return };
        link.send_mlat_and_alt(message, altitude);
    }

    /// DF11: all-call replies create tracking entries for unknown aircraft.
    fn received_df11(&mut self, message: &Message) {
        let Self {
            aircraft,
            requested_traffic,
            link,
            newly_seen,
            ..
        } = self;
        let ac = match aircraft.entry(message.address) {
            Entry::Vacant(slot) => {
                let mut ac = Aircraft::new(message.address);
                ac.requested = requested_traffic.contains(&message.address);
                ac.messages = 1;
                ac.last_message_timestamp = message.timestamp;
                slot.insert(ac);
                return; // will need some more messages first
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };

        ac.messages += 1;
        ac.last_message_timestamp = message.timestamp;

        if ac.messages < MIN_MESSAGES {
            return;
        }
        if ac.reported && !ac.requested {
            return;
        }
        if message.timestamp - ac.last_position_timestamp < ts(60) {
            return;
        }
        if message.timestamp - ac.last_altitude_timestamp > ts(15) {
            return;
        }
        if !ac.reported {
            report_aircraft(ac, link.selective_traffic(), newly_seen);
            return;
        }

        let Some(altitude) = ac.altitude else { return };
        link.send_mlat_and_alt(message, altitude);
    }

    /// DF17: extended squitters. Airborne-position pairs close in time make
    /// sync reference messages; aircraft with recent positions are otherwise
    /// left alone.
    fn received_df17(&mut self, message: Message) {
        let Self {
            aircraft,
            requested_traffic,
            link,
            newly_seen,
            ..
        } = self;
        let ac = match aircraft.entry(message.address) {
            Entry::Vacant(slot) => {
                let mut ac = Aircraft::new(message.address);
                ac.requested = requested_traffic.contains(&message.address);
                ac.messages = 1;
                ac.last_message_timestamp = message.timestamp;
                // An ES-equipped aircraft is assumed to be position-reporting
                // from the start, so its initial burst never triggers mlat.
                ac.last_position_timestamp = message.timestamp;
                slot.insert(ac);
                return;
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };

        ac.messages += 1;
        ac.last_message_timestamp = message.timestamp;

        if ac.messages < MIN_MESSAGES {
            return;
        }
        if ac.reported && !ac.requested {
            return;
        }
        if message.altitude.is_none() {
            return; // need an altitude
        }

        if message.even_cpr {
            ac.last_position_timestamp = message.timestamp;
            ac.even_message = Some(message);
        } else if message.odd_cpr {
            ac.last_position_timestamp = message.timestamp;
            ac.odd_message = Some(message);
        } else {
            return; // not a position squitter
        }

        let (even_ts, odd_ts) = match (&ac.even_message, &ac.odd_message) {
            (Some(even), Some(odd)) => (even.timestamp, odd.timestamp),
            _ => return,
        };
        if even_ts.abs_diff(odd_ts) > ts(5) {
            return;
        }

        // This is a useful reference pair.
        if !ac.reported {
            report_aircraft(ac, link.selective_traffic(), newly_seen);
            return;
        }
        if let (Some(even), Some(odd)) = (&ac.even_message, &ac.odd_message) {
            link.send_sync(even, odd);
        }
    }

    // --- server commands ---

    fn start_sending(&mut self, addresses: &[u32]) {
        info!("server requests traffic for {} aircraft", addresses.len());
        for icao in addresses {
            if let Some(ac) = self.aircraft.get_mut(icao) {
                ac.requested = true;
            }
        }
        self.requested_traffic.extend(addresses);
    }

    fn stop_sending(&mut self, addresses: &[u32]) {
        info!("server stops traffic for {} aircraft", addresses.len());
        for icao in addresses {
            if let Some(ac) = self.aircraft.get_mut(icao) {
                ac.requested = false;
            }
            self.requested_traffic.remove(icao);
        }
    }

    fn received_mlat_result(&mut self, result: &MlatResult) {
        // TODO: feed results to a local SBS-style output
        debug!(
            "mlat result for {:06x}: {:.4},{:.4} at {:.0}ft ({} stations)",
            result.addr, result.lat, result.lon, result.alt, result.nstations
        );
    }

    // --- periodic work ---

    fn send_aircraft_report(&mut self) {
        if self.newly_seen.is_empty() {
            return;
        }
        info!("telling server about {} new aircraft", self.newly_seen.len());
        let seen = std::mem::take(&mut self.newly_seen);
        self.link.send_seen(seen);
    }

    /// Drop aircraft not heard for a minute of receiver time and tell the
    /// server about the reported ones.
    fn expire(&mut self) {
        let expired: Vec<u32> = self
            .aircraft
            .values()
            .filter(|ac| {
                self.last_rcv_timestamp
                    .saturating_sub(ac.last_message_timestamp)
                    > ts(60)
            })
            .map(|ac| ac.icao)
            .collect();

        let mut discarded = Vec::new();
        for icao in &expired {
            if let Some(ac) = self.aircraft.remove(icao) {
                if ac.reported {
                    discarded.push(ac.icao);
                }
            }
        }
        if !discarded.is_empty() {
            self.link.send_lost(discarded);
        }

        let reported = self.aircraft.values().filter(|ac| ac.reported).count();
        let requested = self.aircraft.values().filter(|ac| ac.requested).count();
        info!(
            "expired {} aircraft, {} remaining",
            expired.len(),
            self.aircraft.len()
        );
        info!(
            "sending traffic for {requested}/{reported} aircraft, server requested {} aircraft",
            self.requested_traffic.len()
        );
    }
}

/// Mark an aircraft as announced. Without selective traffic every reported
/// aircraft is implicitly requested.
fn report_aircraft(ac: &mut Aircraft, selective_traffic: bool, newly_seen: &mut HashSet<u32>) {
    ac.reported = true;
    if !selective_traffic {
        ac.requested = true;
    }
    newly_seen.insert(ac.icao);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SAMPLE_RATE;
    use crate::protocol::BeastPacketizer;
    use crate::tcp::{Endpoint, RECONNECT_DELAY};
    use crate::link::ReceiverInfo;

    const ICAO: u32 = 0xabcdef;

    /// Receiver sample counter at the start of each test. Real receivers
    /// have been running for a while, so counters are well past zero.
    const BASE: u64 = 1000 * SAMPLE_RATE;

    fn test_coordinator(selective: bool, random_drop: f64) -> Coordinator {
        let (input_endpoint, _input_events) =
            Endpoint::spawn("input-test", "127.0.0.1:9".to_string(), RECONNECT_DELAY);
        let (server_endpoint, _server_events) =
            Endpoint::spawn("server-test", "127.0.0.1:9".to_string(), RECONNECT_DELAY);

        let feed = InputFeed::new(input_endpoint, Box::new(BeastPacketizer::new()));
        let receiver = ReceiverInfo {
            lat: 52.2,
            lon: 0.1,
            alt: 15.0,
            user: "test-rig".to_string(),
            random_drop,
        };
        let mut link = ServerLink::new(server_endpoint, receiver, true);

        // Drive a real handshake so the link is ready.
        link.on_connected();
        let response = format!(
            "{{\"compress\":\"none\",\"selective_traffic\":{selective},\"heartbeat\":false}}\n"
        );
        link.on_data(response.as_bytes()).unwrap();

        let mut coordinator = Coordinator::new(feed, link, random_drop);
        coordinator.server_connected();
        coordinator
    }

    fn df11(timestamp: u64) -> Message {
        Message {
            df: 11,
            address: ICAO,
            timestamp,
            altitude: None,
            even_cpr: false,
            odd_cpr: false,
            valid: true,
            frame: vec![0x5d, 0xab, 0xcd, 0xef, 0x11, 0x22, 0x33],
        }
    }

    fn df0(timestamp: u64, altitude: i32) -> Message {
        Message {
            df: 0,
            address: ICAO,
            timestamp,
            altitude: Some(altitude),
            even_cpr: false,
            odd_cpr: false,
            valid: true,
            frame: vec![0x00, 0x00, 0x13, 0x38, 0x44, 0x55, 0x66],
        }
    }

    fn df17(timestamp: u64, even: bool) -> Message {
        Message {
            df: 17,
            address: ICAO,
            timestamp,
            altitude: Some(38000),
            even_cpr: even,
            odd_cpr: !even,
            valid: true,
            frame: vec![
                0x8d, 0xab, 0xcd, 0xef, 0x58, 0xc3, 0x82, 0xd6, 0x90, 0xc8, 0xac, 0x28, 0x63,
                0xa7,
            ],
        }
    }

    fn uplinked(coordinator: &Coordinator) -> Vec<String> {
        coordinator.link.pending_lines().to_vec()
    }

    #[tokio::test]
    async fn test_df11_bootstrap() {
        let mut coordinator = test_coordinator(false, 0.0);

        // First DF11 creates the record; a DF0 supplies altitude context.
        let step = SAMPLE_RATE / 10;
        coordinator.input_received_messages(vec![df11(BASE + step)]);
        coordinator.input_received_messages(vec![df0(BASE + 2 * step, 30000)]);

        // Nine more DF11s reach the stability threshold at message ten,
        // where the aircraft is reported rather than forwarded.
        for i in 3..=10 {
            coordinator.input_received_messages(vec![df11(BASE + i * step)]);
        }
        assert!(uplinked(&coordinator)
            .iter()
            .all(|line| !line.contains("mlat")));
        assert!(coordinator.newly_seen.contains(&ICAO));
        assert!(coordinator.aircraft[&ICAO].reported);

        // The report tick announces it once.
        coordinator.send_aircraft_report();
        assert!(uplinked(&coordinator).contains(&r#"{"seen":["abcdef"]}"#.to_string()));
        assert!(coordinator.newly_seen.is_empty());

        // Message eleven becomes an mlat candidate with altitude annotation.
        coordinator.input_received_messages(vec![df11(BASE + 11 * step)]);
        let lines = uplinked(&coordinator);
        let mlat = lines.last().unwrap();
        assert!(mlat.starts_with(r#"{"mlat":{"t":"#), "got {mlat}");
        assert!(mlat.ends_with(r#","a":30000}}"#), "got {mlat}");
    }

    #[tokio::test]
    async fn test_adsb_self_reporting_suppression() {
        let mut coordinator = test_coordinator(false, 0.0);

        // Twelve DF17 position frames, alternating even/odd, close in time.
        // The pair at message eleven reports the aircraft; the next pair is
        // the first sync candidate.
        for i in 1..=12u64 {
            coordinator
                .input_received_messages(vec![df17(BASE + i * SAMPLE_RATE / 100, i % 2 == 0)]);
        }

        let lines = uplinked(&coordinator);
        assert!(lines.iter().any(|line| line.starts_with(r#"{"sync":"#)));
        assert!(lines.iter().all(|line| !line.starts_with(r#"{"mlat":"#)));

        // While the aircraft keeps self-reporting, surveillance frames are
        // suppressed.
        coordinator.input_received_messages(vec![df0(BASE + SAMPLE_RATE, 38000)]);
        let lines = uplinked(&coordinator);
        assert!(lines.iter().all(|line| !line.starts_with(r#"{"mlat":"#)));

        // Once the last position is more than a minute old, they pass again.
        coordinator.input_received_messages(vec![df0(BASE + 62 * SAMPLE_RATE, 38000)]);
        let lines = uplinked(&coordinator);
        assert!(lines.iter().any(|line| line.starts_with(r#"{"mlat":"#)));
    }

    #[tokio::test]
    async fn test_selective_traffic() {
        let mut coordinator = test_coordinator(true, 0.0);
        let step = SAMPLE_RATE / 10;

        // Bootstrap: in selective mode a reported aircraft is not requested
        // until the server says so.
        coordinator.input_received_messages(vec![df11(BASE + step)]);
        coordinator.input_received_messages(vec![df0(BASE + 2 * step, 30000)]);
        for i in 3..=12 {
            coordinator.input_received_messages(vec![df11(BASE + i * step)]);
        }
        assert!(coordinator.aircraft[&ICAO].reported);
        assert!(!coordinator.aircraft[&ICAO].requested);
        assert!(uplinked(&coordinator)
            .iter()
            .all(|line| !line.starts_with(r#"{"mlat":"#)));

        // start_sending enables emission.
        coordinator.start_sending(&[ICAO]);
        coordinator.input_received_messages(vec![df11(BASE + 13 * step)]);
        assert!(uplinked(&coordinator)
            .iter()
            .any(|line| line.starts_with(r#"{"mlat":"#)));

        // stop_sending disables it again.
        coordinator.stop_sending(&[ICAO]);
        let before = uplinked(&coordinator).len();
        coordinator.input_received_messages(vec![df11(BASE + 14 * step)]);
        assert_eq!(uplinked(&coordinator).len(), before);
        assert!(!coordinator.requested_traffic.contains(&ICAO));
    }

    #[tokio::test]
    async fn test_expiry_with_lost_notification() {
        let mut coordinator = test_coordinator(false, 0.0);
        let step = SAMPLE_RATE / 10;

        coordinator.input_received_messages(vec![df11(BASE + step)]);
        coordinator.input_received_messages(vec![df0(BASE + 2 * step, 30000)]);
        for i in 3..=10 {
            coordinator.input_received_messages(vec![df11(BASE + i * step)]);
        }
        assert!(coordinator.aircraft[&ICAO].reported);

        // Another aircraft advances receiver time past the expiry horizon.
        let mut other = df11(BASE + 10 * step + 61 * SAMPLE_RATE);
        other.address = 0x4840d6;
        coordinator.input_received_messages(vec![other]);

        coordinator.expire();
        assert!(!coordinator.aircraft.contains_key(&ICAO));
        assert!(uplinked(&coordinator).contains(&r#"{"lost":["abcdef"]}"#.to_string()));

        // The never-reported second aircraft survives the sweep, and the
        // reported one was batched exactly once.
        assert!(coordinator.aircraft.contains_key(&0x4840d6));
        let lost_lines = uplinked(&coordinator)
            .iter()
            .filter(|line| line.starts_with(r#"{"lost":"#))
            .count();
        assert_eq!(lost_lines, 1);
    }

    #[tokio::test]
    async fn test_timestamp_regression_stops_batch() {
        let mut coordinator = test_coordinator(false, 0.0);
        let step = SAMPLE_RATE / 10;

        coordinator.input_received_messages(vec![df11(BASE + 10 * step)]);
        assert_eq!(coordinator.last_rcv_timestamp, BASE + 10 * step);

        // A regressed batch is dropped wholesale, including the in-order
        // messages that follow the regression.
        coordinator.input_received_messages(vec![df11(BASE + 5 * step), df11(BASE + 11 * step)]);
        assert_eq!(coordinator.last_rcv_timestamp, BASE + 10 * step);
        assert_eq!(coordinator.aircraft[&ICAO].messages, 1);

        // Progress resumes once sample counts pass the stored maximum.
        coordinator.input_received_messages(vec![df11(BASE + 12 * step)]);
        assert_eq!(coordinator.aircraft[&ICAO].messages, 2);
    }

    #[tokio::test]
    async fn test_invalid_message_stops_batch() {
        let mut coordinator = test_coordinator(false, 0.0);
        let step = SAMPLE_RATE / 10;

        let mut bad = df11(BASE + 2 * step);
        bad.valid = false;
        coordinator.input_received_messages(vec![df11(BASE + step), bad, df11(BASE + 3 * step)]);

        assert_eq!(coordinator.aircraft[&ICAO].messages, 1);
        // The invalid frame still advanced receiver time.
        assert_eq!(coordinator.last_rcv_timestamp, BASE + 2 * step);
    }

    #[tokio::test]
    async fn test_random_drop_rate() {
        // Cutoff 127 drops trailing bytes 0..=126, i.e. 127/256 of a
        // uniform distribution.
        let mut coordinator = test_coordinator(false, 0.5);
        assert_eq!(coordinator.random_drop_cutoff, 127);

        let mut accepted = 0u32;
        let mut timestamp = BASE;
        for i in 0..10_000u32 {
            let mut message = df11(timestamp);
            *message.frame.last_mut().unwrap() = (i % 256) as u8;
            timestamp += 1;
            let before = coordinator
                .aircraft
                .get(&ICAO)
                .map_or(0, |ac| ac.messages);
            coordinator.input_received_messages(vec![message]);
            let after = coordinator
                .aircraft
                .get(&ICAO)
                .map_or(0, |ac| ac.messages);
            accepted += after - before;
        }

        let rate = f64::from(accepted) / 10_000.0;
        let expected = f64::from(256 - 127) / 256.0;
        assert!((rate - expected).abs() < 0.02, "accept rate {rate}");
    }

    #[tokio::test]
    async fn test_server_reconnect_resets_state() {
        let mut coordinator = test_coordinator(false, 0.0);
        let step = SAMPLE_RATE / 10;

        coordinator.input_received_messages(vec![df11(BASE + step)]);
        coordinator.input_received_messages(vec![df0(BASE + 2 * step, 30000)]);
        for i in 3..=10 {
            coordinator.input_received_messages(vec![df11(BASE + i * step)]);
        }
        assert!(!coordinator.aircraft.is_empty());
        assert!(!coordinator.newly_seen.is_empty());

        coordinator.server_connected();
        assert!(coordinator.aircraft.is_empty());
        assert!(coordinator.newly_seen.is_empty());
        assert!(coordinator.requested_traffic.is_empty());
    }
}

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

//! Protocol layer for receiver input parsing.
//!
//! This module provides a trait-based abstraction over the receiver wire
//! format. The only format currently implemented is the Beast binary framing
//! produced by dump1090-style decoders; alternative packetizers can be
//! plugged in by implementing [`Packetizer`].

mod beast;

pub use beast::BeastPacketizer;

/// A demodulated Mode S frame with the metadata the selection pipeline needs.
///
/// Fields are public so that alternative [`Packetizer`] implementations can
/// construct messages. Decoding stops at the handful of fields used for
/// multilateration; full ADS-B payload decoding is the server's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// 5-bit downlink format code (0..31).
    pub df: u8,
    /// 24-bit ICAO aircraft address.
    pub address: u32,
    /// 48-bit sample count at 12 MHz, monotonic per receiver.
    pub timestamp: u64,
    /// Pressure altitude in feet, when the frame carries one.
    pub altitude: Option<i32>,
    /// True for an ES airborne-position frame with the even CPR format bit.
    pub even_cpr: bool,
    /// True for an ES airborne-position frame with the odd CPR format bit.
    pub odd_cpr: bool,
    /// True when the frame passed parity.
    pub valid: bool,
    /// Raw Mode S frame bytes, checksum included.
    pub frame: Vec<u8>,
}

impl Message {
    /// The raw frame rendered as lowercase hex, no separators.
    #[must_use]
    pub fn hex(&self) -> String {
        hex::encode(&self.frame)
    }

    /// Trailing checksum byte, used as a uniform-random selector by the
    /// random-drop sampler.
    #[must_use]
    pub fn random_byte(&self) -> u8 {
        self.frame.last().copied().unwrap_or(0)
    }
}

/// Splits a receiver byte stream into messages.
///
/// `packetize` consumes a prefix of `buffer` and returns its length together
/// with the messages decoded from it, in stream order. A partially received
/// frame at the end of the buffer must not be consumed, so feeding the same
/// stream in arbitrary chunks yields the same message sequence. When more
/// bytes are required the result is `(0, vec![])`.
pub trait Packetizer {
    fn packetize(&mut self, buffer: &[u8]) -> (usize, Vec<Message>);
}

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

//! Beast binary framing parser.
//!
//! The Beast format wraps each demodulated frame as
//! `0x1A <type> <6-byte timestamp> <1-byte signal> <payload>`, where `0x1A`
//! bytes inside the frame body are escaped by doubling. Type `0x31` carries a
//! 2-byte Mode A/C reply (skipped here), `0x32` a 7-byte Mode S short frame
//! and `0x33` a 14-byte Mode S long frame. The timestamp is a big-endian
//! 48-bit sample count at 12 MHz.

use super::{Message, Packetizer};

const ESCAPE: u8 = 0x1a;
const KIND_MODE_AC: u8 = 0x31;
const KIND_MODE_S_SHORT: u8 = 0x32;
const KIND_MODE_S_LONG: u8 = 0x33;

/// Mode S CRC-24 generator polynomial.
const CRC_POLY: u32 = 0x00ff_f409;

/// Packetizer for the Beast binary format.
///
/// Stateless: buffering of partial frames is the caller's job. Garbage bytes
/// are skipped by resynchronising on the next frame marker rather than
/// reported as errors.
#[derive(Debug, Default)]
pub struct BeastPacketizer;

impl BeastPacketizer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Packetizer for BeastPacketizer {
    fn packetize(&mut self, buffer: &[u8]) -> (usize, Vec<Message>) {
        let mut pos = 0;
        let mut messages = Vec::new();

        while pos < buffer.len() {
            if buffer[pos] != ESCAPE {
                // Resynchronise on the next frame marker.
                match buffer[pos..].iter().position(|&b| b == ESCAPE) {
                    Some(skip) => pos += skip,
                    None => {
                        pos = buffer.len();
                        break;
                    }
                }
                continue;
            }

            let Some(&kind) = buffer.get(pos + 1) else {
                break; // need more data to tell escape from frame start
            };
            let payload_len = match kind {
                KIND_MODE_AC => 2,
                KIND_MODE_S_SHORT => 7,
                KIND_MODE_S_LONG => 14,
                _ => {
                    pos += 1;
                    continue;
                }
            };

            match unescape_body(&buffer[pos + 2..], 7 + payload_len) {
                Body::Complete { body, consumed } => {
                    pos += 2 + consumed;
                    if kind != KIND_MODE_AC {
                        let timestamp = be48(&body[..6]);
                        messages.push(decode_mode_s(timestamp, &body[7..]));
                    }
                }
                Body::Truncated { garbage } => pos += 2 + garbage,
                Body::Incomplete => break,
            }
        }

        (pos, messages)
    }
}

enum Body {
    /// A full unescaped frame body and the raw bytes it covered.
    Complete { body: Vec<u8>, consumed: usize },
    /// The body was cut short by the start of a new frame; `garbage` raw
    /// bytes should be discarded.
    Truncated { garbage: usize },
    /// More input is required.
    Incomplete,
}

fn unescape_body(input: &[u8], want: usize) -> Body {
    let mut body = Vec::with_capacity(want);
    let mut i = 0;
    while body.len() < want {
        match input.get(i) {
            None => return Body::Incomplete,
            Some(&ESCAPE) => match input.get(i + 1) {
                None => return Body::Incomplete,
                Some(&ESCAPE) => {
                    body.push(ESCAPE);
                    i += 2;
                }
                Some(_) => return Body::Truncated { garbage: i },
            },
            Some(&byte) => {
                body.push(byte);
                i += 1;
            }
        }
    }
    Body::Complete { body, consumed: i }
}

fn be48(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

/// Extract the fields the selection pipeline cares about from a raw Mode S
/// frame.
///
/// Parity handling depends on the downlink format: DF11 and DF17/18 carry
/// the aircraft address in the clear and the CRC residual must be (nearly)
/// zero, while the remaining formats overlay the address onto the checksum,
/// so the residual *is* the address and parity cannot be checked.
fn decode_mode_s(timestamp: u64, data: &[u8]) -> Message {
    let df = data[0] >> 3;
    let residual = crc_residual(data);

    let (address, valid) = match df {
        // All-call replies may fold the interrogator code into the low bits.
        11 => (aa_address(data), residual & 0x00ff_ff80 == 0),
        17 | 18 => (aa_address(data), residual == 0),
        _ => (residual, true),
    };

    let mut altitude = None;
    let mut even_cpr = false;
    let mut odd_cpr = false;
    match df {
        0 | 4 | 16 | 20 => {
            let field = (u16::from(data[2] & 0x1f) << 8) | u16::from(data[3]);
            altitude = decode_ac13(field);
        }
        17 | 18 => {
            let tc = data[4] >> 3;
            if (9..=18).contains(&tc) || (20..=22).contains(&tc) {
                let field = (u16::from(data[5]) << 4) | u16::from(data[6] >> 4);
                altitude = decode_ac12(field);
                if data[6] & 0x04 == 0 {
                    even_cpr = true;
                } else {
                    odd_cpr = true;
                }
            }
        }
        _ => {}
    }

    Message {
        df,
        address,
        timestamp,
        altitude,
        even_cpr,
        odd_cpr,
        valid,
        frame: data.to_vec(),
    }
}

fn aa_address(data: &[u8]) -> u32 {
    (u32::from(data[1]) << 16) | (u32::from(data[2]) << 8) | u32::from(data[3])
}

fn crc_residual(frame: &[u8]) -> u32 {
    let n = frame.len();
    let parity =
        (u32::from(frame[n - 3]) << 16) | (u32::from(frame[n - 2]) << 8) | u32::from(frame[n - 1]);
    crc24(&frame[..n - 3]) ^ parity
}

fn crc24(data: &[u8]) -> u32 {
    let mut crc = 0u32;
    for &byte in data {
        crc ^= u32::from(byte) << 16;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x0100_0000 != 0 {
                crc ^= CRC_POLY;
            }
        }
    }
    crc & 0x00ff_ffff
}

/// Decode the 13-bit altitude code of DF 0/4/16/20.
///
/// Only the 25 ft Q-bit encoding is handled; metric and Gillham-coded
/// altitudes are rare enough that the frame is treated as altitude-free.
fn decode_ac13(field: u16) -> Option<i32> {
    if field == 0 || field & 0x0040 != 0 || field & 0x0010 == 0 {
        return None;
    }
    let n = i32::from(((field & 0x1f80) >> 2) | ((field & 0x0020) >> 1) | (field & 0x000f));
    Some(n * 25 - 1000)
}

/// Decode the 12-bit altitude code of ES airborne-position frames.
fn decode_ac12(field: u16) -> Option<i32> {
    if field == 0 || field & 0x0010 == 0 {
        return None;
    }
    let n = i32::from(((field & 0x0fe0) >> 1) | (field & 0x000f));
    Some(n * 25 - 1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Canonical frames from "The 1090 Megahertz Riddle".
    const DF17_EVEN: &str = "8d40621d58c382d690c8ac2863a7";
    const DF17_ODD: &str = "8d40621d58c386435cc412692ad6";
    const DF11: &str = "5d4840d6202cc3";

    fn wire_frame(kind: u8, timestamp: u64, signal: u8, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&timestamp.to_be_bytes()[2..]);
        body.push(signal);
        body.extend_from_slice(payload);

        let mut out = vec![ESCAPE, kind];
        for byte in body {
            out.push(byte);
            if byte == ESCAPE {
                out.push(ESCAPE);
            }
        }
        out
    }

    /// Build a short surveillance frame whose parity overlays `icao`.
    fn overlay_frame(head: &[u8], icao: u32) -> Vec<u8> {
        let mut frame = head.to_vec();
        let parity = crc24(head) ^ icao;
        frame.push((parity >> 16) as u8);
        frame.push((parity >> 8) as u8);
        frame.push(parity as u8);
        frame
    }

    fn packetize_all(stream: &[u8]) -> Vec<Message> {
        let mut packetizer = BeastPacketizer::new();
        let (consumed, messages) = packetizer.packetize(stream);
        assert_eq!(consumed, stream.len());
        messages
    }

    #[test]
    fn test_df17_position_even() {
        let payload = hex::decode(DF17_EVEN).unwrap();
        let stream = wire_frame(KIND_MODE_S_LONG, 1_234_567, 0x60, &payload);
        let messages = packetize_all(&stream);
        assert_eq!(messages.len(), 1);

        let msg = &messages[0];
        assert_eq!(msg.df, 17);
        assert_eq!(msg.address, 0x40621d);
        assert_eq!(msg.timestamp, 1_234_567);
        assert_eq!(msg.altitude, Some(38000));
        assert!(msg.even_cpr);
        assert!(!msg.odd_cpr);
        assert!(msg.valid);
        assert_eq!(msg.hex(), DF17_EVEN);
    }

    #[test]
    fn test_df17_position_odd() {
        let payload = hex::decode(DF17_ODD).unwrap();
        let stream = wire_frame(KIND_MODE_S_LONG, 42, 0, &payload);
        let messages = packetize_all(&stream);
        assert!(messages[0].odd_cpr);
        assert!(!messages[0].even_cpr);
        assert_eq!(messages[0].altitude, Some(38000));
        assert!(messages[0].valid);
    }

    #[test]
    fn test_df17_corrupt_frame_is_invalid() {
        let mut payload = hex::decode(DF17_EVEN).unwrap();
        payload[5] ^= 0x40;
        let stream = wire_frame(KIND_MODE_S_LONG, 42, 0, &payload);
        let messages = packetize_all(&stream);
        assert!(!messages[0].valid);
    }

    #[test]
    fn test_df11_all_call() {
        let payload = hex::decode(DF11).unwrap();
        let stream = wire_frame(KIND_MODE_S_SHORT, 99, 0, &payload);
        let messages = packetize_all(&stream);
        assert_eq!(messages[0].df, 11);
        assert_eq!(messages[0].address, 0x4840d6);
        assert!(messages[0].valid);
        assert_eq!(messages[0].altitude, None);
    }

    #[test]
    fn test_df4_altitude_and_overlay_address() {
        // AC13 field 0x1338: Q-bit encoding of 30000 ft.
        let payload = overlay_frame(&[0x20, 0x00, 0x13, 0x38], 0xabcdef);
        let stream = wire_frame(KIND_MODE_S_SHORT, 7, 0, &payload);
        let messages = packetize_all(&stream);
        assert_eq!(messages[0].df, 4);
        assert_eq!(messages[0].address, 0xabcdef);
        assert_eq!(messages[0].altitude, Some(30000));
        assert!(messages[0].valid);
    }

    #[test]
    fn test_df17_non_position_has_no_cpr() {
        // Extended squitter with type code 0: no position, no altitude.
        let payload = hex::decode("8d4bb463003d10000000001b5bec").unwrap();
        let stream = wire_frame(KIND_MODE_S_LONG, 1, 0, &payload);
        let messages = packetize_all(&stream);
        assert!(messages[0].valid);
        assert_eq!(messages[0].altitude, None);
        assert!(!messages[0].even_cpr);
        assert!(!messages[0].odd_cpr);
    }

    #[test]
    fn test_mode_ac_skipped() {
        let stream = wire_frame(KIND_MODE_AC, 5, 0, &[0x12, 0x34]);
        let messages = packetize_all(&stream);
        assert!(messages.is_empty());
    }

    #[test]
    fn test_resync_over_garbage() {
        let mut stream = vec![0x00, 0x47, 0xff];
        stream.extend(wire_frame(
            KIND_MODE_S_SHORT,
            3,
            0,
            &hex::decode(DF11).unwrap(),
        ));
        let messages = packetize_all(&stream);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_aborted_frame_resyncs_on_next_marker() {
        // A frame cut off mid-body by the next frame marker is discarded.
        let mut stream = vec![ESCAPE, KIND_MODE_S_SHORT, 0x01, 0x02, 0x03];
        stream.extend(wire_frame(
            KIND_MODE_S_SHORT,
            3,
            0,
            &hex::decode(DF11).unwrap(),
        ));
        let messages = packetize_all(&stream);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].address, 0x4840d6);
    }

    #[test]
    fn test_partial_frame_not_consumed() {
        let stream = wire_frame(KIND_MODE_S_LONG, 42, 0, &hex::decode(DF17_EVEN).unwrap());
        let mut packetizer = BeastPacketizer::new();

        let (consumed, messages) = packetizer.packetize(&stream[..10]);
        assert_eq!(consumed, 0);
        assert!(messages.is_empty());

        let (consumed, messages) = packetizer.packetize(&stream);
        assert_eq!(consumed, stream.len());
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_chunking_idempotence() {
        // Timestamps with 0x1a bytes exercise the escaping path.
        let mut stream = Vec::new();
        stream.extend(wire_frame(
            KIND_MODE_S_SHORT,
            0x0000_1a1a_001a,
            0x1a,
            &hex::decode(DF11).unwrap(),
        ));
        stream.extend([0xde, 0xad]);
        stream.extend(wire_frame(
            KIND_MODE_S_LONG,
            0x1a00_0000_0001,
            0x20,
            &hex::decode(DF17_EVEN).unwrap(),
        ));
        stream.extend(wire_frame(
            KIND_MODE_S_LONG,
            0x1a00_0000_0002,
            0x20,
            &hex::decode(DF17_ODD).unwrap(),
        ));

        let whole = packetize_all(&stream);
        assert_eq!(whole.len(), 3);

        for chunk_size in [1, 2, 3, 7, 16] {
            let mut packetizer = BeastPacketizer::new();
            let mut buffer: Vec<u8> = Vec::new();
            let mut chunked = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                buffer.extend_from_slice(chunk);
                let (consumed, messages) = packetizer.packetize(&buffer);
                buffer.drain(..consumed);
                chunked.extend(messages);
            }
            assert_eq!(chunked, whole, "chunk size {chunk_size}");
        }
    }
}

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

//! Wall-clock and receiver-timestamp helpers.
//!
//! Receiver timestamps are 48-bit sample counts from a 12 MHz clock, so
//! durations expressed in seconds must be scaled before they can be compared
//! against `Message::timestamp` values.

use chrono::{DateTime, Utc};

/// Receiver sample rate in samples per second.
pub const SAMPLE_RATE: u64 = 12_000_000;

/// Convert a duration in whole seconds to receiver sample counts.
#[must_use]
pub const fn ts(seconds: u64) -> u64 {
    seconds * SAMPLE_RATE
}

/// Wall-clock time as seconds since the Unix epoch.
#[must_use]
pub fn wall_seconds(now: DateTime<Utc>) -> f64 {
    now.timestamp_millis() as f64 / 1000.0
}

/// Round a seconds value to one decimal place.
#[must_use]
pub fn round_tenths(seconds: f64) -> f64 {
    (seconds * 10.0).round() / 10.0
}

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

use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use mlat_client::{Client, Config, ReceiverInfo};

/// Validate a latitude in decimal degrees.
fn latitude(s: &str) -> Result<f64, String> {
    let lat: f64 = s
        .parse()
        .map_err(|_| format!("invalid latitude '{s}'"))?;
    if !(-90.0..=90.0).contains(&lat) {
        return Err(format!("latitude {s} must be in the range -90 to 90"));
    }
    Ok(lat)
}

/// Validate a longitude in decimal degrees; values above 180 wrap westward.
fn longitude(s: &str) -> Result<f64, String> {
    let mut lon: f64 = s
        .parse()
        .map_err(|_| format!("invalid longitude '{s}'"))?;
    if !(-180.0..=360.0).contains(&lon) {
        return Err(format!("longitude {s} must be in the range -180 to 360"));
    }
    if lon > 180.0 {
        lon -= 360.0;
    }
    Ok(lon)
}

/// Parse an altitude with an optional unit suffix into metres.
///
/// The habitable range runs from the shore of the Dead Sea to a bit above
/// La Rinconada, Peru.
fn altitude(s: &str) -> Result<f64, String> {
    let alt = if let Some(feet) = s.strip_suffix("ft") {
        feet.parse::<f64>()
            .map_err(|_| format!("invalid altitude '{s}'"))?
            * 0.3048
    } else if let Some(metres) = s.strip_suffix('m') {
        metres
            .parse::<f64>()
            .map_err(|_| format!("invalid altitude '{s}'"))?
    } else {
        s.parse::<f64>()
            .map_err(|_| format!("invalid altitude '{s}'"))?
    };
    if !(-420.0..=5100.0).contains(&alt) {
        return Err(format!("altitude {s} must be in the range -420m to 5100m"));
    }
    Ok(alt)
}

/// Client for a Mode S multilateration network.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Latitude of the receiver, in decimal degrees
    #[arg(long, value_parser = latitude, allow_hyphen_values = true)]
    lat: f64,

    /// Longitude of the receiver, in decimal degrees
    #[arg(long, value_parser = longitude, allow_hyphen_values = true)]
    lon: f64,

    /// Altitude of the receiver (AMSL), in metres unless suffixed with 'm' or 'ft'
    #[arg(long, value_parser = altitude, allow_hyphen_values = true)]
    alt: f64,

    /// User information to give to the server, used to get in touch if there
    /// are problems
    #[arg(long)]
    user: String,

    /// Host to connect to for Mode S traffic in the Beast binary format
    #[arg(long)]
    input_host: String,

    /// Port to connect to for Mode S traffic
    #[arg(long, default_value_t = 30005, value_parser = clap::value_parser!(u16).range(1..))]
    input_port: u16,

    /// Host of the multilateration server
    #[arg(long, default_value = "mlat.mutability.co.uk")]
    output_host: String,

    /// Port of the multilateration server
    #[arg(long, default_value_t = 40147, value_parser = clap::value_parser!(u16).range(1..))]
    output_port: u16,

    /// Don't offer zlib compression to the multilateration server
    #[arg(long)]
    no_compression: bool,

    /// Drop this percentage of received messages
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=100))]
    random_drop: u8,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = CliArgs::parse();

    let config = Config {
        input_address: format!("{}:{}", args.input_host, args.input_port),
        server_address: format!("{}:{}", args.output_host, args.output_port),
        receiver: ReceiverInfo {
            lat: args.lat,
            lon: args.lon,
            alt: args.alt,
            user: args.user,
            random_drop: f64::from(args.random_drop) / 100.0,
        },
        offer_zlib: !args.no_compression,
    };

    let client = Client::spawn(config);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    if let Err(e) = client.run(shutdown).await {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latitude_range() {
        assert!(latitude("52.2").is_ok());
        assert!(latitude("-90").is_ok());
        assert!(latitude("90.5").is_err());
        assert!(latitude("north").is_err());
    }

    #[test]
    fn test_longitude_wraps_westward() {
        assert_eq!(longitude("200").unwrap(), -160.0);
        assert_eq!(longitude("0.1").unwrap(), 0.1);
        assert!(longitude("361").is_err());
    }

    #[test]
    fn test_altitude_units() {
        assert_eq!(altitude("15").unwrap(), 15.0);
        assert_eq!(altitude("15m").unwrap(), 15.0);
        assert!((altitude("100ft").unwrap() - 30.48).abs() < 1e-9);
        assert!(altitude("6000").is_err());
        assert!(altitude("-500").is_err());
    }
}

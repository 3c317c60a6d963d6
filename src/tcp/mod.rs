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

//! Async TCP endpoint layer with automatic reconnection.
//!
//! Each endpoint runs in a background task that owns the socket and does
//! nothing but raw I/O. State transitions are reported as events on a
//! channel, so the owner can keep all of its own state mutation in a single
//! place. An endpoint starts out parked: nothing happens until the owner
//! asks for a connection.

use std::time::Duration;

use log::{info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Upper bound on unsent outbound data before the connection is dropped.
pub const MAX_WRITE_BUFFER: usize = 65536;

/// Default delay before a reconnection attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(30);

const READ_CHUNK: usize = 16384;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Events emitted by an endpoint task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    /// The TCP connection is established.
    Connected,
    /// Bytes arrived from the peer.
    Data(Vec<u8>),
    /// The connection is gone, for any reason.
    Lost,
}

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect(String),
    CloseLost(String),
    Send(Vec<u8>),
    SetReconnectDelay(Duration),
}

/// Handle to a managed TCP connection.
///
/// Dropping the handle shuts the background task down.
#[derive(Debug, Clone)]
pub struct Endpoint {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Endpoint {
    /// Spawn an endpoint task for `address` and return the command handle
    /// plus the event stream. The task stays idle until [`Endpoint::connect`]
    /// is called.
    #[must_use]
    pub fn spawn(
        name: &'static str,
        address: String,
        reconnect_delay: Duration,
    ) -> (Self, mpsc::Receiver<EndpointEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(endpoint_loop(name, address, reconnect_delay, cmd_rx, event_tx));

        (Self { cmd_tx }, event_rx)
    }

    /// Ask for a connection attempt. A no-op while already connected.
    pub fn connect(&self) {
        let _ = self.cmd_tx.send(Command::Connect);
    }

    /// Tear the connection down and stay down until the next
    /// [`Endpoint::connect`].
    pub fn disconnect(&self, reason: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::Disconnect(reason.into()));
    }

    /// Tear the connection down as if the peer had failed, scheduling a
    /// reconnect.
    pub fn close_lost(&self, reason: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::CloseLost(reason.into()));
    }

    /// Queue bytes for transmission.
    pub fn send(&self, bytes: Vec<u8>) {
        let _ = self.cmd_tx.send(Command::Send(bytes));
    }

    /// Override the delay used before reconnection attempts.
    pub fn set_reconnect_delay(&self, delay: Duration) {
        let _ = self.cmd_tx.send(Command::SetReconnectDelay(delay));
    }
}

enum Teardown {
    /// The owner asked for the teardown; park until the next connect.
    Manual,
    /// The connection failed; schedule a reconnect.
    Lost,
    /// The owner is gone; exit the task.
    Shutdown,
}

async fn endpoint_loop(
    name: &'static str,
    address: String,
    mut delay: Duration,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::Sender<EndpointEvent>,
) {
    'idle: loop {
        // Parked: wait for the owner to ask for a connection.
        loop {
            match cmd_rx.recv().await {
                None => return,
                Some(Command::Connect) => break,
                Some(Command::SetReconnectDelay(d)) => delay = d,
                Some(Command::Disconnect(_) | Command::CloseLost(_) | Command::Send(_)) => {}
            }
        }

        loop {
            info!("{name}: connecting to {address}");
            match TcpStream::connect(&address).await {
                Ok(stream) => {
                    info!("{name}: connected to {address}");
                    if event_tx.send(EndpointEvent::Connected).await.is_err() {
                        return;
                    }
                    match run_connected(name, stream, &mut cmd_rx, &event_tx, &mut delay).await {
                        Teardown::Manual => continue 'idle,
                        Teardown::Lost => {}
                        Teardown::Shutdown => return,
                    }
                }
                Err(e) => warn!("{name}: connection to {address} failed: {e}"),
            }

            info!("{name}: reconnecting in {} seconds", delay.as_secs_f64());
            let retry = tokio::time::sleep(delay);
            tokio::pin!(retry);
            loop {
                tokio::select! {
                    () = &mut retry => break,
                    cmd = cmd_rx.recv() => match cmd {
                        None => return,
                        Some(Command::Connect) => break,
                        Some(Command::Disconnect(reason)) => {
                            info!("{name}: disconnecting: {reason}");
                            continue 'idle;
                        }
                        Some(Command::SetReconnectDelay(d)) => delay = d,
                        Some(Command::CloseLost(_) | Command::Send(_)) => {}
                    },
                }
            }
        }
    }
}

async fn run_connected(
    name: &str,
    stream: TcpStream,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    event_tx: &mpsc::Sender<EndpointEvent>,
    delay: &mut Duration,
) -> Teardown {
    let (mut reader, mut writer) = stream.into_split();
    let mut readbuf = vec![0u8; READ_CHUNK];
    let mut writebuf: Vec<u8> = Vec::new();

    loop {
        tokio::select! {
            read = reader.read(&mut readbuf) => match read {
                Ok(0) => {
                    info!("{name}: connection closed by peer");
                    break;
                }
                Ok(n) => {
                    if event_tx.send(EndpointEvent::Data(readbuf[..n].to_vec())).await.is_err() {
                        return Teardown::Shutdown;
                    }
                }
                Err(e) => {
                    warn!("{name}: read error: {e}");
                    break;
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                None => return Teardown::Shutdown,
                Some(Command::Send(bytes)) => {
                    writebuf.extend_from_slice(&bytes);
                    if writebuf.len() > MAX_WRITE_BUFFER {
                        warn!("{name}: write buffer overflow (too much unsent data)");
                        break;
                    }
                }
                Some(Command::Disconnect(reason)) => {
                    info!("{name}: disconnecting: {reason}");
                    let _ = event_tx.send(EndpointEvent::Lost).await;
                    return Teardown::Manual;
                }
                Some(Command::CloseLost(reason)) => {
                    warn!("{name}: closing connection: {reason}");
                    break;
                }
                Some(Command::SetReconnectDelay(d)) => *delay = d,
                Some(Command::Connect) => {}
            },
            writable = writer.writable(), if !writebuf.is_empty() => match writable {
                Ok(()) => match writer.try_write(&writebuf) {
                    Ok(n) => {
                        writebuf.drain(..n);
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        warn!("{name}: write error: {e}");
                        break;
                    }
                },
                Err(e) => {
                    warn!("{name}: write error: {e}");
                    break;
                }
            },
        }
    }

    let _ = event_tx.send(EndpointEvent::Lost).await;
    Teardown::Lost
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_send_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let (endpoint, mut events) = Endpoint::spawn("test", address, Duration::from_secs(1));
        endpoint.connect();

        let (mut peer, _) = listener.accept().await.unwrap();
        assert_eq!(events.recv().await, Some(EndpointEvent::Connected));

        endpoint.send(b"hello".to_vec());
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        peer.write_all(b"world").await.unwrap();
        match events.recv().await {
            Some(EndpointEvent::Data(data)) => assert_eq!(data, b"world"),
            other => panic!("unexpected event {other:?}"),
        }

        drop(peer);
        assert_eq!(events.recv().await, Some(EndpointEvent::Lost));
    }

    #[tokio::test]
    async fn test_manual_disconnect_reports_loss() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let (endpoint, mut events) = Endpoint::spawn("test", address, Duration::from_secs(1));
        endpoint.connect();
        let (_peer, _) = listener.accept().await.unwrap();
        assert_eq!(events.recv().await, Some(EndpointEvent::Connected));

        endpoint.disconnect("done with it");
        assert_eq!(events.recv().await, Some(EndpointEvent::Lost));
    }
}

//! Scripted in-process MQTT 3.1.1 broker for session tests
//!
//! Serves a single client connection. It accepts CONNECT, grants or rejects SUBSCRIBE
//! filters, routes the client's own QoS 0 publishes back to it, answers PINGREQ and
//! UNSUBSCRIBE, and lets a test push messages or drop the socket.

#![allow(dead_code)]

use mqtt_eventbus::config::ConnectionConfig;
use mqtt_eventbus::topic_matches;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const CONNECT: u8 = 1;
const PUBLISH: u8 = 3;
const SUBSCRIBE: u8 = 8;
const UNSUBSCRIBE: u8 = 10;
const PINGREQ: u8 = 12;
const DISCONNECT: u8 = 14;

const SUBACK_FAILURE: u8 = 0x80;

pub type Published = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

enum Command {
    Push { topic: String, payload: Vec<u8> },
    DropConnection,
}

pub struct FakeBroker {
    port: u16,
    commands: mpsc::UnboundedSender<Command>,
    published: Published,
}

impl FakeBroker {
    pub async fn start() -> Self {
        Self::start_rejecting(&[]).await
    }

    /// Broker that answers SUBSCRIBE for any of `rejected` with a failure return code
    pub async fn start_rejecting(rejected: &[&str]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let published = Published::default();

        let state = BrokerState {
            published: published.clone(),
            rejected: rejected.iter().map(|f| f.to_string()).collect(),
            subscriptions: Vec::new(),
        };
        tokio::spawn(serve(listener, command_rx, state));

        Self {
            port,
            commands,
            published,
        }
    }

    /// Plain TCP config for this broker with pacing disabled
    pub fn config(&self, client_id: &str) -> ConnectionConfig {
        let mut config = ConnectionConfig::new("127.0.0.1", self.port)
            .with_client_id(client_id)
            .with_min_publish_interval(Duration::ZERO);
        config.connect_timeout_secs = 5;
        config.publish_timeout_secs = 5;
        config
    }

    /// Send a PUBLISH to the client whether or not it subscribed
    pub fn push(&self, topic: &str, payload: &str) {
        let _ = self.commands.send(Command::Push {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        });
    }

    /// Close the socket without a DISCONNECT
    pub fn drop_connection(&self) {
        let _ = self.commands.send(Command::DropConnection);
    }

    /// Messages the client published, in arrival order
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }
}

struct BrokerState {
    published: Published,
    rejected: Vec<String>,
    subscriptions: Vec<String>,
}

async fn serve(
    listener: TcpListener,
    commands: mpsc::UnboundedReceiver<Command>,
    mut state: BrokerState,
) {
    let Ok((socket, _)) = listener.accept().await else {
        return;
    };
    let (reader, writer) = socket.into_split();
    let (packet_tx, packets) = mpsc::unbounded_channel();
    let reading = tokio::spawn(read_packets(reader, packet_tx));

    run_connection(writer, packets, commands, &mut state).await;
    // Dropping the read half with the write half closes the socket
    reading.abort();
}

async fn run_connection(
    mut writer: OwnedWriteHalf,
    mut packets: mpsc::UnboundedReceiver<(u8, Vec<u8>)>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    state: &mut BrokerState,
) {
    loop {
        let replies = tokio::select! {
            packet = packets.recv() => match packet {
                Some((header, body)) => match handle_packet(header, &body, state) {
                    Some(replies) => replies,
                    None => return,
                },
                None => return,
            },
            command = commands.recv() => match command {
                Some(Command::Push { topic, payload }) => vec![publish_frame(&topic, &payload)],
                Some(Command::DropConnection) | None => return,
            },
        };

        for reply in replies {
            if writer.write_all(&reply).await.is_err() {
                return;
            }
        }
    }
}

async fn read_packets(mut reader: OwnedReadHalf, packets: mpsc::UnboundedSender<(u8, Vec<u8>)>) {
    while let Some(packet) = read_packet(&mut reader).await {
        if packets.send(packet).is_err() {
            break;
        }
    }
}

async fn read_packet(reader: &mut OwnedReadHalf) -> Option<(u8, Vec<u8>)> {
    let header = reader.read_u8().await.ok()?;
    let mut length = 0usize;
    let mut shift = 0;
    loop {
        let byte = reader.read_u8().await.ok()?;
        length |= usize::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0; length];
    reader.read_exact(&mut body).await.ok()?;
    Some((header, body))
}

/// Replies to one client packet; `None` ends the connection
fn handle_packet(header: u8, body: &[u8], state: &mut BrokerState) -> Option<Vec<Vec<u8>>> {
    match header >> 4 {
        CONNECT => Some(vec![vec![0x20, 0x02, 0x00, 0x00]]),
        PUBLISH => {
            let (topic, rest) = read_string(body);
            // QoS 1 and 2 carry a packet id before the payload
            let payload = if (header >> 1) & 0x03 > 0 {
                &rest[2..]
            } else {
                rest
            };
            state
                .published
                .lock()
                .unwrap()
                .push((topic.clone(), payload.to_vec()));

            let routed = state
                .subscriptions
                .iter()
                .any(|filter| topic_matches(filter, &topic));
            if routed {
                Some(vec![publish_frame(&topic, payload)])
            } else {
                Some(Vec::new())
            }
        }
        SUBSCRIBE => {
            let mut suback = body[..2].to_vec();
            let mut rest = &body[2..];
            while !rest.is_empty() {
                let (filter, after) = read_string(rest);
                // Skip the requested QoS byte
                rest = &after[1..];
                if state.rejected.contains(&filter) {
                    suback.push(SUBACK_FAILURE);
                } else {
                    suback.push(0x01);
                    state.subscriptions.push(filter);
                }
            }
            Some(vec![frame(0x90, &suback)])
        }
        UNSUBSCRIBE => {
            let mut rest = &body[2..];
            while !rest.is_empty() {
                let (filter, after) = read_string(rest);
                rest = after;
                state.subscriptions.retain(|existing| *existing != filter);
            }
            Some(vec![frame(0xb0, &body[..2])])
        }
        PINGREQ => Some(vec![vec![0xd0, 0x00]]),
        DISCONNECT => None,
        _ => Some(Vec::new()),
    }
}

fn read_string(bytes: &[u8]) -> (String, &[u8]) {
    let len = usize::from(u16::from_be_bytes([bytes[0], bytes[1]]));
    let text = String::from_utf8_lossy(&bytes[2..2 + len]).into_owned();
    (text, &bytes[2 + len..])
}

fn frame(header: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![header];
    let mut remaining = body.len();
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if remaining == 0 {
            break;
        }
    }
    out.extend_from_slice(body);
    out
}

fn publish_frame(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 + topic.len() + payload.len());
    body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    body.extend_from_slice(topic.as_bytes());
    body.extend_from_slice(payload);
    frame(0x30, &body)
}

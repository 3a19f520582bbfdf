//! Minimal NATS client (text protocol over TCP).
//!
//! Supports CONNECT, PUB, SUB, MSG and PING/PONG, which is all the agent
//! uses. Any read error or EOF marks the connection lost; there is no
//! reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use super::{BusError, BusMessage, MessageBus, Subscription};

type Subscribers = Arc<StdMutex<HashMap<u64, mpsc::UnboundedSender<BusMessage>>>>;

/// Parsed `nats://[user:pass@]host[:port]` address.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NatsAddress {
    host: String,
    port: u16,
    user: Option<String>,
    pass: Option<String>,
}

fn parse_address(uri: &str) -> Result<NatsAddress, BusError> {
    let rest = uri.strip_prefix("nats://").unwrap_or(uri);
    let rest = rest.trim_end_matches('/');
    let (credentials, host_port) = match rest.rsplit_once('@') {
        Some((creds, host_port)) => (Some(creds), host_port),
        None => (None, rest),
    };
    let (user, pass) = match credentials {
        Some(creds) => match creds.split_once(':') {
            Some((u, p)) => (Some(u.to_string()), Some(p.to_string())),
            None => (Some(creds.to_string()), None),
        },
        None => (None, None),
    };
    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| BusError::InvalidAddress(uri.to_string()))?;
            (host.to_string(), port)
        }
        None => (host_port.to_string(), 4222),
    };
    if host.is_empty() {
        return Err(BusError::InvalidAddress(uri.to_string()));
    }
    Ok(NatsAddress {
        host,
        port,
        user,
        pass,
    })
}

#[derive(Debug, Serialize)]
struct ConnectOptions<'a> {
    verbose: bool,
    pedantic: bool,
    name: &'a str,
    lang: &'a str,
    version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pass: Option<&'a str>,
}

/// Header of a `MSG` line.
#[derive(Debug, PartialEq, Eq)]
struct MsgHeader {
    subject: String,
    sid: u64,
    reply_to: Option<String>,
    size: usize,
}

fn parse_msg_header(line: &str) -> Result<MsgHeader, BusError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let invalid = || BusError::Protocol(format!("malformed MSG line: {line}"));
    let (subject, sid, reply_to, size) = match parts.as_slice() {
        ["MSG", subject, sid, size] => (*subject, *sid, None, *size),
        ["MSG", subject, sid, reply, size] => (*subject, *sid, Some(*reply), *size),
        _ => return Err(invalid()),
    };
    Ok(MsgHeader {
        subject: subject.to_string(),
        sid: sid.parse().map_err(|_| invalid())?,
        reply_to: reply_to.map(str::to_string),
        size: size.parse().map_err(|_| invalid())?,
    })
}

pub struct NatsBus {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    subscribers: Subscribers,
    next_sid: AtomicU64,
    lost: Arc<watch::Sender<bool>>,
}

impl NatsBus {
    /// Connect and start the read loop.
    pub async fn connect(uri: &str, client_name: &str) -> Result<Arc<Self>, BusError> {
        let address = parse_address(uri)?;
        let stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut info_line = String::new();
        if reader.read_line(&mut info_line).await? == 0 {
            return Err(BusError::Disconnected);
        }
        if !info_line.starts_with("INFO") {
            return Err(BusError::Protocol(format!(
                "expected INFO, got: {}",
                info_line.trim_end()
            )));
        }

        let options = ConnectOptions {
            verbose: false,
            pedantic: false,
            name: client_name,
            lang: "rust",
            version: env!("CARGO_PKG_VERSION"),
            user: address.user.as_deref(),
            pass: address.pass.as_deref(),
        };
        let connect = serde_json::to_string(&options)
            .map_err(|e| BusError::Protocol(e.to_string()))?;

        let writer = Arc::new(Mutex::new(write_half));
        {
            let mut w = writer.lock().await;
            w.write_all(format!("CONNECT {connect}\r\nPING\r\n").as_bytes())
                .await?;
            w.flush().await?;
        }

        let (lost, _) = watch::channel(false);
        let bus = Arc::new(Self {
            writer: writer.clone(),
            subscribers: Arc::new(StdMutex::new(HashMap::new())),
            next_sid: AtomicU64::new(1),
            lost: Arc::new(lost),
        });

        tokio::spawn(read_loop(
            reader,
            writer,
            bus.subscribers.clone(),
            bus.lost.clone(),
        ));

        info!(host = %address.host, port = address.port, "Connected to message bus");
        Ok(bus)
    }

    async fn send(&self, frame: &[u8]) -> Result<(), BusError> {
        if *self.lost.borrow() {
            return Err(BusError::Disconnected);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut frame = format!("PUB {} {}\r\n", subject, payload.len()).into_bytes();
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(b"\r\n");
        self.send(&frame).await
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sid, tx);
        self.send(format!("SUB {subject} {sid}\r\n").as_bytes())
            .await?;
        debug!(subject = %subject, sid = sid, "Subscribed");
        Ok(Subscription::new(subject, rx))
    }

    fn connection_lost(&self) -> watch::Receiver<bool> {
        self.lost.subscribe()
    }
}

async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    subscribers: Subscribers,
    lost: Arc<watch::Sender<bool>>,
) {
    let result = read_frames(&mut reader, &writer, &subscribers).await;
    match result {
        Ok(()) => warn!("Message bus closed the connection"),
        Err(e) => error!(error = %e, "Message bus connection failed"),
    }
    lost.send_replace(true);
    // Dropping the senders ends every subscription.
    subscribers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

async fn read_frames(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &Mutex<OwnedWriteHalf>,
    subscribers: &Subscribers,
) -> Result<(), BusError> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end();

        if trimmed.starts_with("MSG ") {
            let header = parse_msg_header(trimmed)?;
            let mut payload = vec![0u8; header.size + 2];
            reader.read_exact(&mut payload).await?;
            payload.truncate(header.size);

            let sender = subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&header.sid)
                .cloned();
            if let Some(tx) = sender {
                let _ = tx.send(BusMessage {
                    subject: header.subject,
                    payload,
                    reply_to: header.reply_to,
                });
            }
        } else if trimmed == "PING" {
            let mut w = writer.lock().await;
            w.write_all(b"PONG\r\n").await?;
            w.flush().await?;
        } else if let Some(err) = trimmed.strip_prefix("-ERR") {
            warn!(error = %err.trim(), "Message bus reported an error");
        }
        // +OK, PONG and INFO need no action.
    }
}

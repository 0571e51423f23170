//! Shared handle to one IRC client and the writer task behind it.
//!
//! The writer task is the only owner of the client's joined-channel set.
//! Everything else (the read loop, command tasks, the event router) talks
//! to it through a bounded queue of [`Outbound`] requests, so a relay for a
//! channel is decided and written in the same step as the JOIN or PART that
//! changes membership.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cordirc_platform::Snowflake;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use crate::irc::Message;

/// Pending echoes remembered per channel.
const MAX_PENDING_ECHOES: usize = 32;
/// Requests written per flush.
const WRITE_BATCH: usize = 64;

pub(crate) enum Outbound {
    /// Written unconditionally.
    Lines(Vec<String>),
    /// Written only while the channel is joined.
    Relay { channel: Snowflake, lines: Vec<String> },
    /// One line per channel; each is written only if that channel is joined.
    EachJoined(Arc<HashMap<Snowflake, String>>),
    /// Mark joined and write `lines`; replies false if already joined.
    Join {
        channel: Snowflake,
        lines: Vec<String>,
        reply: oneshot::Sender<bool>,
    },
    /// Mark joined (writing `join_lines` if it was not), then write `lines`.
    Open {
        channel: Snowflake,
        join_lines: Vec<String>,
        lines: Vec<String>,
    },
    /// Unmark and write `lines`; replies false (and writes nothing) if not joined.
    Part {
        channel: Snowflake,
        lines: Vec<String>,
        reply: Option<oneshot::Sender<bool>>,
    },
    IsJoined {
        channel: Snowflake,
        reply: oneshot::Sender<bool>,
    },
    Close,
}

pub struct Client {
    pub id: String,
    server_name: String,
    tx: mpsc::Sender<Outbound>,
    healthy: AtomicBool,
    nick: RwLock<String>,
    caps: RwLock<HashSet<String>>,
    pending_echoes: Mutex<HashMap<Snowflake, VecDeque<String>>>,
}

impl Client {
    pub(crate) fn new(id: String, server_name: &str, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            server_name: server_name.to_string(),
            tx,
            healthy: AtomicBool::new(true),
            nick: RwLock::new("*".to_string()),
            caps: RwLock::new(HashSet::new()),
            pending_echoes: Mutex::new(HashMap::new()),
        }
    }

    fn enqueue(&self, out: Outbound) {
        if let Err(e) = self.tx.try_send(out) {
            if matches!(e, mpsc::error::TrySendError::Full(_)) {
                tracing::warn!(session_id = %self.id, "Send buffer full");
            }
            self.healthy.store(false, Ordering::Relaxed);
        }
    }

    /// False once a send was dropped; the read loop disconnects such clients.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn nick(&self) -> String {
        self.nick.read().clone()
    }

    pub fn set_nick(&self, nick: &str) {
        *self.nick.write() = nick.to_string();
    }

    pub fn has_cap(&self, cap: &str) -> bool {
        self.caps.read().contains(cap)
    }

    pub(crate) fn set_cap(&self, cap: &str, enabled: bool) {
        let mut caps = self.caps.write();
        if enabled {
            caps.insert(cap.to_string());
        } else {
            caps.remove(cap);
        }
    }

    pub fn caps(&self) -> Vec<String> {
        let mut caps: Vec<String> = self.caps.read().iter().cloned().collect();
        caps.sort();
        caps
    }

    pub fn send(&self, line: impl Display) {
        self.enqueue(Outbound::Lines(vec![line.to_string()]));
    }

    /// Write several lines back to back.
    pub fn send_lines(&self, lines: Vec<String>) {
        if !lines.is_empty() {
            self.enqueue(Outbound::Lines(lines));
        }
    }

    /// Server numeric addressed to this client's nick.
    pub fn numeric(&self, code: &str, params: Vec<&str>) {
        self.send(self.numeric_line(code, params));
    }

    pub fn numeric_line(&self, code: &str, params: Vec<&str>) -> String {
        let nick = self.nick();
        let mut all = Vec::with_capacity(params.len() + 1);
        all.push(nick.as_str());
        all.extend(params);
        Message::from_server(&self.server_name, code, all).to_string()
    }

    pub fn notice(&self, text: &str) {
        let nick = self.nick();
        self.send(Message::from_server(&self.server_name, "NOTICE", vec![&nick, text]));
    }

    /// Lines for a channel, dropped if the client has not joined it.
    pub fn relay(&self, channel: Snowflake, lines: Vec<String>) {
        if !lines.is_empty() {
            self.enqueue(Outbound::Relay { channel, lines });
        }
    }

    pub fn each_joined(&self, lines: Arc<HashMap<Snowflake, String>>) {
        self.enqueue(Outbound::EachJoined(lines));
    }

    /// Mark `channel` joined, writing `lines` as the acknowledgement.
    /// Returns false if it already was.
    pub async fn join(&self, channel: Snowflake, lines: Vec<String>) -> bool {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Outbound::Join { channel, lines, reply });
        rx.await.unwrap_or(false)
    }

    /// Deliver `lines` to `channel`, joining it first if needed. Does not
    /// wait on the writer.
    pub fn open(&self, channel: Snowflake, join_lines: Vec<String>, lines: Vec<String>) {
        self.enqueue(Outbound::Open {
            channel,
            join_lines,
            lines,
        });
    }

    /// Unmark `channel`, writing `lines`. Returns false if it was not joined.
    pub async fn part(&self, channel: Snowflake, lines: Vec<String>) -> bool {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Outbound::Part {
            channel,
            lines,
            reply: Some(reply),
        });
        rx.await.unwrap_or(false)
    }

    /// Like [`Client::part`] without waiting for the outcome.
    pub fn evict(&self, channel: Snowflake, lines: Vec<String>) {
        self.enqueue(Outbound::Part {
            channel,
            lines,
            reply: None,
        });
    }

    pub async fn is_joined(&self, channel: Snowflake) -> bool {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Outbound::IsJoined { channel, reply });
        rx.await.unwrap_or(false)
    }

    /// Ask the writer to flush what is queued and stop.
    pub fn close(&self) {
        let _ = self.tx.try_send(Outbound::Close);
    }

    /// Remember text this client is about to post, so its echo can be
    /// recognised.
    pub fn remember_sent(&self, channel: Snowflake, content: &str) {
        let mut pending = self.pending_echoes.lock();
        let queue = pending.entry(channel).or_default();
        queue.push_back(content.to_string());
        while queue.len() > MAX_PENDING_ECHOES {
            queue.pop_front();
        }
    }

    pub fn forget_sent(&self, channel: Snowflake, content: &str) {
        self.take_echo(channel, content);
    }

    /// True (and consumed) when `content` in `channel` was posted by this client.
    pub fn take_echo(&self, channel: Snowflake, content: &str) -> bool {
        let mut pending = self.pending_echoes.lock();
        let Some(queue) = pending.get_mut(&channel) else {
            return false;
        };
        match queue.iter().position(|c| c == content) {
            Some(pos) => {
                queue.remove(pos);
                if queue.is_empty() {
                    pending.remove(&channel);
                }
                true
            }
            None => false,
        }
    }
}

/// Apply one request to the joined set, collecting the lines it writes.
/// Returns false on [`Outbound::Close`].
fn apply(joined: &mut HashSet<Snowflake>, out: Outbound, buf: &mut Vec<String>) -> bool {
    match out {
        Outbound::Lines(lines) => buf.extend(lines),
        Outbound::Relay { channel, lines } => {
            if joined.contains(&channel) {
                buf.extend(lines);
            }
        }
        Outbound::EachJoined(lines) => {
            for (channel, line) in lines.iter() {
                if joined.contains(channel) {
                    buf.push(line.clone());
                }
            }
        }
        Outbound::Join { channel, lines, reply } => {
            let fresh = joined.insert(channel);
            if fresh {
                buf.extend(lines);
            }
            let _ = reply.send(fresh);
        }
        Outbound::Open {
            channel,
            join_lines,
            lines,
        } => {
            if joined.insert(channel) {
                buf.extend(join_lines);
            }
            buf.extend(lines);
        }
        Outbound::Part { channel, lines, reply } => {
            let was = joined.remove(&channel);
            if was {
                buf.extend(lines);
            }
            if let Some(reply) = reply {
                let _ = reply.send(was);
            }
        }
        Outbound::IsJoined { channel, reply } => {
            let _ = reply.send(joined.contains(&channel));
        }
        Outbound::Close => return false,
    }
    true
}

async fn write_all<W: AsyncWrite + Unpin>(writer: &mut W, buf: &mut Vec<String>) -> std::io::Result<()> {
    for line in buf.drain(..) {
        tracing::trace!("-> {line}");
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }
    writer.flush().await
}

/// The writer task: owns the joined set and the socket's write half.
pub(crate) async fn run_writer<W>(mut rx: mpsc::Receiver<Outbound>, mut writer: W, session_id: String)
where
    W: AsyncWrite + Unpin,
{
    let mut joined: HashSet<Snowflake> = HashSet::new();
    let mut buf: Vec<String> = Vec::new();
    while let Some(first) = rx.recv().await {
        let mut open = apply(&mut joined, first, &mut buf);
        // Drain whatever else is queued and write it in one go.
        let mut batch_count = 0;
        while open && batch_count < WRITE_BATCH {
            match rx.try_recv() {
                Ok(next) => open = apply(&mut joined, next, &mut buf),
                Err(_) => break,
            }
            batch_count += 1;
        }
        if let Err(e) = write_all(&mut writer, &mut buf).await {
            tracing::warn!(%session_id, "Write error: {e}");
            break;
        }
        if !open {
            let _ = writer.shutdown().await;
            break;
        }
    }
}

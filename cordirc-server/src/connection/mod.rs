//! Per-client connection handler.
//!
//! Each accepted socket gets a [`Connection`] driven by a read loop, plus a
//! writer task behind a [`client::Client`] handle. The handler is split into
//! submodules:
//! - [`cap`]: CAP negotiation
//! - [`registration`]: PASS/NICK/USER and the welcome burst
//! - [`channel`]: JOIN, PART, TOPIC, NAMES, LIST and history replay
//! - [`messaging`]: PRIVMSG
//! - [`queries`]: WHOIS
//!
//! Registration and liveness commands run inline on the read loop so the
//! registration sequence is processed in order. Everything else runs as its
//! own task and may finish out of order.

mod cap;
mod channel;
pub mod client;
pub(crate) mod messaging;
mod queries;
mod registration;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::format;
use crate::guild::{Attachment, GuildSession};
use crate::irc::{self, Message};
use crate::server::SharedState;
use client::Client;

/// Longest accepted input line, in bytes.
const MAX_LINE_LEN: usize = 8192;
/// How long the writer gets to flush after the read loop ends.
const WRITER_GRACE: Duration = Duration::from_secs(2);

/// Whether the read loop keeps going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close,
}

/// State of a single client connection.
pub struct Connection {
    pub id: String,
    pub nick: Option<String>,
    pub user: Option<String>,
    pub realname: Option<String>,
    /// Raw `PASS` argument.
    pub password: Option<String>,
    pub registered: bool,

    pub(crate) cap_negotiating: bool,
    pub(crate) client: Arc<Client>,
    /// Present once registered; detaches from the session when dropped.
    pub(crate) attachment: Option<Attachment>,
}

impl Connection {
    fn new(client: Arc<Client>) -> Self {
        Self {
            id: client.id.clone(),
            nick: None,
            user: None,
            realname: None,
            password: None,
            registered: false,
            cap_negotiating: false,
            client,
            attachment: None,
        }
    }

    pub(crate) fn nick_or_star(&self) -> &str {
        self.nick.as_deref().unwrap_or("*")
    }

    fn session(&self) -> Option<&Arc<GuildSession>> {
        self.attachment.as_ref().map(Attachment::session)
    }
}

/// What a deferred command task needs.
#[derive(Clone)]
pub(crate) struct Context {
    pub state: Arc<SharedState>,
    pub client: Arc<Client>,
    pub session: Arc<GuildSession>,
}

impl Context {
    /// The client's own hostmask.
    pub fn prefix(&self) -> String {
        format::prefix(&self.client.nick(), &self.session.account().me)
    }

    pub fn need_more_params(&self, command: &str) {
        self.client
            .numeric(irc::ERR_NEEDMOREPARAMS, vec![command, "Not enough parameters"]);
    }
}

/// Handle a plain TCP connection.
pub async fn handle(stream: TcpStream, state: Arc<SharedState>) -> Result<()> {
    let peer = stream.peer_addr()?;
    let session_id = format!("{peer}");
    tracing::info!(%session_id, "New connection (plain)");
    let (reader, writer) = tokio::io::split(stream);
    handle_io(BufReader::new(reader), writer, session_id, state).await
}

/// Handle a generic async stream (TLS or other wrappers).
pub async fn handle_generic<S>(stream: S, state: Arc<SharedState>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let session_id = format!("stream-{id}");
    tracing::info!(%session_id, "New connection (generic stream)");
    let (reader, writer) = tokio::io::split(stream);
    handle_io(BufReader::new(reader), writer, session_id, state).await
}

async fn handle_io<R, W>(
    mut reader: BufReader<R>,
    writer: W,
    session_id: String,
    state: Arc<SharedState>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(state.config.send_queue.max(16));
    let client = Arc::new(Client::new(session_id.clone(), &state.server_name, tx));
    let mut write_handle = tokio::spawn(client::run_writer(rx, writer, session_id.clone()));
    let mut conn = Connection::new(client.clone());

    let mut line_buf = String::new();
    let ping_interval = state.config.ping_interval();
    let mut awaiting_pong = false;

    loop {
        // A dropped send means the client stopped reading.
        if !client.is_healthy() {
            tracing::info!(%session_id, "Send channel unhealthy, disconnecting");
            break;
        }

        line_buf.clear();
        let read_result = tokio::time::timeout(ping_interval, reader.read_line(&mut line_buf)).await;
        if line_buf.len() > MAX_LINE_LEN {
            tracing::warn!(%session_id, len = line_buf.len(), "Line too long, dropping");
            client.numeric(irc::ERR_INPUTTOOLONG, vec!["Input line was too long"]);
            continue;
        }

        match read_result {
            Ok(Ok(0)) | Ok(Err(_)) => break,
            Err(_) => {
                if awaiting_pong {
                    tracing::info!(%session_id, "Ping timeout");
                    break;
                }
                client.send(Message::from_server(&state.server_name, "PING", vec![&state.server_name]));
                awaiting_pong = true;
                continue;
            }
            Ok(Ok(_)) => {}
        }
        // Any traffic proves the client is alive.
        awaiting_pong = false;

        let Some(msg) = Message::parse(&line_buf) else {
            continue;
        };
        tracing::debug!(%session_id, "<- {}", line_buf.trim());

        if dispatch(&mut conn, msg, &state).await == Flow::Close {
            break;
        }
    }

    // Detach before the writer goes away so fan-out stops targeting us.
    conn.attachment.take();
    client.close();
    if tokio::time::timeout(WRITER_GRACE, &mut write_handle).await.is_err() {
        write_handle.abort();
    }
    tracing::info!(
        %session_id,
        nick = conn.nick.as_deref().unwrap_or("-"),
        registered = conn.registered,
        "Connection closed"
    );
    Ok(())
}

async fn dispatch(conn: &mut Connection, msg: Message, state: &Arc<SharedState>) -> Flow {
    match msg.command.as_str() {
        "CAP" => cap::handle_cap(conn, &msg, state).await,
        "PASS" => registration::handle_pass(conn, &msg, state).await,
        "NICK" => registration::handle_nick(conn, &msg, state).await,
        "USER" => registration::handle_user(conn, &msg, state).await,
        "PING" => {
            let token = msg.params.first().map(String::as_str).unwrap_or("");
            conn.client.send(Message::from_server(
                &state.server_name,
                "PONG",
                vec![&state.server_name, token],
            ));
            Flow::Continue
        }
        "PONG" => Flow::Continue,
        "QUIT" => Flow::Close,
        _ if !conn.registered => {
            conn.client
                .numeric(irc::ERR_NOTREGISTERED, vec!["You have not registered"]);
            Flow::Continue
        }
        "JOIN" | "PART" | "TOPIC" | "NAMES" | "LIST" | "PRIVMSG" | "WHOIS" => {
            let Some(session) = conn.session().cloned() else {
                return Flow::Continue;
            };
            let ctx = Context {
                state: state.clone(),
                client: conn.client.clone(),
                session,
            };
            tokio::spawn(run_command(ctx, msg));
            Flow::Continue
        }
        _ => {
            conn.client.numeric(
                irc::ERR_UNKNOWNCOMMAND,
                vec![&msg.command, "Unknown command"],
            );
            Flow::Continue
        }
    }
}

async fn run_command(ctx: Context, msg: Message) {
    match msg.command.as_str() {
        "JOIN" => channel::handle_join(&ctx, &msg).await,
        "PART" => channel::handle_part(&ctx, &msg).await,
        "TOPIC" => channel::handle_topic(&ctx, &msg).await,
        "NAMES" => channel::handle_names(&ctx, &msg).await,
        "LIST" => channel::handle_list(&ctx),
        "PRIVMSG" => messaging::handle_privmsg(&ctx, &msg).await,
        "WHOIS" => queries::handle_whois(&ctx, &msg).await,
        _ => {}
    }
}

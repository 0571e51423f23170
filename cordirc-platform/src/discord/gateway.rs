//! Discord gateway websocket.
//!
//! One task per credential keeps a gateway session alive, decodes dispatches
//! into [`Event`]s and forwards them in arrival order. Reconnects use a fresh
//! IDENTIFY with exponential backoff; the task ends once the event receiver
//! is dropped.

use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, sleep};
use tokio_tungstenite::tungstenite::Message as WsMsg;

use crate::error::{PlatformError, Result};
use crate::event::Event;
use crate::snowflake::Snowflake;

pub const GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

const GUILDS: u64 = 1 << 0;
const GUILD_MEMBERS: u64 = 1 << 1;
const GUILD_MESSAGES: u64 = 1 << 9;
const DIRECT_MESSAGES: u64 = 1 << 12;
const MESSAGE_CONTENT: u64 = 1 << 15;
pub const INTENTS: u64 = GUILDS | GUILD_MEMBERS | GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT;

const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_REQUEST_MEMBERS: u8 = 8;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;
const OP_HEARTBEAT_ACK: u8 = 11;

/// Close codes after which reconnecting cannot succeed.
const FATAL_CLOSE_CODES: &[u16] = &[4004, 4010, 4011, 4012, 4013, 4014];

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Requests sent from the REST side into the live gateway session.
#[derive(Debug)]
pub(crate) enum GatewayCommand {
    RequestMembers(Snowflake),
}

#[derive(Deserialize)]
struct Frame {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

enum Exit {
    Reconnect,
    Shutdown,
}

pub(crate) async fn run(
    token: String,
    events: mpsc::Sender<Event>,
    mut commands: mpsc::UnboundedReceiver<GatewayCommand>,
) {
    let mut backoff = MIN_BACKOFF;
    loop {
        match session(&token, &events, &mut commands).await {
            Ok(Exit::Shutdown) => {
                tracing::info!("Gateway task stopping");
                return;
            }
            Ok(Exit::Reconnect) => {
                tracing::info!("Gateway asked to reconnect");
                backoff = MIN_BACKOFF;
            }
            Err(e) => {
                tracing::warn!(retry_in = ?backoff, "Gateway session failed: {e}");
            }
        }
        tokio::select! {
            _ = sleep(backoff) => {}
            _ = events.closed() => return,
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn session(
    token: &str,
    events: &mpsc::Sender<Event>,
    commands: &mut mpsc::UnboundedReceiver<GatewayCommand>,
) -> Result<Exit> {
    let (ws, _response) = tokio_tungstenite::connect_async(GATEWAY_URL)
        .await
        .map_err(gateway_err)?;
    let (mut sink, mut stream) = ws.split();
    tracing::info!("Gateway connected");

    let hello = loop {
        match stream.next().await {
            Some(Ok(WsMsg::Text(text))) => {
                let frame: Frame = serde_json::from_str(&text)?;
                if frame.op == OP_HELLO {
                    break frame;
                }
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(gateway_err(e)),
            None => return Ok(Exit::Reconnect),
        }
    };
    let period = hello
        .d
        .get("heartbeat_interval")
        .and_then(Value::as_u64)
        .map(Duration::from_millis)
        .ok_or_else(|| PlatformError::Gateway("HELLO without heartbeat_interval".into()))?;

    let identify = json!({
        "op": OP_IDENTIFY,
        "d": {
            "token": token.strip_prefix("Bot ").unwrap_or(token),
            "intents": INTENTS,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "cordirc",
                "device": "cordirc",
            },
        },
    });
    send_json(&mut sink, &identify).await?;

    let mut heartbeat = interval_at(Instant::now() + period, period);
    let mut seq: Option<u64> = None;
    let mut acked = true;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if !acked {
                    tracing::warn!("Heartbeat not acknowledged, reconnecting");
                    return Ok(Exit::Reconnect);
                }
                acked = false;
                send_json(&mut sink, &json!({"op": OP_HEARTBEAT, "d": seq})).await?;
            }
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { return Ok(Exit::Shutdown) };
                match cmd {
                    GatewayCommand::RequestMembers(guild) => {
                        let payload = json!({
                            "op": OP_REQUEST_MEMBERS,
                            "d": {"guild_id": guild, "query": "", "limit": 0},
                        });
                        send_json(&mut sink, &payload).await?;
                    }
                }
            }
            _ = events.closed() => return Ok(Exit::Shutdown),
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(WsMsg::Text(text))) => text,
                    Some(Ok(WsMsg::Close(close))) => {
                        let code = close.as_ref().map(|c| u16::from(c.code));
                        if code.is_some_and(|c| FATAL_CLOSE_CODES.contains(&c)) {
                            tracing::warn!(?code, "Gateway closed the session permanently");
                            return Ok(Exit::Shutdown);
                        }
                        return Ok(Exit::Reconnect);
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(gateway_err(e)),
                    None => return Ok(Exit::Reconnect),
                };
                let frame: Frame = match serde_json::from_str(&text) {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::debug!("Undecodable gateway frame: {e}");
                        continue;
                    }
                };
                match frame.op {
                    OP_DISPATCH => {
                        if frame.s.is_some() {
                            seq = frame.s;
                        }
                        let kind = frame.t.unwrap_or_default();
                        match Event::from_dispatch(&kind, frame.d) {
                            Ok(Some(event)) => {
                                if events.send(event).await.is_err() {
                                    return Ok(Exit::Shutdown);
                                }
                            }
                            Ok(None) => {}
                            Err(e) => tracing::debug!(%kind, "Dropping dispatch: {e}"),
                        }
                    }
                    OP_HEARTBEAT => {
                        send_json(&mut sink, &json!({"op": OP_HEARTBEAT, "d": seq})).await?;
                    }
                    OP_RECONNECT | OP_INVALID_SESSION => return Ok(Exit::Reconnect),
                    OP_HEARTBEAT_ACK => acked = true,
                    _ => {}
                }
            }
        }
    }
}

async fn send_json<S>(sink: &mut S, value: &Value) -> Result<()>
where
    S: Sink<WsMsg> + Unpin,
    S::Error: std::fmt::Display,
{
    sink.send(WsMsg::Text(value.to_string()))
        .await
        .map_err(|e| PlatformError::Gateway(e.to_string()))
}

fn gateway_err(e: tokio_tungstenite::tungstenite::Error) -> PlatformError {
    PlatformError::Gateway(e.to_string())
}

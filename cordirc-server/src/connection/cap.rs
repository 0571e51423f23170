//! CAP capability negotiation.

use std::sync::Arc;

use super::registration::try_complete_registration;
use super::{Connection, Flow};
use crate::irc::{self, Message};
use crate::server::SharedState;

pub(super) async fn handle_cap(
    conn: &mut Connection,
    msg: &Message,
    state: &Arc<SharedState>,
) -> Flow {
    let server_name = &state.server_name;
    let subcmd = msg.params.first().map(|s| s.to_ascii_uppercase());
    let nick = conn.nick_or_star().to_string();
    match subcmd.as_deref() {
        Some("LS") => {
            if !conn.registered {
                conn.cap_negotiating = true;
            }
            let caps = state.config.supported_caps().join(" ");
            conn.client
                .send(Message::from_server(server_name, "CAP", vec![nick.as_str(), "LS", &caps]));
        }
        Some("LIST") => {
            let caps = conn.client.caps().join(" ");
            conn.client
                .send(Message::from_server(server_name, "CAP", vec![nick.as_str(), "LIST", &caps]));
        }
        Some("REQ") => {
            if !conn.registered {
                conn.cap_negotiating = true;
            }
            let requested = msg.params.get(1).map(String::as_str).unwrap_or("");
            let supported = state.config.supported_caps();
            let verdict = match evaluate_request(&supported, requested) {
                Some(changes) => {
                    for (cap, enabled) in &changes {
                        conn.client.set_cap(cap, *enabled);
                    }
                    tracing::debug!(session_id = %conn.id, caps = %requested, "CAP ACK");
                    "ACK"
                }
                None => "NAK",
            };
            conn.client.send(Message::from_server(
                server_name,
                "CAP",
                vec![nick.as_str(), verdict, requested],
            ));
        }
        Some("END") => {
            conn.cap_negotiating = false;
            return try_complete_registration(conn, state).await;
        }
        Some(other) => {
            conn.client.send(Message::from_server(
                server_name,
                irc::ERR_INVALIDCAPCMD,
                vec![nick.as_str(), other, "Invalid CAP command"],
            ));
        }
        None => {
            conn.client.send(Message::from_server(
                server_name,
                irc::ERR_NEEDMOREPARAMS,
                vec![nick.as_str(), "CAP", "Not enough parameters"],
            ));
        }
    }
    Flow::Continue
}

/// Decide a `CAP REQ` as a whole.
///
/// Returns the `(capability, enabled)` changes when every requested name
/// (with or without a leading `-`) is supported, `None` otherwise.
pub(crate) fn evaluate_request(supported: &[String], request: &str) -> Option<Vec<(String, bool)>> {
    let mut changes = Vec::new();
    for token in request.split_whitespace() {
        let (name, enabled) = match token.strip_prefix('-') {
            Some(name) => (name, false),
            None => (token, true),
        };
        let name = name.to_ascii_lowercase();
        if !supported.contains(&name) {
            return None;
        }
        changes.push((name, enabled));
    }
    (!changes.is_empty()).then_some(changes)
}

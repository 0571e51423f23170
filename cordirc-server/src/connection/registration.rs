//! IRC registration (PASS/NICK/USER completion).

use std::sync::Arc;

use super::{Connection, Flow};
use crate::error::BridgeError;
use crate::format;
use crate::guild::{Attachment, GuildSession, Scope};
use crate::irc::{self, Message};
use crate::server::SharedState;

pub(super) async fn handle_pass(
    conn: &mut Connection,
    msg: &Message,
    state: &Arc<SharedState>,
) -> Flow {
    if conn.registered {
        conn.client
            .numeric(irc::ERR_ALREADYREGISTERED, vec!["You may not reregister"]);
        return Flow::Continue;
    }
    let Some(pass) = msg.params.first() else {
        conn.client
            .numeric(irc::ERR_NEEDMOREPARAMS, vec!["PASS", "Not enough parameters"]);
        return Flow::Continue;
    };
    conn.password = Some(pass.clone());
    try_complete_registration(conn, state).await
}

pub(super) async fn handle_nick(
    conn: &mut Connection,
    msg: &Message,
    state: &Arc<SharedState>,
) -> Flow {
    let Some(nick) = msg.params.first().filter(|n| !n.is_empty()) else {
        conn.client
            .numeric(irc::ERR_NONICKNAMEGIVEN, vec!["No nickname given"]);
        return Flow::Continue;
    };
    if conn.registered {
        conn.client
            .notice("Nicknames follow your Discord name and cannot be changed from IRC");
        return Flow::Continue;
    }
    conn.nick = Some(nick.clone());
    conn.client.set_nick(nick);
    try_complete_registration(conn, state).await
}

pub(super) async fn handle_user(
    conn: &mut Connection,
    msg: &Message,
    state: &Arc<SharedState>,
) -> Flow {
    if conn.registered {
        conn.client
            .numeric(irc::ERR_ALREADYREGISTERED, vec!["You may not reregister"]);
        return Flow::Continue;
    }
    if msg.params.len() < 4 {
        conn.client
            .numeric(irc::ERR_NEEDMOREPARAMS, vec!["USER", "Not enough parameters"]);
        return Flow::Continue;
    }
    conn.user = Some(msg.params[0].clone());
    conn.realname = Some(msg.params[3].clone());
    try_complete_registration(conn, state).await
}

/// Split the `PASS` argument into the platform credential, checking the
/// shared server password when one is configured.
pub(crate) fn credential<'a>(configured: Option<&str>, pass: &'a str) -> Result<&'a str, BridgeError> {
    let Some(expected) = configured else {
        return Ok(pass);
    };
    match pass.split_once(':') {
        Some((given, token)) if given == expected && !token.is_empty() => Ok(token),
        _ => Err(BridgeError::PasswordMismatch),
    }
}

fn close_link(conn: &Connection, reason: &str) -> Flow {
    conn.client.send(format!("ERROR :Closing link: {reason}"));
    Flow::Close
}

pub(super) async fn try_complete_registration(
    conn: &mut Connection,
    state: &Arc<SharedState>,
) -> Flow {
    if conn.registered || conn.cap_negotiating {
        return Flow::Continue;
    }
    let (Some(nick), Some(user), Some(pass)) = (
        conn.nick.clone(),
        conn.user.clone(),
        conn.password.clone(),
    ) else {
        return Flow::Continue;
    };

    let credential = match credential(state.config.server_password.as_deref(), &pass) {
        Ok(credential) => credential.to_string(),
        Err(e) => {
            tracing::info!(session_id = %conn.id, "Registration refused: {e}");
            conn.client
                .numeric(irc::ERR_PASSWDMISMATCH, vec!["Password incorrect"]);
            return close_link(conn, "Bad password");
        }
    };
    let scope = match Scope::from_username(&user) {
        Ok(scope) => scope,
        Err(e) => {
            conn.client.notice(&e.to_string());
            conn.client
                .notice("Use a guild id, or \"dm\" for direct messages, as your username");
            return close_link(conn, "Invalid username");
        }
    };

    let session = match state.registry.get_or_create(&credential, scope).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(session_id = %conn.id, %scope, error = %e, "Could not open session");
            conn.client
                .notice(&format!("Could not connect to Discord: {e}"));
            return close_link(conn, "Upstream unavailable");
        }
    };

    conn.registered = true;
    conn.attachment = Some(Attachment::new(session.clone(), conn.client.clone()));
    send_welcome(conn, state, &session, &nick);

    // Adopt the platform account's name.
    let me = &session.account().me;
    let own_nick = session.nick_of(me);
    if own_nick != nick {
        conn.client
            .send(format!(":{} NICK {own_nick}", format::prefix(&nick, me)));
        conn.client.set_nick(&own_nick);
        conn.nick = Some(own_nick);
    }
    tracing::info!(
        session_id = %conn.id,
        nick = conn.nick_or_star(),
        %scope,
        guild = %session.name(),
        "Client registered"
    );
    Flow::Continue
}

fn send_welcome(conn: &Connection, state: &SharedState, session: &GuildSession, nick: &str) {
    let server_name = &state.server_name;
    let version = env!("CARGO_PKG_VERSION");
    let welcome = Message::from_server(
        server_name,
        irc::RPL_WELCOME,
        vec![
            nick,
            &format!("Welcome to {server_name}, {nick}: bridged to {}", session.name()),
        ],
    );
    let yourhost = Message::from_server(
        server_name,
        irc::RPL_YOURHOST,
        vec![nick, &format!("Your host is {server_name}, running cordirc {version}")],
    );
    let created = Message::from_server(
        server_name,
        irc::RPL_CREATED,
        vec![
            nick,
            &format!("This server was created {}", state.created.format("%Y-%m-%d %H:%M:%S UTC")),
        ],
    );
    let myinfo = Message::from_server(
        server_name,
        irc::RPL_MYINFO,
        vec![nick, server_name, &format!("cordirc-{version}"), "i", "t"],
    );
    let network = format!("NETWORK={server_name}");
    let isupport = Message::from_server(
        server_name,
        irc::RPL_ISUPPORT,
        vec![
            nick,
            "CHANTYPES=#",
            "CASEMAPPING=ascii",
            "NICKLEN=32",
            &network,
            "are supported by this server",
        ],
    );

    let mut lines: Vec<String> = [welcome, yourhost, created, myinfo, isupport]
        .iter()
        .map(ToString::to_string)
        .collect();

    if let Some(ref motd) = state.motd {
        lines.push(
            Message::from_server(
                server_name,
                irc::RPL_MOTDSTART,
                vec![nick, &format!("- {server_name} Message of the day -")],
            )
            .to_string(),
        );
        for line in motd.lines() {
            lines.push(
                Message::from_server(server_name, irc::RPL_MOTD, vec![nick, &format!("- {line}")])
                    .to_string(),
            );
        }
        lines.push(
            Message::from_server(server_name, irc::RPL_ENDOFMOTD, vec![nick, "End of /MOTD command"])
                .to_string(),
        );
    } else {
        lines.push(
            Message::from_server(server_name, irc::ERR_NOMOTD, vec![nick, "MOTD File is missing"])
                .to_string(),
        );
    }
    conn.client.send_lines(lines);
}

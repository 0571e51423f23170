//! WHOIS.

use super::Context;
use crate::format;
use crate::irc;

pub(super) async fn handle_whois(ctx: &Context, msg: &irc::Message) {
    // WHOIS [server] <nick>
    let Some(nick) = msg.params.last().map(String::as_str) else {
        ctx.client
            .numeric(irc::ERR_NONICKNAMEGIVEN, vec!["No nickname given"]);
        return;
    };
    let end = ctx
        .client
        .numeric_line(irc::RPL_ENDOFWHOIS, vec![nick, "End of /WHOIS list"]);

    let Some(id) = ctx.session.user_id(nick) else {
        ctx.client.send_lines(vec![
            ctx.client
                .numeric_line(irc::ERR_NOSUCHNICK, vec![nick, "No such nick/channel"]),
            end,
        ]);
        return;
    };
    let user = match ctx.session.user(id) {
        Some(user) => user,
        None => match ctx.session.platform().user(id).await {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!(user = %id, error = %e, "User lookup failed");
                ctx.client.send_lines(vec![
                    ctx.client
                        .numeric_line(irc::ERR_NOSUCHNICK, vec![nick, "No such nick/channel"]),
                    end,
                ]);
                return;
            }
        },
    };
    let canonical = ctx.session.nick_of(&user);
    let ident = format::ident(&user);
    let host = id.to_string();
    let realname = user.tag();
    ctx.client.send_lines(vec![
        ctx.client.numeric_line(
            irc::RPL_WHOISUSER,
            vec![canonical.as_str(), &ident, &host, "*", &realname],
        ),
        ctx.client.numeric_line(
            irc::RPL_WHOISSERVER,
            vec![canonical.as_str(), &ctx.state.server_name, ctx.session.name()],
        ),
        end,
    ]);
}

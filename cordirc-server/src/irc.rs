//! IRC message parsing and formatting.
//!
//! Implements the RFC 1459 / RFC 2812 line format plus IRCv3 message tags,
//! which carry `time` and `batch` on relayed and replayed messages.

use std::fmt;

/// A parsed IRC message with optional IRCv3 tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// IRCv3 message tags, in the order they are written.
    pub tags: Vec<(String, String)>,
    /// Optional message prefix (server or user origin).
    pub prefix: Option<String>,
    /// The IRC command (e.g. "NICK", "PRIVMSG", "001").
    pub command: String,
    /// Command parameters.
    pub params: Vec<String>,
}

impl Message {
    /// Parse a raw IRC line into a Message, including optional tags.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return None;
        }

        let mut rest = line;

        let tags = if let Some(tagged) = rest.strip_prefix('@') {
            let end = tagged.find(' ')?;
            let tags = parse_tags(&tagged[..end]);
            rest = tagged[end + 1..].trim_start_matches(' ');
            tags
        } else {
            Vec::new()
        };

        let prefix = if let Some(prefixed) = rest.strip_prefix(':') {
            let end = prefixed.find(' ')?;
            let pfx = prefixed[..end].to_string();
            rest = prefixed[end + 1..].trim_start_matches(' ');
            Some(pfx)
        } else {
            None
        };

        let mut params = Vec::new();
        let command;

        if let Some(space) = rest.find(' ') {
            command = rest[..space].to_ascii_uppercase();
            rest = &rest[space + 1..];

            while !rest.is_empty() {
                if let Some(trailing) = rest.strip_prefix(':') {
                    params.push(trailing.to_string());
                    break;
                }
                if let Some(space) = rest.find(' ') {
                    if space > 0 {
                        params.push(rest[..space].to_string());
                    }
                    rest = &rest[space + 1..];
                } else {
                    params.push(rest.to_string());
                    break;
                }
            }
        } else {
            command = rest.to_ascii_uppercase();
        }

        if command.is_empty() {
            return None;
        }

        Some(Message {
            tags,
            prefix,
            command,
            params,
        })
    }

    /// Create a new message with a server prefix.
    pub fn from_server(server: &str, command: &str, params: Vec<&str>) -> Self {
        Message {
            tags: Vec::new(),
            prefix: Some(server.to_string()),
            command: command.to_string(),
            params: params.into_iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Create a message originating from a user (`nick!ident@host`).
    pub fn from_user(prefix: &str, command: &str, params: Vec<&str>) -> Self {
        Self::from_server(prefix, command, params)
    }

    /// Attach a tag, replacing any existing value for the key.
    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        if let Some(slot) = self.tags.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value.to_string();
        } else {
            self.tags.push((key.to_string(), value.to_string()));
        }
        self
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            write!(f, "@")?;
            for (i, (key, value)) in self.tags.iter().enumerate() {
                if i > 0 {
                    write!(f, ";")?;
                }
                if value.is_empty() {
                    write!(f, "{key}")?;
                } else {
                    write!(f, "{key}={}", escape_tag_value(value))?;
                }
            }
            write!(f, " ")?;
        }

        if let Some(ref prefix) = self.prefix {
            write!(f, ":{prefix} ")?;
        }
        write!(f, "{}", self.command)?;
        for (i, param) in self.params.iter().enumerate() {
            if i == self.params.len() - 1
                && (param.contains(' ') || param.starts_with(':') || param.is_empty())
            {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}

/// Parse IRCv3 tag string: `key=value;key2=value2`
fn parse_tags(tag_str: &str) -> Vec<(String, String)> {
    let mut tags = Vec::new();
    for pair in tag_str.split(';') {
        if pair.is_empty() {
            continue;
        }
        if let Some((key, value)) = pair.split_once('=') {
            tags.push((key.to_string(), unescape_tag_value(value)));
        } else {
            tags.push((pair.to_string(), String::new()));
        }
    }
    tags
}

fn unescape_tag_value(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(':') => result.push(';'),
                Some('s') => result.push(' '),
                Some('\\') => result.push('\\'),
                Some('r') => result.push('\r'),
                Some('n') => result.push('\n'),
                Some(other) => result.push(other),
                None => {}
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn escape_tag_value(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ';' => result.push_str("\\:"),
            ' ' => result.push_str("\\s"),
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

// Registration
pub const RPL_WELCOME: &str = "001";
pub const RPL_YOURHOST: &str = "002";
pub const RPL_CREATED: &str = "003";
pub const RPL_MYINFO: &str = "004";
pub const RPL_ISUPPORT: &str = "005";

// MOTD
pub const RPL_MOTDSTART: &str = "375";
pub const RPL_MOTD: &str = "372";
pub const RPL_ENDOFMOTD: &str = "376";
pub const ERR_NOMOTD: &str = "422";

// WHOIS
pub const RPL_WHOISUSER: &str = "311";
pub const RPL_WHOISSERVER: &str = "312";
pub const RPL_ENDOFWHOIS: &str = "318";

// LIST
pub const RPL_LISTSTART: &str = "321";
pub const RPL_LIST: &str = "322";
pub const RPL_LISTEND: &str = "323";

// Channel
pub const RPL_NOTOPIC: &str = "331";
pub const RPL_TOPIC: &str = "332";
pub const RPL_TOPICWHOTIME: &str = "333";
pub const RPL_NAMREPLY: &str = "353";
pub const RPL_ENDOFNAMES: &str = "366";

// Errors
pub const ERR_NOSUCHNICK: &str = "401";
pub const ERR_NOSUCHCHANNEL: &str = "403";
pub const ERR_INVALIDCAPCMD: &str = "410";
pub const ERR_NORECIPIENT: &str = "411";
pub const ERR_NOTEXTTOSEND: &str = "412";
pub const ERR_INPUTTOOLONG: &str = "417";
pub const ERR_UNKNOWNCOMMAND: &str = "421";
pub const ERR_NONICKNAMEGIVEN: &str = "431";
pub const ERR_NOTONCHANNEL: &str = "442";
pub const ERR_NOTREGISTERED: &str = "451";
pub const ERR_NEEDMOREPARAMS: &str = "461";
pub const ERR_ALREADYREGISTERED: &str = "462";
pub const ERR_PASSWDMISMATCH: &str = "464";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_command() {
        let msg = Message::parse("NICK alice").unwrap();
        assert_eq!(msg.command, "NICK");
        assert_eq!(msg.params, vec!["alice"]);
        assert!(msg.tags.is_empty());
    }

    #[test]
    fn parse_with_prefix() {
        let msg = Message::parse(":server 001 alice :Welcome").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("server"));
        assert_eq!(msg.command, "001");
        assert_eq!(msg.params, vec!["alice", "Welcome"]);
    }

    #[test]
    fn parse_lowercase_command_and_trailing() {
        let msg = Message::parse("privmsg #general :hello there\r\n").unwrap();
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#general", "hello there"]);
    }

    #[test]
    fn parse_tags_keep_order_and_unescape() {
        let msg = Message::parse("@time=2024-01-01T00:00:00.000Z;label=a\\sb :n!u@h PRIVMSG #c :x").unwrap();
        assert_eq!(msg.tags[0].0, "time");
        assert_eq!(msg.tags[1], ("label".to_string(), "a b".to_string()));
        assert_eq!(msg.prefix.as_deref(), Some("n!u@h"));
    }

    #[test]
    fn parse_user_with_realname() {
        let msg = Message::parse("USER 123456 0 * :Real Name").unwrap();
        assert_eq!(msg.params.len(), 4);
        assert_eq!(msg.params[3], "Real Name");
    }

    #[test]
    fn empty_and_blank_lines_are_ignored() {
        assert!(Message::parse("\r\n").is_none());
        assert!(Message::parse("").is_none());
    }

    #[test]
    fn display_adds_trailing_colon_when_needed() {
        let msg = Message::from_server("cordirc", "001", vec!["alice", "Welcome home"]);
        assert_eq!(msg.to_string(), ":cordirc 001 alice :Welcome home");
        let msg = Message::from_server("cordirc", "366", vec!["alice", "#c", ""]);
        assert_eq!(msg.to_string(), ":cordirc 366 alice #c :");
    }

    #[test]
    fn display_writes_tags_in_order() {
        let msg = Message::from_user("bob!bob@1", "PRIVMSG", vec!["#c", "hi"])
            .with_tag("batch", "abc")
            .with_tag("time", "2024-01-01T00:00:00.000Z");
        assert_eq!(
            msg.to_string(),
            "@batch=abc;time=2024-01-01T00:00:00.000Z :bob!bob@1 PRIVMSG #c hi"
        );
    }

    #[test]
    fn display_escapes_tag_values() {
        let msg = Message::from_server("cordirc", "BATCH", vec!["+a", "chathistory", "#c"])
            .with_tag("label", "x y;z");
        assert_eq!(
            msg.to_string(),
            "@label=x\\sy\\:z :cordirc BATCH +a chathistory #c"
        );
    }
}

//! cordirc: an IRC server that bridges to Discord.
//!
//! Each IRC login names a credential (`PASS`) and a scope (`USER`: a guild
//! id or `dm`). Logins with the same credential and scope share one
//! [`guild::GuildSession`], so several IRC clients see the same guild
//! consistently. Upstream events reach sessions through [`router`];
//! client commands are handled in [`connection`].

pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod format;
pub mod guild;
pub mod idmap;
pub mod irc;
pub mod registry;
pub mod router;
pub mod server;

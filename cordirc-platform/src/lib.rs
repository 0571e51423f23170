//! Upstream chat platform boundary for cordirc.
//!
//! The bridge core only ever talks to the platform through two traits:
//! - [`Platform`]: REST-style operations (send a message, fetch history,
//!   look up guilds/channels/users, request member chunks)
//! - [`Connector`]: turns a credential into a live [`Upstream`], a platform
//!   client plus the stream of [`Event`]s for that credential
//!
//! [`discord`] provides the concrete implementation over the Discord REST
//! API and gateway websocket. With the `testing` feature, `memory` provides an
//! in-process stand-in for tests.

pub mod client;
pub mod discord;
pub mod error;
pub mod event;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod model;
pub mod snowflake;

pub use client::{Connector, Platform, Upstream};
pub use error::{PlatformError, Result};
pub use event::Event;
pub use model::{Attachment, Channel, Guild, Member, Message, Role, User};
pub use snowflake::Snowflake;

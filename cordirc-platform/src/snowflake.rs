//! Snowflake identifiers.
//!
//! Every guild, channel, user, role and message on the platform is named by
//! a 64-bit snowflake. The top 42 bits carry the creation time in
//! milliseconds since the platform epoch, which is how "sent 3 minutes ago"
//! labels are derived without any extra lookups.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Milliseconds between the Unix epoch and 2015-01-01T00:00:00Z.
pub const PLATFORM_EPOCH_MS: u64 = 1_420_070_400_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Snowflake(pub u64);

impl Snowflake {
    /// Creation time embedded in the identifier.
    pub fn created_at(self) -> DateTime<Utc> {
        let ms = (self.0 >> 22) + PLATFORM_EPOCH_MS;
        DateTime::from_timestamp_millis(ms as i64).unwrap_or_default()
    }

    /// Build a snowflake whose embedded creation time is `at`.
    ///
    /// `sequence` fills the low 22 bits so that several ids minted for the
    /// same millisecond stay distinct.
    pub fn from_timestamp(at: DateTime<Utc>, sequence: u64) -> Self {
        let ms = (at.timestamp_millis().max(0) as u64).saturating_sub(PLATFORM_EPOCH_MS);
        Snowflake((ms << 22) | (sequence & 0x3F_FFFF))
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Snowflake {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Snowflake)
    }
}

impl From<u64> for Snowflake {
    fn from(value: u64) -> Self {
        Snowflake(value)
    }
}

// The platform sends ids as JSON strings (they overflow JS numbers), but
// some payloads and fixtures use bare integers. Accept both, emit strings.
impl Serialize for Snowflake {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SnowflakeVisitor;

        impl Visitor<'_> for SnowflakeVisitor {
            type Value = Snowflake;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a snowflake as a string or integer")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Snowflake, E> {
                Ok(Snowflake(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Snowflake, E> {
                u64::try_from(v)
                    .map(Snowflake)
                    .map_err(|_| E::custom("negative snowflake"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Snowflake, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(SnowflakeVisitor)
    }
}

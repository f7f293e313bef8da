use std::fmt;
use std::str::FromStr;

use snafu::ResultExt;
use uuid::Uuid;

use super::error::{ChatError, ChatResult, InvalidTempIdSnafu};

/// Session-local key of one message record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl MessageId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Identifier issued at optimistic insertion, before the service has seen the message.
///
/// Time-ordered v7 UUIDs keep every tentative id unique for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TempId(pub Uuid);

impl TempId {
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(raw: &str) -> ChatResult<Self> {
        let parsed = Uuid::parse_str(raw).context(InvalidTempIdSnafu {
            stage: "parse-temp-id",
            raw: raw.to_string(),
        })?;
        Ok(Self(parsed))
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl From<Uuid> for TempId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for TempId {
    type Err = ChatError;

    fn from_str(raw: &str) -> ChatResult<Self> {
        Self::parse(raw)
    }
}

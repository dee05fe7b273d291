use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DomainError;

const USER_PREFIX: &str = "user:";
const ROOM_PREFIX: &str = "room:";
const FEED_GLOBAL: &str = "feed:global";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    User(String),
    Room(String),
    Feed,
}

impl Channel {
    pub fn user(user_id: impl Into<String>) -> Self {
        Channel::User(user_id.into())
    }

    pub fn room(room_id: impl Into<String>) -> Self {
        Channel::Room(room_id.into())
    }

    pub fn is_feed(&self) -> bool {
        matches!(self, Channel::Feed)
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Channel::User(_) => "user",
            Channel::Room(_) => "room",
            Channel::Feed => "feed",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::User(user_id) => write!(f, "{USER_PREFIX}{user_id}"),
            Channel::Room(room_id) => write!(f, "{ROOM_PREFIX}{room_id}"),
            Channel::Feed => f.write_str(FEED_GLOBAL),
        }
    }
}

impl FromStr for Channel {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value == FEED_GLOBAL {
            return Ok(Channel::Feed);
        }
        let parsed = if let Some(user_id) = value.strip_prefix(USER_PREFIX) {
            Channel::User(user_id.to_string())
        } else if let Some(room_id) = value.strip_prefix(ROOM_PREFIX) {
            Channel::Room(room_id.to_string())
        } else {
            return Err(DomainError::Validation(format!("unknown channel: {value}")));
        };
        match &parsed {
            Channel::User(id) | Channel::Room(id) if id.trim().is_empty() => Err(
                DomainError::Validation(format!("channel id is required: {value}")),
            ),
            _ => Ok(parsed),
        }
    }
}

impl Serialize for Channel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats_channel_names() {
        for name in ["user:u-1", "room:42", "feed:global"] {
            let channel: Channel = name.parse().unwrap();
            assert_eq!(channel.to_string(), name);
        }
        assert!("room:".parse::<Channel>().is_err());
        assert!("feed:local".parse::<Channel>().is_err());
    }
}

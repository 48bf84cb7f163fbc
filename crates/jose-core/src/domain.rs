use std::{fmt, sync::OnceLock};

use regex::Regex;

use crate::{errors::Error, Result};

/// Matrix user id (`@localpart:server_name`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(String);

fn user_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Localparts cannot contain ':'; the server name keeps any port or IPv6 literal.
    RE.get_or_init(|| Regex::new(r"^@([^:\s]+):(\S+)$").expect("valid user id regex"))
}

impl UserId {
    pub fn parse(raw: impl AsRef<str>) -> Result<Self> {
        let raw = raw.as_ref().trim();
        if !user_id_re().is_match(raw) {
            return Err(Error::InvalidUserId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn localpart(&self) -> &str {
        self.split().0
    }

    /// Home server of the account (the part after the first `:`).
    pub fn server_name(&self) -> &str {
        self.split().1
    }

    fn split(&self) -> (&str, &str) {
        // `parse` guarantees the leading '@' and at least one ':'.
        let rest = &self.0[1..];
        rest.split_once(':').unwrap_or((rest, ""))
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Matrix room id (`!opaque:server`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Matrix event id (`$opaque`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventId(pub String);

impl EventId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `membership` field of an `m.room.member` event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Membership {
    Join,
    Invite,
    Leave,
    Ban,
    Knock,
    Other(String),
}

impl Membership {
    pub fn parse(s: &str) -> Self {
        match s {
            "join" => Membership::Join,
            "invite" => Membership::Invite,
            "leave" => Membership::Leave,
            "ban" => Membership::Ban,
            "knock" => Membership::Knock,
            other => Membership::Other(other.to_string()),
        }
    }
}

/// A member arriving in the room, as opposed to a profile update (`join -> join`).
pub fn is_fresh_join(membership: &Membership, prev: Option<&Membership>) -> bool {
    *membership == Membership::Join
        && matches!(
            prev,
            None | Some(Membership::Invite) | Some(Membership::Leave)
        )
}

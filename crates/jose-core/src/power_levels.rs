use std::collections::BTreeMap;

use serde::{de, Deserialize, Deserializer, Serialize};

use crate::domain::UserId;

pub const EVENT_TYPE: &str = "m.room.power_levels";

/// Level given to muted members. Below the default `events_default` of 0, so they cannot talk.
pub const MUTED_LEVEL: i64 = -1;

const DEFAULT_USERS_DEFAULT: i64 = 0;
const DEFAULT_STATE_DEFAULT: i64 = 50;

/// `m.room.power_levels` content.
///
/// Keys the bot does not touch (`ban`, `kick`, `redact`, `notifications`, ...)
/// are kept in `extra` so writing the state back never drops them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerLevels {
    #[serde(
        default,
        deserialize_with = "level_map",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub users: BTreeMap<String, i64>,
    #[serde(
        default,
        deserialize_with = "opt_level",
        skip_serializing_if = "Option::is_none"
    )]
    pub users_default: Option<i64>,
    #[serde(
        default,
        deserialize_with = "level_map",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub events: BTreeMap<String, i64>,
    #[serde(
        default,
        deserialize_with = "opt_level",
        skip_serializing_if = "Option::is_none"
    )]
    pub events_default: Option<i64>,
    #[serde(
        default,
        deserialize_with = "opt_level",
        skip_serializing_if = "Option::is_none"
    )]
    pub state_default: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PowerLevels {
    pub fn from_content(content: serde_json::Value) -> serde_json::Result<Self> {
        serde_json::from_value(content)
    }

    pub fn to_content(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    pub fn user_level(&self, user: &UserId) -> i64 {
        self.users
            .get(user.as_str())
            .copied()
            .unwrap_or(self.users_default.unwrap_or(DEFAULT_USERS_DEFAULT))
    }

    pub fn state_level(&self, event_type: &str) -> i64 {
        self.events
            .get(event_type)
            .copied()
            .unwrap_or(self.state_default.unwrap_or(DEFAULT_STATE_DEFAULT))
    }

    pub fn can_send_state(&self, user: &UserId, event_type: &str) -> bool {
        self.user_level(user) >= self.state_level(event_type)
    }

    /// Silence `user` while still letting them react.
    pub fn mute(&mut self, user: &UserId) {
        self.events.insert("m.reaction".to_string(), MUTED_LEVEL);
        self.users.insert(user.as_str().to_string(), MUTED_LEVEL);
    }

    /// Drop the override for `user`. Returns whether there was one.
    pub fn unmute(&mut self, user: &UserId) -> bool {
        self.users.remove(user.as_str()).is_some()
    }
}

// Room versions before 10 allow levels encoded as strings ("50").
#[derive(Deserialize)]
#[serde(untagged)]
enum RawLevel {
    Int(i64),
    Str(String),
}

impl RawLevel {
    fn into_int<E: de::Error>(self) -> Result<i64, E> {
        match self {
            RawLevel::Int(n) => Ok(n),
            RawLevel::Str(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid power level: {s:?}"))),
        }
    }
}

fn level_map<'de, D>(d: D) -> Result<BTreeMap<String, i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, RawLevel>::deserialize(d)?;
    raw.into_iter()
        .map(|(k, v)| v.into_int().map(|n| (k, n)))
        .collect()
}

fn opt_level<'de, D>(d: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<RawLevel>::deserialize(d)?
        .map(RawLevel::into_int)
        .transpose()
}

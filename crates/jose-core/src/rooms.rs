use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::domain::{RoomId, UserId};

/// Names learned from sync, used for log lines and notices.
#[derive(Debug, Default)]
pub struct RoomCache {
    inner: RwLock<HashMap<RoomId, RoomInfo>>,
}

#[derive(Debug, Default)]
struct RoomInfo {
    name: Option<String>,
    canonical_alias: Option<String>,
    members: HashMap<UserId, Option<String>>,
}

/// A state change relevant to the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoomUpdate {
    Name(Option<String>),
    CanonicalAlias(Option<String>),
    Member {
        user: UserId,
        display_name: Option<String>,
        joined: bool,
    },
}

impl RoomCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn apply(&self, room_id: &RoomId, update: RoomUpdate) {
        let mut map = self.inner.write().await;
        let info = map.entry(room_id.clone()).or_default();
        match update {
            RoomUpdate::Name(name) => info.name = name.filter(|n| !n.trim().is_empty()),
            RoomUpdate::CanonicalAlias(alias) => info.canonical_alias = alias,
            RoomUpdate::Member {
                user,
                display_name,
                joined,
            } => {
                if joined {
                    info.members.insert(user, display_name);
                } else {
                    info.members.remove(&user);
                }
            }
        }
    }

    /// Room name, then canonical alias, then the raw id.
    pub async fn display_name(&self, room_id: &RoomId) -> String {
        let map = self.inner.read().await;
        map.get(room_id)
            .and_then(|i| i.name.clone().or_else(|| i.canonical_alias.clone()))
            .unwrap_or_else(|| room_id.0.clone())
    }

    /// Display name of a joined member, if they set one.
    pub async fn member_name(&self, room_id: &RoomId, user: &UserId) -> Option<String> {
        let map = self.inner.read().await;
        map.get(room_id)?.members.get(user)?.clone()
    }

    pub async fn forget(&self, room_id: &RoomId) {
        self.inner.write().await.remove(room_id);
    }
}

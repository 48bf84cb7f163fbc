//! `/sync` response model and the translation into core events.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use jose_core::{
    domain::{EventId, Membership, RoomId, UserId},
    messaging::types::{IncomingEvent, InviteEvent, MembershipEvent, ReactionEvent},
    rooms::RoomUpdate,
};

#[derive(Debug, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: Rooms,
}

#[derive(Debug, Default, Deserialize)]
pub struct Rooms {
    #[serde(default)]
    pub join: BTreeMap<String, JoinedRoom>,
    #[serde(default)]
    pub invite: BTreeMap<String, InvitedRoom>,
    #[serde(default)]
    pub leave: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct JoinedRoom {
    #[serde(default)]
    pub state: RoomEvents,
    #[serde(default)]
    pub timeline: RoomEvents,
}

#[derive(Debug, Default, Deserialize)]
pub struct RoomEvents {
    #[serde(default)]
    pub events: Vec<RoomEvent>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InvitedRoom {
    #[serde(default)]
    pub invite_state: StrippedEvents,
}

#[derive(Debug, Default, Deserialize)]
pub struct StrippedEvents {
    #[serde(default)]
    pub events: Vec<RoomEvent>,
}

/// Client event as delivered by sync. Stripped invite-state events share the
/// shape minus `event_id` and `unsigned`.
#[derive(Debug, Deserialize)]
pub struct RoomEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub event_id: Option<String>,
    pub sender: String,
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub unsigned: Unsigned,
    /// Pre-v1.1 servers put this at the top level instead of in `unsigned`.
    pub prev_content: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Unsigned {
    pub prev_content: Option<Value>,
}

impl RoomEvent {
    fn prev_content(&self) -> Option<&Value> {
        self.unsigned
            .prev_content
            .as_ref()
            .or(self.prev_content.as_ref())
    }
}

/// What one sync response means for the bot.
#[derive(Debug, Default)]
pub struct SyncBatch {
    /// Cache updates, applied before `events` are dispatched.
    pub updates: Vec<(RoomId, RoomUpdate)>,
    /// Events to hand to the moderator, in server order per room.
    pub events: Vec<IncomingEvent>,
    /// Rooms the bot is no longer in.
    pub left: Vec<RoomId>,
}

/// Lift the events the bot cares about out of a sync response.
///
/// Membership changes are only taken from the timeline: with `full_state` the
/// `state` section replays every member's current state, which must never be
/// mistaken for new joins.
pub fn extract(resp: &SyncResponse, own: &UserId) -> SyncBatch {
    let mut batch = SyncBatch::default();

    for (room_id, room) in &resp.rooms.invite {
        let room_id = RoomId(room_id.clone());
        let own_invite = room.invite_state.events.iter().find(|ev| {
            ev.event_type == "m.room.member"
                && ev.state_key.as_deref() == Some(own.as_str())
                && membership_of(&ev.content) == Some(Membership::Invite)
        });
        if let Some(ev) = own_invite {
            batch.events.push(IncomingEvent::Invite(InviteEvent {
                room_id,
                sender: ev.sender.clone(),
                invitee: own.clone(),
            }));
        }
    }

    for (room_id, room) in &resp.rooms.join {
        let room_id = RoomId(room_id.clone());

        for ev in &room.state.events {
            if let Some(update) = room_update(ev) {
                batch.updates.push((room_id.clone(), update));
            }
        }

        for ev in &room.timeline.events {
            if let Some(update) = room_update(ev) {
                batch.updates.push((room_id.clone(), update));
            }
            match ev.event_type.as_str() {
                "m.room.member" => {
                    if let Some(m) = membership_event(&room_id, ev) {
                        batch.events.push(IncomingEvent::Membership(m));
                    }
                }
                "m.reaction" => {
                    if let Some(r) = reaction_event(&room_id, ev) {
                        batch.events.push(IncomingEvent::Reaction(r));
                    }
                }
                _ => {}
            }
        }
    }

    batch.left = resp
        .rooms
        .leave
        .keys()
        .map(|id| RoomId(id.clone()))
        .collect();

    batch
}

fn membership_of(content: &Value) -> Option<Membership> {
    content
        .get("membership")
        .and_then(Value::as_str)
        .map(Membership::parse)
}

fn display_name_of(content: &Value) -> Option<String> {
    content
        .get("displayname")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn room_update(ev: &RoomEvent) -> Option<RoomUpdate> {
    match ev.event_type.as_str() {
        "m.room.name" => Some(RoomUpdate::Name(
            ev.content
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string),
        )),
        "m.room.canonical_alias" => Some(RoomUpdate::CanonicalAlias(
            ev.content
                .get("alias")
                .and_then(Value::as_str)
                .map(str::to_string),
        )),
        "m.room.member" => {
            let user = UserId::parse(ev.state_key.as_deref()?).ok()?;
            Some(RoomUpdate::Member {
                user,
                display_name: display_name_of(&ev.content),
                joined: membership_of(&ev.content)? == Membership::Join,
            })
        }
        _ => None,
    }
}

fn membership_event(room_id: &RoomId, ev: &RoomEvent) -> Option<MembershipEvent> {
    let member = UserId::parse(ev.state_key.as_deref()?).ok()?;
    Some(MembershipEvent {
        room_id: room_id.clone(),
        event_id: ev.event_id.clone().map(EventId),
        member,
        membership: membership_of(&ev.content)?,
        prev_membership: ev.prev_content().and_then(membership_of),
        display_name: display_name_of(&ev.content),
    })
}

fn reaction_event(room_id: &RoomId, ev: &RoomEvent) -> Option<ReactionEvent> {
    let rel = ev.content.get("m.relates_to")?;
    if rel.get("rel_type").and_then(Value::as_str) != Some("m.annotation") {
        return None;
    }
    let relates_to = rel.get("event_id").and_then(Value::as_str)?;
    let key = rel.get("key").and_then(Value::as_str)?;
    Some(ReactionEvent {
        room_id: room_id.clone(),
        event_id: ev.event_id.clone().map(EventId),
        sender: UserId::parse(&ev.sender).ok()?,
        relates_to: EventId(relates_to.to_string()),
        key: key.to_string(),
    })
}

use crate::domain::{EventId, Membership, RoomId, UserId};

/// Events the bot reacts to, already lifted out of a sync response.
#[derive(Clone, Debug)]
pub enum IncomingEvent {
    Invite(InviteEvent),
    Membership(MembershipEvent),
    Reaction(ReactionEvent),
}

/// An invite addressed to the bot.
#[derive(Clone, Debug)]
pub struct InviteEvent {
    pub room_id: RoomId,
    pub sender: String,
    pub invitee: UserId,
}

/// An `m.room.member` state change.
#[derive(Clone, Debug)]
pub struct MembershipEvent {
    pub room_id: RoomId,
    pub event_id: Option<EventId>,
    /// The member whose state changed (`state_key`).
    pub member: UserId,
    pub membership: Membership,
    pub prev_membership: Option<Membership>,
    pub display_name: Option<String>,
}

/// An `m.reaction` annotating another event.
#[derive(Clone, Debug)]
pub struct ReactionEvent {
    pub room_id: RoomId,
    pub event_id: Option<EventId>,
    pub sender: UserId,
    pub relates_to: EventId,
    pub key: String,
}

/// A raw event fetched by id (`GET /rooms/{room}/event/{event}`).
#[derive(Clone, Debug)]
pub struct FetchedEvent {
    pub event_id: EventId,
    pub sender: String,
    pub event_type: String,
    pub content: serde_json::Value,
}

//! Join moderation: mute members from servers outside the allow-list until
//! they react to a notice with the emoji assigned to them.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::{
    domain::{is_fresh_join, EventId, RoomId, UserId},
    messaging::{
        notice::{join_confirm_member, send_text_to_room, JOIN_CONFIRM},
        port::MatrixPort,
        types::{IncomingEvent, InviteEvent, MembershipEvent, ReactionEvent},
    },
    policy::{JoinDecision, JoinPolicy},
    power_levels::{self, PowerLevels},
    reactions::reaction_for,
    rooms::RoomCache,
};

const JOIN_ATTEMPTS: usize = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InviteOutcome {
    /// Invite was for someone else.
    Ignored,
    Joined { attempts: usize },
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipOutcome {
    /// Not a fresh join (profile change, leave, ...).
    Ignored,
    OwnJoin,
    Allowed,
    DryRun,
    PowerLevelsUnavailable,
    NotPermitted,
    UpdateFailed,
    Challenged {
        reaction: &'static str,
        notice: Option<EventId>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReactionOutcome {
    EventUnavailable,
    NotJoinConfirm,
    WrongSender,
    WrongKey,
    PowerLevelsUnavailable,
    AlreadyUnmuted,
    UpdateFailed,
    Unmuted,
}

pub struct Moderator {
    port: Arc<dyn MatrixPort>,
    policy: JoinPolicy,
    rooms: Arc<RoomCache>,
    join_confirm_template: String,
}

impl Moderator {
    pub fn new(
        port: Arc<dyn MatrixPort>,
        policy: JoinPolicy,
        rooms: Arc<RoomCache>,
        join_confirm_template: impl Into<String>,
    ) -> Self {
        Self {
            port,
            policy,
            rooms,
            join_confirm_template: join_confirm_template.into(),
        }
    }

    /// Route one event to its handler. Failures are logged, never returned.
    pub async fn handle(&self, event: &IncomingEvent) {
        match event {
            IncomingEvent::Invite(e) => {
                self.on_invite(e).await;
            }
            IncomingEvent::Membership(e) => {
                self.on_membership(e).await;
            }
            IncomingEvent::Reaction(e) => {
                self.on_reaction(e).await;
            }
        }
    }

    pub async fn on_invite(&self, event: &InviteEvent) -> InviteOutcome {
        if &event.invitee != self.port.user_id() {
            return InviteOutcome::Ignored;
        }
        debug!("Got invite to {} from {}.", event.room_id, event.sender);

        for attempt in 1..=JOIN_ATTEMPTS {
            match self.port.join_room(&event.room_id).await {
                Ok(()) => {
                    info!("Joined {}", event.room_id);
                    return InviteOutcome::Joined { attempts: attempt };
                }
                Err(e) => {
                    error!(
                        "Error joining room {} (attempt {attempt}): {e}",
                        event.room_id
                    );
                }
            }
        }

        error!("Unable to join room: {}", event.room_id);
        InviteOutcome::Failed
    }

    pub async fn on_membership(&self, event: &MembershipEvent) -> MembershipOutcome {
        if !is_fresh_join(&event.membership, event.prev_membership.as_ref()) {
            return MembershipOutcome::Ignored;
        }

        let room_name = self.rooms.display_name(&event.room_id).await;
        let name = event.display_name.as_deref().unwrap_or("");
        let member = &event.member;
        info!("New user joined in {room_name}: {name} ({member})");
        debug!("join event {}", event_id_or_dash(event.event_id.as_ref()));

        if member == self.port.user_id() {
            return MembershipOutcome::OwnJoin;
        }

        match self.policy.decide(member.server_name()) {
            JoinDecision::Allowed => {
                info!("{name} ({member}) is in allowed servers. Stop processing.");
                return MembershipOutcome::Allowed;
            }
            JoinDecision::DryRun => {
                info!(
                    "[dry run] {name} ({member}) is from {}, would be muted in {room_name}.",
                    member.server_name()
                );
                return MembershipOutcome::DryRun;
            }
            JoinDecision::Moderate => {}
        }

        let Some(mut levels) = self.fetch_power_levels(&event.room_id).await else {
            warn!(
                "Failed to get power level data in room {room_name} ({}). Stop processing.",
                event.room_id
            );
            return MembershipOutcome::PowerLevelsUnavailable;
        };

        if !levels.can_send_state(self.port.user_id(), power_levels::EVENT_TYPE) {
            warn!(
                "Bot is unable to update power levels in {room_name} ({}). Stop processing.",
                event.room_id
            );
            return MembershipOutcome::NotPermitted;
        }

        levels.mute(member);
        if let Err(e) = self.write_power_levels(&event.room_id, &levels).await {
            warn!("Failed to reconfigure power level: {e}");
            return MembershipOutcome::UpdateFailed;
        }

        let reaction = reaction_for(member.as_str());
        let display = match event.display_name.clone() {
            Some(n) => n,
            None => self
                .rooms
                .member_name(&event.room_id, member)
                .await
                .unwrap_or_else(|| member.localpart().to_string()),
        };
        let body = render_join_confirm(&self.join_confirm_template, &display, member, reaction);

        let mut meta = Map::new();
        meta.insert("type".to_string(), Value::String(JOIN_CONFIRM.to_string()));
        meta.insert(
            "state_key".to_string(),
            Value::String(member.as_str().to_string()),
        );

        let notice = match send_text_to_room(
            self.port.as_ref(),
            &event.room_id,
            &body,
            true,
            None,
            Some(meta),
        )
        .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                error!("Unable to send message response to {}: {e}", event.room_id);
                None
            }
        };

        MembershipOutcome::Challenged { reaction, notice }
    }

    pub async fn on_reaction(&self, event: &ReactionEvent) -> ReactionOutcome {
        debug!(
            "Got reaction {} to {} in {} from {}.",
            event_id_or_dash(event.event_id.as_ref()),
            event.relates_to,
            event.room_id,
            event.sender
        );

        let target = match self.port.get_event(&event.room_id, &event.relates_to).await {
            Ok(ev) => ev,
            Err(e) => {
                warn!(
                    "Error getting event that was reacted to ({}): {e}",
                    event.relates_to
                );
                return ReactionOutcome::EventUnavailable;
            }
        };

        if target.event_type != "m.room.message" || target.sender != self.port.user_id().as_str()
        {
            return ReactionOutcome::NotJoinConfirm;
        }
        let Some(state_key) = join_confirm_member(&target.content) else {
            return ReactionOutcome::NotJoinConfirm;
        };
        let Ok(member) = UserId::parse(state_key) else {
            return ReactionOutcome::NotJoinConfirm;
        };

        if event.sender != member {
            debug!(
                "{} reacted to the join confirmation of {member}. Ignoring.",
                event.sender
            );
            return ReactionOutcome::WrongSender;
        }
        if event.key != reaction_for(member.as_str()) {
            return ReactionOutcome::WrongKey;
        }

        let Some(mut levels) = self.fetch_power_levels(&event.room_id).await else {
            debug!(
                "Failed to get power level data in room {}. Stop processing.",
                event.room_id
            );
            return ReactionOutcome::PowerLevelsUnavailable;
        };

        if !levels.unmute(&member) {
            return ReactionOutcome::AlreadyUnmuted;
        }
        if let Err(e) = self.write_power_levels(&event.room_id, &levels).await {
            warn!("Failed to reconfigure power level: {e}");
            return ReactionOutcome::UpdateFailed;
        }

        info!(
            "{member} confirmed their join in {} (notice {}).",
            event.room_id, target.event_id
        );
        ReactionOutcome::Unmuted
    }

    async fn fetch_power_levels(&self, room_id: &RoomId) -> Option<PowerLevels> {
        let content = match self
            .port
            .get_state_event(room_id, power_levels::EVENT_TYPE, "")
            .await
        {
            Ok(c) => c,
            Err(e) => {
                debug!("get {} in {room_id} failed: {e}", power_levels::EVENT_TYPE);
                return None;
            }
        };
        match PowerLevels::from_content(content) {
            Ok(levels) => Some(levels),
            Err(e) => {
                debug!("malformed {} in {room_id}: {e}", power_levels::EVENT_TYPE);
                None
            }
        }
    }

    async fn write_power_levels(
        &self,
        room_id: &RoomId,
        levels: &PowerLevels,
    ) -> crate::Result<EventId> {
        let content = levels.to_content()?;
        self.port
            .put_state_event(room_id, power_levels::EVENT_TYPE, "", &content)
            .await
    }
}

fn event_id_or_dash(id: Option<&EventId>) -> &str {
    id.map_or("-", EventId::as_str)
}

/// Fill `{name}`, `{user_id}` and `{reaction}` in a notice template.
pub fn render_join_confirm(template: &str, name: &str, user: &UserId, reaction: &str) -> String {
    template
        .replace("{name}", name)
        .replace("{user_id}", user.as_str())
        .replace("{reaction}", reaction)
}

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use serde_json::{json, Value};

use jose_core::{
    config::DEFAULT_JOIN_CONFIRM_TEMPLATE,
    domain::{EventId, Membership, RoomId, UserId},
    errors::Error,
    messaging::{
        notice::{BOT_NAMESPACE, JOIN_CONFIRM},
        port::MatrixPort,
        types::{FetchedEvent, IncomingEvent, InviteEvent, MembershipEvent, ReactionEvent},
    },
    moderation::{InviteOutcome, MembershipOutcome, Moderator, ReactionOutcome},
    policy::JoinPolicy,
    reactions::{reaction_for, REACTIONS},
    rooms::{RoomCache, RoomUpdate},
    Result,
};

const BOT: &str = "@bot:home.org";
const ROOM: &str = "!room:home.org";

#[derive(Clone, Debug, PartialEq)]
enum Call {
    Join(String),
    GetState(String),
    PutState(String, Value),
    GetEvent(String),
    Send(String, Value),
}

struct FakeMatrix {
    user: UserId,
    power_levels: Mutex<Value>,
    events: Mutex<HashMap<String, FetchedEvent>>,
    calls: Mutex<Vec<Call>>,
    join_failures: AtomicUsize,
    fail_put: bool,
    fail_get_state: bool,
}

impl FakeMatrix {
    fn new(power_levels: Value) -> Self {
        Self {
            user: UserId::parse(BOT).unwrap(),
            power_levels: Mutex::new(power_levels),
            events: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            join_failures: AtomicUsize::new(0),
            fail_put: false,
            fail_get_state: false,
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn mutating_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::PutState(..) | Call::Send(..) | Call::Join(_)))
            .collect()
    }

    fn levels(&self) -> Value {
        self.power_levels.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

fn not_found() -> Error {
    Error::Matrix {
        status: 404,
        errcode: "M_NOT_FOUND".to_string(),
        message: "not found".to_string(),
    }
}

#[async_trait]
impl MatrixPort for FakeMatrix {
    fn user_id(&self) -> &UserId {
        &self.user
    }

    async fn join_room(&self, room_id: &RoomId) -> Result<()> {
        self.record(Call::Join(room_id.0.clone()));
        let left = self.join_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.join_failures.store(left - 1, Ordering::SeqCst);
            return Err(Error::Transport("connection reset".to_string()));
        }
        Ok(())
    }

    async fn get_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        _state_key: &str,
    ) -> Result<Value> {
        self.record(Call::GetState(room_id.0.clone()));
        if self.fail_get_state || event_type != "m.room.power_levels" {
            return Err(not_found());
        }
        Ok(self.levels())
    }

    async fn put_state_event(
        &self,
        room_id: &RoomId,
        _event_type: &str,
        _state_key: &str,
        content: &Value,
    ) -> Result<EventId> {
        self.record(Call::PutState(room_id.0.clone(), content.clone()));
        if self.fail_put {
            return Err(Error::Matrix {
                status: 403,
                errcode: "M_FORBIDDEN".to_string(),
                message: "no".to_string(),
            });
        }
        *self.power_levels.lock().unwrap() = content.clone();
        Ok(EventId("$state".to_string()))
    }

    async fn get_event(&self, room_id: &RoomId, event_id: &EventId) -> Result<FetchedEvent> {
        self.record(Call::GetEvent(room_id.0.clone()));
        self.events
            .lock()
            .unwrap()
            .get(&event_id.0)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn send_message(&self, room_id: &RoomId, content: &Value) -> Result<EventId> {
        self.record(Call::Send(room_id.0.clone(), content.clone()));
        let id = format!("$notice{}", self.calls().len());
        self.events.lock().unwrap().insert(
            id.clone(),
            FetchedEvent {
                event_id: EventId(id.clone()),
                sender: BOT.to_string(),
                event_type: "m.room.message".to_string(),
                content: content.clone(),
            },
        );
        Ok(EventId(id))
    }
}

fn moderator_levels() -> Value {
    json!({
        "users": { BOT: 100 },
        "events": { "m.room.power_levels": 100 },
        "ban": 50,
        "state_default": 50
    })
}

fn moderator(port: Arc<FakeMatrix>, allowed: &[&str], dry_run: bool) -> Moderator {
    let servers: BTreeSet<String> = allowed.iter().map(|s| s.to_string()).collect();
    Moderator::new(
        port,
        JoinPolicy::new(servers, dry_run),
        Arc::new(RoomCache::new()),
        DEFAULT_JOIN_CONFIRM_TEMPLATE,
    )
}

fn join(user: &str, prev: Option<Membership>) -> MembershipEvent {
    MembershipEvent {
        room_id: RoomId(ROOM.to_string()),
        event_id: Some(EventId("$join".to_string())),
        member: UserId::parse(user).unwrap(),
        membership: Membership::Join,
        prev_membership: prev,
        display_name: Some("Newbie".to_string()),
    }
}

fn reaction(sender: &str, to: &EventId, key: &str) -> ReactionEvent {
    ReactionEvent {
        room_id: RoomId(ROOM.to_string()),
        event_id: Some(EventId("$react".to_string())),
        sender: UserId::parse(sender).unwrap(),
        relates_to: to.clone(),
        key: key.to_string(),
    }
}

fn wrong_key(user: &str) -> &'static str {
    let right = reaction_for(user);
    REACTIONS.iter().copied().find(|r| *r != right).unwrap()
}

#[tokio::test]
async fn allowed_server_is_left_alone() {
    let port = Arc::new(FakeMatrix::new(moderator_levels()));
    let m = moderator(port.clone(), &["friendly.org"], false);

    let out = m.on_membership(&join("@a:friendly.org", None)).await;
    assert_eq!(out, MembershipOutcome::Allowed);
    assert!(port.calls().is_empty());
}

#[tokio::test]
async fn dry_run_takes_no_action() {
    let port = Arc::new(FakeMatrix::new(moderator_levels()));
    let m = moderator(port.clone(), &["friendly.org"], true);

    let out = m.on_membership(&join("@a:stranger.net", None)).await;
    assert_eq!(out, MembershipOutcome::DryRun);
    assert!(port.calls().is_empty());
}

#[tokio::test]
async fn profile_updates_and_own_join_are_ignored() {
    let port = Arc::new(FakeMatrix::new(moderator_levels()));
    let m = moderator(port.clone(), &[], false);

    let out = m
        .on_membership(&join("@a:stranger.net", Some(Membership::Join)))
        .await;
    assert_eq!(out, MembershipOutcome::Ignored);

    let out = m.on_membership(&join(BOT, Some(Membership::Invite))).await;
    assert_eq!(out, MembershipOutcome::OwnJoin);

    assert!(port.calls().is_empty());
}

#[tokio::test]
async fn stranger_is_muted_and_challenged() {
    let port = Arc::new(FakeMatrix::new(moderator_levels()));
    let m = moderator(port.clone(), &["friendly.org"], false);
    let user = "@a:stranger.net";

    let out = m.on_membership(&join(user, Some(Membership::Leave))).await;
    let MembershipOutcome::Challenged { reaction, notice } = out.clone() else {
        panic!("expected a challenge, got {out:?}");
    };
    assert_eq!(reaction, reaction_for(user));
    assert!(notice.is_some());

    let levels = port.levels();
    assert_eq!(levels["users"][user], -1);
    assert_eq!(levels["users"][BOT], 100);
    assert_eq!(levels["events"]["m.reaction"], -1);
    assert_eq!(levels["ban"], 50);

    let sent = port
        .calls()
        .into_iter()
        .find_map(|c| match c {
            Call::Send(_, content) => Some(content),
            _ => None,
        })
        .unwrap();
    assert_eq!(sent["msgtype"], "m.notice");
    assert_eq!(sent[BOT_NAMESPACE]["type"], JOIN_CONFIRM);
    assert_eq!(sent[BOT_NAMESPACE]["state_key"], user);
    let body = sent["body"].as_str().unwrap();
    assert!(body.contains("Newbie"));
    assert!(body.contains(user));
    assert!(body.contains(reaction));
}

#[tokio::test]
async fn no_permission_means_no_write() {
    let port = Arc::new(FakeMatrix::new(json!({
        "users": { BOT: 50 },
        "events": { "m.room.power_levels": 100 }
    })));
    let m = moderator(port.clone(), &[], false);

    let out = m.on_membership(&join("@a:stranger.net", None)).await;
    assert_eq!(out, MembershipOutcome::NotPermitted);
    assert!(port.mutating_calls().is_empty());
}

#[tokio::test]
async fn missing_power_levels_stops_processing() {
    let mut fake = FakeMatrix::new(moderator_levels());
    fake.fail_get_state = true;
    let port = Arc::new(fake);
    let m = moderator(port.clone(), &[], false);

    let out = m.on_membership(&join("@a:stranger.net", None)).await;
    assert_eq!(out, MembershipOutcome::PowerLevelsUnavailable);
    assert!(port.mutating_calls().is_empty());
}

#[tokio::test]
async fn failed_state_write_sends_no_notice() {
    let mut fake = FakeMatrix::new(moderator_levels());
    fake.fail_put = true;
    let port = Arc::new(fake);
    let m = moderator(port.clone(), &[], false);

    let out = m.on_membership(&join("@a:stranger.net", None)).await;
    assert_eq!(out, MembershipOutcome::UpdateFailed);
    assert!(!port.calls().iter().any(|c| matches!(c, Call::Send(..))));
}

#[tokio::test]
async fn right_reaction_from_member_unmutes() {
    let port = Arc::new(FakeMatrix::new(moderator_levels()));
    let m = moderator(port.clone(), &[], false);
    let user = "@a:stranger.net";

    let MembershipOutcome::Challenged {
        notice: Some(notice),
        ..
    } = m.on_membership(&join(user, None)).await
    else {
        panic!("expected a challenge");
    };

    let out = m
        .on_reaction(&reaction(user, &notice, reaction_for(user)))
        .await;
    assert_eq!(out, ReactionOutcome::Unmuted);

    let levels = port.levels();
    assert!(levels["users"].get(user).is_none());
    assert_eq!(levels["users"][BOT], 100);

    // A second confirmation has nothing left to undo.
    let again = m
        .on_reaction(&reaction(user, &notice, reaction_for(user)))
        .await;
    assert_eq!(again, ReactionOutcome::AlreadyUnmuted);
}

#[tokio::test]
async fn wrong_key_or_sender_keeps_member_muted() {
    let port = Arc::new(FakeMatrix::new(moderator_levels()));
    let m = moderator(port.clone(), &[], false);
    let user = "@a:stranger.net";

    let MembershipOutcome::Challenged {
        notice: Some(notice),
        ..
    } = m.on_membership(&join(user, None)).await
    else {
        panic!("expected a challenge");
    };

    let out = m.on_reaction(&reaction(user, &notice, wrong_key(user))).await;
    assert_eq!(out, ReactionOutcome::WrongKey);

    let out = m
        .on_reaction(&reaction("@helper:stranger.net", &notice, reaction_for(user)))
        .await;
    assert_eq!(out, ReactionOutcome::WrongSender);

    assert_eq!(port.levels()["users"][user], -1);
}

#[tokio::test]
async fn reactions_to_other_events_are_ignored() {
    let port = Arc::new(FakeMatrix::new(moderator_levels()));
    port.events.lock().unwrap().insert(
        "$chat".to_string(),
        FetchedEvent {
            event_id: EventId("$chat".to_string()),
            sender: "@someone:home.org".to_string(),
            event_type: "m.room.message".to_string(),
            content: json!({
                "msgtype": "m.text",
                "body": "spoofed",
                BOT_NAMESPACE: { "type": JOIN_CONFIRM, "state_key": "@a:stranger.net" }
            }),
        },
    );
    let m = moderator(port.clone(), &[], false);

    let out = m
        .on_reaction(&reaction("@a:stranger.net", &EventId("$chat".into()), "🎉"))
        .await;
    assert_eq!(out, ReactionOutcome::NotJoinConfirm);

    let out = m
        .on_reaction(&reaction("@a:stranger.net", &EventId("$gone".into()), "🎉"))
        .await;
    assert_eq!(out, ReactionOutcome::EventUnavailable);

    // Bot-sent, but not a message.
    port.events.lock().unwrap().insert(
        "$topic".to_string(),
        FetchedEvent {
            event_id: EventId("$topic".to_string()),
            sender: BOT.to_string(),
            event_type: "m.room.topic".to_string(),
            content: json!({
                "topic": "rules",
                BOT_NAMESPACE: { "type": JOIN_CONFIRM, "state_key": "@a:stranger.net" }
            }),
        },
    );
    let out = m
        .on_reaction(&reaction(
            "@a:stranger.net",
            &EventId("$topic".into()),
            reaction_for("@a:stranger.net"),
        ))
        .await;
    assert_eq!(out, ReactionOutcome::NotJoinConfirm);
    assert!(port.mutating_calls().is_empty());
}

#[tokio::test]
async fn invite_joins_with_retries() {
    let port = Arc::new(FakeMatrix::new(moderator_levels()));
    port.join_failures.store(2, Ordering::SeqCst);
    let m = moderator(port.clone(), &[], false);

    let invite = InviteEvent {
        room_id: RoomId(ROOM.to_string()),
        sender: "@admin:home.org".to_string(),
        invitee: UserId::parse(BOT).unwrap(),
    };
    assert_eq!(
        m.on_invite(&invite).await,
        InviteOutcome::Joined { attempts: 3 }
    );

    port.join_failures.store(5, Ordering::SeqCst);
    assert_eq!(m.on_invite(&invite).await, InviteOutcome::Failed);
    let joins = port
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::Join(_)))
        .count();
    assert_eq!(joins, 6);
}

#[tokio::test]
async fn invites_for_others_are_ignored() {
    let port = Arc::new(FakeMatrix::new(moderator_levels()));
    let m = moderator(port.clone(), &[], false);

    let invite = InviteEvent {
        room_id: RoomId(ROOM.to_string()),
        sender: "@admin:home.org".to_string(),
        invitee: UserId::parse("@friend:home.org").unwrap(),
    };
    assert_eq!(m.on_invite(&invite).await, InviteOutcome::Ignored);
    assert!(port.calls().is_empty());
}

#[tokio::test]
async fn notice_falls_back_to_cached_member_name() {
    let port = Arc::new(FakeMatrix::new(moderator_levels()));
    let rooms = Arc::new(RoomCache::new());
    let user = UserId::parse("@a:stranger.net").unwrap();
    rooms
        .apply(
            &RoomId(ROOM.to_string()),
            RoomUpdate::Member {
                user: user.clone(),
                display_name: Some("Cached Name".into()),
                joined: true,
            },
        )
        .await;
    let m = Moderator::new(
        port.clone(),
        JoinPolicy::default(),
        rooms,
        "{name}/{reaction}",
    );

    let mut ev = join(user.as_str(), None);
    ev.display_name = None;
    m.handle(&IncomingEvent::Membership(ev)).await;

    let body = port
        .calls()
        .into_iter()
        .find_map(|c| match c {
            Call::Send(_, content) => content["body"].as_str().map(str::to_string),
            _ => None,
        })
        .unwrap();
    assert_eq!(body, format!("Cached Name/{}", reaction_for(user.as_str())));
}

use serde_json::{json, Map, Value};

use crate::{
    domain::{EventId, RoomId},
    messaging::port::MatrixPort,
    Result,
};

/// Custom content key marking messages sent by this bot.
pub const BOT_NAMESPACE: &str = "io.github.shadowrz.jose_bot";

/// `type` of the notice asking a new member to confirm with a reaction.
pub const JOIN_CONFIRM: &str = "join_confirm";

/// Build `m.room.message` content carrying the bot metadata key.
///
/// `notice` selects `m.notice`, which clients do not ping for. Metadata `type`
/// defaults to `"text"` when `extended` does not set one.
pub fn message_content(
    body: &str,
    notice: bool,
    reply_to: Option<&EventId>,
    extended: Option<Map<String, Value>>,
) -> Value {
    let msgtype = if notice { "m.notice" } else { "m.text" };

    let mut meta = extended.unwrap_or_default();
    meta.insert(
        "in_reply_to".to_string(),
        reply_to.map_or(Value::Null, |id| Value::String(id.0.clone())),
    );
    let has_type = meta
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| !t.is_empty());
    if !has_type {
        meta.insert("type".to_string(), Value::String("text".to_string()));
    }

    let mut content = json!({
        "msgtype": msgtype,
        "body": body,
    });
    if let Some(id) = reply_to {
        content["m.relates_to"] = json!({ "m.in_reply_to": { "event_id": id.0 } });
    }
    content[BOT_NAMESPACE] = Value::Object(meta);
    content
}

pub fn bot_event_type(content: &Value) -> Option<&str> {
    content.get(BOT_NAMESPACE)?.get("type")?.as_str()
}

/// Member a join-confirm notice is addressed to.
pub fn join_confirm_member(content: &Value) -> Option<&str> {
    if bot_event_type(content) != Some(JOIN_CONFIRM) {
        return None;
    }
    content.get(BOT_NAMESPACE)?.get("state_key")?.as_str()
}

pub async fn send_text_to_room(
    port: &dyn MatrixPort,
    room_id: &RoomId,
    body: &str,
    notice: bool,
    reply_to: Option<&EventId>,
    extended: Option<Map<String, Value>>,
) -> Result<EventId> {
    let content = message_content(body, notice, reply_to, extended);
    port.send_message(room_id, &content).await
}

use async_trait::async_trait;

use crate::{
    domain::{EventId, RoomId, UserId},
    messaging::types::FetchedEvent,
    Result,
};

/// What the bot needs from a homeserver.
///
/// The Matrix client-server adapter is the production implementation; tests use
/// an in-memory fake.
#[async_trait]
pub trait MatrixPort: Send + Sync {
    /// The account the bot is logged in as.
    fn user_id(&self) -> &UserId;

    async fn join_room(&self, room_id: &RoomId) -> Result<()>;

    async fn get_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<serde_json::Value>;

    async fn put_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
        content: &serde_json::Value,
    ) -> Result<EventId>;

    async fn get_event(&self, room_id: &RoomId, event_id: &EventId) -> Result<FetchedEvent>;

    /// Send an `m.room.message` event.
    async fn send_message(&self, room_id: &RoomId, content: &serde_json::Value)
        -> Result<EventId>;
}

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{EventId, RoomId, UserId},
    messaging::{port::MatrixPort, types::FetchedEvent},
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* homeserver calls.
    pub global_min_interval: Duration,
    /// Minimum spacing between calls touching the same room.
    pub per_room_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        // Conservative; homeservers rate-limit per account.
        Self {
            global_min_interval: Duration::from_millis(100),
            per_room_min_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// MatrixPort decorator that spaces out outbound calls.
///
/// A burst of joins (a raid) would otherwise fire a state write and a notice
/// per member back to back and trip `M_LIMIT_EXCEEDED`.
pub struct ThrottledMatrix {
    inner: Arc<dyn MatrixPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_room: Mutex<HashMap<String, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledMatrix {
    pub fn new(inner: Arc<dyn MatrixPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_room: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for_room(&self, room_id: &RoomId) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_room.lock().await;
        map.entry(room_id.0.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_room_min_interval,
                )))
            })
            .clone()
    }

    /// Drop the limiter of a room the bot has left.
    pub async fn forget_room(&self, room_id: &RoomId) {
        self.per_room.lock().await.remove(room_id.as_str());
    }

    async fn throttle_room(&self, room_id: &RoomId) {
        let global_wait = { self.global.lock().await.reserve() };
        let room_wait = {
            let lim = self.limiter_for_room(room_id).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(room_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait]
impl MatrixPort for ThrottledMatrix {
    fn user_id(&self) -> &UserId {
        self.inner.user_id()
    }

    async fn join_room(&self, room_id: &RoomId) -> Result<()> {
        self.throttle_room(room_id).await;
        self.inner.join_room(room_id).await
    }

    async fn get_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<serde_json::Value> {
        self.throttle_room(room_id).await;
        self.inner
            .get_state_event(room_id, event_type, state_key)
            .await
    }

    async fn put_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
        content: &serde_json::Value,
    ) -> Result<EventId> {
        self.throttle_room(room_id).await;
        self.inner
            .put_state_event(room_id, event_type, state_key, content)
            .await
    }

    async fn get_event(&self, room_id: &RoomId, event_id: &EventId) -> Result<FetchedEvent> {
        self.throttle_room(room_id).await;
        self.inner.get_event(room_id, event_id).await
    }

    async fn send_message(
        &self,
        room_id: &RoomId,
        content: &serde_json::Value,
    ) -> Result<EventId> {
        self.throttle_room(room_id).await;
        self.inner.send_message(room_id, content).await
    }
}

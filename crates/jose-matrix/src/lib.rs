//! Matrix adapter (client-server API over reqwest).
//!
//! This crate implements the `jose-core` MatrixPort against a homeserver and
//! drives the sync loop.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, warn};

pub mod router;
pub mod sync;

use jose_core::{
    domain::{EventId, RoomId, UserId},
    errors::Error,
    messaging::{port::MatrixPort, types::FetchedEvent},
    Result,
};

use crate::{router::SyncSource, sync::SyncResponse};

const CLIENT_API: &str = "/_matrix/client/v3";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Extra room on top of the long-poll timeout before the HTTP call gives up.
const SYNC_GRACE: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct MatrixClient {
    homeserver: String,
    http: reqwest::Client,
    user_id: UserId,
    access_token: String,
    device_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
    retry_after_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    user_id: String,
    access_token: String,
    device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhoAmIResponse {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct EventIdResponse {
    event_id: String,
}

#[derive(Debug, Deserialize)]
struct RawFetchedEvent {
    event_id: String,
    sender: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    content: serde_json::Value,
}

impl MatrixClient {
    /// Log in with a password (`m.login.password`).
    pub async fn login_password(
        homeserver: &str,
        user_id: &UserId,
        password: &str,
        device_id: Option<&str>,
        device_name: &str,
    ) -> Result<Self> {
        let http = build_http()?;
        let body = login_body(user_id, password, device_id, device_name);
        let url = endpoint(homeserver, "/login");

        let resp: LoginResponse = execute(None, || http.post(&url).json(&body)).await?;
        let user_id = UserId::parse(&resp.user_id)?;

        Ok(Self {
            homeserver: homeserver.to_string(),
            http,
            user_id,
            access_token: resp.access_token,
            device_id: resp.device_id,
        })
    }

    /// Reuse an existing access token. The token is not checked until [`Self::whoami`].
    pub fn with_token(
        homeserver: &str,
        user_id: UserId,
        access_token: &str,
        device_id: Option<&str>,
    ) -> Result<Self> {
        Ok(Self {
            homeserver: homeserver.to_string(),
            http: build_http()?,
            user_id,
            access_token: access_token.to_string(),
            device_id: device_id.map(str::to_string),
        })
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Ask the homeserver who the token belongs to.
    pub async fn whoami(&self) -> Result<UserId> {
        let resp: WhoAmIResponse = self.call(Method::GET, "/account/whoami", None).await?;
        UserId::parse(&resp.user_id)
    }

    /// Long-poll `/sync`.
    pub async fn sync(
        &self,
        since: Option<&str>,
        timeout: Duration,
        full_state: bool,
    ) -> Result<SyncResponse> {
        let url = endpoint(&self.homeserver, "/sync");
        let mut query = vec![
            ("timeout", timeout.as_millis().to_string()),
            ("full_state", full_state.to_string()),
        ];
        if let Some(since) = since {
            query.push(("since", since.to_string()));
        }

        execute(Some(&self.access_token), || {
            self.http
                .get(&url)
                .query(&query)
                .timeout(timeout + SYNC_GRACE)
        })
        .await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T> {
        let url = endpoint(&self.homeserver, path);
        execute(Some(&self.access_token), || {
            let req = self.http.request(method.clone(), &url);
            match body {
                Some(b) => req.json(b),
                None => req,
            }
        })
        .await
    }
}

#[async_trait]
impl MatrixPort for MatrixClient {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    async fn join_room(&self, room_id: &RoomId) -> Result<()> {
        let path = format!("/join/{}", urlencoding::encode(room_id.as_str()));
        let _: serde_json::Value = self.call(Method::POST, &path, Some(&json!({}))).await?;
        Ok(())
    }

    async fn get_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<serde_json::Value> {
        let path = state_path(room_id, event_type, state_key);
        self.call(Method::GET, &path, None).await
    }

    async fn put_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
        content: &serde_json::Value,
    ) -> Result<EventId> {
        let path = state_path(room_id, event_type, state_key);
        let resp: EventIdResponse = self.call(Method::PUT, &path, Some(content)).await?;
        Ok(EventId(resp.event_id))
    }

    async fn get_event(&self, room_id: &RoomId, event_id: &EventId) -> Result<FetchedEvent> {
        let path = format!(
            "/rooms/{}/event/{}",
            urlencoding::encode(room_id.as_str()),
            urlencoding::encode(event_id.as_str())
        );
        let raw: RawFetchedEvent = self.call(Method::GET, &path, None).await?;
        Ok(FetchedEvent {
            event_id: EventId(raw.event_id),
            sender: raw.sender,
            event_type: raw.event_type,
            content: raw.content,
        })
    }

    async fn send_message(
        &self,
        room_id: &RoomId,
        content: &serde_json::Value,
    ) -> Result<EventId> {
        let txn_id = uuid::Uuid::new_v4().to_string();
        let path = format!(
            "/rooms/{}/send/m.room.message/{}",
            urlencoding::encode(room_id.as_str()),
            txn_id
        );
        let resp: EventIdResponse = self.call(Method::PUT, &path, Some(content)).await?;
        Ok(EventId(resp.event_id))
    }
}

#[async_trait]
impl SyncSource for MatrixClient {
    async fn sync(
        &self,
        since: Option<&str>,
        timeout: Duration,
        full_state: bool,
    ) -> Result<SyncResponse> {
        MatrixClient::sync(self, since, timeout, full_state).await
    }
}

fn build_http() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("jose-bot/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::External(format!("http client build failed: {e}")))
}

fn endpoint(homeserver: &str, path: &str) -> String {
    format!("{}{CLIENT_API}{path}", homeserver.trim_end_matches('/'))
}

fn state_path(room_id: &RoomId, event_type: &str, state_key: &str) -> String {
    let base = format!(
        "/rooms/{}/state/{}",
        urlencoding::encode(room_id.as_str()),
        urlencoding::encode(event_type)
    );
    if state_key.is_empty() {
        base
    } else {
        format!("{base}/{}", urlencoding::encode(state_key))
    }
}

fn login_body(
    user_id: &UserId,
    password: &str,
    device_id: Option<&str>,
    device_name: &str,
) -> serde_json::Value {
    let mut body = json!({
        "type": "m.login.password",
        "identifier": { "type": "m.id.user", "user": user_id.as_str() },
        "password": password,
        "initial_device_display_name": device_name,
    });
    if let Some(id) = device_id {
        body["device_id"] = json!(id);
    }
    body
}

fn map_send_err(e: reqwest::Error) -> Error {
    Error::Transport(e.to_string())
}

/// Whether a failed response asks us to back off and try again.
fn is_rate_limited(status: StatusCode, body: &ErrorBody) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || body.errcode == "M_LIMIT_EXCEEDED"
}

/// Send a request, retrying once when the homeserver rate-limits us.
async fn execute<T: DeserializeOwned>(
    token: Option<&str>,
    mut build: impl FnMut() -> RequestBuilder,
) -> Result<T> {
    const MAX_RETRIES: usize = 1;
    let mut attempts = 0usize;
    loop {
        let mut req = build();
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(map_send_err)?;
        let status = resp.status();

        if status.is_success() {
            return resp
                .json::<T>()
                .await
                .map_err(|e| Error::External(format!("matrix json error: {e}")));
        }

        let body: ErrorBody = resp.json().await.unwrap_or_default();
        if is_rate_limited(status, &body) && attempts < MAX_RETRIES {
            attempts += 1;
            let wait = Duration::from_millis(body.retry_after_ms.unwrap_or(1_000));
            warn!("rate limited by homeserver, retrying in {}ms", wait.as_millis());
            sleep(wait).await;
            continue;
        }

        debug!("matrix request failed: {status} {}", body.errcode);
        return Err(Error::Matrix {
            status: status.as_u16(),
            errcode: if body.errcode.is_empty() {
                "M_UNKNOWN".to_string()
            } else {
                body.errcode
            },
            message: body.error,
        });
    }
}

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jose_core::{
    config::{Config, Credentials},
    domain::UserId,
    errors::Error,
    messaging::{
        port::MatrixPort,
        throttled::{ThrottleConfig, ThrottledMatrix},
    },
    moderation::Moderator,
    policy::JoinPolicy,
    rooms::RoomCache,
    Result,
};

use crate::{
    sync::{extract, SyncBatch, SyncResponse},
    MatrixClient,
};

const SYNC_TIMEOUT: Duration = Duration::from_secs(30);
const INITIAL_SYNC_RETRY: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(15);

/// The `/sync` side of a logged-in homeserver connection.
#[async_trait]
pub trait SyncSource: MatrixPort {
    async fn sync(
        &self,
        since: Option<&str>,
        timeout: Duration,
        full_state: bool,
    ) -> Result<SyncResponse>;
}

/// Run the bot until `shutdown` fires.
///
/// Connection problems and unexpected errors restart the session after a
/// pause; a rejected login ends the loop with an error.
pub async fn run_sync(cfg: Arc<Config>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let cfg: &Config = &cfg;
    supervise(cfg, &shutdown, move || connect(cfg)).await
}

/// Reconnect loop. The sync token and the room cache outlive a session, so a
/// new session picks up exactly where the last one stopped.
async fn supervise<S, C, F>(
    cfg: &Config,
    shutdown: &CancellationToken,
    mut connect: C,
) -> anyhow::Result<()>
where
    S: SyncSource + 'static,
    C: FnMut() -> F,
    F: Future<Output = Result<Arc<S>>>,
{
    info!(
        "Allowed servers: {}{}",
        cfg.allowed_servers.len(),
        if cfg.dry_run { " (dry run)" } else { "" }
    );

    let rooms = Arc::new(RoomCache::new());
    let mut since: Option<String> = None;

    loop {
        let outcome = match cancellable(shutdown, connect()).await {
            None => return Ok(()),
            Some(Ok(client)) => run_session(cfg, client, &rooms, &mut since, shutdown).await,
            Some(Err(e)) => Err(e),
        };

        match outcome {
            Ok(()) => return Ok(()),
            Err(e @ Error::Config(_)) => return Err(e.into()),
            Err(e) if e.is_transport() => {
                warn!("Unable to connect to homeserver, retrying in 15s... ({e})");
            }
            Err(e) => {
                error!("An exception was raised: {e}");
            }
        }

        if !pause(shutdown, RECONNECT_DELAY).await {
            return Ok(());
        }
    }
}

/// Follow the sync stream until it fails or shutdown fires.
///
/// Without a stored token the session first syncs the full state once; those
/// events happened before the bot started and only feed the room cache.
/// `since` is advanced after each batch has been dispatched.
async fn run_session<S: SyncSource + 'static>(
    cfg: &Config,
    client: Arc<S>,
    rooms: &Arc<RoomCache>,
    since: &mut Option<String>,
    shutdown: &CancellationToken,
) -> Result<()> {
    info!("Logged in as {}", client.user_id());
    let own = client.user_id().clone();

    if since.is_none() {
        let initial = loop {
            let Some(res) = cancellable(shutdown, client.sync(None, SYNC_TIMEOUT, true)).await
            else {
                return Ok(());
            };
            match res {
                Ok(resp) => break resp,
                Err(e) if e.is_transport() => return Err(e),
                Err(e) => {
                    warn!("Initial sync failed, retrying in 30s... ({e})");
                    if !pause(shutdown, INITIAL_SYNC_RETRY).await {
                        return Ok(());
                    }
                }
            }
        };
        apply_updates(rooms, &extract(&initial, &own)).await;
        *since = Some(initial.next_batch);
        info!("Initial sync completed.");
    } else {
        info!("Resuming sync.");
    }

    let throttled = Arc::new(ThrottledMatrix::new(
        client.clone(),
        ThrottleConfig::default(),
    ));
    let moderator = Moderator::new(
        throttled.clone(),
        JoinPolicy::new(cfg.allowed_servers.clone(), cfg.dry_run),
        rooms.clone(),
        cfg.join_confirm_template.clone(),
    );

    loop {
        let Some(res) =
            cancellable(shutdown, client.sync(since.as_deref(), SYNC_TIMEOUT, false)).await
        else {
            return Ok(());
        };
        let resp = res?;
        let batch = extract(&resp, &own);
        apply_updates(rooms, &batch).await;
        for room_id in &batch.left {
            throttled.forget_room(room_id).await;
        }
        for event in &batch.events {
            moderator.handle(event).await;
        }
        *since = Some(resp.next_batch);
    }
}

async fn connect(cfg: &Config) -> Result<Arc<MatrixClient>> {
    let m = &cfg.matrix;
    let client = match &m.credentials {
        Credentials::Token(token) => {
            let client = MatrixClient::with_token(
                &m.homeserver_url,
                m.user_id.clone(),
                token,
                m.device_id.as_deref(),
            )?;
            check_token_owner(&m.user_id, client.whoami().await)?;
            client
        }
        Credentials::Password(password) => MatrixClient::login_password(
            &m.homeserver_url,
            &m.user_id,
            password,
            m.device_id.as_deref(),
            &m.device_name,
        )
        .await
        .map_err(login_failure)?,
    };
    debug!("device: {}", client.device_id().unwrap_or("(server assigned)"));
    Ok(Arc::new(client))
}

/// A token for another account is as fatal as a rejected one.
fn check_token_owner(expected: &UserId, whoami: Result<UserId>) -> Result<()> {
    match whoami {
        Ok(who) if &who != expected => Err(Error::Config(format!(
            "access token belongs to {who}, not {expected}"
        ))),
        Ok(_) => Ok(()),
        Err(e) => Err(login_failure(e)),
    }
}

fn login_failure(e: Error) -> Error {
    match e {
        Error::Matrix { message, .. } => Error::Config(format!("Failed to login: {message}")),
        other => other,
    }
}

async fn apply_updates(rooms: &RoomCache, batch: &SyncBatch) {
    for room_id in &batch.left {
        rooms.forget(room_id).await;
    }
    for (room_id, update) in &batch.updates {
        rooms.apply(room_id, update.clone()).await;
    }
}

/// `None` when shutdown won the race.
async fn cancellable<T>(shutdown: &CancellationToken, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        _ = shutdown.cancelled() => None,
        out = fut => Some(out),
    }
}

/// Sleep unless shut down first. Returns whether to keep going.
async fn pause(shutdown: &CancellationToken, d: Duration) -> bool {
    cancellable(shutdown, tokio::time::sleep(d)).await.is_some()
}

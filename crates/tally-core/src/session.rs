//! Device session client - login, heartbeat, logout
//!
//! A logged-in device refreshes its presence row every 25 seconds,
//! deliberately shorter than the server's 120-second staleness window so a
//! live device never appears stale to a concurrent login attempt under
//! normal network conditions.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::record::Record;
use crate::registry::Registry;
use crate::remote::{LoginOutcome, RemoteAuthority};

/// Interval between presence heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// An established device session.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub user: Record,
    pub user_id: String,
    pub device_id: String,
}

/// Attempt a remote-authenticated login for this device.
///
/// `LoginOutcome::ActiveElsewhere` must be surfaced to the user without
/// retry; transport errors bubble up as [`Error::Remote`].
pub async fn login<R: RemoteAuthority>(
    remote: &R,
    registry: &Registry,
    username: &str,
    password: &str,
    device_id: &str,
) -> Result<std::result::Result<Session, LoginOutcome>> {
    match remote.login(username, password, device_id).await? {
        LoginOutcome::Accepted(user) => {
            let users = registry
                .get("users")
                .ok_or_else(|| Error::UnknownTable("users".to_string()))?;
            let user_id = user.primary_key_of(users).ok_or_else(|| {
                Error::InvalidInput("login response user record has no userId".to_string())
            })?;
            tracing::info!(user_id, device_id, "device session established");
            Ok(Ok(Session {
                user,
                user_id,
                device_id: device_id.to_string(),
            }))
        }
        other => Ok(Err(other)),
    }
}

/// Remove the presence row outright, freeing the slot immediately for
/// another device.
pub async fn logout<R: RemoteAuthority>(remote: &R, session: &Session) -> Result<()> {
    remote.logout(&session.user_id).await?;
    tracing::info!(user_id = session.user_id, "device session released");
    Ok(())
}

/// Heartbeat loop; runs until the owning task is dropped. Individual
/// heartbeat failures are tolerated - the next tick tries again.
pub async fn run_heartbeat<R: RemoteAuthority>(remote: R, user_id: String, device_id: String) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(error) = remote.heartbeat(&user_id, &device_id).await {
            tracing::debug!(%error, user_id, "heartbeat failed; will retry next tick");
        }
    }
}

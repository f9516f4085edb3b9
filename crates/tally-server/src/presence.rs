//! Presence registry - one active device per user
//!
//! A login claims the user's presence row; the claim is refused while
//! another device holds a heartbeat younger than the staleness window.
//! Crashed devices stop heartbeating and age out, so the slot frees
//! itself without operator intervention.

use rusqlite::{Connection, OptionalExtension};

use crate::error::AppError;

/// A heartbeat older than this no longer blocks a new login.
pub const STALE_AFTER_MS: i64 = 120_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub device_id: String,
    pub last_heartbeat_at: i64,
}

pub fn get(conn: &Connection, user_id: &str) -> Result<Option<Presence>, AppError> {
    conn.query_row(
        "SELECT deviceId, lastHeartbeatAt FROM sessions WHERE userId = ?1",
        [user_id],
        |row| {
            Ok(Presence {
                device_id: row.get(0)?,
                last_heartbeat_at: row.get(1)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/// Try to claim the user's presence slot for `device_id` at `now_ms`.
///
/// Returns `false` when a different device holds a fresh heartbeat; the
/// same device re-claiming its own slot always succeeds.
pub fn claim(
    conn: &Connection,
    user_id: &str,
    device_id: &str,
    now_ms: i64,
) -> Result<bool, AppError> {
    if let Some(current) = get(conn, user_id)? {
        let fresh = now_ms - current.last_heartbeat_at < STALE_AFTER_MS;
        if fresh && current.device_id != device_id {
            tracing::info!(
                user_id,
                holder = current.device_id,
                rejected = device_id,
                "login refused; session active on another device"
            );
            return Ok(false);
        }
    }
    heartbeat(conn, user_id, device_id, now_ms)?;
    Ok(true)
}

pub fn heartbeat(
    conn: &Connection,
    user_id: &str,
    device_id: &str,
    now_ms: i64,
) -> Result<(), AppError> {
    conn.execute(
        "INSERT INTO sessions (userId, deviceId, lastHeartbeatAt) VALUES (?1, ?2, ?3)
         ON CONFLICT(userId) DO UPDATE SET deviceId = ?2, lastHeartbeatAt = ?3",
        rusqlite::params![user_id, device_id, now_ms],
    )?;
    Ok(())
}

pub fn release(conn: &Connection, user_id: &str) -> Result<(), AppError> {
    conn.execute("DELETE FROM sessions WHERE userId = ?1", [user_id])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tally_core::Registry;

    use super::*;
    use crate::db::Authority;

    fn sessions_db() -> Authority {
        let db = Authority::open_in_memory(Registry::retail()).unwrap();
        db.init_schema().unwrap();
        db
    }

    #[test]
    fn second_device_is_refused_while_the_heartbeat_is_fresh() {
        let db = sessions_db();
        let conn = db.connection();

        assert!(claim(conn, "u1", "device-a", 0).unwrap());
        assert!(!claim(conn, "u1", "device-b", 50_000).unwrap());

        let holder = get(conn, "u1").unwrap().unwrap();
        assert_eq!(holder.device_id, "device-a");
    }

    #[test]
    fn stale_heartbeat_frees_the_slot() {
        let db = sessions_db();
        let conn = db.connection();

        assert!(claim(conn, "u1", "device-a", 0).unwrap());
        assert!(claim(conn, "u1", "device-b", 130_000).unwrap());

        let holder = get(conn, "u1").unwrap().unwrap();
        assert_eq!(holder.device_id, "device-b");
        assert_eq!(holder.last_heartbeat_at, 130_000);
    }

    #[test]
    fn same_device_reclaims_its_own_slot() {
        let db = sessions_db();
        let conn = db.connection();

        assert!(claim(conn, "u1", "device-a", 0).unwrap());
        assert!(claim(conn, "u1", "device-a", 10_000).unwrap());
    }

    #[test]
    fn release_frees_the_slot_immediately() {
        let db = sessions_db();
        let conn = db.connection();

        assert!(claim(conn, "u1", "device-a", 0).unwrap());
        release(conn, "u1").unwrap();
        assert!(claim(conn, "u1", "device-b", 1_000).unwrap());
    }

    #[test]
    fn different_users_hold_independent_slots() {
        let db = sessions_db();
        let conn = db.connection();

        assert!(claim(conn, "u1", "device-a", 0).unwrap());
        assert!(claim(conn, "u2", "device-b", 0).unwrap());
    }
}

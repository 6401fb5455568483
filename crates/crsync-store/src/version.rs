//! The version store: local change counter and the synced watermark.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::Engine;
use crate::error::Result;

/// Per-database version state.
///
/// `synced <= current` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionState {
    /// Highest local `db_version` assigned.
    pub current: i64,
    /// Highest version already exchanged with the remote.
    pub synced: i64,
}

impl VersionState {
    /// True if local changes have not been pushed yet.
    pub fn has_unsynced(&self) -> bool {
        self.current > self.synced
    }
}

/// Read `current` from the engine and `synced` from the watermark table.
pub fn select_version(conn: &Connection) -> Result<VersionState> {
    let current = conn.current_version()?;
    let synced: i64 = conn.query_row("SELECT version FROM __crsync_version", [], |row| {
        row.get(0)
    })?;
    Ok(VersionState { current, synced })
}

/// Move the watermark to `version`, or to `current` when `None`.
///
/// The target is clamped into `[synced, current]`, so the watermark never
/// moves backwards or past the local counter. Returns the new watermark.
pub fn update_version(conn: &Connection, version: Option<i64>) -> Result<i64> {
    let state = select_version(conn)?;
    let target = version
        .unwrap_or(state.current)
        .min(state.current)
        .max(state.synced);

    if target != state.synced {
        conn.execute("UPDATE __crsync_version SET version = ?1", [target])?;
        debug!(from = state.synced, to = target, "advanced synced watermark");
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crr::enable_tracking;
    use crate::engine::open_connection;
    use proptest::prelude::*;

    fn setup() -> Connection {
        let conn = open_connection(":memory:").unwrap();
        conn.execute_batch("CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT);")
            .unwrap();
        enable_tracking(&conn, "kv").unwrap();
        conn
    }

    fn write(conn: &Connection, key: &str) {
        conn.execute(
            "INSERT INTO kv (k, v) VALUES (?1, 'x') ON CONFLICT (k) DO UPDATE SET v = v || 'x'",
            [key],
        )
        .unwrap();
    }

    #[test]
    fn test_fresh_database() {
        let conn = setup();
        assert_eq!(select_version(&conn).unwrap(), VersionState::default());
    }

    #[test]
    fn test_update_without_argument_syncs_to_current() {
        let conn = setup();
        write(&conn, "a");
        write(&conn, "b");
        let state = select_version(&conn).unwrap();
        assert_eq!(state.current, 2);
        assert!(state.has_unsynced());

        assert_eq!(update_version(&conn, None).unwrap(), 2);
        assert!(!select_version(&conn).unwrap().has_unsynced());
    }

    #[test]
    fn test_explicit_version_is_clamped() {
        let conn = setup();
        write(&conn, "a");
        write(&conn, "b");
        write(&conn, "c");

        assert_eq!(update_version(&conn, Some(2)).unwrap(), 2);
        assert_eq!(update_version(&conn, Some(1)).unwrap(), 2);
        assert_eq!(update_version(&conn, Some(99)).unwrap(), 3);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Write(u8),
        Sync(Option<i64>),
    }

    fn arb_step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0u8..4).prop_map(Step::Write),
            proptest::option::of(-2i64..12).prop_map(Step::Sync),
        ]
    }

    proptest! {
        #[test]
        fn prop_synced_is_monotonic_and_bounded(steps in proptest::collection::vec(arb_step(), 0..24)) {
            let conn = setup();
            let mut last = select_version(&conn).unwrap();
            for step in steps {
                match step {
                    Step::Write(k) => write(&conn, &k.to_string()),
                    Step::Sync(v) => { update_version(&conn, v).unwrap(); }
                }
                let state = select_version(&conn).unwrap();
                prop_assert!(state.synced >= last.synced);
                prop_assert!(state.current >= last.current);
                prop_assert!(state.synced <= state.current);
                last = state;
            }
        }
    }
}

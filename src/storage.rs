use std::fs;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::error::AppError;
use crate::models::SessionState;

/// Durable session store: one full-state JSON write per mutation.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    pub fn new(db_path: &str) -> Result<Self, AppError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                state_json TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Loads the session, creating and persisting a fresh one on first
    /// reference to the id.
    pub fn get_or_create(&self, session_id: &str) -> Result<SessionState, AppError> {
        let existing: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT state_json FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?
        };
        if let Some(raw) = existing {
            return Ok(serde_json::from_str(&raw)?);
        }
        let state = SessionState::new(session_id);
        self.save(&state)?;
        Ok(state)
    }

    pub fn save(&self, state: &SessionState) -> Result<(), AppError> {
        let payload = serde_json::to_string(state)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions(session_id, state_json, updated_at)
             VALUES(?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(session_id)
             DO UPDATE SET state_json = excluded.state_json, updated_at = CURRENT_TIMESTAMP",
            params![state.session_id, payload],
        )?;
        Ok(())
    }

    pub fn as_json(&self, session_id: &str) -> Result<serde_json::Value, AppError> {
        let state = self.get_or_create(session_id)?;
        Ok(serde_json::to_value(state)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LockPhase;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> SessionStore {
        SessionStore::new(tmp.path().join("sessions.db").to_str().unwrap()).unwrap()
    }

    #[test]
    fn first_reference_creates_fresh_state() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let state = store.get_or_create("abc").unwrap();
        assert_eq!(state.session_id, "abc");
        assert_eq!(state.step, 1);
        assert!(state.images.is_empty());
    }

    #[test]
    fn mutations_round_trip_through_save() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let mut state = store.get_or_create("abc").unwrap();
        state.step = 5;
        state.lock = LockPhase::Asked;
        state.spec.product_type = Some("jar".to_string());
        state.spec.dimensions.insert("wall_thickness_mm".to_string(), 2.0);
        store.save(&state).unwrap();

        let loaded = store.get_or_create("abc").unwrap();
        assert_eq!(loaded.step, 5);
        assert_eq!(loaded.lock, LockPhase::Asked);
        assert_eq!(loaded.spec.product_type.as_deref(), Some("jar"));
        assert_eq!(loaded.spec.dimensions.get("wall_thickness_mm"), Some(&2.0));
    }

    #[test]
    fn reset_keeps_session_id_continuity() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let mut state = store.get_or_create("abc").unwrap();
        state.step = 6;
        state.cad_code = Some("import cadquery as cq".to_string());
        state.reset();
        store.save(&state).unwrap();

        let loaded = store.get_or_create("abc").unwrap();
        assert_eq!(loaded.session_id, "abc");
        assert_eq!(loaded.step, 1);
        assert!(loaded.cad_code.is_none());
    }

    #[test]
    fn sessions_are_independent() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let mut a = store.get_or_create("a").unwrap();
        a.step = 4;
        store.save(&a).unwrap();

        let b = store.get_or_create("b").unwrap();
        assert_eq!(b.step, 1);
    }
}

//! Fire log in SQLite. The listener side only pushes onto a channel; a Tokio
//! task owns the write connection and commits whatever has queued up every
//! 300ms in one transaction.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::arbiter::TriggerEvent;

const FLUSH_EVERY: Duration = Duration::from_millis(300);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS fires (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    profile_id   TEXT    NOT NULL,
    profile_name TEXT    NOT NULL,
    distance     REAL    NOT NULL,
    session      INTEGER NOT NULL,
    created_at   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_fires_created ON fires(created_at);
CREATE INDEX IF NOT EXISTS idx_fires_profile ON fires(profile_id);
";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireRecord {
    pub profile_id: String,
    pub profile_name: String,
    pub distance: f64,
    /// Generation of the listening session that fired.
    pub session: u64,
    /// Unix seconds.
    pub created_at: i64,
}

impl FireRecord {
    pub fn from_event(event: &TriggerEvent, session: u64) -> Self {
        Self {
            profile_id: event.profile.to_string(),
            profile_name: event.name.clone(),
            distance: f64::from(event.distance),
            session,
            created_at: unix_now(),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            profile_id: row.get("profile_id")?,
            profile_name: row.get("profile_name")?,
            distance: row.get("distance")?,
            session: row.get::<_, i64>("session")? as u64,
            created_at: row.get("created_at")?,
        })
    }
}

/// Fire totals for one profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileTally {
    pub profile_id: String,
    pub profile_name: String,
    pub fires: u64,
    pub last_fire: i64,
}

pub struct HistoryStore {
    queue: Mutex<Option<mpsc::UnboundedSender<FireRecord>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Connection>,
}

fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

impl HistoryStore {
    /// Open or create the log. Must be called inside a Tokio runtime.
    pub fn open(path: &Path) -> Result<Arc<Self>, String> {
        let reader =
            open_connection(path).map_err(|e| format!("open history {}: {e}", path.display()))?;
        reader
            .execute_batch(SCHEMA)
            .map_err(|e| format!("history schema: {e}"))?;
        let writer_conn =
            open_connection(path).map_err(|e| format!("open history writer: {e}"))?;

        let (queue, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(rx, writer_conn));
        info!(path = %path.display(), "history opened");

        Ok(Arc::new(Self {
            queue: Mutex::new(Some(queue)),
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(reader),
        }))
    }

    /// Queue a fire for the next batch.
    pub fn record(&self, record: FireRecord) {
        let queued = self
            .queue
            .lock()
            .as_ref()
            .is_some_and(|q| q.send(record).is_ok());
        if !queued {
            warn!("history closed, fire not logged");
        }
    }

    /// Flush what is queued and stop the writer.
    pub async fn close(&self) {
        self.queue.lock().take();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!(error = %e, "history writer ended abnormally");
            }
        }
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<FireRecord>, String> {
        let conn = self.reader.lock();
        let mut stmt = conn
            .prepare(
                "SELECT profile_id, profile_name, distance, session, created_at
                 FROM fires ORDER BY created_at DESC, id DESC LIMIT ?1",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![limit as i64], FireRecord::from_row)
            .map_err(|e| e.to_string())?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| e.to_string())
    }

    /// Per-profile totals, most active first.
    pub fn tallies(&self) -> Result<Vec<ProfileTally>, String> {
        let conn = self.reader.lock();
        let mut stmt = conn
            .prepare(
                "SELECT profile_id, MAX(profile_name), COUNT(*), MAX(created_at)
                 FROM fires GROUP BY profile_id ORDER BY COUNT(*) DESC, profile_id",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ProfileTally {
                    profile_id: row.get(0)?,
                    profile_name: row.get(1)?,
                    fires: row.get::<_, i64>(2)? as u64,
                    last_fire: row.get(3)?,
                })
            })
            .map_err(|e| e.to_string())?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| e.to_string())
    }

    /// Delete fires older than `days`; returns how many went.
    pub fn prune(&self, days: u32) -> Result<usize, String> {
        let cutoff = unix_now() - i64::from(days) * 86_400;
        let removed = self
            .reader
            .lock()
            .execute("DELETE FROM fires WHERE created_at < ?1", params![cutoff])
            .map_err(|e| e.to_string())?;
        if removed > 0 {
            info!(removed, days, "history pruned");
        }
        Ok(removed)
    }
}

async fn write_loop(mut rx: mpsc::UnboundedReceiver<FireRecord>, mut conn: Connection) {
    let mut tick = tokio::time::interval(FLUSH_EVERY);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pending = Vec::new();

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(record) => {
                    pending.push(record);
                    continue;
                }
                None => break,
            },
            _ = tick.tick() => {}
        }
        if !pending.is_empty() {
            commit(&mut conn, &mut pending);
        }
    }

    if !pending.is_empty() {
        commit(&mut conn, &mut pending);
    }
    debug!("history writer stopped");
}

/// Insert and clear `pending`. A failed batch is logged and dropped.
fn commit(conn: &mut Connection, pending: &mut Vec<FireRecord>) {
    let count = pending.len();
    let result = (|| -> rusqlite::Result<()> {
        let tx = conn.transaction()?;
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO fires (profile_id, profile_name, distance, session, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for r in pending.iter() {
                insert.execute(params![
                    r.profile_id,
                    r.profile_name,
                    r.distance,
                    r.session as i64,
                    r.created_at
                ])?;
            }
        }
        tx.commit()
    })();
    pending.clear();
    match result {
        Ok(()) => debug!(count, "history batch committed"),
        Err(e) => warn!(count, error = %e, "history batch dropped"),
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fire(profile: &str, distance: f64, created_at: i64) -> FireRecord {
        FireRecord {
            profile_id: profile.to_string(),
            profile_name: profile.to_uppercase(),
            distance,
            session: 3,
            created_at,
        }
    }

    fn temp_db() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("soundtrigger-history-{}.db", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn close_flushes_queued_fires() {
        let path = temp_db();
        let history = HistoryStore::open(&path).unwrap();
        let now = unix_now();
        history.record(fire("a", 0.5, now - 2));
        history.record(fire("b", 1.0, now - 1));
        history.record(fire("a", 0.7, now));
        history.close().await;

        let recent = history.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0], fire("a", 0.7, now));

        let tallies = history.tallies().unwrap();
        assert_eq!(tallies[0].profile_id, "a");
        assert_eq!(tallies[0].fires, 2);
        assert_eq!(tallies[0].last_fire, now);
        assert_eq!(tallies[1].fires, 1);

        // fires after close are dropped, not queued
        history.record(fire("c", 0.1, now));
        assert_eq!(history.recent(10).unwrap().len(), 3);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn prune_removes_only_old_fires() {
        let path = temp_db();
        let history = HistoryStore::open(&path).unwrap();
        let now = unix_now();
        history.record(fire("old", 0.2, now - 10 * 86_400));
        history.record(fire("new", 0.2, now));
        history.close().await;

        assert_eq!(history.prune(7).unwrap(), 1);
        let left = history.recent(10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].profile_id, "new");
        let _ = std::fs::remove_file(&path);
    }
}

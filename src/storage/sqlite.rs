use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{FileRecord, SkipCounter, Storage, UserRotationState};

#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl SqliteStore {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("storage: set busy timeout")?;
        migrate(&conn)?;

        tracing::debug!(path = %path.display(), "sqlite storage ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }
}

impl Storage for SqliteStore {
    fn upsert_file(&self, rec: &FileRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO files (file_id, db_chat_id, db_message_id, kind, caption)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(file_id) DO UPDATE SET
  db_chat_id = excluded.db_chat_id,
  db_message_id = excluded.db_message_id,
  kind = excluded.kind,
  caption = excluded.caption
"#,
            params![
                rec.file_id,
                rec.db_chat_id,
                rec.db_message_id,
                rec.kind,
                rec.caption,
            ],
        )
        .context("storage: upsert file")?;
        Ok(())
    }

    fn file(&self, file_id: &str) -> Result<Option<FileRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
SELECT file_id, db_chat_id, db_message_id, kind, caption
FROM files
WHERE file_id = ?1
"#,
            params![file_id],
            file_from_row,
        )
        .optional()
        .context("storage: query file")
    }

    fn save_link(&self, code: &str, file_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO links (code, file_id) VALUES (?1, ?2)
ON CONFLICT(code) DO UPDATE SET file_id = excluded.file_id
"#,
            params![code, file_id],
        )
        .context("storage: save link")?;
        Ok(())
    }

    fn resolve_link(&self, code: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT file_id FROM links WHERE code = ?1",
            params![code],
            |row| row.get(0),
        )
        .optional()
        .context("storage: resolve link")
    }

    fn rotation_state(&self, user_id: i64) -> Result<UserRotationState> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO user_state (user_id, rotation_offset, last_gate_key, last_rotated_ts)
VALUES (?1, 0, '', 0)
ON CONFLICT(user_id) DO NOTHING
"#,
            params![user_id],
        )
        .context("storage: create user state")?;
        conn.query_row(
            r#"
SELECT user_id, rotation_offset, last_gate_key, last_rotated_ts
FROM user_state
WHERE user_id = ?1
"#,
            params![user_id],
            state_from_row,
        )
        .context("storage: query user state")
    }

    fn bump_rotation(&self, user_id: i64, now: i64) -> Result<UserRotationState> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
INSERT INTO user_state (user_id, rotation_offset, last_gate_key, last_rotated_ts)
VALUES (?1, 1, '', ?2)
ON CONFLICT(user_id) DO UPDATE SET
  rotation_offset = rotation_offset + 1,
  last_rotated_ts = excluded.last_rotated_ts
RETURNING user_id, rotation_offset, last_gate_key, last_rotated_ts
"#,
            params![user_id, now],
            state_from_row,
        )
        .context("storage: bump rotation")
    }

    fn try_bump_rotation(
        &self,
        user_id: i64,
        key: &str,
        now: i64,
        min_interval: i64,
    ) -> Result<Option<UserRotationState>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
UPDATE user_state SET
  rotation_offset = rotation_offset + 1,
  last_rotated_ts = ?3
WHERE user_id = ?1
  AND last_gate_key = ?2
  AND last_gate_key <> ''
  AND ?3 - last_rotated_ts >= ?4
RETURNING user_id, rotation_offset, last_gate_key, last_rotated_ts
"#,
            params![user_id, key, now, min_interval],
            state_from_row,
        )
        .optional()
        .context("storage: conditional bump rotation")
    }

    fn set_gate_key(&self, user_id: i64, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO user_state (user_id, rotation_offset, last_gate_key, last_rotated_ts)
VALUES (?1, 0, ?2, 0)
ON CONFLICT(user_id) DO UPDATE SET last_gate_key = excluded.last_gate_key
"#,
            params![user_id, key],
        )
        .context("storage: set gate key")?;
        Ok(())
    }

    fn increment_skip(&self, check_handle: &str, n: u64) -> Result<()> {
        let n = i64::try_from(n).context("storage: skip increment out of range")?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO skip_stats (check_handle, skips) VALUES (?1, ?2)
ON CONFLICT(check_handle) DO UPDATE SET skips = skips + excluded.skips
"#,
            params![check_handle, n],
        )
        .context("storage: increment skip")?;
        Ok(())
    }

    fn top_skips(&self, limit: usize) -> Result<Vec<SkipCounter>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
SELECT check_handle, skips
FROM skip_stats
ORDER BY skips DESC, id ASC
LIMIT ?1
"#,
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let skips: i64 = row.get(1)?;
                Ok(SkipCounter {
                    check_handle: row.get(0)?,
                    skips: skips.max(0) as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        file_id: row.get(0)?,
        db_chat_id: row.get(1)?,
        db_message_id: row.get(2)?,
        kind: row.get(3)?,
        caption: row.get(4)?,
    })
}

fn state_from_row(row: &Row<'_>) -> rusqlite::Result<UserRotationState> {
    let offset: i64 = row.get(1)?;
    Ok(UserRotationState {
        user_id: row.get(0)?,
        offset: offset.max(0) as u64,
        last_gate_key: row.get(2)?,
        last_rotated_ts: row.get(3)?,
    })
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let migrations = migrations();
    for (idx, sql) in migrations.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![
                version,
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::from_secs(0))
                    .as_secs() as i64,
            ],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![
        r#"
CREATE TABLE IF NOT EXISTS files (
  file_id TEXT PRIMARY KEY,
  db_chat_id INTEGER NOT NULL,
  db_message_id INTEGER NOT NULL,
  kind TEXT NOT NULL,
  caption TEXT
);

CREATE TABLE IF NOT EXISTS links (
  code TEXT PRIMARY KEY,
  file_id TEXT NOT NULL
);
"#,
        r#"
CREATE TABLE IF NOT EXISTS user_state (
  user_id INTEGER PRIMARY KEY,
  rotation_offset INTEGER NOT NULL DEFAULT 0,
  last_gate_key TEXT NOT NULL DEFAULT '',
  last_rotated_ts INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS skip_stats (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  check_handle TEXT NOT NULL UNIQUE,
  skips INTEGER NOT NULL DEFAULT 0 CHECK (skips >= 0)
);

CREATE INDEX IF NOT EXISTS idx_skip_stats_skips ON skip_stats(skips);
"#,
    ]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("fsub-gate").join("state.db"))
}

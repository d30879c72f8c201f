use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::{StorageBackend, StorageConfig};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{default_path as sqlite_default_path, Options, SqliteStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub file_id: String,
    pub db_chat_id: i64,
    pub db_message_id: i64,
    pub kind: String,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserRotationState {
    pub user_id: i64,
    pub offset: u64,
    pub last_gate_key: String,
    pub last_rotated_ts: i64,
}

impl UserRotationState {
    pub fn fresh(user_id: i64) -> Self {
        Self {
            user_id,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipCounter {
    pub check_handle: String,
    pub skips: u64,
}

/// Everything the bot persists. Counter updates must be atomic in the
/// backend itself, several processes may share one store.
pub trait Storage: Send + Sync {
    fn upsert_file(&self, rec: &FileRecord) -> Result<()>;
    fn file(&self, file_id: &str) -> Result<Option<FileRecord>>;

    fn save_link(&self, code: &str, file_id: &str) -> Result<()>;
    fn resolve_link(&self, code: &str) -> Result<Option<String>>;

    /// Returns the rotation state, creating the zero state on first access.
    fn rotation_state(&self, user_id: i64) -> Result<UserRotationState>;
    /// Atomically increments the offset and stamps `now` as the rotation time.
    fn bump_rotation(&self, user_id: i64, now: i64) -> Result<UserRotationState>;
    /// Bumps like [`Storage::bump_rotation`], but only while `key` is the open
    /// gate and at least `min_interval` seconds have passed since the last
    /// rotation. Check and bump happen as one atomic step; `None` means the
    /// state was left untouched.
    fn try_bump_rotation(
        &self,
        user_id: i64,
        key: &str,
        now: i64,
        min_interval: i64,
    ) -> Result<Option<UserRotationState>>;
    fn set_gate_key(&self, user_id: i64, key: &str) -> Result<()>;

    fn increment_skip(&self, check_handle: &str, n: u64) -> Result<()>;
    fn top_skips(&self, limit: usize) -> Result<Vec<SkipCounter>>;
}

pub fn open(cfg: &StorageConfig) -> Result<Arc<dyn Storage>> {
    match cfg.backend {
        StorageBackend::Sqlite => {
            let store = SqliteStore::open(Options {
                path: cfg.sqlite_path.clone(),
            })
            .context("open sqlite storage")?;
            Ok(Arc::new(store))
        }
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every backend must share.

    use std::sync::Arc;
    use std::thread;

    use super::*;

    pub fn files_round_trip(store: &dyn Storage) {
        assert_eq!(store.file("missing").unwrap(), None);
        let mut rec = FileRecord {
            file_id: "f1".into(),
            db_chat_id: -100_1,
            db_message_id: 10,
            kind: "document".into(),
            caption: Some("<b>hi</b>".into()),
        };
        store.upsert_file(&rec).unwrap();
        rec.db_message_id = 11;
        rec.caption = None;
        store.upsert_file(&rec).unwrap();
        assert_eq!(store.file("f1").unwrap(), Some(rec));
    }

    pub fn links_resolve(store: &dyn Storage) {
        assert_eq!(store.resolve_link("abc").unwrap(), None);
        store.save_link("abc", "f1").unwrap();
        store.save_link("abc", "f2").unwrap();
        assert_eq!(store.resolve_link("abc").unwrap().as_deref(), Some("f2"));
    }

    pub fn rotation_defaults_and_bumps(store: &dyn Storage) {
        let fresh = store.rotation_state(5).unwrap();
        assert_eq!(fresh, UserRotationState::fresh(5));

        store.set_gate_key(5, "F1").unwrap();
        let bumped = store.bump_rotation(5, 1_700_000_000).unwrap();
        assert_eq!(bumped.offset, 1);
        assert_eq!(bumped.last_rotated_ts, 1_700_000_000);
        assert_eq!(bumped.last_gate_key, "F1");

        let bumped = store.bump_rotation(5, 1_700_000_100).unwrap();
        assert_eq!(bumped.offset, 2);
        assert_eq!(store.rotation_state(5).unwrap(), bumped);

        // bumping an unseen user starts from zero
        let other = store.bump_rotation(6, 42).unwrap();
        assert_eq!(other.offset, 1);
        assert_eq!(other.last_gate_key, "");
    }

    pub fn skips_accumulate_and_rank(store: &dyn Storage) {
        store.increment_skip("@a", 1).unwrap();
        store.increment_skip("@b", 3).unwrap();
        store.increment_skip("@c", 1).unwrap();
        store.increment_skip("@a", 1).unwrap();
        store.increment_skip("@d", 0).unwrap();

        let top = store.top_skips(10).unwrap();
        let ranked: Vec<(&str, u64)> = top
            .iter()
            .map(|c| (c.check_handle.as_str(), c.skips))
            .collect();
        assert_eq!(ranked, vec![("@b", 3), ("@a", 2), ("@c", 1), ("@d", 0)]);
        assert_eq!(store.top_skips(1).unwrap().len(), 1);
    }

    pub fn conditional_bump_checks_key_and_interval(store: &dyn Storage) {
        // no open gate
        assert_eq!(store.try_bump_rotation(8, "", 100, 60).unwrap(), None);
        assert_eq!(store.try_bump_rotation(8, "F1", 100, 60).unwrap(), None);

        store.set_gate_key(8, "F1").unwrap();
        let first = store.try_bump_rotation(8, "F1", 100, 60).unwrap().unwrap();
        assert_eq!(first.offset, 1);
        assert_eq!(first.last_rotated_ts, 100);

        // inside the interval, and a stale key
        assert_eq!(store.try_bump_rotation(8, "F1", 159, 60).unwrap(), None);
        assert_eq!(store.try_bump_rotation(8, "F2", 500, 60).unwrap(), None);
        // clock went backwards
        assert_eq!(store.try_bump_rotation(8, "F1", 40, i64::MAX).unwrap(), None);
        assert_eq!(store.rotation_state(8).unwrap(), first);

        let second = store.try_bump_rotation(8, "F1", 160, 60).unwrap().unwrap();
        assert_eq!(second.offset, 2);
    }

    pub fn concurrent_conditional_bumps_admit_one(store: Arc<dyn Storage>) {
        const THREADS: usize = 8;

        store.set_gate_key(78, "F1").unwrap();
        let barrier = Arc::new(std::sync::Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    store.try_bump_rotation(78, "F1", 1_000, 60).unwrap().is_some()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(store.rotation_state(78).unwrap().offset, 1);
    }

    pub fn concurrent_bumps_are_not_lost(store: Arc<dyn Storage>) {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 25;

        let start = store.rotation_state(77).unwrap().offset;
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || {
                    for j in 0..PER_THREAD {
                        store.bump_rotation(77, (i * PER_THREAD + j) as i64).unwrap();
                        store.increment_skip("@race", 1).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let end = store.rotation_state(77).unwrap().offset;
        assert_eq!(end - start, (THREADS * PER_THREAD) as u64);
        let race = store
            .top_skips(100)
            .unwrap()
            .into_iter()
            .find(|c| c.check_handle == "@race")
            .unwrap();
        assert_eq!(race.skips, (THREADS * PER_THREAD) as u64);
    }
}

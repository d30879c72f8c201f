use std::collections::HashMap;

use anyhow::Result;
use parking_lot::Mutex;

use super::{FileRecord, SkipCounter, Storage, UserRotationState};

#[derive(Default)]
struct Inner {
    files: HashMap<String, FileRecord>,
    links: HashMap<String, String>,
    users: HashMap<i64, UserRotationState>,
    // handle -> (first insertion order, skips)
    skips: HashMap<String, (u64, u64)>,
    next_seq: u64,
}

/// Process-local backend. Every operation runs under one lock, which makes
/// bumps and increments atomic for this process only.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStore {
    fn upsert_file(&self, rec: &FileRecord) -> Result<()> {
        self.inner
            .lock()
            .files
            .insert(rec.file_id.clone(), rec.clone());
        Ok(())
    }

    fn file(&self, file_id: &str) -> Result<Option<FileRecord>> {
        Ok(self.inner.lock().files.get(file_id).cloned())
    }

    fn save_link(&self, code: &str, file_id: &str) -> Result<()> {
        self.inner
            .lock()
            .links
            .insert(code.to_string(), file_id.to_string());
        Ok(())
    }

    fn resolve_link(&self, code: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().links.get(code).cloned())
    }

    fn rotation_state(&self, user_id: i64) -> Result<UserRotationState> {
        let mut inner = self.inner.lock();
        Ok(inner
            .users
            .entry(user_id)
            .or_insert_with(|| UserRotationState::fresh(user_id))
            .clone())
    }

    fn bump_rotation(&self, user_id: i64, now: i64) -> Result<UserRotationState> {
        let mut inner = self.inner.lock();
        let state = inner
            .users
            .entry(user_id)
            .or_insert_with(|| UserRotationState::fresh(user_id));
        state.offset += 1;
        state.last_rotated_ts = now;
        Ok(state.clone())
    }

    fn try_bump_rotation(
        &self,
        user_id: i64,
        key: &str,
        now: i64,
        min_interval: i64,
    ) -> Result<Option<UserRotationState>> {
        let mut inner = self.inner.lock();
        let Some(state) = inner.users.get_mut(&user_id) else {
            return Ok(None);
        };
        if key.is_empty()
            || state.last_gate_key != key
            || now.saturating_sub(state.last_rotated_ts) < min_interval
        {
            return Ok(None);
        }
        state.offset += 1;
        state.last_rotated_ts = now;
        Ok(Some(state.clone()))
    }

    fn set_gate_key(&self, user_id: i64, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .users
            .entry(user_id)
            .or_insert_with(|| UserRotationState::fresh(user_id))
            .last_gate_key = key.to_string();
        Ok(())
    }

    fn increment_skip(&self, check_handle: &str, n: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        let entry = inner
            .skips
            .entry(check_handle.to_string())
            .or_insert((seq, 0));
        entry.1 = entry.1.saturating_add(n);
        if entry.0 == seq {
            inner.next_seq += 1;
        }
        Ok(())
    }

    fn top_skips(&self, limit: usize) -> Result<Vec<SkipCounter>> {
        let inner = self.inner.lock();
        let mut ranked: Vec<(&String, &(u64, u64))> = inner.skips.iter().collect();
        ranked.sort_by(|a, b| b.1 .1.cmp(&a.1 .1).then(a.1 .0.cmp(&b.1 .0)));
        Ok(ranked
            .into_iter()
            .take(limit)
            .map(|(handle, (_, skips))| SkipCounter {
                check_handle: handle.clone(),
                skips: *skips,
            })
            .collect())
    }
}

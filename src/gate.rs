//! Force-subscribe gate.
//!
//! A user who has not joined every target is shown a rotating batch of join
//! buttons. The batch is never stored: it is recomputed from the user's
//! rotation offset with [`visibility::select`], which is what lets an
//! abandoned batch be charged to the skip counters after the fact.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{Config, MessagesConfig};
use crate::membership;
use crate::storage::{Storage, UserRotationState};
use crate::target::Target;
use crate::transport::{Button, Keyboard, MessageRef, Transport};
use crate::visibility;

pub const CB_DONE: &str = "fsub_done";
pub const CB_ROTATE: &str = "fsub_rot";
pub const GENERAL_KEY: &str = "__none__";

/// What a user is currently gated for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GateKey {
    File(String),
    /// Plain access without a file attached.
    General,
}

impl GateKey {
    pub fn as_str(&self) -> &str {
        match self {
            GateKey::File(id) => id,
            GateKey::General => GENERAL_KEY,
        }
    }

    /// Parses a stored or callback key. An empty string means no gate.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "" => None,
            GENERAL_KEY => Some(GateKey::General),
            id => Some(GateKey::File(id.to_string())),
        }
    }

    pub fn file_id(&self) -> Option<&str> {
        match self {
            GateKey::File(id) => Some(id),
            GateKey::General => None,
        }
    }

    pub fn callback_data(&self, action: GateAction) -> String {
        format!("{}:{}", action.prefix(), self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    Done,
    Rotate,
}

impl GateAction {
    fn prefix(self) -> &'static str {
        match self {
            GateAction::Done => CB_DONE,
            GateAction::Rotate => CB_ROTATE,
        }
    }
}

/// Splits `fsub_done:<key>` / `fsub_rot:<key>` callback data.
pub fn parse_callback(data: &str) -> Option<(GateAction, GateKey)> {
    let (prefix, key) = data.split_once(':')?;
    let action = match prefix {
        CB_DONE => GateAction::Done,
        CB_ROTATE => GateAction::Rotate,
        _ => return None,
    };
    Some((action, GateKey::parse(key)?))
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub buttons_per_row: usize,
    pub max_join_buttons: usize,
    pub join_text: String,
    pub rotate_seconds: u64,
    pub rotate_button: bool,
    pub messages: MessagesConfig,
}

impl Settings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            buttons_per_row: cfg.gate.buttons_per_row.max(1),
            max_join_buttons: cfg.gate.max_join_buttons.max(1),
            join_text: cfg.gate.join_text.clone(),
            rotate_seconds: cfg.gate.rotate_seconds,
            rotate_button: cfg.gate.rotate_button,
            messages: cfg.messages.clone(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateOutcome {
    Rotated { offset: u64 },
    TooSoon { wait_secs: u64 },
    /// The tapped prompt is not the user's open gate.
    Stale,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Delivered(MessageRef),
    AccessGranted,
    FileMissing,
    DeliveryFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneOutcome {
    NotJoined,
    Released(Release),
}

pub struct Gate {
    settings: Settings,
    targets: Vec<Target>,
    store: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    // check handle -> invite link created by the bot
    invites: Mutex<HashMap<String, String>>,
}

impl Gate {
    pub fn new(
        settings: Settings,
        targets: Vec<Target>,
        store: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            targets,
            store,
            transport,
            clock,
            invites: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn has_targets(&self) -> bool {
        !self.targets.is_empty()
    }

    pub fn is_cleared(&self, user_id: i64) -> bool {
        membership::all_joined(self.transport.as_ref(), &self.targets, user_id)
    }

    pub fn visible(&self, user_id: i64, offset: u64) -> Vec<Target> {
        visibility::select(
            &self.targets,
            user_id,
            offset,
            self.settings.max_join_buttons,
        )
    }

    /// Shows the join prompt for `key`.
    ///
    /// Switching to a different key while an older gate is still open counts
    /// the old batch as skipped and moves the user to the next rotation.
    pub fn enter(&self, chat_id: i64, user_id: i64, key: &GateKey) -> Result<MessageRef> {
        let key_str = key.as_str();
        let mut state = self.store.rotation_state(user_id)?;

        if !state.last_gate_key.is_empty() && state.last_gate_key != key_str {
            let previous = std::mem::take(&mut state.last_gate_key);
            let skipped = self.record_skips(user_id, state.offset)?;
            state = self.store.bump_rotation(user_id, self.clock.now())?;
            info!(
                user_id,
                previous = %previous,
                next = key_str,
                skipped,
                offset = state.offset,
                "gate abandoned"
            );
        }

        if state.last_gate_key != key_str {
            self.store.set_gate_key(user_id, key_str)?;
            state.last_gate_key = key_str.to_string();
        }

        let keyboard = self.keyboard(&state, key);
        let message = self
            .transport
            .send_message(chat_id, &self.settings.messages.force_sub, Some(&keyboard))
            .context("send gate prompt")?;
        debug!(user_id, key = key_str, offset = state.offset, "gate shown");
        Ok(message)
    }

    /// Swaps the visible batch for the next one, keeping the same message.
    ///
    /// Only the gate the user currently has open can rotate, and only once
    /// per cooldown; the store decides both in one step so double taps
    /// rotate once.
    pub fn rotate(&self, user_id: i64, key: &GateKey, message: MessageRef) -> Result<RotateOutcome> {
        if !self.settings.rotate_button {
            return Ok(RotateOutcome::Disabled);
        }

        let key_str = key.as_str();
        let now = self.clock.now();
        let cooldown = i64::try_from(self.settings.rotate_seconds).unwrap_or(i64::MAX);

        let Some(state) = self
            .store
            .try_bump_rotation(user_id, key_str, now, cooldown)?
        else {
            let state = self.store.rotation_state(user_id)?;
            if state.last_gate_key != key_str {
                debug!(user_id, key = key_str, open = %state.last_gate_key, "rotate on a closed gate");
                return Ok(RotateOutcome::Stale);
            }
            return Ok(RotateOutcome::TooSoon {
                wait_secs: remaining_cooldown(cooldown, now, state.last_rotated_ts),
            });
        };

        let skipped = self.record_skips(user_id, state.offset.saturating_sub(1))?;
        info!(user_id, skipped, offset = state.offset, "gate rotated");

        let keyboard = self.keyboard(&state, key);
        if let Err(err) = self.transport.edit_markup(message, &keyboard) {
            debug!(user_id, error = %err, "keyboard edit failed");
        }
        Ok(RotateOutcome::Rotated {
            offset: state.offset,
        })
    }

    /// Handles the "joined" button: verifies every target, then releases.
    pub fn done(&self, user_id: i64, key: &GateKey, message: MessageRef) -> Result<DoneOutcome> {
        if !self.is_cleared(user_id) {
            debug!(user_id, key = key.as_str(), "done pressed before joining");
            return Ok(DoneOutcome::NotJoined);
        }

        self.store.set_gate_key(user_id, "")?;
        if let Err(err) = self.transport.delete_message(message) {
            debug!(user_id, error = %err, "gate message cleanup failed");
        }

        let release = self.release(message.chat_id, key)?;
        info!(user_id, key = key.as_str(), ?release, "gate cleared");
        Ok(DoneOutcome::Released(release))
    }

    pub fn release(&self, chat_id: i64, key: &GateKey) -> Result<Release> {
        match key {
            GateKey::File(file_id) => self.deliver(chat_id, file_id),
            GateKey::General => {
                self.notify(chat_id, &self.settings.messages.access_granted)?;
                Ok(Release::AccessGranted)
            }
        }
    }

    pub fn deliver(&self, chat_id: i64, file_id: &str) -> Result<Release> {
        let Some(rec) = self.store.file(file_id)? else {
            self.notify(chat_id, &self.settings.messages.file_missing)?;
            return Ok(Release::FileMissing);
        };

        match self
            .transport
            .copy_message(chat_id, rec.db_chat_id, rec.db_message_id)
        {
            Ok(message) => Ok(Release::Delivered(message)),
            Err(err) => {
                warn!(file_id, db_chat_id = rec.db_chat_id, error = %err, "copy from storage chat failed");
                self.notify(chat_id, &self.settings.messages.delivery_failed)?;
                Ok(Release::DeliveryFailed)
            }
        }
    }

    pub fn keyboard(&self, state: &UserRotationState, key: &GateKey) -> Keyboard {
        let mut rows: Vec<Vec<Button>> = Vec::new();
        let mut row: Vec<Button> = Vec::new();
        let mut idx = 1;

        for target in self.visible(state.user_id, state.offset) {
            let Some(url) = self.join_url(&target) else {
                continue;
            };
            row.push(Button::url(
                format!("{} {}", self.settings.join_text, idx),
                url,
            ));
            idx += 1;
            if row.len() >= self.settings.buttons_per_row {
                rows.push(std::mem::take(&mut row));
            }
        }
        if !row.is_empty() {
            rows.push(row);
        }

        if self.settings.rotate_button && self.has_targets() {
            rows.push(vec![Button::callback(
                self.settings.messages.rotate_button.clone(),
                key.callback_data(GateAction::Rotate),
            )]);
        }
        rows.push(vec![Button::callback(
            self.settings.messages.done_button.clone(),
            key.callback_data(GateAction::Done),
        )]);

        Keyboard { rows }
    }

    fn join_url(&self, target: &Target) -> Option<String> {
        if !target.needs_invite() {
            return target.join_url.clone();
        }
        if let Some(url) = self.invites.lock().get(&target.check_handle) {
            return Some(url.clone());
        }
        match self.transport.create_invite_link(&target.check_handle) {
            Ok(url) => {
                self.invites
                    .lock()
                    .insert(target.check_handle.clone(), url.clone());
                Some(url)
            }
            Err(err) => {
                warn!(chat = %target, error = %err, "invite link unavailable, hiding button");
                None
            }
        }
    }

    fn record_skips(&self, user_id: i64, offset: u64) -> Result<usize> {
        let batch = self.visible(user_id, offset);
        for target in &batch {
            self.store
                .increment_skip(&target.check_handle, 1)
                .with_context(|| format!("count skip for {target}"))?;
        }
        Ok(batch.len())
    }

    fn notify(&self, chat_id: i64, text: &str) -> Result<()> {
        self.transport
            .send_message(chat_id, text, None)
            .context("send notice")?;
        Ok(())
    }
}

/// Seconds left before another rotation. A clock that went backwards counts
/// as no time elapsed.
fn remaining_cooldown(cooldown: i64, now: i64, last_rotated_ts: i64) -> u64 {
    let elapsed = now.saturating_sub(last_rotated_ts).max(0);
    u64::try_from(cooldown.saturating_sub(elapsed)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;
    use crate::target::parse_all;
    use crate::transport::{ButtonAction, MockTransport};

    fn gate_with(targets: &[&str], settings: Settings) -> (Gate, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let gate = Gate::new(
            settings,
            parse_all(targets),
            Arc::new(MemoryStore::new()),
            transport.clone(),
            Arc::new(ManualClock::new(1_000)),
        );
        (gate, transport)
    }

    #[test]
    fn gate_key_round_trips_through_callback_data() {
        let key = GateKey::File("abc-123".into());
        let data = key.callback_data(GateAction::Done);
        assert_eq!(data, "fsub_done:abc-123");
        assert_eq!(parse_callback(&data), Some((GateAction::Done, key)));
        assert_eq!(
            parse_callback("fsub_rot:__none__"),
            Some((GateAction::Rotate, GateKey::General))
        );
        assert_eq!(parse_callback("post_tgl:x:1"), None);
        assert_eq!(parse_callback("fsub_done:"), None);
    }

    #[test]
    fn no_targets_renders_only_done_row() {
        let (gate, _) = gate_with(&[], Settings::default());
        let kb = gate.keyboard(&UserRotationState::fresh(1), &GateKey::General);
        assert_eq!(kb.rows.len(), 1);
        assert_eq!(kb.callback_data().collect::<Vec<_>>(), vec!["fsub_done:__none__"]);
    }

    #[test]
    fn buttons_are_numbered_and_wrapped() {
        let mut settings = Settings::default();
        settings.buttons_per_row = 2;
        settings.max_join_buttons = 3;
        settings.join_text = "JOIN".into();
        let (gate, _) = gate_with(&["@a", "@b", "@c", "@d", "@e"], settings);

        let kb = gate.keyboard(&UserRotationState::fresh(9), &GateKey::General);
        assert_eq!(kb.rows.len(), 3);
        assert_eq!(kb.rows[0].len(), 2);
        assert_eq!(kb.rows[1].len(), 1);
        let labels: Vec<&str> = kb.url_buttons().map(|b| b.text.as_str()).collect();
        assert_eq!(labels, vec!["JOIN 1", "JOIN 2", "JOIN 3"]);
    }

    #[test]
    fn invite_links_are_created_once_and_failures_hidden() {
        let mut settings = Settings::default();
        settings.max_join_buttons = 12;
        let (gate, transport) = gate_with(&["-1001", "-1002", "@pub"], settings);
        transport.fail_invites_for("-1002");

        let state = UserRotationState::fresh(3);
        let kb = gate.keyboard(&state, &GateKey::General);
        let urls: Vec<String> = kb
            .url_buttons()
            .filter_map(|b| match &b.action {
                ButtonAction::Url(url) => Some(url.clone()),
                ButtonAction::Callback(_) => None,
            })
            .collect();
        assert_eq!(urls.len(), 2);
        assert!(urls.contains(&"https://t.me/pub".to_string()));
        assert_eq!(transport.invites_created(), 1);

        gate.keyboard(&state, &GateKey::General);
        assert_eq!(transport.invites_created(), 1);
    }

    #[test]
    fn rotate_button_only_when_enabled() {
        let mut settings = Settings::default();
        settings.rotate_button = true;
        let (gate, _) = gate_with(&["@a"], settings);
        let kb = gate.keyboard(&UserRotationState::fresh(1), &GateKey::File("f".into()));
        assert_eq!(
            kb.callback_data().collect::<Vec<_>>(),
            vec!["fsub_rot:f", "fsub_done:f"]
        );

        let (gate, _) = gate_with(&["@a"], Settings::default());
        let outcome = gate
            .rotate(
                1,
                &GateKey::General,
                MessageRef {
                    chat_id: 1,
                    message_id: 1,
                },
            )
            .unwrap();
        assert_eq!(outcome, RotateOutcome::Disabled);
    }

    #[test]
    fn remaining_cooldown_never_overflows() {
        assert_eq!(remaining_cooldown(60, 1_010, 1_000), 50);
        assert_eq!(remaining_cooldown(60, 1_100, 1_000), 0);
        // clock moved backwards
        assert_eq!(remaining_cooldown(60, 900, 1_000), 60);
        assert_eq!(remaining_cooldown(i64::MAX, 900, 1_000), i64::MAX as u64);
        assert_eq!(remaining_cooldown(i64::MAX, i64::MIN, i64::MAX), i64::MAX as u64);
    }

    #[test]
    fn huge_cooldown_with_clock_behind_reports_wait() {
        let mut settings = Settings::default();
        settings.rotate_button = true;
        settings.rotate_seconds = u64::MAX;
        let store = Arc::new(MemoryStore::new());
        let gate = Gate::new(
            settings,
            parse_all(&["@a"]),
            store.clone(),
            Arc::new(MockTransport::new()),
            Arc::new(ManualClock::new(1_000)),
        );
        store.set_gate_key(1, "__none__").unwrap();
        store.bump_rotation(1, 2_000).unwrap();

        let message = MessageRef {
            chat_id: 1,
            message_id: 1,
        };
        let outcome = gate.rotate(1, &GateKey::General, message).unwrap();
        assert_eq!(
            outcome,
            RotateOutcome::TooSoon {
                wait_secs: i64::MAX as u64
            }
        );
        assert_eq!(store.rotation_state(1).unwrap().offset, 1);
    }
}

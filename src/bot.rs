use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config::{EntryPolicy, MessagesConfig};
use crate::gate::{self, DoneOutcome, Gate, GateAction, GateKey, RotateOutcome};
use crate::storage::Storage;
use crate::telegram::{CallbackQuery, Message, Update, User};
use crate::transport::Transport;

pub struct Bot {
    gate: Arc<Gate>,
    store: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    entry: EntryPolicy,
    messages: MessagesConfig,
}

impl Bot {
    pub fn new(
        gate: Arc<Gate>,
        store: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        entry: EntryPolicy,
    ) -> Self {
        let messages = gate.settings().messages.clone();
        Self {
            gate,
            store,
            transport,
            entry,
            messages,
        }
    }

    pub fn handle(&self, update: &Update) -> Result<()> {
        if let Some(query) = &update.callback_query {
            return self.on_callback(query);
        }
        if let Some(message) = &update.message {
            return self.on_message(message);
        }
        Ok(())
    }

    fn on_message(&self, message: &Message) -> Result<()> {
        let (Some(user), Some(text)) = (&message.from, message.text.as_deref()) else {
            return Ok(());
        };
        match parse_start(text) {
            Some(payload) => self.on_start(message.chat.id, user, payload),
            None => Ok(()),
        }
    }

    fn on_start(&self, chat_id: i64, user: &User, payload: Option<&str>) -> Result<()> {
        let Some(code) = payload else {
            if self.entry == EntryPolicy::Start
                && self.gate.has_targets()
                && !self.gate.is_cleared(user.id)
            {
                self.gate.enter(chat_id, user.id, &GateKey::General)?;
                return Ok(());
            }
            let text = self.messages.start.replace("{mention}", &mention_html(user));
            self.transport
                .send_message(chat_id, &text, None)
                .context("send start message")?;
            return Ok(());
        };

        let Some(file_id) = self.store.resolve_link(code)? else {
            debug!(user_id = user.id, code, "unknown redeem code");
            self.transport
                .send_message(chat_id, &self.messages.invalid_link, None)
                .context("send invalid link notice")?;
            return Ok(());
        };

        if self.gate.is_cleared(user.id) {
            let release = self.gate.deliver(chat_id, &file_id)?;
            info!(user_id = user.id, file_id = %file_id, ?release, "redeemed");
            return Ok(());
        }

        self.gate.enter(chat_id, user.id, &GateKey::File(file_id))?;
        Ok(())
    }

    fn on_callback(&self, query: &CallbackQuery) -> Result<()> {
        let parsed = query.data.as_deref().and_then(gate::parse_callback);
        let (Some((action, key)), Some(message)) = (parsed, &query.message) else {
            self.answer(query, None, false);
            return Ok(());
        };
        let user_id = query.from.id;

        match action {
            GateAction::Done => match self.gate.done(user_id, &key, message.reference())? {
                DoneOutcome::NotJoined => {
                    self.answer(query, Some(&self.messages.not_joined), true);
                }
                DoneOutcome::Released(_) => self.answer(query, None, false),
            },
            GateAction::Rotate => match self.gate.rotate(user_id, &key, message.reference())? {
                RotateOutcome::TooSoon { wait_secs } => {
                    let text = self
                        .messages
                        .rotate_too_soon
                        .replace("{seconds}", &wait_secs.to_string());
                    self.answer(query, Some(&text), true);
                }
                RotateOutcome::Rotated { .. }
                | RotateOutcome::Stale
                | RotateOutcome::Disabled => self.answer(query, None, false),
            },
        }
        Ok(())
    }

    fn answer(&self, query: &CallbackQuery, text: Option<&str>, alert: bool) {
        if let Err(err) = self.transport.answer_callback(&query.id, text, alert) {
            debug!(callback = %query.id, error = %err, "answer callback failed");
        }
    }
}

/// Returns `Some(payload)` for `/start` and `/start@bot`, `None` for anything else.
pub fn parse_start(text: &str) -> Option<Option<&str>> {
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let command = parts.next()?;
    let name = command.split('@').next()?;
    if name != "/start" {
        return None;
    }
    Some(parts.next().map(str::trim).filter(|p| !p.is_empty()))
}

pub fn mention_html(user: &User) -> String {
    let name: String = if user.first_name.trim().is_empty() {
        "there".into()
    } else {
        user.first_name.replace(['<', '>', '&'], "")
    };
    format!("<a href='tg://user?id={}'>{}</a>", user.id, name)
}

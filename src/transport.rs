use std::collections::HashMap;

use parking_lot::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("telegram api error {code}: {description}")]
    Api { code: i64, description: String },
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Creator,
    Administrator,
    Member,
    Restricted,
    Left,
    Kicked,
}

impl MemberStatus {
    pub fn from_api(status: &str) -> Option<Self> {
        match status {
            "creator" => Some(MemberStatus::Creator),
            "administrator" => Some(MemberStatus::Administrator),
            "member" => Some(MemberStatus::Member),
            "restricted" => Some(MemberStatus::Restricted),
            "left" => Some(MemberStatus::Left),
            "kicked" => Some(MemberStatus::Kicked),
            _ => None,
        }
    }

    pub fn has_departed(self) -> bool {
        matches!(self, MemberStatus::Left | MemberStatus::Kicked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ButtonAction {
    Url(String),
    Callback(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub text: String,
    pub action: ButtonAction,
}

impl Button {
    pub fn url(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            action: ButtonAction::Url(url.into()),
        }
    }

    pub fn callback(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            action: ButtonAction::Callback(data.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyboard {
    pub rows: Vec<Vec<Button>>,
}

impl Keyboard {
    pub fn url_buttons(&self) -> impl Iterator<Item = &Button> {
        self.rows
            .iter()
            .flatten()
            .filter(|b| matches!(b.action, ButtonAction::Url(_)))
    }

    pub fn callback_data(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().flatten().filter_map(|b| match &b.action {
            ButtonAction::Callback(data) => Some(data.as_str()),
            ButtonAction::Url(_) => None,
        })
    }
}

/// Messaging operations the gate depends on.
pub trait Transport: Send + Sync {
    fn member_status(&self, chat: &str, user_id: i64) -> Result<MemberStatus, TransportError>;
    fn create_invite_link(&self, chat: &str) -> Result<String, TransportError>;
    fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<MessageRef, TransportError>;
    fn edit_markup(&self, message: MessageRef, keyboard: &Keyboard) -> Result<(), TransportError>;
    fn delete_message(&self, message: MessageRef) -> Result<(), TransportError>;
    fn copy_message(
        &self,
        chat_id: i64,
        from_chat_id: i64,
        message_id: i64,
    ) -> Result<MessageRef, TransportError>;
    fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
        alert: bool,
    ) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Message {
        chat_id: i64,
        text: String,
        keyboard: Option<Keyboard>,
    },
    EditMarkup {
        message: MessageRef,
        keyboard: Keyboard,
    },
    Delete(MessageRef),
    Copy {
        chat_id: i64,
        from_chat_id: i64,
        message_id: i64,
    },
    Answer {
        callback_id: String,
        text: Option<String>,
        alert: bool,
    },
}

#[derive(Default)]
struct MockState {
    // chat -> user -> status; a missing chat answers with an api error
    members: HashMap<String, HashMap<i64, MemberStatus>>,
    failing_invites: Vec<String>,
    invites_created: usize,
    fail_side_actions: bool,
    next_message_id: i64,
    sent: Vec<Sent>,
}

/// In-memory transport that records every outbound call.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chat(&self, chat: &str) {
        self.state.lock().members.entry(chat.to_string()).or_default();
    }

    pub fn set_status(&self, chat: &str, user_id: i64, status: MemberStatus) {
        self.state
            .lock()
            .members
            .entry(chat.to_string())
            .or_default()
            .insert(user_id, status);
    }

    pub fn fail_invites_for(&self, chat: &str) {
        self.state.lock().failing_invites.push(chat.to_string());
    }

    /// Makes edit and delete calls fail.
    pub fn fail_side_actions(&self, fail: bool) {
        self.state.lock().fail_side_actions = fail;
    }

    pub fn invites_created(&self) -> usize {
        self.state.lock().invites_created
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.state.lock().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<Sent> {
        std::mem::take(&mut self.state.lock().sent)
    }

    pub fn last_keyboard(&self) -> Option<Keyboard> {
        self.state.lock().sent.iter().rev().find_map(|s| match s {
            Sent::Message {
                keyboard: Some(kb), ..
            } => Some(kb.clone()),
            Sent::EditMarkup { keyboard, .. } => Some(keyboard.clone()),
            _ => None,
        })
    }
}

impl Transport for MockTransport {
    fn member_status(&self, chat: &str, user_id: i64) -> Result<MemberStatus, TransportError> {
        let state = self.state.lock();
        let members = state.members.get(chat).ok_or_else(|| TransportError::Api {
            code: 400,
            description: "Bad Request: chat not found".into(),
        })?;
        Ok(members.get(&user_id).copied().unwrap_or(MemberStatus::Left))
    }

    fn create_invite_link(&self, chat: &str) -> Result<String, TransportError> {
        let mut state = self.state.lock();
        if state.failing_invites.iter().any(|c| c == chat) {
            return Err(TransportError::Api {
                code: 400,
                description: "Bad Request: not enough rights to manage chat invite link".into(),
            });
        }
        state.invites_created += 1;
        Ok(format!(
            "https://t.me/+{}{}",
            chat.trim_start_matches('-'),
            state.invites_created
        ))
    }

    fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<MessageRef, TransportError> {
        let mut state = self.state.lock();
        state.next_message_id += 1;
        let message_id = state.next_message_id;
        state.sent.push(Sent::Message {
            chat_id,
            text: text.to_string(),
            keyboard: keyboard.cloned(),
        });
        Ok(MessageRef {
            chat_id,
            message_id,
        })
    }

    fn edit_markup(&self, message: MessageRef, keyboard: &Keyboard) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.fail_side_actions {
            return Err(TransportError::Api {
                code: 400,
                description: "Bad Request: message is not modified".into(),
            });
        }
        state.sent.push(Sent::EditMarkup {
            message,
            keyboard: keyboard.clone(),
        });
        Ok(())
    }

    fn delete_message(&self, message: MessageRef) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.fail_side_actions {
            return Err(TransportError::Api {
                code: 400,
                description: "Bad Request: message to delete not found".into(),
            });
        }
        state.sent.push(Sent::Delete(message));
        Ok(())
    }

    fn copy_message(
        &self,
        chat_id: i64,
        from_chat_id: i64,
        message_id: i64,
    ) -> Result<MessageRef, TransportError> {
        let mut state = self.state.lock();
        state.next_message_id += 1;
        let copied = state.next_message_id;
        state.sent.push(Sent::Copy {
            chat_id,
            from_chat_id,
            message_id,
        });
        Ok(MessageRef {
            chat_id,
            message_id: copied,
        })
    }

    fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
        alert: bool,
    ) -> Result<(), TransportError> {
        self.state.lock().sent.push(Sent::Answer {
            callback_id: callback_id.to_string(),
            text: text.map(str::to_string),
            alert,
        });
        Ok(())
    }
}

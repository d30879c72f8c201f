use std::time::Duration;

use anyhow::{bail, Result};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::USER_AGENT;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::transport::{
    ButtonAction, Keyboard, MemberStatus, MessageRef, Transport, TransportError,
};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

// getUpdates holds the connection open for the poll timeout; leave headroom.
const REQUEST_SLACK: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub token: String,
    pub api_base: Option<String>,
    pub poll_timeout: Duration,
    pub http_client: Option<HttpClient>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
}

impl Message {
    pub fn reference(&self) -> MessageRef {
        MessageRef {
            chat_id: self.chat.id,
            message_id: self.message_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct ChatMember {
    status: String,
}

#[derive(Debug, Deserialize)]
struct InviteLink {
    invite_link: String,
}

#[derive(Debug, Deserialize)]
struct MessageId {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
}

#[derive(Serialize)]
struct InlineButton<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    callback_data: Option<&'a str>,
}

pub fn inline_markup(keyboard: &Keyboard) -> Value {
    let rows: Vec<Vec<InlineButton<'_>>> = keyboard
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|button| match &button.action {
                    ButtonAction::Url(url) => InlineButton {
                        text: button.text.as_str(),
                        url: Some(url.as_str()),
                        callback_data: None,
                    },
                    ButtonAction::Callback(data) => InlineButton {
                        text: button.text.as_str(),
                        url: None,
                        callback_data: Some(data.as_str()),
                    },
                })
                .collect()
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

/// Chat ids go over the wire as numbers when they parse, usernames as strings.
fn chat_ref(chat: &str) -> Value {
    match chat.trim().parse::<i64>() {
        Ok(id) => json!(id),
        Err(_) => json!(chat.trim()),
    }
}

pub struct Client {
    http: HttpClient,
    base_url: String,
    poll_timeout: Duration,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.token.trim().is_empty() {
            bail!("telegram client bot token required");
        }

        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.poll_timeout + REQUEST_SLACK)
                .build()?,
        };
        let base = config
            .api_base
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        Ok(Client {
            http,
            base_url: format!("{}/bot{}", base.trim_end_matches('/'), config.token.trim()),
            poll_timeout: config.poll_timeout,
        })
    }

    fn call<T: DeserializeOwned>(&self, method: &str, body: Value) -> Result<T, TransportError> {
        let url = format!("{}/{}", self.base_url, method);
        let response = self
            .http
            .post(&url)
            .header(USER_AGENT, format!("fsub-gate/{}", crate::VERSION))
            .json(&body)
            .send()?;

        let envelope: Envelope<T> = response.json()?;
        if !envelope.ok {
            return Err(TransportError::Api {
                code: envelope.error_code.unwrap_or_default(),
                description: envelope.description.unwrap_or_default(),
            });
        }
        envelope
            .result
            .ok_or_else(|| TransportError::Decode(format!("{method}: missing result")))
    }

    pub fn get_me(&self) -> Result<User, TransportError> {
        self.call("getMe", json!({}))
    }

    pub fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>, TransportError> {
        let mut body = json!({
            "timeout": self.poll_timeout.as_secs(),
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }
        self.call("getUpdates", body)
    }

    pub fn get_chat_member(&self, chat: &str, user_id: i64) -> Result<String, TransportError> {
        let member: ChatMember = self.call(
            "getChatMember",
            json!({ "chat_id": chat_ref(chat), "user_id": user_id }),
        )?;
        Ok(member.status)
    }

    pub fn create_chat_invite_link(&self, chat: &str) -> Result<String, TransportError> {
        let link: InviteLink = self.call(
            "createChatInviteLink",
            json!({ "chat_id": chat_ref(chat), "creates_join_request": false }),
        )?;
        Ok(link.invite_link)
    }

    pub fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<Message, TransportError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
            "link_preview_options": { "is_disabled": true },
        });
        if let Some(keyboard) = keyboard {
            body["reply_markup"] = inline_markup(keyboard);
        }
        self.call("sendMessage", body)
    }

    pub fn answer_callback_query(
        &self,
        callback_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> Result<bool, TransportError> {
        let mut body = json!({ "callback_query_id": callback_id, "show_alert": show_alert });
        if let Some(text) = text {
            body["text"] = json!(text);
        }
        self.call("answerCallbackQuery", body)
    }
}

impl Transport for Client {
    fn member_status(&self, chat: &str, user_id: i64) -> Result<MemberStatus, TransportError> {
        let status = self.get_chat_member(chat, user_id)?;
        MemberStatus::from_api(&status)
            .ok_or_else(|| TransportError::Decode(format!("unknown member status {status:?}")))
    }

    fn create_invite_link(&self, chat: &str) -> Result<String, TransportError> {
        self.create_chat_invite_link(chat)
    }

    fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<MessageRef, TransportError> {
        Ok(self.send_text(chat_id, text, keyboard)?.reference())
    }

    fn edit_markup(&self, message: MessageRef, keyboard: &Keyboard) -> Result<(), TransportError> {
        let _: Value = self.call(
            "editMessageReplyMarkup",
            json!({
                "chat_id": message.chat_id,
                "message_id": message.message_id,
                "reply_markup": inline_markup(keyboard),
            }),
        )?;
        Ok(())
    }

    fn delete_message(&self, message: MessageRef) -> Result<(), TransportError> {
        let _: bool = self.call(
            "deleteMessage",
            json!({ "chat_id": message.chat_id, "message_id": message.message_id }),
        )?;
        Ok(())
    }

    fn copy_message(
        &self,
        chat_id: i64,
        from_chat_id: i64,
        message_id: i64,
    ) -> Result<MessageRef, TransportError> {
        let copied: MessageId = self.call(
            "copyMessage",
            json!({
                "chat_id": chat_id,
                "from_chat_id": from_chat_id,
                "message_id": message_id,
            }),
        )?;
        Ok(MessageRef {
            chat_id,
            message_id: copied.message_id,
        })
    }

    fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
        alert: bool,
    ) -> Result<(), TransportError> {
        self.answer_callback_query(callback_id, text, alert)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Button;

    #[test]
    fn markup_serializes_url_and_callback_buttons() {
        let keyboard = Keyboard {
            rows: vec![
                vec![Button::url("JOIN 1", "https://t.me/a")],
                vec![Button::callback("done", "fsub_done:__none__")],
            ],
        };
        let markup = inline_markup(&keyboard);
        assert_eq!(
            markup,
            json!({
                "inline_keyboard": [
                    [{ "text": "JOIN 1", "url": "https://t.me/a" }],
                    [{ "text": "done", "callback_data": "fsub_done:__none__" }],
                ]
            })
        );
    }

    #[test]
    fn chat_refs_keep_usernames_as_strings() {
        assert_eq!(chat_ref("-100555"), json!(-100555));
        assert_eq!(chat_ref("@pub"), json!("@pub"));
    }

    #[test]
    fn decodes_update_with_callback() {
        let raw = r#"{
            "update_id": 10,
            "callback_query": {
                "id": "cb1",
                "from": { "id": 42, "is_bot": false, "first_name": "Ana" },
                "message": { "message_id": 7, "chat": { "id": 42, "type": "private" } },
                "data": "fsub_done:f1"
            }
        }"#;
        let update: Update = serde_json::from_str(raw).unwrap();
        let query = update.callback_query.unwrap();
        assert_eq!(query.from.id, 42);
        assert_eq!(query.data.as_deref(), Some("fsub_done:f1"));
        assert_eq!(
            query.message.unwrap().reference(),
            MessageRef {
                chat_id: 42,
                message_id: 7
            }
        );
    }

    #[test]
    fn error_envelope_decodes() {
        let raw = r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#;
        let envelope: Envelope<Value> = serde_json::from_str(raw).unwrap();
        assert!(!envelope.ok);
        assert_eq!(envelope.error_code, Some(400));
        assert!(envelope.result.is_none());
    }

    fn decode_envelope<T: DeserializeOwned>(raw: &str) -> Envelope<T> {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn envelope_result_needs_no_default() {
        let ok: Envelope<User> =
            decode_envelope(r#"{"ok":true,"result":{"id":7,"is_bot":true,"first_name":"gate","username":"gate_bot"}}"#);
        assert_eq!(ok.result.map(|u| u.id), Some(7));

        let failed: Envelope<User> = decode_envelope(r#"{"ok":false,"error_code":403,"description":"Forbidden"}"#);
        assert!(failed.result.is_none());
        assert_eq!(failed.description.as_deref(), Some("Forbidden"));
    }

    #[test]
    fn client_requires_token() {
        assert!(Client::new(ClientConfig::default()).is_err());
    }
}

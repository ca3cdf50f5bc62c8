use async_trait::async_trait;
use fleetbot_kernel::{split_message, MAX_MESSAGE_CHARS};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("sendMessage request failed: {0}")]
    Transport(String),
    #[error("sendMessage returned {status}: {body}")]
    Api { status: u16, body: String },
}

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), MessengerError>;
}

pub struct TelegramMessenger {
    client: reqwest::Client,
    api_base_url: String,
    token: String,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
}

impl TelegramMessenger {
    pub fn new(client: reqwest::Client, api_base_url: &str, token: &str) -> Self {
        Self {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    /// Texts above the platform limit go out as several consecutive messages.
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), MessengerError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base_url, self.token);
        for chunk in split_message(text, MAX_MESSAGE_CHARS) {
            let resp = self
                .client
                .post(&url)
                .json(&SendMessageRequest {
                    chat_id,
                    text: &chunk,
                })
                .send()
                .await
                .map_err(|e| MessengerError::Transport(e.without_url().to_string()))?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(MessengerError::Api {
                    status: status.as_u16(),
                    body,
                });
            }
        }
        Ok(())
    }
}

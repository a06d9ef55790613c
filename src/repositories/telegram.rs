use anyhow::bail;
use async_trait::async_trait;
use serde_json::json;

/// Outbound chat messages. Callers treat every failure as non-fatal.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_admins(&self, text: &str) -> Result<(), anyhow::Error>;
    async fn notify_user(&self, user_id: i64, text: &str) -> Result<(), anyhow::Error>;
}

pub struct TelegramNotifier {
    api_url: String,
    bot_token: String,
    admin_chat_ids: Vec<i64>,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(api_url: String, bot_token: String, admin_chat_ids: Vec<i64>) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            bot_token,
            admin_chat_ids,
            client: reqwest::Client::new(),
        }
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), anyhow::Error> {
        let payload = json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });

        let response: serde_json::Value = self
            .client
            .post(format!("{}/bot{}/sendMessage", self.api_url, self.bot_token))
            .json(&payload)
            .send()
            .await?
            .json()
            .await?;

        match response.get("ok").and_then(|ok| ok.as_bool()) {
            Some(true) => Ok(()),
            _ => bail!(
                "Telegram: sendMessage to {} failed: {}",
                chat_id,
                response
                    .get("description")
                    .and_then(|d| d.as_str())
                    .unwrap_or("unknown error")
            ),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify_admins(&self, text: &str) -> Result<(), anyhow::Error> {
        let mut last_error = None;

        // One unreachable admin must not keep the rest from hearing about it.
        for chat_id in &self.admin_chat_ids {
            if let Err(e) = self.send_message(*chat_id, text).await {
                log::warn!("{}", e);
                last_error = Some(e);
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn notify_user(&self, user_id: i64, text: &str) -> Result<(), anyhow::Error> {
        self.send_message(user_id, text).await
    }
}

use anyhow::bail;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;

/// Remote balance the user spends from once a deposit is approved.
#[async_trait]
pub trait CardProvider: Send + Sync {
    async fn credit_user(
        &self,
        user_id: i64,
        amount_usd: Decimal,
        reference: &str,
    ) -> Result<(), anyhow::Error>;
}

pub struct StroWalletApi {
    public_key: String,
    url: String,
    client: reqwest::Client,
}

impl StroWalletApi {
    pub fn new(public_key: String, url: String) -> Self {
        Self {
            public_key,
            url: url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CardProvider for StroWalletApi {
    async fn credit_user(
        &self,
        user_id: i64,
        amount_usd: Decimal,
        reference: &str,
    ) -> Result<(), anyhow::Error> {
        let payload = json!({
            "public_key": self.public_key,
            "customerId": user_id.to_string(),
            "amount": amount_usd.to_string(),
            "reference": reference,
        });

        let response = self
            .client
            .post(format!("{}/wallet/credit", self.url))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            bail!("StroWallet: HTTP {} crediting user {}", status.as_u16(), user_id);
        }

        let response_json: serde_json::Value = serde_json::from_str(&text)?;
        match response_json.get("success").and_then(|s| s.as_bool()) {
            Some(true) => Ok(()),
            _ => {
                let message = response_json
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("no message");
                bail!("StroWallet: credit refused: {}", message)
            }
        }
    }
}

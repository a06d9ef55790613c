use std::collections::HashMap;

use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::models::deposits::ExpectedReceiver;
use crate::models::payments::PaymentMethod;

#[derive(Debug, Deserialize)]
pub struct Postgres {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Deserialize)]
pub struct Server {
    pub listen: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Fetcher {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub proxies: Vec<String>,
    #[serde(default = "default_true")]
    pub direct_fallback: bool,
}

impl Default for Fetcher {
    fn default() -> Self {
        Fetcher {
            timeout_secs: default_timeout_secs(),
            max_redirects: default_max_redirects(),
            max_body_bytes: default_max_body_bytes(),
            user_agent: default_user_agent(),
            proxies: Vec::new(),
            direct_fallback: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Verifier {
    pub allowed_domains: Vec<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_raw_snippet_chars")]
    pub raw_snippet_chars: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiverPolicy {
    /// No expected receiver configured for a method means the check is skipped.
    #[default]
    SkipWhenUnconfigured,
    RejectWhenUnconfigured,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Deposits {
    #[serde(default = "default_amount_tolerance")]
    pub amount_tolerance: Decimal,
    #[serde(default = "default_true")]
    pub must_be_today: bool,
    pub max_receipt_age_minutes: Option<i64>,
    #[serde(default)]
    pub receiver_policy: ReceiverPolicy,
}

impl Default for Deposits {
    fn default() -> Self {
        Deposits {
            amount_tolerance: default_amount_tolerance(),
            must_be_today: true,
            max_receipt_age_minutes: None,
            receiver_policy: ReceiverPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Telegram {
    #[serde(default = "default_telegram_url")]
    pub api_url: String,
    pub bot_token: String,
    #[serde(default)]
    pub admin_chat_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct Strowallet {
    pub url: String,
    pub public_key: String,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub postgres: Postgres,
    pub server: Server,
    #[serde(default)]
    pub fetcher: Fetcher,
    pub verifier: Verifier,
    #[serde(default)]
    pub deposits: Deposits,
    #[serde(default)]
    pub receivers: HashMap<PaymentMethod, ExpectedReceiver>,
    pub telegram: Telegram,
    pub strowallet: Option<Strowallet>,
}

impl Settings {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("RECEIPT_DEALER").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_max_redirects() -> usize {
    5
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_user_agent() -> String {
    format!("receipt-dealer/{}", env!("CARGO_PKG_VERSION"))
}

fn default_true() -> bool {
    true
}

fn default_timezone() -> String {
    "Africa/Addis_Ababa".to_string()
}

fn default_raw_snippet_chars() -> usize {
    50_000
}

fn default_amount_tolerance() -> Decimal {
    Decimal::new(5, 0)
}

fn default_telegram_url() -> String {
    "https://api.telegram.org".to_string()
}

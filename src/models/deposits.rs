use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::payments::PaymentMethod;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Completed,
    CreditPendingExternal,
    Rejected,
    Cancelled,
}

impl DepositStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Completed => "completed",
            DepositStatus::CreditPendingExternal => "credit_pending_external",
            DepositStatus::Rejected => "rejected",
            DepositStatus::Cancelled => "cancelled",
        }
    }

    /// Rejected and cancelled deposits release their transaction reference.
    pub fn holds_reference(&self) -> bool {
        !matches!(self, DepositStatus::Rejected | DepositStatus::Cancelled)
    }
}

impl fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DepositStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "completed" => DepositStatus::Completed,
            "credit_pending_external" => DepositStatus::CreditPendingExternal,
            "rejected" => DepositStatus::Rejected,
            "cancelled" => DepositStatus::Cancelled,
            other => bail!("Unknown deposit status: {}", other),
        };

        Ok(status)
    }
}

/// Ledger entry for funds credited to a user.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Deposit {
    pub id: i64,
    pub payment_id: i64,
    pub user_id: i64,
    pub amount_usd: Decimal,
    pub amount_etb: Decimal,
    pub exchange_rate: Decimal,
    pub payment_method: PaymentMethod,
    pub transaction_ref: String,
    /// None when the deposit was approved automatically.
    pub approved_by: Option<i64>,
    pub status: DepositStatus,
    pub auto_approved: bool,
    pub created_at: DateTime<Utc>,
}

/// Everything the ledger needs to settle a payment in one transaction.
#[derive(Clone, Debug, Serialize)]
pub struct DepositCredit {
    pub payment_id: i64,
    pub transaction_ref: String,
    pub amount_etb: Decimal,
    pub status: DepositStatus,
    pub receipt_url: String,
    pub verification: serde_json::Value,
}

/// Account the operator expects funds to arrive in for one payment method.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExpectedReceiver {
    pub account: Option<String>,
    pub name: Option<String>,
}

impl ExpectedReceiver {
    pub fn is_empty(&self) -> bool {
        let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
        blank(&self.account) && blank(&self.name)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ManualReview {
    pub payment_id: i64,
    pub receipt_url: String,
    pub transaction_ref: Option<String>,
    pub verification: serde_json::Value,
}

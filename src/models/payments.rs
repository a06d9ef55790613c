use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Telebirr,
    Cbe,
    Boa,
    Mpesa,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Telebirr => "telebirr",
            PaymentMethod::Cbe => "cbe",
            PaymentMethod::Boa => "boa",
            PaymentMethod::Mpesa => "mpesa",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "telebirr" => Ok(PaymentMethod::Telebirr),
            "cbe" => Ok(PaymentMethod::Cbe),
            "boa" => Ok(PaymentMethod::Boa),
            "mpesa" | "m-pesa" => Ok(PaymentMethod::Mpesa),
            other => bail!("Unknown payment method: {}", other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    ScreenshotSubmitted,
    TransactionSubmitted,
    Verified,
    AutoApproved,
    Rejected,
    Cancelled,
    Completed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::ScreenshotSubmitted => "screenshot_submitted",
            PaymentStatus::TransactionSubmitted => "transaction_submitted",
            PaymentStatus::Verified => "verified",
            PaymentStatus::AutoApproved => "auto_approved",
            PaymentStatus::Rejected => "rejected",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Completed => "completed",
        }
    }

    /// A payment in one of these states can no longer be settled by a receipt.
    /// `auto_approved` is included because funds were already credited.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed
                | PaymentStatus::Rejected
                | PaymentStatus::Cancelled
                | PaymentStatus::AutoApproved
        )
    }

    /// Status a payment is parked in while it waits for an administrator.
    pub fn manual_review() -> Self {
        PaymentStatus::TransactionSubmitted
    }

    pub fn open_statuses() -> &'static [PaymentStatus] {
        &[
            PaymentStatus::Pending,
            PaymentStatus::ScreenshotSubmitted,
            PaymentStatus::TransactionSubmitted,
            PaymentStatus::Verified,
        ]
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "pending" => PaymentStatus::Pending,
            "screenshot_submitted" => PaymentStatus::ScreenshotSubmitted,
            "transaction_submitted" => PaymentStatus::TransactionSubmitted,
            "verified" => PaymentStatus::Verified,
            "auto_approved" => PaymentStatus::AutoApproved,
            "rejected" => PaymentStatus::Rejected,
            "cancelled" => PaymentStatus::Cancelled,
            "completed" => PaymentStatus::Completed,
            other => bail!("Unknown payment status: {}", other),
        };

        Ok(status)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PendingPayment {
    pub id: i64,
    pub user_id: i64,
    pub amount_usd: Decimal,
    pub exchange_rate: Decimal,
    pub amount_etb: Decimal,
    pub deposit_fee_etb: Decimal,
    pub total_etb: Decimal,
    pub payment_method: PaymentMethod,
    pub status: PaymentStatus,
    pub receipt_url: Option<String>,
    pub transaction_ref: Option<String>,
    pub verification: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NewPendingPayment {
    pub user_id: i64,
    pub amount_usd: Decimal,
    pub exchange_rate: Decimal,
    pub deposit_fee_etb: Decimal,
    pub payment_method: PaymentMethod,
}

impl NewPendingPayment {
    pub fn amount_etb(&self) -> Decimal {
        (self.amount_usd * self.exchange_rate)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
    }

    /// Fixed at creation; never recomputed from a later rate or fee.
    pub fn total_etb(&self) -> Decimal {
        self.amount_etb() + self.deposit_fee_etb
    }
}

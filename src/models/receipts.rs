use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CURRENCY: &str = "ETB";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptField {
    TransactionId,
    Amount,
    SenderName,
    SenderAccount,
    ReceiverName,
    ReceiverAccount,
    Date,
}

impl ReceiptField {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptField::TransactionId => "transaction_id",
            ReceiptField::Amount => "amount",
            ReceiptField::SenderName => "sender_name",
            ReceiptField::SenderAccount => "sender_account",
            ReceiptField::ReceiverName => "receiver_name",
            ReceiptField::ReceiverAccount => "receiver_account",
            ReceiptField::Date => "date",
        }
    }
}

impl fmt::Display for ReceiptField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized transaction record extracted from a provider receipt.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ParsedReceipt {
    pub source_domain: String,
    pub transaction_id: Option<String>,
    pub amount: Option<Decimal>,
    pub currency: String,
    pub sender_name: Option<String>,
    pub sender_account: Option<String>,
    pub receiver_name: Option<String>,
    pub receiver_account: Option<String>,
    pub raw_date: Option<String>,
    pub date_utc: Option<DateTime<Utc>>,
    pub date_local: Option<DateTime<FixedOffset>>,
}

impl ParsedReceipt {
    pub fn new(source_domain: &str) -> Self {
        ParsedReceipt {
            source_domain: source_domain.to_string(),
            currency: DEFAULT_CURRENCY.to_string(),
            ..Default::default()
        }
    }

    /// Only a receipt with both a transaction id and an amount can settle a payment.
    pub fn is_usable(&self) -> bool {
        self.transaction_id.is_some() && self.amount.is_some()
    }

    pub fn missing_fields(&self) -> Vec<ReceiptField> {
        let checks = [
            (ReceiptField::TransactionId, self.transaction_id.is_none()),
            (ReceiptField::Amount, self.amount.is_none()),
            (ReceiptField::SenderName, self.sender_name.is_none()),
            (ReceiptField::SenderAccount, self.sender_account.is_none()),
            (ReceiptField::ReceiverName, self.receiver_name.is_none()),
            (ReceiptField::ReceiverAccount, self.receiver_account.is_none()),
            (ReceiptField::Date, self.raw_date.is_none()),
        ];

        checks
            .into_iter()
            .filter(|(_, missing)| *missing)
            .map(|(field, _)| field)
            .collect()
    }

    pub fn has_receiver(&self) -> bool {
        self.receiver_name.is_some() || self.receiver_account.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum VerifyFailure {
    InvalidUrl,
    DomainNotAllowed,
    Network,
    RemoteError { status: u16 },
    NoParser,
}

impl VerifyFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyFailure::InvalidUrl => "invalid_url",
            VerifyFailure::DomainNotAllowed => "domain_not_allowed",
            VerifyFailure::Network => "network",
            VerifyFailure::RemoteError { .. } => "remote_error",
            VerifyFailure::NoParser => "no_parser",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VerifyResult {
    pub ok: bool,
    pub parsed: Option<ParsedReceipt>,
    #[serde(default)]
    pub missing_fields: Vec<ReceiptField>,
    pub raw_html_snippet: Option<String>,
    pub failure: Option<VerifyFailure>,
    pub message: Option<String>,
    pub parser: Option<String>,
    pub body_sha256: Option<String>,
}

impl VerifyResult {
    pub fn failed(failure: VerifyFailure, message: impl Into<String>) -> Self {
        VerifyResult {
            ok: false,
            parsed: None,
            missing_fields: Vec::new(),
            raw_html_snippet: None,
            failure: Some(failure),
            message: Some(message.into()),
            parser: None,
            body_sha256: None,
        }
    }

    pub fn parsed(parsed: ParsedReceipt, parser: &str, body_sha256: String) -> Self {
        VerifyResult {
            ok: true,
            missing_fields: parsed.missing_fields(),
            parsed: Some(parsed),
            raw_html_snippet: None,
            failure: None,
            message: None,
            parser: Some(parser.to_string()),
            body_sha256: Some(body_sha256),
        }
    }
}

/// Inclusive UTC window; an absent bound is unbounded on that side.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct DateWindow {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct DateConstraints {
    pub must_be_today: bool,
    pub between: Option<DateWindow>,
}

impl DateConstraints {
    pub fn is_empty(&self) -> bool {
        !self.must_be_today && self.between.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DateMatchResult {
    pub ok: bool,
    /// False when no rule was requested; `ok` is then always true.
    pub enforced: bool,
    pub reason: String,
    pub receipt_local_date: Option<NaiveDate>,
    pub receipt_utc: Option<DateTime<Utc>>,
    pub today_local: Option<NaiveDate>,
    pub window: Option<DateWindow>,
}

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;
use url::Url;

use super::{detect_currency, parse_amount};
use crate::models::receipts::ParsedReceipt;
use crate::utils::normalize_for_match;

pub const JSON_PARSER_NAME: &str = "json";

// Keys are compared after normalize_for_match, so "Transaction Reference",
// "transaction_reference" and "transactionReference" are the same key.
const TRANSACTION_ID_KEYS: &[&str] = &[
    "transaction_id",
    "transaction_reference",
    "transaction_ref",
    "reference_no",
    "reference",
    "txn_id",
    "invoice_no",
];
const AMOUNT_KEYS: &[&str] = &[
    "amount",
    "transferred_amount",
    "settled_amount",
    "total_amount",
    "paid_amount",
];
const CURRENCY_KEYS: &[&str] = &["currency", "currency_code"];
const SENDER_NAME_KEYS: &[&str] = &["sender_name", "payer_name", "payer's_name", "source_account_name"];
const SENDER_ACCOUNT_KEYS: &[&str] = &["sender_account", "payer_account", "source_account"];
const RECEIVER_NAME_KEYS: &[&str] = &[
    "receiver_name",
    "receiver's_name",
    "beneficiary_name",
    "credited_party_name",
];
const RECEIVER_ACCOUNT_KEYS: &[&str] = &[
    "receiver_account",
    "receiver's_account",
    "beneficiary_account",
    "credited_party_account",
];
const DATE_KEYS: &[&str] = &["transaction_date", "payment_date", "date", "created_at"];

/// Objects searched, in order, for each field.
fn candidate_objects(root: &Value) -> Vec<&Value> {
    let mut candidates = vec![root];

    for key in ["data", "result", "body"] {
        match root.get(key) {
            Some(obj @ Value::Object(_)) => candidates.push(obj),
            Some(Value::Array(items)) => {
                if let Some(first @ Value::Object(_)) = items.first() {
                    candidates.push(first);
                }
            }
            _ => {}
        }
    }

    candidates
}

fn lookup<'a>(candidates: &[&'a Value], keys: &[&str]) -> Option<&'a Value> {
    let wanted: Vec<String> = keys.iter().map(|k| normalize_for_match(k)).collect();

    for candidate in candidates {
        let Value::Object(map) = candidate else {
            continue;
        };

        for key in &wanted {
            let hit = map
                .iter()
                .find(|(k, v)| normalize_for_match(k) == *key && !is_blank(v))
                .map(|(_, v)| v);
            if hit.is_some() {
                return hit;
            }
        }
    }

    None
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_amount(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .ok()
            .or_else(|| n.as_f64().and_then(|f| Decimal::try_from(f).ok())),
        Value::String(s) => parse_amount(s),
        _ => None,
    }
}

/// Fast path for providers whose receipt endpoint answers with JSON.
pub fn parse_json(value: &Value, url: &Url) -> ParsedReceipt {
    let candidates = candidate_objects(value);
    let text = |keys: &[&str]| lookup(&candidates, keys).and_then(as_text);

    let mut receipt = ParsedReceipt::new(url.host_str().unwrap_or_default());
    receipt.transaction_id = text(TRANSACTION_ID_KEYS);

    if let Some(raw_amount) = lookup(&candidates, AMOUNT_KEYS) {
        receipt.amount = as_amount(raw_amount);
        if let Some(currency) = as_text(raw_amount).as_deref().and_then(detect_currency) {
            receipt.currency = currency.to_string();
        }
    }
    if let Some(currency) = text(CURRENCY_KEYS) {
        receipt.currency = match detect_currency(&currency) {
            Some(code) => code.to_string(),
            None => currency.to_ascii_uppercase(),
        };
    }

    receipt.sender_name = text(SENDER_NAME_KEYS);
    receipt.sender_account = text(SENDER_ACCOUNT_KEYS);
    receipt.receiver_name = text(RECEIVER_NAME_KEYS);
    receipt.receiver_account = text(RECEIVER_ACCOUNT_KEYS);
    receipt.raw_date = text(DATE_KEYS);

    receipt
}

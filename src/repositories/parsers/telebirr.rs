use url::Url;

use super::{contains_ci, host_is, AliasTable, LabelledFields, ReceiptParser};
use crate::models::receipts::ParsedReceipt;

const TELEBIRR_DOMAIN: &str = "ethiotelecom.et";

const ALIASES: AliasTable = AliasTable {
    transaction_id: &["invoice no", "transaction id", "transaction number", "receipt no"],
    amount: &["settled amount", "total paid amount", "amount"],
    sender_name: &["payer name"],
    sender_account: &["payer telebirr no", "payer account no", "payer phone no"],
    receiver_name: &["credited party name"],
    receiver_account: &[
        "credited party account no",
        "credited party telebirr no",
        "credited party account",
    ],
    date: &["payment date", "transaction date", "date"],
};

/// Ethio Telecom telebirr transaction receipt.
pub struct TelebirrParser;

impl ReceiptParser for TelebirrParser {
    fn name(&self) -> &'static str {
        "telebirr"
    }

    fn claims_host(&self, url: &Url) -> bool {
        host_is(url, TELEBIRR_DOMAIN)
    }

    fn recognizes(&self, html: &str) -> bool {
        contains_ci(html, "telebirr") && contains_ci(html, "credited party")
    }

    fn parse(&self, html: &str, url: &Url) -> ParsedReceipt {
        let fields = LabelledFields::from_html(html);
        ALIASES.apply(&fields, url)
    }
}

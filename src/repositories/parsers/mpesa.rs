use url::Url;

use super::{contains_ci, host_is, AliasTable, LabelledFields, ReceiptParser};
use crate::models::receipts::ParsedReceipt;

const MPESA_DOMAIN: &str = "safaricom.et";

const ALIASES: AliasTable = AliasTable {
    transaction_id: &["transaction id", "receipt no", "transaction number"],
    amount: &["amount", "transaction amount", "paid amount"],
    sender_name: &["sender name", "sender"],
    sender_account: &["sender number", "sender phone"],
    receiver_name: &["receiver name", "receiver", "merchant name"],
    receiver_account: &["receiver number", "receiver account", "till number"],
    date: &["transaction date", "date"],
};

/// M-Pesa Ethiopia transaction receipt.
pub struct MpesaParser;

impl ReceiptParser for MpesaParser {
    fn name(&self) -> &'static str {
        "mpesa"
    }

    fn claims_host(&self, url: &Url) -> bool {
        host_is(url, MPESA_DOMAIN)
    }

    fn recognizes(&self, html: &str) -> bool {
        contains_ci(html, "m-pesa")
    }

    fn parse(&self, html: &str, url: &Url) -> ParsedReceipt {
        let fields = LabelledFields::from_html(html);
        ALIASES.apply(&fields, url)
    }
}

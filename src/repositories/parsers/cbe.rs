use url::Url;

use super::{contains_ci, host_is, AliasTable, LabelledFields, ReceiptParser};
use crate::models::receipts::ParsedReceipt;

const CBE_DOMAIN: &str = "cbe.com.et";

const ALIASES: AliasTable = AliasTable {
    transaction_id: &["reference no", "transaction reference", "reference"],
    amount: &["transferred amount", "amount"],
    sender_name: &["payer", "payer name"],
    sender_account: &["payer account"],
    receiver_name: &["receiver", "receiver name"],
    receiver_account: &["receiver account"],
    date: &["payment date time", "payment date", "transaction date"],
};

#[derive(Clone, Copy)]
enum Party {
    Payer,
    Receiver,
}

/// Commercial Bank of Ethiopia transfer receipt.
///
/// CBE prints a bare "Account" row under both the payer and the receiver; it
/// belongs to whichever party label came last. A bound table row replaces any
/// account that only came from free page text.
pub struct CbeParser;

impl CbeParser {
    fn bind_bare_accounts(fields: &LabelledFields, receipt: &mut ParsedReceipt) {
        let mut party = None;
        let mut sender_bound = fields.get_structured(ALIASES.sender_account).is_some();
        let mut receiver_bound = fields.get_structured(ALIASES.receiver_account).is_some();

        for (label, value) in fields.pairs() {
            match label {
                "payer" | "payer name" => party = Some(Party::Payer),
                "receiver" | "receiver name" => party = Some(Party::Receiver),
                "account" => match party {
                    Some(Party::Payer) if !sender_bound => {
                        receipt.sender_account = Some(value.to_string());
                        sender_bound = true;
                    }
                    Some(Party::Receiver) if !receiver_bound => {
                        receipt.receiver_account = Some(value.to_string());
                        receiver_bound = true;
                    }
                    _ => {}
                },
                _ => {}
            }
        }
    }
}

impl ReceiptParser for CbeParser {
    fn name(&self) -> &'static str {
        "cbe"
    }

    fn claims_host(&self, url: &Url) -> bool {
        host_is(url, CBE_DOMAIN)
    }

    fn recognizes(&self, html: &str) -> bool {
        contains_ci(html, "commercial bank of ethiopia")
    }

    fn parse(&self, html: &str, url: &Url) -> ParsedReceipt {
        let fields = LabelledFields::from_html(html);
        let mut receipt = ALIASES.apply(&fields, url);
        Self::bind_bare_accounts(&fields, &mut receipt);

        receipt
    }
}

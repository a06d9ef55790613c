use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::models::receipts::ParsedReceipt;
use crate::utils::DomainAllowList;

mod cbe;
pub mod json;
mod mpesa;
mod telebirr;

pub use cbe::CbeParser;
pub use mpesa::MpesaParser;
pub use telebirr::TelebirrParser;

static AMOUNT_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?").ok());

/// Text inside these elements is only read through the structured row and
/// definition-list passes.
const STRUCTURED_TAGS: &[&str] = &["td", "th", "dt", "dd"];

/// One provider's receipt page format.
///
/// Selection checks `claims_host` across every registered parser before any
/// `recognizes` content sniff, so page text cannot pull a receipt away from the
/// provider that served it. `parse` never fails: anything it cannot find is
/// left as `None`.
pub trait ReceiptParser: Send + Sync {
    fn name(&self) -> &'static str;
    fn claims_host(&self, url: &Url) -> bool;
    fn recognizes(&self, html: &str) -> bool;
    fn parse(&self, html: &str, url: &Url) -> ParsedReceipt;

    fn can_parse(&self, url: &Url, html: &str) -> bool {
        self.claims_host(url) || self.recognizes(html)
    }
}

/// Host match over all parsers first, then content sniffing in registration order.
pub fn select_parser<'a>(
    parsers: &'a [Box<dyn ReceiptParser>],
    url: &Url,
    html: &str,
) -> Option<&'a dyn ReceiptParser> {
    parsers
        .iter()
        .find(|p| p.claims_host(url))
        .or_else(|| parsers.iter().find(|p| p.recognizes(html)))
        .map(|p| &**p)
}

pub fn default_parsers() -> Vec<Box<dyn ReceiptParser>> {
    vec![
        Box::new(TelebirrParser),
        Box::new(CbeParser),
        Box::new(MpesaParser),
    ]
}

/// Label aliases per normalized field, tried in order.
pub struct AliasTable {
    pub transaction_id: &'static [&'static str],
    pub amount: &'static [&'static str],
    pub sender_name: &'static [&'static str],
    pub sender_account: &'static [&'static str],
    pub receiver_name: &'static [&'static str],
    pub receiver_account: &'static [&'static str],
    pub date: &'static [&'static str],
}

impl AliasTable {
    pub fn apply(&self, fields: &LabelledFields, url: &Url) -> ParsedReceipt {
        let mut receipt = ParsedReceipt::new(url.host_str().unwrap_or_default());

        receipt.transaction_id = fields.get(self.transaction_id).map(str::to_string);
        if let Some(amount_text) = fields.get(self.amount) {
            receipt.amount = parse_amount(amount_text);
            if let Some(currency) = detect_currency(amount_text) {
                receipt.currency = currency.to_string();
            }
        }
        receipt.sender_name = fields.get(self.sender_name).map(str::to_string);
        receipt.sender_account = fields.get(self.sender_account).map(str::to_string);
        receipt.receiver_name = fields.get(self.receiver_name).map(str::to_string);
        receipt.receiver_account = fields.get(self.receiver_account).map(str::to_string);
        receipt.raw_date = fields.get(self.date).map(str::to_string);

        receipt
    }
}

/// Label/value pairs pulled out of a receipt page, in document order.
///
/// Table rows and definition lists are structured pairs. Free `Label: value`
/// lines elsewhere on the page go to a separate pool that is only read when
/// no structured pair matches.
#[derive(Debug, Default)]
pub struct LabelledFields {
    pairs: Vec<(String, String)>,
    text_pairs: Vec<(String, String)>,
}

impl LabelledFields {
    pub fn from_html(html: &str) -> Self {
        let document = Html::parse_document(html);
        let mut fields = LabelledFields::default();

        fields.collect_table_rows(&document);
        fields.collect_definition_lists(&document);
        fields.collect_text_lines(&document);

        fields
    }

    fn collect_table_rows(&mut self, document: &Html) {
        let (Ok(row_sel), Ok(cell_sel)) = (Selector::parse("tr"), Selector::parse("td, th")) else {
            return;
        };

        let rows: Vec<Vec<String>> = document
            .select(&row_sel)
            .map(|row| row.select(&cell_sel).map(element_text).collect())
            .collect();

        for (idx, cells) in rows.iter().enumerate() {
            match cells.len() {
                2 => self.push(&cells[0], &cells[1]),
                4 => {
                    self.push(&cells[0], &cells[1]);
                    self.push(&cells[2], &cells[3]);
                }
                _ => {}
            }

            // Header row followed by a value row of the same width.
            if cells.len() >= 3 {
                if let Some(next) = rows.get(idx + 1).filter(|next| next.len() == cells.len()) {
                    for (label, value) in cells.iter().zip(next.iter()) {
                        self.push(label, value);
                    }
                }
            }
        }
    }

    fn collect_definition_lists(&mut self, document: &Html) {
        let (Ok(dt_sel), Ok(dd_sel)) = (Selector::parse("dt"), Selector::parse("dd")) else {
            return;
        };

        let labels: Vec<String> = document.select(&dt_sel).map(element_text).collect();
        let values: Vec<String> = document.select(&dd_sel).map(element_text).collect();
        for (label, value) in labels.iter().zip(values.iter()) {
            self.push(label, value);
        }
    }

    fn collect_text_lines(&mut self, document: &Html) {
        for node in document.root_element().descendants() {
            let Some(text) = node.value().as_text() else {
                continue;
            };
            let in_structure = node
                .ancestors()
                .filter_map(ElementRef::wrap)
                .any(|el| STRUCTURED_TAGS.contains(&el.value().name()));
            if in_structure {
                continue;
            }

            for line in text.lines().map(collapse_whitespace) {
                if let Some((label, value)) = line.split_once(':') {
                    if label.chars().any(char::is_alphabetic) {
                        push_pair(&mut self.text_pairs, label, value);
                    }
                }
            }
        }
    }

    fn push(&mut self, label: &str, value: &str) {
        push_pair(&mut self.pairs, label, value);
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(l, v)| (l.as_str(), v.as_str()))
    }

    /// Structured pairs win over text lines. Within a pool, exact label matches
    /// win over prefix matches and earlier aliases win over later ones.
    pub fn get(&self, aliases: &[&str]) -> Option<&str> {
        self.get_structured(aliases)
            .or_else(|| lookup_pairs(&self.text_pairs, aliases))
    }

    pub fn get_structured(&self, aliases: &[&str]) -> Option<&str> {
        lookup_pairs(&self.pairs, aliases)
    }
}

fn push_pair(pool: &mut Vec<(String, String)>, label: &str, value: &str) {
    let label = normalize_label(label);
    let value = collapse_whitespace(value);
    if !label.is_empty() && !value.is_empty() {
        pool.push((label, value));
    }
}

fn lookup_pairs<'a>(pool: &'a [(String, String)], aliases: &[&str]) -> Option<&'a str> {
    for alias in aliases {
        if let Some((_, value)) = pool.iter().find(|(label, _)| label == alias) {
            return Some(value);
        }
    }

    for alias in aliases {
        let prefix = format!("{} ", alias);
        if let Some((_, value)) = pool.iter().find(|(label, _)| label.starts_with(&prefix)) {
            return Some(value);
        }
    }

    None
}

fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<Vec<_>>().join(" "))
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `"Payment Date & Time:"` -> `"payment date time"`.
pub fn normalize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect();

    collapse_whitespace(&cleaned)
}

/// First number in the text, thousands separators allowed: `"ETB 13,500.00"` -> 13500.00.
pub fn parse_amount(text: &str) -> Option<Decimal> {
    let raw = AMOUNT_RE.as_ref()?.find(text)?.as_str().replace(',', "");

    Decimal::from_str(&raw).ok()
}

pub fn detect_currency(text: &str) -> Option<&'static str> {
    let upper = text.to_ascii_uppercase();
    if upper.contains("USD") || upper.contains('$') {
        Some("USD")
    } else if upper.contains("ETB") || upper.contains("BIRR") {
        Some("ETB")
    } else {
        None
    }
}

pub(crate) fn host_is(url: &Url, domain: &str) -> bool {
    DomainAllowList::new([domain]).permits(url)
}

pub(crate) fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
}

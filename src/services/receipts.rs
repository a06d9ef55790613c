use super::RequestHandler;
use super::Service;

use crate::models::receipts::{VerifyFailure, VerifyResult};
use crate::repositories::fetcher::{FetchError, ReceiptFetcher};
use crate::repositories::parsers::json::{parse_json, JSON_PARSER_NAME};
use crate::repositories::parsers::{default_parsers, select_parser, ReceiptParser};
use crate::settings;
use crate::utils::{truncate_chars, DomainAllowList};

use std::sync::{Arc, LazyLock};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use url::Url;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%d-%m-%Y %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%m/%d/%Y, %I:%M:%S %p",
];

static EMBEDDED_DATE_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(\d{4})[-/.](\d{1,2})[-/.](\d{1,2})(?:[ T](\d{1,2}):(\d{2})(?::(\d{2}))?)?").ok()
});

/// Resolves a receipt's date text to the same instant in UTC and in `tz`.
/// Values without an offset are read as wall-clock time in `tz`.
pub fn normalize_date(raw: &str, tz: Tz) -> Option<(DateTime<Utc>, DateTime<FixedOffset>)> {
    let raw = raw.trim();

    if let Ok(with_offset) = DateTime::parse_from_rfc3339(raw) {
        let utc = with_offset.with_timezone(&Utc);
        return Some((utc, utc.with_timezone(&tz).fixed_offset()));
    }

    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .or_else(|| extract_embedded_date(raw))?;

    let local = tz.from_local_datetime(&naive).earliest()?;
    Some((local.with_timezone(&Utc), local.fixed_offset()))
}

fn extract_embedded_date(raw: &str) -> Option<NaiveDateTime> {
    let caps = EMBEDDED_DATE_RE.as_ref()?.captures(raw)?;
    let number = |idx: usize| caps.get(idx).and_then(|m| m.as_str().parse::<u32>().ok());

    let date = NaiveDate::from_ymd_opt(caps[1].parse().ok()?, number(2)?, number(3)?)?;
    date.and_hms_opt(
        number(4).unwrap_or(0),
        number(5).unwrap_or(0),
        number(6).unwrap_or(0),
    )
}

pub struct ReceiptVerifier {
    allow_list: DomainAllowList,
    fetcher: Arc<dyn ReceiptFetcher>,
    parsers: Vec<Box<dyn ReceiptParser>>,
    timezone: Tz,
    raw_snippet_chars: usize,
}

impl ReceiptVerifier {
    pub fn new(
        config: &settings::Verifier,
        fetcher: Arc<dyn ReceiptFetcher>,
    ) -> Result<Self, anyhow::Error> {
        let timezone: Tz = config
            .timezone
            .parse()
            .map_err(|e| anyhow!("Invalid timezone {}: {}", config.timezone, e))?;

        Ok(ReceiptVerifier {
            allow_list: DomainAllowList::new(&config.allowed_domains),
            fetcher,
            parsers: default_parsers(),
            timezone,
            raw_snippet_chars: config.raw_snippet_chars,
        })
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub async fn verify_by_url(&self, raw_url: &str) -> VerifyResult {
        let url = match Url::parse(raw_url.trim()) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            _ => {
                return VerifyResult::failed(
                    VerifyFailure::InvalidUrl,
                    "Receipt link is not a valid http(s) URL",
                )
            }
        };

        if !self.allow_list.permits(&url) {
            return VerifyResult::failed(
                VerifyFailure::DomainNotAllowed,
                format!(
                    "Receipts from {} are not accepted",
                    url.host_str().unwrap_or("this host")
                ),
            );
        }

        let fetched = match self.fetcher.fetch(&url).await {
            Ok(fetched) => fetched,
            Err(FetchError::RemoteError { status }) => {
                return VerifyResult::failed(
                    VerifyFailure::RemoteError { status },
                    format!("Receipt host answered HTTP {}", status),
                )
            }
            Err(e) => {
                log::warn!("Receipt fetch from {} failed ({}): {}", url, e.reason(), e);
                return VerifyResult::failed(VerifyFailure::Network, e.to_string());
            }
        };
        if fetched.truncated {
            log::info!("Parsing truncated receipt body from {}.", fetched.final_url);
        }

        let body_sha256 = format!("{:x}", Sha256::digest(&fetched.body));
        let text = fetched.text();
        let page_url = &fetched.final_url;

        // A body labelled JSON that does not parse goes through the HTML parsers.
        let json = fetched
            .is_json()
            .then(|| serde_json::from_str::<serde_json::Value>(&text).ok())
            .flatten();

        let (mut parsed, parser_name) = match json {
            Some(value) => (parse_json(&value, page_url), JSON_PARSER_NAME),
            None => match select_parser(&self.parsers, page_url, &text) {
                Some(parser) => (parser.parse(&text, page_url), parser.name()),
                None => {
                    let mut result = VerifyResult::failed(
                        VerifyFailure::NoParser,
                        "No parser recognised the receipt page",
                    );
                    result.raw_html_snippet = Some(truncate_chars(&text, self.raw_snippet_chars));
                    result.body_sha256 = Some(body_sha256);
                    return result;
                }
            },
        };

        if let Some(raw_date) = parsed.raw_date.as_deref() {
            match normalize_date(raw_date, self.timezone) {
                Some((utc, local)) => {
                    parsed.date_utc = Some(utc);
                    parsed.date_local = Some(local);
                }
                None => log::debug!("Unrecognised receipt date format: {:?}", raw_date),
            }
        }

        log::info!(
            "Parsed receipt from {} with {} parser.",
            parsed.source_domain,
            parser_name
        );
        if !parsed.is_usable() {
            log::info!(
                "Receipt from {} lacks a transaction id or amount.",
                parsed.source_domain
            );
        }

        VerifyResult::parsed(parsed, parser_name, body_sha256)
    }
}

pub enum ReceiptServiceRequest {
    Verify {
        url: String,
        response: oneshot::Sender<VerifyResult>,
    },
}

#[derive(Clone)]
pub struct ReceiptRequestHandler {
    verifier: Arc<ReceiptVerifier>,
}

impl ReceiptRequestHandler {
    pub fn new(verifier: Arc<ReceiptVerifier>) -> Self {
        ReceiptRequestHandler { verifier }
    }
}

#[async_trait]
impl RequestHandler<ReceiptServiceRequest> for ReceiptRequestHandler {
    async fn handle_request(&self, request: ReceiptServiceRequest) {
        match request {
            ReceiptServiceRequest::Verify { url, response } => {
                let result = self.verifier.verify_by_url(&url).await;
                let _ = response.send(result);
            }
        }
    }
}

pub struct ReceiptService;

impl ReceiptService {
    pub fn new() -> Self {
        ReceiptService
    }
}

impl Service<ReceiptServiceRequest, ReceiptRequestHandler> for ReceiptService {}

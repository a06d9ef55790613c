//! Pure checks applied to a parsed receipt before any money moves.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;

use crate::models::deposits::ExpectedReceiver;
use crate::models::receipts::{DateConstraints, DateMatchResult, ParsedReceipt};
use crate::settings::ReceiverPolicy;
use crate::utils::normalize_for_match;

/// Shortest normalized value allowed to match as a substring, and the fewest
/// visible digits a masked account may show.
const MIN_MATCH_CHARS: usize = 4;

/// A run of this many mask characters is a placeholder for any number of
/// hidden digits. Shorter runs hide exactly one digit per character.
const PLACEHOLDER_MASK_RUN: usize = 4;

pub fn amount_within_tolerance(actual: Decimal, expected: Decimal, tolerance: Decimal) -> bool {
    (actual - expected).abs() <= tolerance.abs()
}

/// Case, whitespace and punctuation insensitive substring match in either
/// direction. Empty values never match.
pub fn fuzzy_matches(candidate: &str, expected: &str) -> bool {
    let candidate = normalize_for_match(candidate);
    let expected = normalize_for_match(expected);

    let shorter = candidate.chars().count().min(expected.chars().count());
    if shorter < MIN_MATCH_CHARS {
        return !candidate.is_empty() && candidate == expected;
    }

    candidate.contains(&expected) || expected.contains(&candidate)
}

fn is_mask_char(c: char) -> bool {
    matches!(c, '*' | 'x' | 'X')
}

fn is_masked(account: &str) -> bool {
    account.chars().any(is_mask_char) && account.chars().any(|c| c.is_ascii_digit())
}

/// `1000****3456` matches `1000123456`: visible leading and trailing digits
/// must line up with the expected account. `1000*3456` does not, since a short
/// mask keeps the account's length.
fn masked_account_matches(masked: &str, expected: &str) -> bool {
    let compact: Vec<char> = masked
        .chars()
        .filter(|c| c.is_ascii_digit() || is_mask_char(*c))
        .collect();
    let head: String = compact.iter().take_while(|c| c.is_ascii_digit()).collect();
    let tail: String = compact
        .iter()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let expected: String = expected.chars().filter(|c| c.is_ascii_digit()).collect();

    let visible = head.len() + tail.len();
    let longest_run = compact
        .split(|c| c.is_ascii_digit())
        .map(<[char]>::len)
        .max()
        .unwrap_or(0);
    let length_ok = if longest_run >= PLACEHOLDER_MASK_RUN {
        expected.len() >= visible
    } else {
        expected.len() == compact.len()
    };

    visible >= MIN_MATCH_CHARS
        && length_ok
        && expected.starts_with(&head)
        && expected.ends_with(&tail)
}

pub fn account_matches(receipt_account: &str, expected: &str) -> bool {
    if is_masked(receipt_account) {
        masked_account_matches(receipt_account, expected)
    } else {
        fuzzy_matches(receipt_account, expected)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiverCheck {
    Matched,
    /// Nothing configured for the method and the policy allows that.
    Skipped,
    Missing,
    Mismatch,
    Unconfigured,
}

pub fn check_receiver(
    parsed: &ParsedReceipt,
    expected: Option<&ExpectedReceiver>,
    policy: ReceiverPolicy,
) -> ReceiverCheck {
    let Some(expected) = expected.filter(|e| !e.is_empty()) else {
        return match policy {
            ReceiverPolicy::SkipWhenUnconfigured => ReceiverCheck::Skipped,
            ReceiverPolicy::RejectWhenUnconfigured => ReceiverCheck::Unconfigured,
        };
    };

    if !parsed.has_receiver() {
        return ReceiverCheck::Missing;
    }

    let account_ok = match (&parsed.receiver_account, &expected.account) {
        (Some(actual), Some(wanted)) => account_matches(actual, wanted),
        _ => false,
    };
    let name_ok = match (&parsed.receiver_name, &expected.name) {
        (Some(actual), Some(wanted)) => fuzzy_matches(actual, wanted),
        _ => false,
    };

    if account_ok || name_ok {
        ReceiverCheck::Matched
    } else {
        ReceiverCheck::Mismatch
    }
}

/// Checks the receipt date against every requested rule; the first failing
/// rule supplies the reason. A rule with no receipt date to check always fails.
pub fn evaluate_date_match(
    parsed: &ParsedReceipt,
    constraints: &DateConstraints,
    now: DateTime<Utc>,
    tz: Tz,
) -> DateMatchResult {
    let today_local = now.with_timezone(&tz).date_naive();
    let receipt_local_date = parsed
        .date_utc
        .map(|utc| utc.with_timezone(&tz).date_naive());

    let mut result = DateMatchResult {
        ok: true,
        enforced: !constraints.is_empty(),
        reason: String::new(),
        receipt_local_date,
        receipt_utc: parsed.date_utc,
        today_local: Some(today_local),
        window: constraints.between.clone(),
    };

    let failure = |mut result: DateMatchResult, reason: String| {
        result.ok = false;
        result.reason = reason;
        result
    };

    if constraints.is_empty() {
        result.reason = "not enforced".to_string();
        return result;
    }

    let (Some(receipt_utc), Some(receipt_local_date)) = (parsed.date_utc, receipt_local_date) else {
        let raw = parsed.raw_date.as_deref().unwrap_or("none");
        return failure(result, format!("receipt date could not be read (raw: {})", raw));
    };

    if constraints.must_be_today && receipt_local_date != today_local {
        return failure(
            result,
            format!("receipt dated {} but today is {}", receipt_local_date, today_local),
        );
    }

    if let Some(window) = &constraints.between {
        if let Some(from) = window.from.filter(|from| receipt_utc < *from) {
            return failure(
                result,
                format!("receipt time {} is before {}", receipt_utc.to_rfc3339(), from.to_rfc3339()),
            );
        }
        if let Some(to) = window.to.filter(|to| receipt_utc > *to) {
            return failure(
                result,
                format!("receipt time {} is after {}", receipt_utc.to_rfc3339(), to.to_rfc3339()),
            );
        }
    }

    result.reason = "date matches".to_string();
    result
}

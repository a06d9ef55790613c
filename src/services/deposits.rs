use super::receipts::ReceiptVerifier;
use super::matching::{amount_within_tolerance, check_receiver, evaluate_date_match, ReceiverCheck};
use super::RequestHandler;
use super::Service;
use super::ServiceError;

use crate::models::deposits::{Deposit, DepositCredit, DepositStatus, ExpectedReceiver, ManualReview};
use crate::models::payments::{NewPendingPayment, PaymentMethod, PendingPayment};
use crate::models::receipts::{DateConstraints, DateWindow, VerifyResult, DEFAULT_CURRENCY};
use crate::repositories::payments::{LedgerError, PaymentLedger};
use crate::repositories::strowallet::CardProvider;
use crate::repositories::telegram::Notifier;
use crate::settings;
use crate::utils::mask;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Receipts may be stamped slightly ahead of our clock.
const CLOCK_SKEW_MINUTES: i64 = 10;

/// Last state a verification attempt reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Start,
    Fetching,
    Parsed,
    AmountChecked,
    ReceiverChecked,
    DateChecked,
    Credited,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Start => "START",
            Stage::Fetching => "FETCHING",
            Stage::Parsed => "PARSED",
            Stage::AmountChecked => "AMOUNT_CHECKED",
            Stage::ReceiverChecked => "RECEIVER_CHECKED",
            Stage::DateChecked => "DATE_CHECKED",
            Stage::Credited => "CREDITED",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    PaymentNotFound,
    ReceiptVerificationFailed,
    MissingField,
    AmountMismatch,
    ReceiverMissing,
    ReceiverMismatch,
    ReceiverUnconfigured,
    DateMismatch,
    DuplicateTransaction,
    LedgerError,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::PaymentNotFound => "payment_not_found",
            RejectReason::ReceiptVerificationFailed => "receipt_verification_failed",
            RejectReason::MissingField => "missing_field",
            RejectReason::AmountMismatch => "amount_mismatch",
            RejectReason::ReceiverMissing => "receiver_missing",
            RejectReason::ReceiverMismatch => "receiver_mismatch",
            RejectReason::ReceiverUnconfigured => "receiver_unconfigured",
            RejectReason::DateMismatch => "date_mismatch",
            RejectReason::DuplicateTransaction => "duplicate_transaction",
            RejectReason::LedgerError => "ledger_error",
        }
    }

    /// Short reason safe to show the user.
    pub fn user_hint(&self) -> &'static str {
        match self {
            RejectReason::PaymentNotFound => "no open payment request was found",
            RejectReason::ReceiptVerificationFailed => "the receipt could not be read",
            RejectReason::MissingField => "the receipt is missing required details",
            RejectReason::AmountMismatch => "the amount does not match your request",
            RejectReason::ReceiverMissing
            | RejectReason::ReceiverMismatch
            | RejectReason::ReceiverUnconfigured => "the recipient account could not be confirmed",
            RejectReason::DateMismatch => "the receipt date is outside the accepted window",
            RejectReason::DuplicateTransaction => "this receipt has already been used",
            RejectReason::LedgerError => "a temporary error occurred",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Rejection {
    pub stage: Stage,
    pub reason: RejectReason,
    pub detail: serde_json::Value,
}

impl Rejection {
    fn new(stage: Stage, reason: RejectReason, detail: serde_json::Value) -> Self {
        Rejection {
            stage,
            reason,
            detail,
        }
    }
}

#[derive(Debug)]
pub enum DepositOutcome {
    Approved { deposit: Deposit },
    ManualReview { rejection: Rejection },
}

impl DepositOutcome {
    pub fn outcome(&self) -> &'static str {
        match self {
            DepositOutcome::Approved { .. } => "approved",
            DepositOutcome::ManualReview { .. } => "manual_review",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            DepositOutcome::Approved { deposit } => format!(
                "Your deposit of ${} has been approved and credited.",
                deposit.amount_usd
            ),
            DepositOutcome::ManualReview { rejection } => format!(
                "Your receipt was sent to an administrator for review: {}.",
                rejection.reason.user_hint()
            ),
        }
    }
}

/// What an attempt learned before it stopped, kept for the review record.
#[derive(Default)]
struct Attempt {
    payment: Option<PendingPayment>,
    verification: Option<VerifyResult>,
    transaction_ref: Option<String>,
}

/// Upper-cases and strips whitespace so cosmetic variants of one reference collide.
pub fn canonical_reference(reference: &str) -> String {
    reference
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

pub struct AutoDepositProcessor {
    ledger: Arc<dyn PaymentLedger>,
    verifier: Arc<ReceiptVerifier>,
    notifier: Arc<dyn Notifier>,
    card_provider: Option<Arc<dyn CardProvider>>,
    config: settings::Deposits,
    receivers: HashMap<PaymentMethod, ExpectedReceiver>,
    clock: fn() -> DateTime<Utc>,
}

impl AutoDepositProcessor {
    pub fn new(
        ledger: Arc<dyn PaymentLedger>,
        verifier: Arc<ReceiptVerifier>,
        notifier: Arc<dyn Notifier>,
        card_provider: Option<Arc<dyn CardProvider>>,
        config: settings::Deposits,
        receivers: HashMap<PaymentMethod, ExpectedReceiver>,
    ) -> Self {
        AutoDepositProcessor {
            ledger,
            verifier,
            notifier,
            card_provider,
            config,
            receivers,
            clock: Utc::now,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn open_payment(&self, new_payment: NewPendingPayment) -> Result<PendingPayment, ServiceError> {
        if new_payment.amount_usd <= Decimal::ZERO
            || new_payment.exchange_rate <= Decimal::ZERO
            || new_payment.deposit_fee_etb < Decimal::ZERO
        {
            return Err(ServiceError::InvalidRequest(
                "amount and exchange rate must be positive, fee must not be negative".to_string(),
            ));
        }

        self.ledger
            .open_payment(&new_payment)
            .await
            .map_err(|e| match e {
                LedgerError::OpenPaymentExists { .. } => ServiceError::Conflict(e.to_string()),
                e => ServiceError::Database(e.to_string()),
            })
    }

    pub async fn get_payment(&self, id: i64) -> Result<Option<PendingPayment>, ServiceError> {
        self.ledger
            .get_payment(id)
            .await
            .map_err(|e| ServiceError::Database(e.to_string()))
    }

    /// Runs one verification attempt to completion. Every failure ends in
    /// manual review; nothing here returns an error to the caller.
    pub async fn process(&self, payment_id: i64, receipt_url: &str, skip_date_check: bool) -> DepositOutcome {
        let attempt_id = Uuid::new_v4();
        let mut attempt = Attempt::default();

        log::info!("[{}] Processing receipt for payment {}.", attempt_id, payment_id);

        match self
            .run(attempt_id, payment_id, receipt_url, skip_date_check, &mut attempt)
            .await
        {
            Ok(deposit) => {
                let deposit = self.settle_externally(attempt_id, deposit).await;
                log::info!(
                    "[{}] Payment {} credited as deposit {} ({}).",
                    attempt_id,
                    payment_id,
                    deposit.id,
                    deposit.status
                );
                self.announce_approval(&deposit).await;

                DepositOutcome::Approved { deposit }
            }
            Err(rejection) => {
                log::warn!(
                    "[{}] Payment {} sent to manual review at {}: {}.",
                    attempt_id,
                    payment_id,
                    rejection.stage.as_str(),
                    rejection.reason
                );
                self.route_to_manual_review(attempt_id, payment_id, receipt_url, &rejection, attempt)
                    .await;

                DepositOutcome::ManualReview { rejection }
            }
        }
    }

    async fn run(
        &self,
        attempt_id: Uuid,
        payment_id: i64,
        receipt_url: &str,
        skip_date_check: bool,
        attempt: &mut Attempt,
    ) -> Result<Deposit, Rejection> {
        let payment = match self.ledger.get_payment(payment_id).await {
            Ok(Some(payment)) if !payment.status.is_terminal() => payment,
            Ok(found) => {
                return Err(Rejection::new(
                    Stage::Start,
                    RejectReason::PaymentNotFound,
                    json!({ "payment_id": payment_id, "status": found.map(|p| p.status) }),
                ))
            }
            Err(e) => {
                return Err(Rejection::new(
                    Stage::Start,
                    RejectReason::LedgerError,
                    json!({ "error": e.to_string() }),
                ))
            }
        };
        attempt.payment = Some(payment.clone());

        let verification = self.verifier.verify_by_url(receipt_url).await;
        attempt.verification = Some(verification.clone());

        let parsed = match (&verification.parsed, verification.ok) {
            (Some(parsed), true) => parsed.clone(),
            _ => {
                return Err(Rejection::new(
                    Stage::Fetching,
                    RejectReason::ReceiptVerificationFailed,
                    json!({ "failure": verification.failure, "message": verification.message }),
                ))
            }
        };

        let (Some(reference), Some(amount)) = (
            parsed.transaction_id.as_deref().map(canonical_reference),
            parsed.amount,
        ) else {
            return Err(Rejection::new(
                Stage::Parsed,
                RejectReason::MissingField,
                json!({ "missing_fields": verification.missing_fields }),
            ));
        };
        attempt.transaction_ref = Some(reference.clone());

        if parsed.currency != DEFAULT_CURRENCY
            || !amount_within_tolerance(amount, payment.total_etb, self.config.amount_tolerance)
        {
            return Err(Rejection::new(
                Stage::Parsed,
                RejectReason::AmountMismatch,
                json!({
                    "expected": payment.total_etb,
                    "actual": amount,
                    "currency": parsed.currency,
                    "tolerance": self.config.amount_tolerance,
                }),
            ));
        }

        let expected = self.receivers.get(&payment.payment_method);
        let receiver_reason = match check_receiver(&parsed, expected, self.config.receiver_policy) {
            ReceiverCheck::Matched | ReceiverCheck::Skipped => None,
            ReceiverCheck::Missing => Some(RejectReason::ReceiverMissing),
            ReceiverCheck::Mismatch => Some(RejectReason::ReceiverMismatch),
            ReceiverCheck::Unconfigured => Some(RejectReason::ReceiverUnconfigured),
        };
        if let Some(reason) = receiver_reason {
            return Err(Rejection::new(
                Stage::AmountChecked,
                reason,
                json!({
                    "payment_method": payment.payment_method,
                    "expected": expected,
                    "receiver_account": parsed.receiver_account,
                    "receiver_name": parsed.receiver_name,
                }),
            ));
        }

        let date_match = if skip_date_check {
            None
        } else {
            let now = (self.clock)();
            let constraints = self.date_constraints(&payment, now);
            let result = evaluate_date_match(&parsed, &constraints, now, self.verifier.timezone());
            if !result.ok {
                return Err(Rejection::new(
                    Stage::ReceiverChecked,
                    RejectReason::DateMismatch,
                    serde_json::to_value(&result).unwrap_or_default(),
                ));
            }
            Some(result)
        };

        let status = match self.card_provider {
            Some(_) => DepositStatus::CreditPendingExternal,
            None => DepositStatus::Completed,
        };
        let credit = DepositCredit {
            payment_id,
            transaction_ref: reference,
            amount_etb: amount,
            status,
            receipt_url: receipt_url.to_string(),
            verification: json!({
                "attempt_id": attempt_id,
                "stage": Stage::Credited,
                "auto_approved": true,
                "parser": verification.parser,
                "body_sha256": verification.body_sha256,
                "parsed": parsed,
                "date_match": date_match,
                "date_check_skipped": skip_date_check,
            }),
        };

        self.ledger.credit_deposit(&credit).await.map_err(|e| match e {
            LedgerError::Duplicate { reference } => Rejection::new(
                Stage::DateChecked,
                RejectReason::DuplicateTransaction,
                json!({ "transaction_ref": reference }),
            ),
            LedgerError::PaymentClosed { id } => Rejection::new(
                Stage::DateChecked,
                RejectReason::PaymentNotFound,
                json!({ "payment_id": id }),
            ),
            e => Rejection::new(
                Stage::DateChecked,
                RejectReason::LedgerError,
                json!({ "error": e.to_string() }),
            ),
        })
    }

    fn date_constraints(&self, payment: &PendingPayment, now: DateTime<Utc>) -> DateConstraints {
        let between = self.config.max_receipt_age_minutes.map(|age| DateWindow {
            from: Some(payment.created_at - Duration::minutes(age)),
            to: Some(now + Duration::minutes(CLOCK_SKEW_MINUTES)),
        });

        DateConstraints {
            must_be_today: self.config.must_be_today,
            between,
        }
    }

    /// Local commit already happened; a provider failure leaves the deposit
    /// pending external credit for an operator to finish.
    async fn settle_externally(&self, attempt_id: Uuid, mut deposit: Deposit) -> Deposit {
        let Some(provider) = &self.card_provider else {
            return deposit;
        };

        match provider
            .credit_user(deposit.user_id, deposit.amount_usd, &deposit.transaction_ref)
            .await
        {
            Ok(()) => match self
                .ledger
                .update_deposit_status(deposit.id, DepositStatus::Completed)
                .await
            {
                Ok(()) => deposit.status = DepositStatus::Completed,
                Err(e) => log::error!(
                    "[{}] Deposit {} credited externally but status update failed: {}",
                    attempt_id,
                    deposit.id,
                    e
                ),
            },
            Err(e) => {
                log::error!(
                    "[{}] External credit for deposit {} failed: {}",
                    attempt_id,
                    deposit.id,
                    e
                );
                let alert = format!(
                    "External credit failed for deposit #{}\nUser: {}\nAmount: ${}\nRef: {}\nThe deposit is left as {}.",
                    deposit.id,
                    mask(&deposit.user_id.to_string()),
                    deposit.amount_usd,
                    mask(&deposit.transaction_ref),
                    DepositStatus::CreditPendingExternal
                );
                self.notify_admins(&alert).await;
            }
        }

        deposit
    }

    async fn announce_approval(&self, deposit: &Deposit) {
        let summary = format!(
            "Deposit #{} auto-approved\nUser: {}\nAmount: {} ETB (${})\nMethod: {}\nRef: {}",
            deposit.id,
            mask(&deposit.user_id.to_string()),
            deposit.amount_etb,
            deposit.amount_usd,
            deposit.payment_method,
            mask(&deposit.transaction_ref)
        );
        self.notify_admins(&summary).await;

        let outcome = DepositOutcome::Approved {
            deposit: deposit.clone(),
        };
        self.notify_user(deposit.user_id, &outcome.user_message()).await;
    }

    async fn route_to_manual_review(
        &self,
        attempt_id: Uuid,
        payment_id: i64,
        receipt_url: &str,
        rejection: &Rejection,
        attempt: Attempt,
    ) {
        let Some(payment) = attempt.payment else {
            // Missing or already settled payments have nothing to park.
            self.notify_admins(&format!(
                "Receipt submitted for payment #{} which is not open ({}).",
                payment_id, rejection.reason
            ))
            .await;
            return;
        };

        let review = ManualReview {
            payment_id,
            receipt_url: receipt_url.to_string(),
            transaction_ref: attempt.transaction_ref,
            verification: json!({
                "attempt_id": attempt_id,
                "stage": rejection.stage,
                "reason": rejection.reason,
                "detail": rejection.detail,
                "verification": attempt.verification,
            }),
        };

        if let Err(e) = self.ledger.send_to_manual_review(&review).await {
            log::error!(
                "[{}] Could not record manual review for payment {}: {}",
                attempt_id,
                payment_id,
                e
            );
        }

        let alert = format!(
            "Payment #{} needs manual review\nUser: {}\nStage: {}\nReason: {}\nReceipt: {}",
            payment_id,
            mask(&payment.user_id.to_string()),
            rejection.stage.as_str(),
            rejection.reason,
            receipt_url
        );
        self.notify_admins(&alert).await;

        let outcome = DepositOutcome::ManualReview {
            rejection: rejection.clone(),
        };
        self.notify_user(payment.user_id, &outcome.user_message()).await;
    }

    async fn notify_admins(&self, text: &str) {
        if let Err(e) = self.notifier.notify_admins(text).await {
            log::warn!("Admin notification failed: {}", e);
        }
    }

    async fn notify_user(&self, user_id: i64, text: &str) {
        if let Err(e) = self.notifier.notify_user(user_id, text).await {
            log::warn!("User notification failed: {}", e);
        }
    }
}

pub enum DepositServiceRequest {
    OpenPayment {
        payment: NewPendingPayment,
        response: oneshot::Sender<Result<PendingPayment, ServiceError>>,
    },
    GetPayment {
        id: i64,
        response: oneshot::Sender<Result<Option<PendingPayment>, ServiceError>>,
    },
    SubmitReceipt {
        payment_id: i64,
        receipt_url: String,
        skip_date_check: bool,
        response: oneshot::Sender<DepositOutcome>,
    },
}

#[derive(Clone)]
pub struct DepositRequestHandler {
    processor: Arc<AutoDepositProcessor>,
}

impl DepositRequestHandler {
    pub fn new(processor: Arc<AutoDepositProcessor>) -> Self {
        DepositRequestHandler { processor }
    }
}

#[async_trait]
impl RequestHandler<DepositServiceRequest> for DepositRequestHandler {
    async fn handle_request(&self, request: DepositServiceRequest) {
        match request {
            DepositServiceRequest::OpenPayment { payment, response } => {
                let result = self.processor.open_payment(payment).await;
                let _ = response.send(result);
            }
            DepositServiceRequest::GetPayment { id, response } => {
                let result = self.processor.get_payment(id).await;
                let _ = response.send(result);
            }
            DepositServiceRequest::SubmitReceipt {
                payment_id,
                receipt_url,
                skip_date_check,
                response,
            } => {
                let outcome = self
                    .processor
                    .process(payment_id, &receipt_url, skip_date_check)
                    .await;
                let _ = response.send(outcome);
            }
        }
    }
}

pub struct DepositService;

impl DepositService {
    pub fn new() -> Self {
        DepositService
    }
}

impl Service<DepositServiceRequest, DepositRequestHandler> for DepositService {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::payments::PaymentStatus;
    use crate::repositories::parsers::fixtures;
    use crate::repositories::payments::memory::MemoryLedger;
    use crate::services::receipts::tests::{verifier_config, StaticFetcher};
    use crate::settings::ReceiverPolicy;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering;
    use tokio::sync::Mutex;

    const RECEIPT_URL: &str = "https://transactioninfo.ethiotelecom.et/receipt/TXN999";

    /// 23:00 in Addis Ababa on the telebirr fixture's date.
    fn receipt_day() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 20, 0, 0).unwrap()
    }

    fn next_day() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 2, 9, 0, 0).unwrap()
    }

    #[derive(Default)]
    struct RecordingNotifier {
        fail: bool,
        admin: Mutex<Vec<String>>,
        users: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify_admins(&self, text: &str) -> Result<(), anyhow::Error> {
            self.admin.lock().await.push(text.to_string());
            if self.fail {
                anyhow::bail!("telegram unreachable");
            }
            Ok(())
        }

        async fn notify_user(&self, user_id: i64, text: &str) -> Result<(), anyhow::Error> {
            self.users.lock().await.push((user_id, text.to_string()));
            if self.fail {
                anyhow::bail!("telegram unreachable");
            }
            Ok(())
        }
    }

    struct FixedProvider {
        succeed: bool,
        calls: Mutex<Vec<(i64, Decimal, String)>>,
    }

    #[async_trait]
    impl CardProvider for FixedProvider {
        async fn credit_user(&self, user_id: i64, amount_usd: Decimal, reference: &str) -> Result<(), anyhow::Error> {
            self.calls
                .lock()
                .await
                .push((user_id, amount_usd, reference.to_string()));
            if self.succeed {
                Ok(())
            } else {
                anyhow::bail!("StroWallet: HTTP 502")
            }
        }
    }

    fn pending(id: i64, user_id: i64, total_etb: Decimal) -> PendingPayment {
        PendingPayment {
            id,
            user_id,
            amount_usd: dec!(100),
            exchange_rate: dec!(135),
            amount_etb: total_etb,
            deposit_fee_etb: dec!(0),
            total_etb,
            payment_method: PaymentMethod::Telebirr,
            status: PaymentStatus::Pending,
            receipt_url: None,
            transaction_ref: None,
            verification: None,
            created_at: receipt_day() - Duration::hours(1),
            verified_at: None,
            completed_at: None,
        }
    }

    fn telebirr_receiver(account: &str) -> HashMap<PaymentMethod, ExpectedReceiver> {
        HashMap::from([(
            PaymentMethod::Telebirr,
            ExpectedReceiver {
                account: Some(account.to_string()),
                name: None,
            },
        )])
    }

    struct Harness {
        ledger: Arc<MemoryLedger>,
        notifier: Arc<RecordingNotifier>,
        fetcher: Arc<StaticFetcher>,
        processor: AutoDepositProcessor,
    }

    fn harness(
        fetcher: StaticFetcher,
        receivers: HashMap<PaymentMethod, ExpectedReceiver>,
        config: settings::Deposits,
        notifier: RecordingNotifier,
        provider: Option<Arc<dyn CardProvider>>,
    ) -> Harness {
        let ledger = Arc::new(MemoryLedger::default());
        let notifier = Arc::new(notifier);
        let fetcher = Arc::new(fetcher);
        let verifier = Arc::new(ReceiptVerifier::new(&verifier_config(), fetcher.clone()).unwrap());

        let processor = AutoDepositProcessor::new(
            ledger.clone(),
            verifier,
            notifier.clone(),
            provider,
            config,
            receivers,
        )
        .with_clock(receipt_day);

        Harness {
            ledger,
            notifier,
            fetcher,
            processor,
        }
    }

    fn telebirr_harness() -> Harness {
        harness(
            StaticFetcher::page(fixtures::TELEBIRR, "text/html"),
            telebirr_receiver("0911000000"),
            settings::Deposits::default(),
            RecordingNotifier::default(),
            None,
        )
    }

    fn rejection_reason(outcome: &DepositOutcome) -> Option<RejectReason> {
        match outcome {
            DepositOutcome::ManualReview { rejection } => Some(rejection.reason),
            DepositOutcome::Approved { .. } => None,
        }
    }

    #[tokio::test]
    async fn test_end_to_end_credit() {
        let h = telebirr_harness();
        h.ledger.insert_payment(pending(42, 7, dec!(13500.00))).await;

        let outcome = h.processor.process(42, RECEIPT_URL, false).await;

        let DepositOutcome::Approved { deposit } = &outcome else {
            panic!("expected approval, got {:?}", outcome);
        };
        assert_eq!(deposit.transaction_ref, "TXN999");
        assert_eq!(deposit.payment_id, 42);
        assert_eq!(deposit.status, DepositStatus::Completed);
        assert!(deposit.auto_approved);
        assert_eq!(deposit.approved_by, None);

        let payment = h.ledger.payment(42).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(payment.transaction_ref.as_deref(), Some("TXN999"));
        assert_eq!(payment.verification.unwrap()["parser"], "telebirr");

        assert_eq!(h.ledger.deposits().await.len(), 1);
        let admin = h.notifier.admin.lock().await;
        assert!(admin[0].contains("auto-approved"));
        assert!(!admin[0].contains("TXN999"));
        assert_eq!(h.notifier.users.lock().await[0].0, 7);
    }

    // A credited payment is terminal, so the resubmission stops at START as
    // payment_not_found before any fetch; the ledger's duplicate guard covers
    // the cross-payment case below.
    #[tokio::test]
    async fn test_same_receipt_twice_credits_once() {
        let h = telebirr_harness();
        h.ledger.insert_payment(pending(42, 7, dec!(13500.00))).await;

        let first = h.processor.process(42, RECEIPT_URL, false).await;
        let second = h.processor.process(42, RECEIPT_URL, false).await;

        assert_eq!(first.outcome(), "approved");
        assert_eq!(rejection_reason(&second), Some(RejectReason::PaymentNotFound));
        assert_eq!(h.ledger.deposits().await.len(), 1);
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.ledger.payment(42).await.unwrap().status,
            PaymentStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_reference_cannot_fund_two_payments() {
        let h = telebirr_harness();
        h.ledger.insert_payment(pending(42, 7, dec!(13500.00))).await;
        h.ledger.insert_payment(pending(43, 8, dec!(13500.00))).await;

        let first = h.processor.process(42, RECEIPT_URL, false).await;
        let second = h.processor.process(43, RECEIPT_URL, false).await;

        assert_eq!(first.outcome(), "approved");
        assert_eq!(rejection_reason(&second), Some(RejectReason::DuplicateTransaction));
        assert_eq!(h.ledger.deposits().await.len(), 1);

        let replay = h.ledger.payment(43).await.unwrap();
        assert_eq!(replay.status, PaymentStatus::TransactionSubmitted);
        assert_eq!(replay.verification.unwrap()["reason"], "duplicate_transaction");
    }

    #[tokio::test]
    async fn test_concurrent_replay_credits_once() {
        let h = telebirr_harness();
        h.ledger.insert_payment(pending(42, 7, dec!(13500.00))).await;
        h.ledger.insert_payment(pending(43, 8, dec!(13500.00))).await;

        let (a, b) = tokio::join!(
            h.processor.process(42, RECEIPT_URL, false),
            h.processor.process(43, RECEIPT_URL, false)
        );

        let approved = [&a, &b].iter().filter(|o| o.outcome() == "approved").count();
        assert_eq!(approved, 1);
        assert_eq!(h.ledger.deposits().await.len(), 1);
    }

    #[tokio::test]
    async fn test_receiver_mismatch_goes_to_manual_review() {
        let h = harness(
            StaticFetcher::page(fixtures::TELEBIRR, "text/html"),
            telebirr_receiver("1000123456"),
            settings::Deposits::default(),
            RecordingNotifier::default(),
            None,
        );
        h.ledger.insert_payment(pending(42, 7, dec!(13500.00))).await;

        let outcome = h.processor.process(42, RECEIPT_URL, false).await;

        assert_eq!(rejection_reason(&outcome), Some(RejectReason::ReceiverMismatch));
        assert!(h.ledger.deposits().await.is_empty());

        let payment = h.ledger.payment(42).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::TransactionSubmitted);
        let verification = payment.verification.unwrap();
        assert_eq!(verification["stage"], "AMOUNT_CHECKED");
        assert_eq!(verification["detail"]["receiver_account"], "0911000000");

        let user_messages = h.notifier.users.lock().await;
        assert!(user_messages[0].1.contains("recipient account"));
        assert!(!user_messages[0].1.contains("0911000000"));
    }

    #[tokio::test]
    async fn test_receiver_account_in_transfer_reason_is_not_trusted() {
        let page = fixtures::CBE
            .replace("CARD SERVICES PLC", "ATTACKER TWO")
            .replace("1000****3456", "2000****7777")
            .replace("Card top up", "Receiver Account: 1000123456");
        let receivers = HashMap::from([(
            PaymentMethod::Cbe,
            ExpectedReceiver {
                account: Some("1000123456".to_string()),
                name: None,
            },
        )]);
        let h = harness(
            StaticFetcher::page(&page, "text/html"),
            receivers,
            settings::Deposits::default(),
            RecordingNotifier::default(),
            None,
        );
        h.ledger
            .insert_payment(PendingPayment {
                payment_method: PaymentMethod::Cbe,
                ..pending(42, 7, dec!(13500.00))
            })
            .await;

        let outcome = h
            .processor
            .process(42, "https://apps.cbe.com.et/?id=FT25014ABCDE", true)
            .await;

        assert_eq!(rejection_reason(&outcome), Some(RejectReason::ReceiverMismatch));
        assert!(h.ledger.deposits().await.is_empty());
        let verification = h.ledger.payment(42).await.unwrap().verification.unwrap();
        assert_eq!(verification["detail"]["receiver_account"], "2000****7777");
    }

    #[tokio::test]
    async fn test_unconfigured_receiver_policies() {
        let h = harness(
            StaticFetcher::page(fixtures::TELEBIRR, "text/html"),
            HashMap::new(),
            settings::Deposits::default(),
            RecordingNotifier::default(),
            None,
        );
        h.ledger.insert_payment(pending(42, 7, dec!(13500.00))).await;
        assert_eq!(h.processor.process(42, RECEIPT_URL, false).await.outcome(), "approved");

        let strict = settings::Deposits {
            receiver_policy: ReceiverPolicy::RejectWhenUnconfigured,
            ..Default::default()
        };
        let h = harness(
            StaticFetcher::page(fixtures::TELEBIRR, "text/html"),
            HashMap::new(),
            strict,
            RecordingNotifier::default(),
            None,
        );
        h.ledger.insert_payment(pending(42, 7, dec!(13500.00))).await;
        let outcome = h.processor.process(42, RECEIPT_URL, false).await;
        assert_eq!(rejection_reason(&outcome), Some(RejectReason::ReceiverUnconfigured));
    }

    #[tokio::test]
    async fn test_amount_outside_tolerance_is_rejected() {
        let h = telebirr_harness();
        h.ledger.insert_payment(pending(42, 7, dec!(13494.99))).await;

        let outcome = h.processor.process(42, RECEIPT_URL, false).await;

        assert_eq!(rejection_reason(&outcome), Some(RejectReason::AmountMismatch));
        assert!(h.ledger.deposits().await.is_empty());
    }

    #[tokio::test]
    async fn test_stale_receipt_and_date_opt_out() {
        let h = telebirr_harness();
        let processor = h.processor.with_clock(next_day);
        h.ledger.insert_payment(pending(42, 7, dec!(13500.00))).await;

        let outcome = processor.process(42, RECEIPT_URL, false).await;
        assert_eq!(rejection_reason(&outcome), Some(RejectReason::DateMismatch));

        let outcome = processor.process(42, RECEIPT_URL, true).await;
        assert_eq!(outcome.outcome(), "approved");
    }

    #[tokio::test]
    async fn test_receipt_older_than_request_is_rejected() {
        let config = settings::Deposits {
            max_receipt_age_minutes: Some(30),
            ..Default::default()
        };
        let h = harness(
            StaticFetcher::page(fixtures::TELEBIRR, "text/html"),
            telebirr_receiver("0911000000"),
            config,
            RecordingNotifier::default(),
            None,
        );
        let mut payment = pending(42, 7, dec!(13500.00));
        // Fixture is stamped 20:59 UTC; the request came after that.
        payment.created_at = Utc.with_ymd_and_hms(2025, 1, 1, 20, 59, 30).unwrap()
            + Duration::minutes(45);
        h.ledger.insert_payment(payment).await;

        let processor = h.processor.with_clock(|| Utc.with_ymd_and_hms(2025, 1, 1, 20, 50, 0).unwrap());
        let outcome = processor.process(42, RECEIPT_URL, false).await;

        let DepositOutcome::ManualReview { rejection } = outcome else {
            panic!("expected manual review");
        };
        assert_eq!(rejection.reason, RejectReason::DateMismatch);
        assert!(rejection.detail["reason"].as_str().unwrap().contains("before"));
    }

    #[tokio::test]
    async fn test_unreachable_receipt_goes_to_manual_review() {
        let h = harness(
            StaticFetcher::status(500),
            telebirr_receiver("0911000000"),
            settings::Deposits::default(),
            RecordingNotifier::default(),
            None,
        );
        h.ledger.insert_payment(pending(42, 7, dec!(13500.00))).await;

        let outcome = h.processor.process(42, RECEIPT_URL, false).await;

        assert_eq!(
            rejection_reason(&outcome),
            Some(RejectReason::ReceiptVerificationFailed)
        );
        let payment = h.ledger.payment(42).await.unwrap();
        assert_eq!(payment.verification.unwrap()["stage"], "FETCHING");
    }

    #[tokio::test]
    async fn test_missing_payment_is_not_parked() {
        let h = telebirr_harness();

        let outcome = h.processor.process(404, RECEIPT_URL, false).await;

        assert_eq!(rejection_reason(&outcome), Some(RejectReason::PaymentNotFound));
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
        assert!(h.notifier.users.lock().await.is_empty());
        assert_eq!(h.notifier.admin.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_notifier_failure_does_not_undo_credit() {
        let h = harness(
            StaticFetcher::page(fixtures::TELEBIRR, "text/html"),
            telebirr_receiver("0911000000"),
            settings::Deposits::default(),
            RecordingNotifier {
                fail: true,
                ..Default::default()
            },
            None,
        );
        h.ledger.insert_payment(pending(42, 7, dec!(13500.00))).await;

        let outcome = h.processor.process(42, RECEIPT_URL, false).await;

        assert_eq!(outcome.outcome(), "approved");
        assert_eq!(
            h.ledger.payment(42).await.unwrap().status,
            PaymentStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_external_credit_completes_deposit() {
        let provider = Arc::new(FixedProvider {
            succeed: true,
            calls: Mutex::new(Vec::new()),
        });
        let h = harness(
            StaticFetcher::page(fixtures::TELEBIRR, "text/html"),
            telebirr_receiver("0911000000"),
            settings::Deposits::default(),
            RecordingNotifier::default(),
            Some(provider.clone() as Arc<dyn CardProvider>),
        );
        h.ledger.insert_payment(pending(42, 7, dec!(13500.00))).await;

        let outcome = h.processor.process(42, RECEIPT_URL, false).await;

        let DepositOutcome::Approved { deposit } = outcome else {
            panic!("expected approval");
        };
        assert_eq!(deposit.status, DepositStatus::Completed);
        assert_eq!(
            provider.calls.lock().await[0],
            (7, dec!(100), "TXN999".to_string())
        );
        assert_eq!(h.ledger.deposits().await[0].status, DepositStatus::Completed);
    }

    #[tokio::test]
    async fn test_external_credit_failure_leaves_deposit_pending() {
        let provider = Arc::new(FixedProvider {
            succeed: false,
            calls: Mutex::new(Vec::new()),
        });
        let h = harness(
            StaticFetcher::page(fixtures::TELEBIRR, "text/html"),
            telebirr_receiver("0911000000"),
            settings::Deposits::default(),
            RecordingNotifier::default(),
            Some(provider as Arc<dyn CardProvider>),
        );
        h.ledger.insert_payment(pending(42, 7, dec!(13500.00))).await;

        let outcome = h.processor.process(42, RECEIPT_URL, false).await;

        assert_eq!(outcome.outcome(), "approved");
        assert_eq!(
            h.ledger.deposits().await[0].status,
            DepositStatus::CreditPendingExternal
        );
        let admin = h.notifier.admin.lock().await;
        assert!(admin.iter().any(|m| m.contains("External credit failed")));
    }

    #[tokio::test]
    async fn test_open_payment_validation_and_single_open_rule() {
        let h = telebirr_harness();
        let request = NewPendingPayment {
            user_id: 7,
            amount_usd: dec!(100),
            exchange_rate: dec!(135),
            deposit_fee_etb: dec!(50),
            payment_method: PaymentMethod::Cbe,
        };

        let created = h.processor.open_payment(request.clone()).await.unwrap();
        assert_eq!(created.total_etb, dec!(13550.00));
        assert_eq!(created.status, PaymentStatus::Pending);

        let again = h.processor.open_payment(request.clone()).await.unwrap_err();
        assert!(matches!(again, ServiceError::Conflict(_)));

        let bad = NewPendingPayment {
            amount_usd: dec!(0),
            ..request
        };
        let err = h.processor.open_payment(bad).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
    }

    #[test]
    fn test_canonical_reference() {
        assert_eq!(canonical_reference(" ft25014 abcde "), "FT25014ABCDE");
    }
}

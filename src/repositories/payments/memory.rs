use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{LedgerError, PaymentLedger};
use crate::models::deposits::{Deposit, DepositCredit, DepositStatus, ManualReview};
use crate::models::payments::{NewPendingPayment, PaymentStatus, PendingPayment};

#[derive(Default)]
struct State {
    payments: HashMap<i64, PendingPayment>,
    deposits: Vec<Deposit>,
    next_payment_id: i64,
}

/// In-process ledger with the same all-or-nothing credit semantics as Postgres.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub async fn insert_payment(&self, payment: PendingPayment) {
        let mut state = self.state.lock().await;
        state.next_payment_id = state.next_payment_id.max(payment.id);
        state.payments.insert(payment.id, payment);
    }

    pub async fn payment(&self, id: i64) -> Option<PendingPayment> {
        self.state.lock().await.payments.get(&id).cloned()
    }

    pub async fn deposits(&self) -> Vec<Deposit> {
        self.state.lock().await.deposits.clone()
    }
}

#[async_trait]
impl PaymentLedger for MemoryLedger {
    async fn open_payment(&self, new_payment: &NewPendingPayment) -> Result<PendingPayment, LedgerError> {
        let mut state = self.state.lock().await;

        let has_open = state
            .payments
            .values()
            .any(|p| p.user_id == new_payment.user_id && !p.status.is_terminal());
        if has_open {
            return Err(LedgerError::OpenPaymentExists {
                user_id: new_payment.user_id,
            });
        }

        state.next_payment_id += 1;
        let payment = PendingPayment {
            id: state.next_payment_id,
            user_id: new_payment.user_id,
            amount_usd: new_payment.amount_usd,
            exchange_rate: new_payment.exchange_rate,
            amount_etb: new_payment.amount_etb(),
            deposit_fee_etb: new_payment.deposit_fee_etb,
            total_etb: new_payment.total_etb(),
            payment_method: new_payment.payment_method,
            status: PaymentStatus::Pending,
            receipt_url: None,
            transaction_ref: None,
            verification: None,
            created_at: Utc::now(),
            verified_at: None,
            completed_at: None,
        };
        state.payments.insert(payment.id, payment.clone());

        Ok(payment)
    }

    async fn get_payment(&self, id: i64) -> Result<Option<PendingPayment>, LedgerError> {
        Ok(self.payment(id).await)
    }

    async fn send_to_manual_review(&self, review: &ManualReview) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let payment = state
            .payments
            .get_mut(&review.payment_id)
            .filter(|p| !p.status.is_terminal())
            .ok_or(LedgerError::PaymentClosed {
                id: review.payment_id,
            })?;

        payment.status = PaymentStatus::manual_review();
        payment.receipt_url = Some(review.receipt_url.clone());
        if review.transaction_ref.is_some() {
            payment.transaction_ref = review.transaction_ref.clone();
        }
        payment.verification = Some(review.verification.clone());

        Ok(())
    }

    async fn credit_deposit(&self, credit: &DepositCredit) -> Result<Deposit, LedgerError> {
        let mut state = self.state.lock().await;

        let duplicate = state
            .deposits
            .iter()
            .any(|d| d.transaction_ref == credit.transaction_ref && d.status.holds_reference());
        if duplicate {
            return Err(LedgerError::Duplicate {
                reference: credit.transaction_ref.clone(),
            });
        }

        let payment = state
            .payments
            .get(&credit.payment_id)
            .filter(|p| !p.status.is_terminal())
            .cloned()
            .ok_or(LedgerError::PaymentClosed {
                id: credit.payment_id,
            })?;

        let now = Utc::now();
        let deposit = Deposit {
            id: state.deposits.len() as i64 + 1,
            payment_id: payment.id,
            user_id: payment.user_id,
            amount_usd: payment.amount_usd,
            amount_etb: credit.amount_etb,
            exchange_rate: payment.exchange_rate,
            payment_method: payment.payment_method,
            transaction_ref: credit.transaction_ref.clone(),
            approved_by: None,
            status: credit.status,
            auto_approved: true,
            created_at: now,
        };

        let completed = PendingPayment {
            status: PaymentStatus::Completed,
            receipt_url: Some(credit.receipt_url.clone()),
            transaction_ref: Some(credit.transaction_ref.clone()),
            verification: Some(credit.verification.clone()),
            verified_at: Some(now),
            completed_at: Some(now),
            ..payment
        };
        state.payments.insert(completed.id, completed);
        state.deposits.push(deposit.clone());

        Ok(deposit)
    }

    async fn update_deposit_status(&self, deposit_id: i64, status: DepositStatus) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        if let Some(deposit) = state.deposits.iter_mut().find(|d| d.id == deposit_id) {
            deposit.status = status;
        }

        Ok(())
    }
}

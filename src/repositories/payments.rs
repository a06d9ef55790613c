use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::deposits::{Deposit, DepositCredit, DepositStatus, ManualReview};
use crate::models::payments::{NewPendingPayment, PaymentStatus, PendingPayment};

#[cfg(test)]
pub mod memory;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Transaction reference {reference} already funded a deposit")]
    Duplicate { reference: String },
    #[error("Payment {id} is missing or no longer open")]
    PaymentClosed { id: i64 },
    #[error("User {user_id} already has an open payment")]
    OpenPaymentExists { user_id: i64 },
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Persistence boundary for pending payments and the deposit ledger.
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    async fn open_payment(&self, new_payment: &NewPendingPayment) -> Result<PendingPayment, LedgerError>;

    async fn get_payment(&self, id: i64) -> Result<Option<PendingPayment>, LedgerError>;

    /// Parks an open payment for an administrator. Terminal payments are left alone.
    async fn send_to_manual_review(&self, review: &ManualReview) -> Result<(), LedgerError>;

    /// Completes the payment and appends the deposit in one transaction.
    /// Fails with `Duplicate` if the reference already funds a live deposit.
    async fn credit_deposit(&self, credit: &DepositCredit) -> Result<Deposit, LedgerError>;

    async fn update_deposit_status(&self, deposit_id: i64, status: DepositStatus) -> Result<(), LedgerError>;
}

#[derive(sqlx::FromRow)]
struct PendingPaymentRow {
    id: i64,
    user_id: i64,
    amount_usd: Decimal,
    exchange_rate: Decimal,
    amount_etb: Decimal,
    deposit_fee_etb: Decimal,
    total_etb: Decimal,
    payment_method: String,
    status: String,
    receipt_url: Option<String>,
    transaction_ref: Option<String>,
    verification: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    verified_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<PendingPaymentRow> for PendingPayment {
    type Error = LedgerError;

    fn try_from(row: PendingPaymentRow) -> Result<Self, Self::Error> {
        Ok(PendingPayment {
            id: row.id,
            user_id: row.user_id,
            amount_usd: row.amount_usd,
            exchange_rate: row.exchange_rate,
            amount_etb: row.amount_etb,
            deposit_fee_etb: row.deposit_fee_etb,
            total_etb: row.total_etb,
            payment_method: row
                .payment_method
                .parse()
                .map_err(|e: anyhow::Error| LedgerError::Corrupt(e.to_string()))?,
            status: row
                .status
                .parse()
                .map_err(|e: anyhow::Error| LedgerError::Corrupt(e.to_string()))?,
            receipt_url: row.receipt_url,
            transaction_ref: row.transaction_ref,
            verification: row.verification,
            created_at: row.created_at,
            verified_at: row.verified_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DepositRow {
    id: i64,
    payment_id: i64,
    user_id: i64,
    amount_usd: Decimal,
    amount_etb: Decimal,
    exchange_rate: Decimal,
    payment_method: String,
    transaction_ref: String,
    approved_by: Option<i64>,
    status: String,
    auto_approved: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<DepositRow> for Deposit {
    type Error = LedgerError;

    fn try_from(row: DepositRow) -> Result<Self, Self::Error> {
        Ok(Deposit {
            id: row.id,
            payment_id: row.payment_id,
            user_id: row.user_id,
            amount_usd: row.amount_usd,
            amount_etb: row.amount_etb,
            exchange_rate: row.exchange_rate,
            payment_method: row
                .payment_method
                .parse()
                .map_err(|e: anyhow::Error| LedgerError::Corrupt(e.to_string()))?,
            transaction_ref: row.transaction_ref,
            approved_by: row.approved_by,
            status: row
                .status
                .parse()
                .map_err(|e: anyhow::Error| LedgerError::Corrupt(e.to_string()))?,
            auto_approved: row.auto_approved,
            created_at: row.created_at,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn open_status_list() -> Vec<String> {
    PaymentStatus::open_statuses()
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

#[derive(Clone)]
pub struct PgPaymentLedger {
    conn: PgPool,
}

impl PgPaymentLedger {
    pub fn new(conn: PgPool) -> Self {
        PgPaymentLedger { conn }
    }
}

#[async_trait]
impl PaymentLedger for PgPaymentLedger {
    async fn open_payment(&self, new_payment: &NewPendingPayment) -> Result<PendingPayment, LedgerError> {
        let row = sqlx::query_as::<_, PendingPaymentRow>(
            r#"INSERT INTO pending_payments
            (user_id, amount_usd, exchange_rate, amount_etb, deposit_fee_etb, total_etb, payment_method, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
            RETURNING *
            "#,
        )
        .bind(new_payment.user_id)
        .bind(new_payment.amount_usd)
        .bind(new_payment.exchange_rate)
        .bind(new_payment.amount_etb())
        .bind(new_payment.deposit_fee_etb)
        .bind(new_payment.total_etb())
        .bind(new_payment.payment_method.as_str())
        .fetch_one(&self.conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                LedgerError::OpenPaymentExists {
                    user_id: new_payment.user_id,
                }
            } else {
                LedgerError::Database(e)
            }
        })?;

        PendingPayment::try_from(row)
    }

    async fn get_payment(&self, id: i64) -> Result<Option<PendingPayment>, LedgerError> {
        let row = sqlx::query_as::<_, PendingPaymentRow>("SELECT * FROM pending_payments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.conn)
            .await?;

        row.map(PendingPayment::try_from).transpose()
    }

    async fn send_to_manual_review(&self, review: &ManualReview) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"UPDATE pending_payments
            SET status = $2, receipt_url = $3, transaction_ref = COALESCE($4, transaction_ref),
                verification = $5, updated_at = CURRENT_TIMESTAMP
            WHERE id = $1 AND status = ANY($6)
            "#,
        )
        .bind(review.payment_id)
        .bind(PaymentStatus::manual_review().as_str())
        .bind(&review.receipt_url)
        .bind(&review.transaction_ref)
        .bind(Json(&review.verification))
        .bind(open_status_list())
        .execute(&self.conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::PaymentClosed {
                id: review.payment_id,
            });
        }

        Ok(())
    }

    async fn credit_deposit(&self, credit: &DepositCredit) -> Result<Deposit, LedgerError> {
        // Dropping `tx` on any early return rolls everything back.
        let mut tx = self.conn.begin().await?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM deposits WHERE transaction_ref = $1 AND status NOT IN ('rejected', 'cancelled') LIMIT 1",
        )
        .bind(&credit.transaction_ref)
        .fetch_optional(&mut *tx)
        .await?;

        if existing.is_some() {
            return Err(LedgerError::Duplicate {
                reference: credit.transaction_ref.clone(),
            });
        }

        let payment = sqlx::query_as::<_, PendingPaymentRow>(
            "SELECT * FROM pending_payments WHERE id = $1 FOR UPDATE",
        )
        .bind(credit.payment_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(PendingPayment::try_from)
        .transpose()?
        .filter(|payment| !payment.status.is_terminal())
        .ok_or(LedgerError::PaymentClosed {
            id: credit.payment_id,
        })?;

        sqlx::query(
            r#"UPDATE pending_payments
            SET status = $2, receipt_url = $3, transaction_ref = $4, verification = $5,
                verified_at = CURRENT_TIMESTAMP, completed_at = CURRENT_TIMESTAMP,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $1
            "#,
        )
        .bind(payment.id)
        .bind(PaymentStatus::Completed.as_str())
        .bind(&credit.receipt_url)
        .bind(&credit.transaction_ref)
        .bind(Json(&credit.verification))
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, DepositRow>(
            r#"INSERT INTO deposits
            (payment_id, user_id, amount_usd, amount_etb, exchange_rate, payment_method,
             transaction_ref, approved_by, status, auto_approved)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NULL, $8, TRUE)
            RETURNING *
            "#,
        )
        .bind(payment.id)
        .bind(payment.user_id)
        .bind(payment.amount_usd)
        .bind(credit.amount_etb)
        .bind(payment.exchange_rate)
        .bind(payment.payment_method.as_str())
        .bind(&credit.transaction_ref)
        .bind(credit.status.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                LedgerError::Duplicate {
                    reference: credit.transaction_ref.clone(),
                }
            } else {
                LedgerError::Database(e)
            }
        })?;

        tx.commit().await?;

        Deposit::try_from(row)
    }

    async fn update_deposit_status(&self, deposit_id: i64, status: DepositStatus) -> Result<(), LedgerError> {
        sqlx::query("UPDATE deposits SET status = $1, updated_at = CURRENT_TIMESTAMP WHERE id = $2")
            .bind(status.as_str())
            .bind(deposit_id)
            .execute(&self.conn)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    #[test]
    fn test_open_status_list_matches_model() {
        assert_eq!(
            open_status_list(),
            vec!["pending", "screenshot_submitted", "transaction_submitted", "verified"]
        );
    }

    #[tokio::test]
    #[ignore] // Only run with database available
    async fn test_duplicate_reference_is_rejected_by_database() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = PgPoolOptions::new().max_connections(2).connect(&url).await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let ledger = PgPaymentLedger::new(pool);

        let open = |user_id| NewPendingPayment {
            user_id,
            amount_usd: Decimal::new(100, 0),
            exchange_rate: Decimal::new(135, 0),
            deposit_fee_etb: Decimal::ZERO,
            payment_method: crate::models::payments::PaymentMethod::Cbe,
        };
        let base = (uuid::Uuid::new_v4().as_u128() % 1_000_000_000) as i64 * 2;
        let first = ledger.open_payment(&open(base)).await.unwrap();
        let second = ledger.open_payment(&open(base + 1)).await.unwrap();

        let reference = format!("FT-IT-{}", uuid::Uuid::new_v4());
        let credit = |payment_id| DepositCredit {
            payment_id,
            transaction_ref: reference.clone(),
            amount_etb: Decimal::new(13500, 0),
            status: DepositStatus::Completed,
            receipt_url: "https://apps.cbe.com.et/?id=FT1".to_string(),
            verification: serde_json::json!({}),
        };

        ledger.credit_deposit(&credit(first.id)).await.unwrap();
        let err = ledger.credit_deposit(&credit(second.id)).await.unwrap_err();

        assert!(matches!(err, LedgerError::Duplicate { .. }));
        let untouched = ledger.get_payment(second.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, PaymentStatus::Pending);
    }
}

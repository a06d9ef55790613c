use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;

use crate::models::payments::NewPendingPayment;
use crate::services::deposits::{DepositOutcome, DepositServiceRequest};
use crate::services::ServiceError;

#[derive(Deserialize)]
pub struct ReceiptSubmission {
    receipt_url: String,
    #[serde(default)]
    skip_date_check: bool,
}

fn service_error_response(error: ServiceError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match error {
        ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ServiceError::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (
        status,
        Json(json!({
            "error": error.to_string()
        })),
    )
}

fn channel_error(e: impl ToString) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": "Internal server error",
            "details": e.to_string()
        })),
    )
}

pub async fn open_payment(
    State(state): State<super::AppState>,
    Json(req): Json<NewPendingPayment>,
) -> impl IntoResponse {
    let (payment_tx, payment_rx) = oneshot::channel();

    let send_result = state
        .deposit_channel
        .send(DepositServiceRequest::OpenPayment {
            payment: req,
            response: payment_tx,
        })
        .await;
    if let Err(e) = send_result {
        return channel_error(e);
    }

    match payment_rx.await {
        Ok(Ok(payment)) => (StatusCode::CREATED, Json(json!(payment))),
        Ok(Err(service_error)) => service_error_response(service_error),
        Err(e) => channel_error(e),
    }
}

pub async fn get_payment(
    State(state): State<super::AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let (payment_tx, payment_rx) = oneshot::channel();

    let send_result = state
        .deposit_channel
        .send(DepositServiceRequest::GetPayment {
            id,
            response: payment_tx,
        })
        .await;
    if let Err(e) = send_result {
        return channel_error(e);
    }

    match payment_rx.await {
        Ok(Ok(Some(payment))) => (StatusCode::OK, Json(json!(payment))),
        Ok(Ok(None)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Payment {} not found", id) })),
        ),
        Ok(Err(service_error)) => service_error_response(service_error),
        Err(e) => channel_error(e),
    }
}

/// Always answers 200 with one of the two user-facing outcomes; diagnostic
/// detail stays in the admin alert and the stored review record.
pub async fn submit_receipt(
    State(state): State<super::AppState>,
    Path(payment_id): Path<i64>,
    Json(req): Json<ReceiptSubmission>,
) -> impl IntoResponse {
    let (outcome_tx, outcome_rx) = oneshot::channel();

    let send_result = state
        .deposit_channel
        .send(DepositServiceRequest::SubmitReceipt {
            payment_id,
            receipt_url: req.receipt_url,
            skip_date_check: req.skip_date_check,
            response: outcome_tx,
        })
        .await;
    if let Err(e) = send_result {
        return channel_error(e);
    }

    match outcome_rx.await {
        Ok(outcome) => {
            let deposit_id = match &outcome {
                DepositOutcome::Approved { deposit } => Some(deposit.id),
                DepositOutcome::ManualReview { .. } => None,
            };

            (
                StatusCode::OK,
                Json(json!({
                    "outcome": outcome.outcome(),
                    "message": outcome.user_message(),
                    "deposit_id": deposit_id,
                })),
            )
        }
        Err(e) => channel_error(e),
    }
}

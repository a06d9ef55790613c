use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;

use crate::services::receipts::ReceiptServiceRequest;

#[derive(Deserialize)]
pub struct VerifyRequest {
    url: String,
}

pub async fn verify_receipt(
    State(state): State<super::AppState>,
    Json(req): Json<VerifyRequest>,
) -> impl IntoResponse {
    let (result_tx, result_rx) = oneshot::channel();

    let send_result = state
        .receipt_channel
        .send(ReceiptServiceRequest::Verify {
            url: req.url,
            response: result_tx,
        })
        .await;
    if let Err(e) = send_result {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "Internal server error",
                "details": e.to_string()
            })),
        );
    }

    match result_rx.await {
        Ok(result) => (StatusCode::OK, Json(json!(result))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "Internal server error",
                "details": e.to_string()
            })),
        ),
    }
}

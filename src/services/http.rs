use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use super::{deposits::DepositServiceRequest, receipts::ReceiptServiceRequest};

mod payments;
mod receipts;

#[derive(Clone)]
struct AppState {
    deposit_channel: mpsc::Sender<DepositServiceRequest>,
    receipt_channel: mpsc::Sender<ReceiptServiceRequest>,
}

fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/payments", post(payments::open_payment))
        .route("/payments/{id}", get(payments::get_payment))
        .route("/payments/{id}/receipt", post(payments::submit_receipt))
        .route("/receipts/verify", post(receipts::verify_receipt))
        .route("/health", get(|| async { "OK" }))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
}

pub async fn start_http_server(
    listen: String,
    deposit_channel: mpsc::Sender<DepositServiceRequest>,
    receipt_channel: mpsc::Sender<ReceiptServiceRequest>,
) -> Result<(), anyhow::Error> {
    let app = router(AppState {
        deposit_channel,
        receipt_channel,
    });

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    println!("[*] Listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::repositories::fetcher::HttpFetcher;
use crate::repositories::payments::PgPaymentLedger;
use crate::repositories::strowallet::{CardProvider, StroWalletApi};
use crate::repositories::telegram::TelegramNotifier;
use crate::settings::Settings;
use crate::utils::DomainAllowList;

mod deposits;
mod http;
mod matching;
mod receipts;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Database error: {0}")]
    Database(String),
}

#[async_trait]
pub trait RequestHandler<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    async fn handle_request(&self, request: T);
}

#[async_trait]
pub trait Service<T, H>: Send + Sync + 'static
where
    T: Send + 'static,
    H: RequestHandler<T> + Clone + Send,
{
    async fn run(&mut self, handler: H, receiver: &mut mpsc::Receiver<T>) {
        while let Some(request) = receiver.recv().await {
            let handler = handler.clone();

            tokio::spawn(async move {
                handler.handle_request(request).await;
            });
        }
    }
}

pub async fn start_services(
    pool: PgPool,
    settings: Settings,
    listen: String,
) -> Result<(), anyhow::Error> {
    let (deposit_tx, mut deposit_rx) = mpsc::channel(512);
    let (receipt_tx, mut receipt_rx) = mpsc::channel(512);

    let allow_list = DomainAllowList::new(&settings.verifier.allowed_domains);
    let fetcher = Arc::new(HttpFetcher::new(&settings.fetcher, allow_list)?);
    let verifier = Arc::new(receipts::ReceiptVerifier::new(&settings.verifier, fetcher)?);

    let notifier = Arc::new(TelegramNotifier::new(
        settings.telegram.api_url,
        settings.telegram.bot_token,
        settings.telegram.admin_chat_ids,
    ));
    let card_provider = settings.strowallet.map(|strowallet| {
        Arc::new(StroWalletApi::new(strowallet.public_key, strowallet.url)) as Arc<dyn CardProvider>
    });
    if card_provider.is_none() {
        log::warn!("No StroWallet configured; deposits complete on local commit.");
    }

    let processor = Arc::new(deposits::AutoDepositProcessor::new(
        Arc::new(PgPaymentLedger::new(pool)),
        verifier.clone(),
        notifier,
        card_provider,
        settings.deposits,
        settings.receivers,
    ));

    let mut deposit_service = deposits::DepositService::new();
    let mut receipt_service = receipts::ReceiptService::new();

    println!("[*] Starting deposit service.");
    tokio::spawn(async move {
        deposit_service
            .run(deposits::DepositRequestHandler::new(processor), &mut deposit_rx)
            .await;
    });

    println!("[*] Starting receipt service.");
    tokio::spawn(async move {
        receipt_service
            .run(receipts::ReceiptRequestHandler::new(verifier), &mut receipt_rx)
            .await;
    });

    println!("[*] Starting HTTP server.");
    http::start_http_server(listen, deposit_tx, receipt_tx).await?;

    Ok(())
}

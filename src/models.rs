pub mod deposits;
pub mod payments;
pub mod receipts;

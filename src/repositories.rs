pub mod fetcher;
pub mod parsers;
pub mod payments;
pub mod strowallet;
pub mod telegram;

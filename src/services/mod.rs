// Pricing
pub mod pricing;
pub mod promotions;

// Catalog and carts
pub mod carts;
pub mod catalog;

// Settlement
pub mod checkout;
pub mod payments;

// Order ledger
pub mod orders;
pub mod refunds;

// Accounts, loyalty and wallet
pub mod accounts;

// Fraud monitoring and the transaction log
pub mod fraud;
pub mod transaction_log;

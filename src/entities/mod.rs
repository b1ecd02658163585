//! sea-orm entities backing the checkout service.

pub mod cart_line;
pub mod order;
pub mod order_item;
pub mod product;
pub mod refund_item;
pub mod refund_request;
pub mod transaction_log;
pub mod user_account;

pub use cart_line::Entity as CartLine;
pub use order::Entity as Order;
pub use order_item::Entity as OrderItem;
pub use product::Entity as Product;
pub use refund_item::Entity as RefundItem;
pub use refund_request::Entity as RefundRequest;
pub use transaction_log::Entity as TransactionLog;
pub use user_account::Entity as UserAccount;

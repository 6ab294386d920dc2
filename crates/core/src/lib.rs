pub mod category;
pub mod money;
pub mod transaction;

pub use category::{Category, CategoryError, CategoryId, CategoryStore};
pub use money::{Money, MoneyParseError};
pub use transaction::Transaction;

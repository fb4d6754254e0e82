mod allocation;
mod ledger;
mod member;
mod transaction;
mod wallet;

pub use allocation::*;
pub use ledger::*;
pub use member::*;
pub use transaction::*;
pub use wallet::*;

pub mod store;
pub mod tenant;

pub use store::LedgerStore;
pub use tenant::{BalanceView, LedgerTransaction, NewTenant, Reason, Tenant};

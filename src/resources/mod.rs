mod ledger;
mod pool;

pub use ledger::{LedgerEntry, ResourceLedger};
pub use pool::{Lease, PoolPolicy, ReleaseOutcome, ResourcePool, ResourceRecord};

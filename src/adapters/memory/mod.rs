//! In-memory adapters.
//!
//! Hold the whole ledger in process. Used by tests and local runs.

mod clock;
mod ledger_store;
mod operator_queue;

pub use clock::ManualClock;
pub use ledger_store::InMemoryLedgerStore;
pub use operator_queue::InMemoryOperatorQueue;

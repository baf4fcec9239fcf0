//! Test doubles for the treasury driver.
//!
//! - [`MemoryRequestStore`] / [`MemoryWatermarkStore`]: in-memory stores
//!   with the same transition rules as the PostgreSQL ones
//! - [`MockChain`]: scripted history, get-method answers and seqnos
//! - [`RecordingSigner`]: records sends and lands them on the [`MockChain`]
//! - [`fixtures`]: addresses, transactions, stacks and requests
//!
//! ```rust,ignore
//! let chain = Arc::new(MockChain::new(fixtures::treasury()));
//! chain.push_transaction(fixtures::reserve_token_tx(1, fixtures::wallet(1), 1_000));
//! chain.set_wallet_state(fixtures::wallet(1), &[], 1_000);
//! chain.set_budgets([1_000]);
//!
//! let signer = Arc::new(RecordingSigner::new(fixtures::driver_wallet(), chain.clone()));
//! ```

mod chain;
pub mod fixtures;
mod store;

pub use chain::{ChainEvent, HistoryCall, MockChain, RecordingSigner};
pub use store::{MemoryRequestStore, MemoryWatermarkStore};

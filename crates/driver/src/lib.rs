//! # Treasury driver
//!
//! An unattended driver for a custodial staking treasury contract. It watches
//! the treasury's transactions, turns the interesting ones into durable
//! requests, and answers each request with exactly one outgoing message from
//! the driver wallet.
//!
//! ## Architecture
//!
//! ```text
//!          chain ──► Extractor ──► RequestStore (new)
//!                        │
//!                        └──► WatermarkStore
//!
//!   RequestStore (triable)
//!       │
//!       ├─► StakeAdmission ───┐    Oracle: treasury / wallet state,
//!       │                     │            max burnable tokens
//!       └─► UnstakeAdmission ─┤
//!                             ▼
//!                       DispatchQueue
//!                             │
//!                             ▼
//!                        Dispatcher ── Signer.send() ── wait for seqno
//!                             │
//!                ┌────────────┴────────────┐
//!                ▼                         ▼
//!         stake listener           unstake listener
//!          sent / error              sent / error
//!
//!   RequestStore (sent) ──► Verifier ──► verified / retriable
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One row per transaction** - requests are keyed by the hash of the
//!    transaction they came from; re-reading history never duplicates them
//! 2. **One message in flight** - the dispatcher sends the next message only
//!    after the signer's seqno moved past the previous one
//! 3. **Watermark after storage** - the extraction frontier moves only once
//!    every request of the pass is stored
//! 4. **Skip without sending** - a request that live state shows to be moot
//!    goes straight to `skipped`
//! 5. **Bounded retries** - requests stop being admitted once `retried`
//!    reaches `max_retry`
//!
//! ## Failure handling
//!
//! Chain or store failures abort the current pass and leave state as it was;
//! the next tick repeats the pass. Problems with a single request (bad
//! address, unreadable wallet, failed dispatch) are logged, recorded on that
//! request, and never stop its siblings.
//!
//! Collaborators are traits: [`ChainClient`] for reads, [`Signer`] for
//! submitting messages, [`RequestStore`] and [`WatermarkStore`] for
//! persistence. A PostgreSQL store lives in `treasury-driver-postgres`,
//! in-memory doubles in `treasury-driver-testing`.

pub mod address;
pub mod body;
pub mod cell;
pub mod chain;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod model;
pub mod oracle;
pub mod runtime;
pub mod schedule;
pub mod stake;
pub mod store;
pub mod unstake;
pub mod verify;

// Re-export model types
pub use model::{
    Payload, Request, RequestKind, RequestRef, RequestState, Stake, StakeRequest, TxInfo,
    Unstake, UnstakeRequest,
};

// Re-export collaborator seams
pub use chain::{ChainClient, Message, OutgoingMessage, Signer, StackValue, Transaction, TxHash};
pub use store::{ExtractionMemo, RequestStore, WatermarkStore, EXTRACTION_MEMO_KEY};

// Re-export primitives
pub use address::{Address, Network};
pub use cell::{Cell, CellBuilder, CellParser};

// Re-export error types
pub use error::{AddressError, CellError, ConfigError, DispatchError, DriverError, OracleError};

// Re-export passes
pub use dispatch::{DispatchQueue, DispatchTiming, Dispatcher, Envelope, Response};
pub use extract::{Classifier, ExtractReport, Extraction, Extractor, PageSizes};
pub use oracle::{Oracle, TreasuryState, WalletState};
pub use stake::{StakeAdmission, StakeReport};
pub use unstake::{UnstakeAdmission, UnstakeReport};
pub use verify::{Verifier, VerifyReport};

// Re-export runtime types (primary entry point)
pub use config::{DriverConfig, Settings};
pub use runtime::{Driver, DriverBuilder, DriverHandle};

// Re-export commonly used external types
pub use async_trait::async_trait;

//! Persistence seams.
//!
//! Every state transition is a single-row update keyed by the request hash.
//! Admission, the dispatcher listeners and the verification sweep touch
//! disjoint state sets, so no locking is needed beyond what the store does
//! for a single row.
//!
//! State updates are conditional: a transition that
//! [`RequestState::can_transition_to`] does not allow leaves the row as it
//! is. Unknown hashes are ignored the same way.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{Payload, Request, RequestState, TxInfo};

/// Repository for one request kind.
#[async_trait]
pub trait RequestStore<P: Payload>: Send + Sync {
    /// Inserts a `new` request, or refreshes `info` when `hash` is already
    /// known. Returns the stored row.
    async fn insert_if_not_exists(
        &self,
        address: &str,
        payload: &P,
        hash: &str,
        info: &TxInfo,
    ) -> Result<Request<P>>;

    async fn find(&self, hash: &str) -> Result<Option<Request<P>>>;

    /// Requests in one of `P::TRIABLE` with `retried < max_retry`.
    async fn find_triable(&self, max_retry: u32) -> Result<Vec<Request<P>>>;

    /// Requests in `sent`.
    async fn find_verifiable(&self) -> Result<Vec<Request<P>>>;

    async fn set_state(&self, hash: &str, state: RequestState) -> Result<()>;

    /// Moves to `ongoing`, bumps `retried` and stamps `retried_at`.
    async fn set_retrying(&self, hash: &str, at: DateTime<Utc>) -> Result<()>;

    /// Moves to `sent` and stamps `sent_at`.
    async fn set_sent(&self, hash: &str, at: DateTime<Utc>) -> Result<()>;

    /// Moves to `verified` and stamps `verified_at`.
    async fn set_verified(&self, hash: &str, at: DateTime<Utc>) -> Result<()>;
}

/// Holds the extraction frontier.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Empty when nothing was processed yet.
    async fn latest_processed_hash(&self) -> Result<String>;

    async fn set_latest_processed_hash(&self, hash: &str) -> Result<()>;
}

/// Memo key the extraction frontier is kept under.
pub const EXTRACTION_MEMO_KEY: &str = "extraction";

/// JSON document stored under [`EXTRACTION_MEMO_KEY`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExtractionMemo {
    #[serde(default)]
    pub latest_processed_hash: String,
}

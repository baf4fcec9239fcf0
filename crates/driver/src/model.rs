//! Requests and their lifecycle.
//!
//! ```text
//!   new ──► ongoing ──► sent ──► verified
//!    │        │  ▲        │
//!    │        │  └── retriable
//!    │        ├──► skipped
//!    │        └──► error ──► ongoing (while retried < max_retry)
//!    └───────────► skipped
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    New,
    Ongoing,
    Sent,
    Verified,
    Retriable,
    Skipped,
    Error,
}

impl RequestState {
    pub const ALL: [RequestState; 7] = [
        RequestState::New,
        RequestState::Ongoing,
        RequestState::Sent,
        RequestState::Verified,
        RequestState::Retriable,
        RequestState::Skipped,
        RequestState::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RequestState::New => "new",
            RequestState::Ongoing => "ongoing",
            RequestState::Sent => "sent",
            RequestState::Verified => "verified",
            RequestState::Retriable => "retriable",
            RequestState::Skipped => "skipped",
            RequestState::Error => "error",
        }
    }

    /// Whether the machine has an edge from `self` to `next`.
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (New | Error | Retriable | Ongoing, Ongoing)
                | (New | Error | Retriable | Ongoing, Skipped)
                | (Ongoing, Sent | Error)
                | (Sent, Verified | Retriable)
        )
    }

    /// States a request may move to `self` from.
    pub fn predecessors(self) -> Vec<RequestState> {
        Self::ALL
            .into_iter()
            .filter(|state| state.can_transition_to(self))
            .collect()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Verified | RequestState::Skipped)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(RequestState::New),
            "ongoing" => Ok(RequestState::Ongoing),
            "sent" => Ok(RequestState::Sent),
            "verified" => Ok(RequestState::Verified),
            "retriable" => Ok(RequestState::Retriable),
            "skipped" => Ok(RequestState::Skipped),
            "error" => Ok(RequestState::Error),
            other => Err(format!("unknown request state '{other}'")),
        }
    }
}

/// Snapshot of the transaction a request was extracted from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInfo {
    /// Value carried by the inbound message, in nanotons.
    pub value: u64,
    pub time: DateTime<Utc>,
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Stake,
    Unstake,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Stake => "stake",
            RequestKind::Unstake => "unstake",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific part of a request.
pub trait Payload: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    const KIND: RequestKind;

    /// States from which a request of this kind may be (re)admitted.
    const TRIABLE: &'static [RequestState];
}

/// A wallet expecting a stake for `round_since`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stake {
    pub round_since: u32,
}

impl Payload for Stake {
    const KIND: RequestKind = RequestKind::Stake;
    const TRIABLE: &'static [RequestState] = &[
        RequestState::New,
        RequestState::Ongoing,
        RequestState::Error,
        RequestState::Retriable,
    ];
}

/// A wallet that reserved `tokens` for withdrawal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unstake {
    pub tokens: BigUint,
}

impl Payload for Unstake {
    const KIND: RequestKind = RequestKind::Unstake;
    const TRIABLE: &'static [RequestState] = &[
        RequestState::New,
        RequestState::Error,
        RequestState::Retriable,
    ];
}

/// A persisted request. `hash` is the natural key.
#[derive(Debug, Clone, PartialEq)]
pub struct Request<P: Payload> {
    pub address: String,
    pub payload: P,
    pub hash: String,
    pub state: RequestState,
    pub retried: u32,
    pub info: TxInfo,
    pub created_at: DateTime<Utc>,
    pub retried_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
}

pub type StakeRequest = Request<Stake>;
pub type UnstakeRequest = Request<Unstake>;

impl<P: Payload> Request<P> {
    /// A freshly extracted request.
    pub fn new(address: String, payload: P, info: TxInfo) -> Self {
        Self {
            address,
            payload,
            hash: info.hash.clone(),
            state: RequestState::New,
            retried: 0,
            info,
            created_at: Utc::now(),
            retried_at: None,
            sent_at: None,
            verified_at: None,
        }
    }

    pub fn kind(&self) -> RequestKind {
        P::KIND
    }

    pub fn is_triable(&self, max_retry: u32) -> bool {
        P::TRIABLE.contains(&self.state) && self.retried < max_retry
    }

    pub fn is_verifiable(&self) -> bool {
        self.state == RequestState::Sent
    }
}

impl StakeRequest {
    pub fn round_since(&self) -> u32 {
        self.payload.round_since
    }
}

impl UnstakeRequest {
    pub fn tokens(&self) -> &BigUint {
        &self.payload.tokens
    }
}

/// The originating request of a dispatched operation.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestRef {
    Stake(StakeRequest),
    Unstake(UnstakeRequest),
}

impl RequestRef {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestRef::Stake(_) => RequestKind::Stake,
            RequestRef::Unstake(_) => RequestKind::Unstake,
        }
    }

    pub fn hash(&self) -> &str {
        match self {
            RequestRef::Stake(request) => &request.hash,
            RequestRef::Unstake(request) => &request.hash,
        }
    }

    pub fn address(&self) -> &str {
        match self {
            RequestRef::Stake(request) => &request.address,
            RequestRef::Unstake(request) => &request.address,
        }
    }
}

impl From<StakeRequest> for RequestRef {
    fn from(request: StakeRequest) -> Self {
        RequestRef::Stake(request)
    }
}

impl From<UnstakeRequest> for RequestRef {
    fn from(request: UnstakeRequest) -> Self {
        RequestRef::Unstake(request)
    }
}

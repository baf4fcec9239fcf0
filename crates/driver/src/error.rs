//! Error types for the driver.
//!
//! Collaborators (chain client, signer, stores) report failures as opaque
//! `anyhow::Error`s. Everything the driver itself can get wrong has a typed
//! variant here.

use std::time::Duration;

use thiserror::Error;

/// Failure while reading or building a cell.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CellError {
    #[error("cell underflow: needed {needed} bits, {available} available")]
    BitUnderflow { needed: usize, available: usize },

    #[error("cell underflow: reference #{index} is missing")]
    RefUnderflow { index: usize },

    #[error("cell overflow: {bits} bits exceed the 1023-bit limit")]
    BitOverflow { bits: usize },

    #[error("cell overflow: more than 4 references")]
    RefOverflow,

    #[error("value of {bits} bits does not fit into {width} bits")]
    ValueTooWide { bits: u64, width: usize },

    #[error("invalid dictionary label: {0}")]
    InvalidLabel(&'static str),

    #[error("unexpected opcode {found:#010x}, expected {expected:#010x}")]
    UnexpectedOpcode { expected: u32, found: u32 },
}

/// Failure while parsing an account address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address must be 48 base64 characters or '<workchain>:<64 hex>', got {0} characters")]
    InvalidLength(usize),

    #[error("invalid base64 address: {0}")]
    InvalidBase64(String),

    #[error("address checksum mismatch")]
    ChecksumMismatch,

    #[error("invalid raw address: {0}")]
    InvalidRaw(String),
}

/// Failure of a read-only contract query.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("running get-method '{method}' failed")]
    Query {
        method: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// The returned stack does not have the expected shape. Nothing from it
    /// is used.
    #[error("malformed response from '{method}': {reason}")]
    MalformedResponse { method: &'static str, reason: String },
}

impl OracleError {
    pub(crate) fn malformed(method: &'static str, reason: impl Into<String>) -> Self {
        OracleError::MalformedResponse {
            method,
            reason: reason.into(),
        }
    }
}

/// Failure to get an outgoing operation onto the chain.
///
/// Clonable so it can travel inside a [`Response`](crate::Response).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("dispatch queue is closed")]
    QueueClosed,

    #[error("reading signer sequence number failed: {0}")]
    SeqnoQuery(String),

    #[error("submitting message failed: {0}")]
    Submit(String),

    #[error("sequence number did not advance past {seqno} within {waited:?}")]
    SeqnoTimeout { seqno: u32, waited: Duration },
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid treasury address: {0}")]
    InvalidTreasuryAddress(#[from] AddressError),

    #[error("invalid time interval for {0} process")]
    InvalidInterval(&'static str),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("driver is missing its {0}")]
    Missing(&'static str),
}

/// Pass-level failure. The pass is abandoned and retried on the next tick.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("chain read failed: {0:#}")]
    Chain(anyhow::Error),

    #[error("repository failed: {0:#}")]
    Store(anyhow::Error),

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

pub type Result<T, E = DriverError> = std::result::Result<T, E>;

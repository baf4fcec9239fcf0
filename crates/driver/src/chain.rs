//! Chain-facing collaborators: the read client and the signer.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use num_bigint::BigInt;

use crate::address::Address;
use crate::cell::Cell;

/// 256-bit transaction hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHash(pub [u8; 32]);

impl TxHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({})", self.to_hex())
    }
}

/// A message as seen inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub source: Option<Address>,
    pub destination: Option<Address>,
    /// Nanotons carried by an internal message; zero for external ones.
    pub value: u64,
    pub body: Cell,
}

impl Message {
    pub fn opcode(&self) -> Option<u32> {
        self.body.opcode()
    }
}

/// A transaction of the monitored account.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub hash: TxHash,
    pub lt: u64,
    /// Unix time of the block the transaction landed in.
    pub now: u32,
    /// Compute and action phases both succeeded.
    pub success: bool,
    pub in_msg: Option<Message>,
    pub out_msgs: Vec<Message>,
}

impl Transaction {
    pub fn time(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(i64::from(self.now), 0)
            .single()
            .unwrap_or_default()
    }

    /// Value of the inbound message.
    pub fn value(&self) -> u64 {
        self.in_msg.as_ref().map_or(0, |msg| msg.value)
    }

    pub fn in_msg_with_opcode(&self, opcode: u32) -> Option<&Message> {
        self.in_msg
            .as_ref()
            .filter(|msg| msg.opcode() == Some(opcode))
    }

    pub fn out_msgs_with_opcode(&self, opcode: u32) -> Vec<&Message> {
        self.out_msgs
            .iter()
            .filter(|msg| msg.opcode() == Some(opcode))
            .collect()
    }
}

/// One entry of a get-method result stack.
#[derive(Debug, Clone, PartialEq)]
pub enum StackValue {
    Null,
    Int(BigInt),
    Cell(Cell),
    Slice(Cell),
}

impl StackValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            StackValue::Null => "null",
            StackValue::Int(_) => "int",
            StackValue::Cell(_) => "cell",
            StackValue::Slice(_) => "slice",
        }
    }
}

/// Read access to the chain.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Newest transactions of `account`, newest first.
    async fn get_last_transactions(&self, account: &Address, limit: u32) -> Result<Vec<Transaction>>;

    /// Up to `limit` transactions starting at (and including) the cursor
    /// transaction, going back in time.
    async fn get_transactions(
        &self,
        account: &Address,
        limit: u32,
        lt: u64,
        hash: TxHash,
    ) -> Result<Vec<Transaction>>;

    async fn run_get_method(
        &self,
        account: &Address,
        method: &str,
        args: Vec<StackValue>,
    ) -> Result<Vec<StackValue>>;

    /// Balance in nanotons.
    async fn get_account_balance(&self, account: &Address) -> Result<u64>;

    /// Current replay-protection sequence number of a wallet.
    async fn get_seqno(&self, account: &Address) -> Result<u32>;
}

/// An outgoing internal message, before signing.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub destination: Address,
    /// Nanotons attached to the message.
    pub amount: u64,
    pub bounce: bool,
    /// Send mode; 1 pays forwarding fees separately.
    pub mode: u8,
    pub body: Cell,
}

/// Signs outgoing messages with the driver wallet's key and submits them.
#[async_trait]
pub trait Signer: Send + Sync {
    fn address(&self) -> Address;

    async fn send(&self, message: &OutgoingMessage) -> Result<()>;
}

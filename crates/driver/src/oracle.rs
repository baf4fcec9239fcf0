//! Typed views over the treasury's read-only get-methods.
//!
//! Every response is shape-checked as a whole before anything is decoded.
//! A mismatch yields [`OracleError::MalformedResponse`] and no partial state.

use std::collections::BTreeMap;
use std::sync::Arc;

use num_bigint::{BigInt, BigUint};
use num_traits::{ToPrimitive, Zero};

use crate::address::Address;
use crate::cell::{parse_dict_u32, Cell};
use crate::chain::{ChainClient, StackValue};
use crate::error::OracleError;

pub const GET_TREASURY_STATE: &str = "get_treasury_state";
pub const GET_WALLET_STATE: &str = "get_wallet_state";
pub const GET_MAX_BURNABLE_TOKENS: &str = "get_max_burnable_tokens";

/// Aggregate treasury state.
#[derive(Debug, Clone, PartialEq)]
pub struct TreasuryState {
    pub total_coins: BigInt,
    pub total_tokens: BigInt,
    pub total_staking: BigInt,
    pub total_unstaking: BigInt,
    pub total_validator_stake: BigInt,
    /// Rounds that were already funded.
    pub participations: BTreeMap<u32, Cell>,
    pub stopped: bool,
    pub reward_share: i64,
}

impl TreasuryState {
    pub fn has_participation(&self, round_since: u32) -> bool {
        self.participations.contains_key(&round_since)
    }
}

/// State of one wallet contract.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletState {
    pub tokens: BigUint,
    /// Rounds this wallet still expects a stake for.
    pub staking: BTreeMap<u32, Cell>,
    /// Everything the wallet is currently owed.
    pub unstaking: BigUint,
}

impl WalletState {
    pub fn is_awaiting(&self, round_since: u32) -> bool {
        self.staking.contains_key(&round_since)
    }

    pub fn has_pending_unstake(&self) -> bool {
        !self.unstaking.is_zero()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    Int,
    CellOrNull,
    SliceOrNull,
}

impl Slot {
    fn accepts(self, value: &StackValue) -> bool {
        matches!(
            (self, value),
            (Slot::Int, StackValue::Int(_))
                | (Slot::CellOrNull, StackValue::Cell(_) | StackValue::Null)
                | (Slot::SliceOrNull, StackValue::Slice(_) | StackValue::Null)
        )
    }

    fn name(self) -> &'static str {
        match self {
            Slot::Int => "int",
            Slot::CellOrNull => "cell or null",
            Slot::SliceOrNull => "slice or null",
        }
    }
}

const TREASURY_SHAPE: [Slot; 16] = [
    Slot::Int,         // total_coins
    Slot::Int,         // total_tokens
    Slot::Int,         // total_staking
    Slot::Int,         // total_unstaking
    Slot::Int,         // total_validator_stake
    Slot::CellOrNull,  // participations
    Slot::Int,         // stopped
    Slot::CellOrNull,  // wallet_code
    Slot::CellOrNull,  // loan_code
    Slot::SliceOrNull, // driver
    Slot::SliceOrNull, // halter
    Slot::SliceOrNull, // governor
    Slot::SliceOrNull, // proposed_governor
    Slot::Int,         // reward_share
    Slot::CellOrNull,  // rewards_history
    Slot::CellOrNull,  // content
];

const WALLET_SHAPE: [Slot; 3] = [Slot::Int, Slot::CellOrNull, Slot::Int];

const MAX_BURNABLE_SHAPE: [Slot; 1] = [Slot::Int];

/// Reads a stack that already passed its shape check.
struct StackReader<'a> {
    method: &'static str,
    stack: &'a [StackValue],
}

impl<'a> StackReader<'a> {
    fn checked(
        method: &'static str,
        stack: &'a [StackValue],
        shape: &[Slot],
    ) -> Result<Self, OracleError> {
        if stack.len() != shape.len() {
            return Err(OracleError::malformed(
                method,
                format!("expected {} entries, got {}", shape.len(), stack.len()),
            ));
        }
        for (index, (value, slot)) in stack.iter().zip(shape).enumerate() {
            if !slot.accepts(value) {
                return Err(OracleError::malformed(
                    method,
                    format!(
                        "entry {index} should be {}, got {}",
                        slot.name(),
                        value.type_name()
                    ),
                ));
            }
        }
        Ok(Self { method, stack })
    }

    fn int(&self, index: usize) -> Result<&'a BigInt, OracleError> {
        match &self.stack[index] {
            StackValue::Int(value) => Ok(value),
            other => Err(OracleError::malformed(
                self.method,
                format!("entry {index} is {}", other.type_name()),
            )),
        }
    }

    fn uint(&self, index: usize) -> Result<BigUint, OracleError> {
        self.int(index)?.to_biguint().ok_or_else(|| {
            OracleError::malformed(self.method, format!("entry {index} is negative"))
        })
    }

    fn small_int(&self, index: usize) -> Result<i64, OracleError> {
        self.int(index)?.to_i64().ok_or_else(|| {
            OracleError::malformed(self.method, format!("entry {index} does not fit 64 bits"))
        })
    }

    /// A `Hashmap 32` root, or null for an empty dictionary.
    fn dict(&self, index: usize) -> Result<BTreeMap<u32, Cell>, OracleError> {
        match &self.stack[index] {
            StackValue::Null => Ok(BTreeMap::new()),
            StackValue::Cell(root) => parse_dict_u32(root).map_err(|err| {
                OracleError::malformed(self.method, format!("entry {index}: {err}"))
            }),
            other => Err(OracleError::malformed(
                self.method,
                format!("entry {index} is {}", other.type_name()),
            )),
        }
    }
}

impl TreasuryState {
    pub fn from_stack(stack: &[StackValue]) -> Result<Self, OracleError> {
        let reader = StackReader::checked(GET_TREASURY_STATE, stack, &TREASURY_SHAPE)?;
        Ok(Self {
            total_coins: reader.int(0)?.clone(),
            total_tokens: reader.int(1)?.clone(),
            total_staking: reader.int(2)?.clone(),
            total_unstaking: reader.int(3)?.clone(),
            total_validator_stake: reader.int(4)?.clone(),
            participations: reader.dict(5)?,
            stopped: !reader.int(6)?.is_zero(),
            reward_share: reader.small_int(13)?,
        })
    }
}

impl WalletState {
    pub fn from_stack(stack: &[StackValue]) -> Result<Self, OracleError> {
        let reader = StackReader::checked(GET_WALLET_STATE, stack, &WALLET_SHAPE)?;
        Ok(Self {
            tokens: reader.uint(0)?,
            staking: reader.dict(1)?,
            unstaking: reader.uint(2)?,
        })
    }
}

fn max_burnable_from_stack(stack: &[StackValue]) -> Result<BigUint, OracleError> {
    StackReader::checked(GET_MAX_BURNABLE_TOKENS, stack, &MAX_BURNABLE_SHAPE)?.uint(0)
}

/// Runs the get-methods. Nothing is cached between calls.
#[derive(Clone)]
pub struct Oracle {
    chain: Arc<dyn ChainClient>,
    treasury: Address,
}

impl Oracle {
    pub fn new(chain: Arc<dyn ChainClient>, treasury: Address) -> Self {
        Self { chain, treasury }
    }

    async fn run(&self, account: &Address, method: &'static str) -> Result<Vec<StackValue>, OracleError> {
        self.chain
            .run_get_method(account, method, Vec::new())
            .await
            .map_err(|source| OracleError::Query { method, source })
    }

    pub async fn treasury_state(&self) -> Result<TreasuryState, OracleError> {
        let stack = self.run(&self.treasury, GET_TREASURY_STATE).await?;
        TreasuryState::from_stack(&stack)
    }

    /// Tokens the treasury can pay out right now.
    pub async fn max_burnable_tokens(&self) -> Result<BigUint, OracleError> {
        let stack = self.run(&self.treasury, GET_MAX_BURNABLE_TOKENS).await?;
        max_burnable_from_stack(&stack)
    }

    pub async fn wallet_state(&self, wallet: &Address) -> Result<WalletState, OracleError> {
        let stack = self.run(wallet, GET_WALLET_STATE).await?;
        WalletState::from_stack(&stack)
    }
}

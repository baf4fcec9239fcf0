//! Builders for addresses, transactions and get-method stacks.

use std::collections::BTreeMap;

use chrono::Utc;
use num_bigint::{BigInt, BigUint};
use treasury_driver::body::{ReserveToken, SaveCoin};
use treasury_driver::cell::build_dict_u32;
use treasury_driver::{
    Address, Cell, Message, Network, Request, Stake, StackValue, Transaction, TxHash, TxInfo,
    Unstake,
};

/// The address every scenario uses for the treasury.
pub fn treasury() -> Address {
    Address::new(0, [0xee; 32])
}

/// The driver's own wallet.
pub fn driver_wallet() -> Address {
    Address::new(0, [0xdd; 32])
}

/// A wallet contract address derived from `seed`.
pub fn wallet(seed: u8) -> Address {
    let mut hash = [seed; 32];
    hash[0] = 0x57;
    Address::new(0, hash)
}

/// A transaction hash derived from `seed`.
pub fn tx_hash(seed: u64) -> TxHash {
    let mut hash = [0u8; 32];
    hash[..8].copy_from_slice(&seed.to_be_bytes());
    hash[31] = 0x01;
    TxHash(hash)
}

fn transaction(seed: u64, in_msg: Option<Message>, out_msgs: Vec<Message>) -> Transaction {
    Transaction {
        hash: tx_hash(seed),
        lt: seed * 1_000,
        now: 1_700_000_000 + u32::try_from(seed).unwrap_or(u32::MAX / 2),
        success: true,
        in_msg,
        out_msgs,
    }
}

/// A successful treasury transaction that tells `to` its coins were saved
/// for `round_since`.
pub fn save_coin_tx(seed: u64, to: Address, round_since: u32) -> Transaction {
    let body = SaveCoin {
        query_id: seed,
        amount: BigUint::from(10_000_000_000u64),
        round_since,
    }
    .encode(None)
    .unwrap_or_else(|_| Cell::empty());
    let funding = Message {
        source: Some(to),
        destination: Some(treasury()),
        value: 10_150_000_000,
        body: Cell::empty(),
    };
    let save = Message {
        source: Some(treasury()),
        destination: Some(to),
        value: 100_000_000,
        body,
    };
    transaction(seed, Some(funding), vec![save])
}

/// A successful treasury transaction carrying a reserve-token request from
/// `from`.
pub fn reserve_token_tx(seed: u64, from: Address, tokens: u64) -> Transaction {
    let body = ReserveToken {
        query_id: seed,
        tokens: BigUint::from(tokens),
    }
    .encode(&from)
    .unwrap_or_else(|_| Cell::empty());
    let reserve = Message {
        source: Some(from),
        destination: Some(treasury()),
        value: 200_000_000,
        body,
    };
    transaction(seed, Some(reserve), Vec::new())
}

/// A transaction with nothing the driver cares about.
pub fn plain_tx(seed: u64) -> Transaction {
    let transfer = Message {
        source: Some(wallet(0xaa)),
        destination: Some(treasury()),
        value: 1_000_000_000,
        body: Cell::empty(),
    };
    transaction(seed, Some(transfer), Vec::new())
}

/// Marks a transaction as failed.
pub fn failed(mut tx: Transaction) -> Transaction {
    tx.success = false;
    tx
}

fn rounds_dict(rounds: &[u32]) -> StackValue {
    let entries: BTreeMap<u32, Cell> = rounds.iter().map(|round| (*round, Cell::empty())).collect();
    match build_dict_u32(&entries) {
        Ok(Some(root)) => StackValue::Cell(root),
        _ => StackValue::Null,
    }
}

fn int(value: i64) -> StackValue {
    StackValue::Int(BigInt::from(value))
}

/// A well-formed `get_treasury_state` answer with `participations` set.
pub fn treasury_state_stack(participations: &[u32]) -> Vec<StackValue> {
    vec![
        int(1_000_000_000_000),
        int(990_000_000_000),
        int(0),
        int(0),
        int(0),
        rounds_dict(participations),
        int(0),
        StackValue::Cell(Cell::empty()),
        StackValue::Cell(Cell::empty()),
        StackValue::Slice(Cell::empty()),
        StackValue::Slice(Cell::empty()),
        StackValue::Slice(Cell::empty()),
        StackValue::Null,
        int(4_096),
        StackValue::Null,
        StackValue::Cell(Cell::empty()),
    ]
}

/// A well-formed `get_wallet_state` answer.
pub fn wallet_state_stack(staking: &[u32], unstaking: u64) -> Vec<StackValue> {
    vec![
        int(0),
        rounds_dict(staking),
        StackValue::Int(BigInt::from(unstaking)),
    ]
}

fn info(seed: u64) -> TxInfo {
    TxInfo {
        value: 0,
        time: Utc::now(),
        hash: tx_hash(seed).to_hex(),
    }
}

/// A stored-looking stake request for `wallet`.
pub fn stake_request(seed: u64, wallet: Address, round_since: u32) -> Request<Stake> {
    Request::new(
        wallet.to_request_form(Network::Mainnet),
        Stake { round_since },
        info(seed),
    )
}

/// A stored-looking unstake request for `wallet`.
pub fn unstake_request(seed: u64, wallet: Address, tokens: u64) -> Request<Unstake> {
    Request::new(
        wallet.to_request_form(Network::Mainnet),
        Unstake {
            tokens: BigUint::from(tokens),
        },
        info(seed),
    )
}

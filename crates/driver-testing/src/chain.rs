use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use num_bigint::BigUint;
use treasury_driver::oracle::{GET_MAX_BURNABLE_TOKENS, GET_TREASURY_STATE, GET_WALLET_STATE};
use treasury_driver::{Address, ChainClient, OutgoingMessage, Signer, StackValue, Transaction, TxHash};

use crate::fixtures::{treasury_state_stack, wallet_state_stack};
use crate::store::lock;

/// Something the driver did against the chain, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    /// A message was handed to the signer while its seqno was `seqno`.
    Submitted { seqno: u32, opcode: Option<u32> },
    /// A seqno poll saw `seqno` for the first time.
    Confirmed { seqno: u32 },
}

/// A pagination request made against the history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryCall {
    Last { limit: u32 },
    From { limit: u32, lt: u64, hash: TxHash },
}

/// Scripted [`ChainClient`].
///
/// Holds one account's history (newest first), get-method answers for the
/// treasury and its wallets, and per-account seqnos that a
/// [`RecordingSigner`] advances when it sends.
pub struct MockChain {
    treasury: Address,
    history: Mutex<Vec<Transaction>>,
    history_calls: Mutex<Vec<HistoryCall>>,
    fail_history: AtomicBool,

    treasury_stack: Mutex<Vec<StackValue>>,
    budgets: Mutex<VecDeque<BigUint>>,
    wallet_stacks: DashMap<Address, Vec<StackValue>>,
    method_calls: DashMap<String, usize>,

    seqnos: DashMap<Address, u32>,
    confirmed: DashMap<Address, u32>,
    events: Mutex<Vec<ChainEvent>>,
    balance: AtomicU64,
}

impl MockChain {
    pub fn new(treasury: Address) -> Self {
        Self {
            treasury,
            history: Mutex::new(Vec::new()),
            history_calls: Mutex::new(Vec::new()),
            fail_history: AtomicBool::new(false),
            treasury_stack: Mutex::new(treasury_state_stack(&[])),
            budgets: Mutex::new(VecDeque::new()),
            wallet_stacks: DashMap::new(),
            method_calls: DashMap::new(),
            seqnos: DashMap::new(),
            confirmed: DashMap::new(),
            events: Mutex::new(Vec::new()),
            balance: AtomicU64::new(0),
        }
    }

    pub fn treasury(&self) -> Address {
        self.treasury
    }

    // ========================================================================
    // History
    // ========================================================================

    /// Appends a transaction as the newest one.
    pub fn push_transaction(&self, tx: Transaction) {
        lock(&self.history).insert(0, tx);
    }

    pub fn push_transactions(&self, txs: impl IntoIterator<Item = Transaction>) {
        for tx in txs {
            self.push_transaction(tx);
        }
    }

    pub fn set_history_failing(&self, failing: bool) {
        self.fail_history.store(failing, Ordering::SeqCst);
    }

    pub fn history_calls(&self) -> Vec<HistoryCall> {
        lock(&self.history_calls).clone()
    }

    // ========================================================================
    // Get-methods
    // ========================================================================

    pub fn set_participations(&self, rounds: &[u32]) {
        *lock(&self.treasury_stack) = treasury_state_stack(rounds);
    }

    pub fn set_treasury_stack(&self, stack: Vec<StackValue>) {
        *lock(&self.treasury_stack) = stack;
    }

    /// Budgets answered by successive max-burnable queries. The last one
    /// keeps being answered once the others are used up.
    pub fn set_budgets(&self, budgets: impl IntoIterator<Item = u64>) {
        *lock(&self.budgets) = budgets.into_iter().map(BigUint::from).collect();
    }

    pub fn set_wallet_state(&self, wallet: Address, staking: &[u32], unstaking: u64) {
        self.wallet_stacks
            .insert(wallet, wallet_state_stack(staking, unstaking));
    }

    pub fn set_wallet_stack(&self, wallet: Address, stack: Vec<StackValue>) {
        self.wallet_stacks.insert(wallet, stack);
    }

    pub fn method_calls(&self, method: &str) -> usize {
        self.method_calls.get(method).map_or(0, |count| *count)
    }

    // ========================================================================
    // Accounts
    // ========================================================================

    pub fn set_balance(&self, balance: u64) {
        self.balance.store(balance, Ordering::SeqCst);
    }

    pub fn seqno(&self, account: &Address) -> u32 {
        self.seqnos.get(account).map_or(0, |seqno| *seqno)
    }

    pub fn advance_seqno(&self, account: &Address) {
        *self.seqnos.entry(*account).or_insert(0) += 1;
    }

    pub fn events(&self) -> Vec<ChainEvent> {
        lock(&self.events).clone()
    }

    fn record_submit(&self, account: &Address, message: &OutgoingMessage) {
        let seqno = self.seqno(account);
        lock(&self.events).push(ChainEvent::Submitted {
            seqno,
            opcode: message.body.opcode(),
        });
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn get_last_transactions(&self, account: &Address, limit: u32) -> Result<Vec<Transaction>> {
        lock(&self.history_calls).push(HistoryCall::Last { limit });
        if self.fail_history.load(Ordering::SeqCst) {
            bail!("lite server timeout");
        }
        if *account != self.treasury {
            return Ok(Vec::new());
        }
        let history = lock(&self.history);
        Ok(history.iter().take(limit as usize).cloned().collect())
    }

    async fn get_transactions(
        &self,
        account: &Address,
        limit: u32,
        lt: u64,
        hash: TxHash,
    ) -> Result<Vec<Transaction>> {
        lock(&self.history_calls).push(HistoryCall::From { limit, lt, hash });
        if self.fail_history.load(Ordering::SeqCst) {
            bail!("lite server timeout");
        }
        if *account != self.treasury {
            return Ok(Vec::new());
        }
        let history = lock(&self.history);
        let start = history
            .iter()
            .position(|tx| tx.hash == hash && tx.lt == lt)
            .ok_or_else(|| anyhow!("cursor transaction {hash} not found"))?;
        Ok(history[start..].iter().take(limit as usize).cloned().collect())
    }

    async fn run_get_method(
        &self,
        account: &Address,
        method: &str,
        _args: Vec<StackValue>,
    ) -> Result<Vec<StackValue>> {
        *self.method_calls.entry(method.to_string()).or_insert(0) += 1;
        match method {
            GET_TREASURY_STATE if *account == self.treasury => Ok(lock(&self.treasury_stack).clone()),
            GET_MAX_BURNABLE_TOKENS if *account == self.treasury => {
                let mut budgets = lock(&self.budgets);
                let budget = if budgets.len() > 1 {
                    budgets.pop_front()
                } else {
                    budgets.front().cloned()
                };
                let budget = budget.ok_or_else(|| anyhow!("no burn budget scripted"))?;
                Ok(vec![StackValue::Int(budget.into())])
            }
            GET_WALLET_STATE => self
                .wallet_stacks
                .get(account)
                .map(|stack| stack.clone())
                .ok_or_else(|| anyhow!("account {account} is not initialized")),
            _ => bail!("method {method} failed with exit code 11"),
        }
    }

    async fn get_account_balance(&self, _account: &Address) -> Result<u64> {
        Ok(self.balance.load(Ordering::SeqCst))
    }

    async fn get_seqno(&self, account: &Address) -> Result<u32> {
        let seqno = self.seqno(account);
        let mut confirmed = self.confirmed.entry(*account).or_insert(0);
        if seqno > *confirmed {
            *confirmed = seqno;
            lock(&self.events).push(ChainEvent::Confirmed { seqno });
        }
        Ok(seqno)
    }
}

/// [`Signer`] that records what it sends and moves the signer's seqno on
/// the [`MockChain`] after `landing_delay`.
pub struct RecordingSigner {
    address: Address,
    chain: Arc<MockChain>,
    sent: Mutex<Vec<OutgoingMessage>>,
    landing_delay: Duration,
    lands: AtomicBool,
    rejects: AtomicBool,
}

impl RecordingSigner {
    pub fn new(address: Address, chain: Arc<MockChain>) -> Self {
        Self {
            address,
            chain,
            sent: Mutex::new(Vec::new()),
            landing_delay: Duration::ZERO,
            lands: AtomicBool::new(true),
            rejects: AtomicBool::new(false),
        }
    }

    /// Delay between a send and the seqno moving.
    pub fn with_landing_delay(mut self, delay: Duration) -> Self {
        self.landing_delay = delay;
        self
    }

    /// When false, sends are accepted but the seqno never moves.
    pub fn set_lands(&self, lands: bool) {
        self.lands.store(lands, Ordering::SeqCst);
    }

    /// When true, sends fail outright.
    pub fn set_rejects(&self, rejects: bool) {
        self.rejects.store(rejects, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutgoingMessage> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl Signer for RecordingSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<()> {
        if self.rejects.load(Ordering::SeqCst) {
            bail!("external message rejected");
        }
        self.chain.record_submit(&self.address, message);
        lock(&self.sent).push(message.clone());

        if self.lands.load(Ordering::SeqCst) {
            let chain = self.chain.clone();
            let address = self.address;
            let delay = self.landing_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                chain.advance_seqno(&address);
            });
        }
        Ok(())
    }
}

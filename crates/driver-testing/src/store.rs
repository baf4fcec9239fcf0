use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use treasury_driver::{Payload, Request, RequestState, RequestStore, TxInfo, WatermarkStore};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Row<P: Payload> {
    seq: u64,
    request: Request<P>,
}

/// In-memory [`RequestStore`] with the same transition rules as the
/// PostgreSQL store.
///
/// Every applied state change is recorded per hash, so tests can check the
/// exact path a request took.
pub struct MemoryRequestStore<P: Payload> {
    rows: DashMap<String, Row<P>>,
    transitions: DashMap<String, Vec<RequestState>>,
    next_seq: AtomicU64,
    unavailable: AtomicBool,
}

impl<P: Payload> Default for MemoryRequestStore<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Payload> MemoryRequestStore<P> {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            transitions: DashMap::new(),
            next_seq: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Seeds a request as-is, bypassing the upsert.
    pub fn insert(&self, request: Request<P>) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.rows.insert(request.hash.clone(), Row { seq, request });
    }

    /// Makes every call fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn get(&self, hash: &str) -> Option<Request<P>> {
        self.rows.get(hash).map(|row| row.request.clone())
    }

    pub fn state(&self, hash: &str) -> Option<RequestState> {
        self.rows.get(hash).map(|row| row.request.state)
    }

    /// States a request moved through, in order.
    pub fn transitions(&self, hash: &str) -> Vec<RequestState> {
        self.transitions
            .get(hash)
            .map(|states| states.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// All requests in insertion order.
    pub fn all(&self) -> Vec<Request<P>> {
        let mut rows: Vec<(u64, Request<P>)> = self
            .rows
            .iter()
            .map(|row| (row.seq, row.request.clone()))
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, request)| request).collect()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("request store unavailable");
        }
        Ok(())
    }

    fn select(&self, keep: impl Fn(&Request<P>) -> bool) -> Vec<Request<P>> {
        self.all().into_iter().filter(|request| keep(request)).collect()
    }

    fn transition(&self, hash: &str, target: RequestState, apply: impl FnOnce(&mut Request<P>)) -> Result<()> {
        self.check_available()?;
        let Some(mut row) = self.rows.get_mut(hash) else {
            return Ok(());
        };
        if !row.request.state.can_transition_to(target) {
            return Ok(());
        }
        row.request.state = target;
        apply(&mut row.request);
        drop(row);
        self.transitions.entry(hash.to_string()).or_default().push(target);
        Ok(())
    }
}

#[async_trait]
impl<P: Payload> RequestStore<P> for MemoryRequestStore<P> {
    async fn insert_if_not_exists(
        &self,
        address: &str,
        payload: &P,
        hash: &str,
        info: &TxInfo,
    ) -> Result<Request<P>> {
        self.check_available()?;
        let mut row = self.rows.entry(hash.to_string()).or_insert_with(|| Row {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            request: Request {
                address: address.to_string(),
                payload: payload.clone(),
                hash: hash.to_string(),
                state: RequestState::New,
                retried: 0,
                info: info.clone(),
                created_at: Utc::now(),
                retried_at: None,
                sent_at: None,
                verified_at: None,
            },
        });
        row.request.info = info.clone();
        Ok(row.request.clone())
    }

    async fn find(&self, hash: &str) -> Result<Option<Request<P>>> {
        self.check_available()?;
        Ok(self.get(hash))
    }

    async fn find_triable(&self, max_retry: u32) -> Result<Vec<Request<P>>> {
        self.check_available()?;
        Ok(self.select(|request| request.is_triable(max_retry)))
    }

    async fn find_verifiable(&self) -> Result<Vec<Request<P>>> {
        self.check_available()?;
        Ok(self.select(Request::is_verifiable))
    }

    async fn set_state(&self, hash: &str, state: RequestState) -> Result<()> {
        self.transition(hash, state, |_| {})
    }

    async fn set_retrying(&self, hash: &str, at: DateTime<Utc>) -> Result<()> {
        self.transition(hash, RequestState::Ongoing, |request| {
            request.retried += 1;
            request.retried_at = Some(at);
        })
    }

    async fn set_sent(&self, hash: &str, at: DateTime<Utc>) -> Result<()> {
        self.transition(hash, RequestState::Sent, |request| {
            request.sent_at = Some(at);
        })
    }

    async fn set_verified(&self, hash: &str, at: DateTime<Utc>) -> Result<()> {
        self.transition(hash, RequestState::Verified, |request| {
            request.verified_at.get_or_insert(at);
        })
    }
}

/// In-memory [`WatermarkStore`] that remembers every write.
#[derive(Default)]
pub struct MemoryWatermarkStore {
    current: Mutex<String>,
    writes: Mutex<Vec<String>>,
    unavailable: AtomicBool,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(hash: impl Into<String>) -> Self {
        Self {
            current: Mutex::new(hash.into()),
            ..Self::default()
        }
    }

    pub fn current(&self) -> String {
        lock(&self.current).clone()
    }

    /// Every hash written, oldest first.
    pub fn writes(&self) -> Vec<String> {
        lock(&self.writes).clone()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("watermark store unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn latest_processed_hash(&self) -> Result<String> {
        self.check_available()?;
        Ok(self.current())
    }

    async fn set_latest_processed_hash(&self, hash: &str) -> Result<()> {
        self.check_available()?;
        *lock(&self.current) = hash.to_string();
        lock(&self.writes).push(hash.to_string());
        Ok(())
    }
}

//! Unstake admission under the treasury's burn budget.
//!
//! Requests are served smallest first. The budget is read again before each
//! request since every admitted withdrawal lowers it. The first request that
//! does not fit ends the pass: everything after it is at least as large.

use std::sync::Arc;

use chrono::Utc;
use num_bigint::BigUint;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::body::{query_id_now, withdraw_message};
use crate::dispatch::DispatchQueue;
use crate::error::{DriverError, Result};
use crate::model::{RequestState, Unstake, UnstakeRequest};
use crate::oracle::Oracle;
use crate::store::RequestStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnstakeReport {
    pub dispatched: usize,
    pub skipped: usize,
    /// Left untouched because the wallet's total claim exceeds the budget.
    pub deferred: usize,
    pub failed: usize,
    /// Budget at the point the pass stopped early, if it did.
    pub exhausted_at: Option<BigUint>,
}

pub struct UnstakeAdmission {
    store: Arc<dyn RequestStore<Unstake>>,
    oracle: Oracle,
    queue: DispatchQueue,
    max_retry: u32,
}

enum Verdict {
    Dispatched,
    Skipped,
    Deferred,
    Failed,
}

impl UnstakeAdmission {
    pub fn new(
        store: Arc<dyn RequestStore<Unstake>>,
        oracle: Oracle,
        queue: DispatchQueue,
        max_retry: u32,
    ) -> Self {
        Self {
            store,
            oracle,
            queue,
            max_retry,
        }
    }

    pub async fn run_pass(&self) -> Result<UnstakeReport> {
        let mut report = UnstakeReport::default();

        let mut requests = self
            .store
            .find_triable(self.max_retry)
            .await
            .map_err(DriverError::Store)?;
        requests.sort_by(|a, b| a.tokens().cmp(b.tokens()));

        for request in requests {
            let budget = self.oracle.max_burnable_tokens().await?;
            if request.tokens() > &budget {
                info!(
                    tokens = %request.tokens(),
                    budget = %budget,
                    "burn budget exhausted, stopping unstake pass"
                );
                report.exhausted_at = Some(budget);
                break;
            }

            match self.admit(&request, &budget).await? {
                Verdict::Dispatched => report.dispatched += 1,
                Verdict::Skipped => report.skipped += 1,
                Verdict::Deferred => report.deferred += 1,
                Verdict::Failed => report.failed += 1,
            }
        }

        Ok(report)
    }

    async fn admit(&self, request: &UnstakeRequest, budget: &BigUint) -> Result<Verdict> {
        let wallet = match request.address.parse::<Address>() {
            Ok(wallet) => wallet,
            Err(err) => {
                warn!(address = %request.address, hash = %request.hash, error = %err, "invalid wallet address");
                return self.fail(request).await;
            }
        };

        let state = match self.oracle.wallet_state(&wallet).await {
            Ok(state) => state,
            Err(err) => {
                warn!(address = %request.address, error = %err, "reading wallet state failed");
                return self.fail(request).await;
            }
        };

        if !state.has_pending_unstake() {
            info!(address = %request.address, "wallet has nothing to withdraw, skipping");
            self.set_state(request, RequestState::Skipped).await?;
            return Ok(Verdict::Skipped);
        }

        if &state.unstaking > budget {
            debug!(
                address = %request.address,
                unstaking = %state.unstaking,
                budget = %budget,
                "wallet claim exceeds burn budget, deferring"
            );
            return Ok(Verdict::Deferred);
        }

        self.retrying(request).await?;
        let message = match withdraw_message(wallet, query_id_now()) {
            Ok(message) => message,
            Err(err) => {
                warn!(address = %request.address, error = %err, "building withdraw message failed");
                self.set_state(request, RequestState::Error).await?;
                return Ok(Verdict::Failed);
            }
        };
        if let Err(err) = self.queue.enqueue(request.clone(), message).await {
            warn!(address = %request.address, error = %err, "queueing withdraw message failed");
            self.set_state(request, RequestState::Error).await?;
            return Ok(Verdict::Failed);
        }

        info!(address = %request.address, tokens = %request.tokens(), "withdraw message queued");
        Ok(Verdict::Dispatched)
    }

    /// Guard failures count as an attempt.
    async fn fail(&self, request: &UnstakeRequest) -> Result<Verdict> {
        self.retrying(request).await?;
        self.set_state(request, RequestState::Error).await?;
        Ok(Verdict::Failed)
    }

    async fn retrying(&self, request: &UnstakeRequest) -> Result<()> {
        self.store
            .set_retrying(&request.hash, Utc::now())
            .await
            .map_err(DriverError::Store)
    }

    async fn set_state(&self, request: &UnstakeRequest, state: RequestState) -> Result<()> {
        self.store
            .set_state(&request.hash, state)
            .await
            .map_err(DriverError::Store)
    }
}

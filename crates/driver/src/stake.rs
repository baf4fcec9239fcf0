//! Stake admission.
//!
//! Triable stake requests are grouped by round. A round the treasury already
//! participates in needs nothing more, so its whole group is skipped. For the
//! rest, each wallet is asked whether it still waits for that round before a
//! stake-coin message is queued.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::address::Address;
use crate::body::{query_id_now, stake_coin_message};
use crate::dispatch::DispatchQueue;
use crate::error::{DriverError, Result};
use crate::model::{RequestState, Stake, StakeRequest};
use crate::oracle::Oracle;
use crate::store::RequestStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StakeReport {
    pub dispatched: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct StakeAdmission {
    store: Arc<dyn RequestStore<Stake>>,
    oracle: Oracle,
    queue: DispatchQueue,
    max_retry: u32,
}

impl StakeAdmission {
    pub fn new(
        store: Arc<dyn RequestStore<Stake>>,
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

    /// One admission pass. Fails only when the store or the treasury state
    /// is unavailable; per-request problems end up in the report.
    pub async fn run_pass(&self) -> Result<StakeReport> {
        let mut report = StakeReport::default();

        let requests = self
            .store
            .find_triable(self.max_retry)
            .await
            .map_err(DriverError::Store)?;
        if requests.is_empty() {
            return Ok(report);
        }

        let mut rounds: BTreeMap<u32, Vec<StakeRequest>> = BTreeMap::new();
        for request in requests {
            rounds.entry(request.round_since()).or_default().push(request);
        }

        let treasury = self.oracle.treasury_state().await?;

        for (round_since, group) in rounds {
            if treasury.has_participation(round_since) {
                info!(round_since, requests = group.len(), "round already funded, skipping");
                for request in &group {
                    self.set_state(request, RequestState::Skipped).await?;
                    report.skipped += 1;
                }
                continue;
            }

            for request in group {
                self.admit(request, &mut report).await?;
            }
        }

        Ok(report)
    }

    async fn admit(&self, request: StakeRequest, report: &mut StakeReport) -> Result<()> {
        let round_since = request.round_since();
        self.store
            .set_retrying(&request.hash, Utc::now())
            .await
            .map_err(DriverError::Store)?;

        let wallet = match request.address.parse::<Address>() {
            Ok(wallet) => wallet,
            Err(err) => {
                warn!(address = %request.address, hash = %request.hash, error = %err, "invalid wallet address");
                return self.fail(&request, report).await;
            }
        };

        let state = match self.oracle.wallet_state(&wallet).await {
            Ok(state) => state,
            Err(err) => {
                warn!(address = %request.address, error = %err, "reading wallet state failed");
                return self.fail(&request, report).await;
            }
        };

        if !state.is_awaiting(round_since) {
            info!(address = %request.address, round_since, "wallet is not waiting for a stake, skipping");
            self.set_state(&request, RequestState::Skipped).await?;
            report.skipped += 1;
            return Ok(());
        }

        let message = match stake_coin_message(wallet, query_id_now(), round_since) {
            Ok(message) => message,
            Err(err) => {
                warn!(address = %request.address, error = %err, "building stake-coin message failed");
                return self.fail(&request, report).await;
            }
        };

        let address = request.address.clone();
        if let Err(err) = self.queue.enqueue(request.clone(), message).await {
            warn!(%address, error = %err, "queueing stake-coin message failed");
            return self.fail(&request, report).await;
        }
        info!(%address, round_since, "stake-coin message queued");
        report.dispatched += 1;
        Ok(())
    }

    async fn fail(&self, request: &StakeRequest, report: &mut StakeReport) -> Result<()> {
        self.set_state(request, RequestState::Error).await?;
        report.failed += 1;
        Ok(())
    }

    async fn set_state(&self, request: &StakeRequest, state: RequestState) -> Result<()> {
        self.store
            .set_state(&request.hash, state)
            .await
            .map_err(DriverError::Store)
    }
}

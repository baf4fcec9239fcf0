//! Verification sweep over `sent` requests.
//!
//! A confirmed send only means the driver wallet accepted the message. The
//! sweep checks the target wallet to see whether the effect actually landed.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::address::Address;
use crate::error::{DriverError, Result};
use crate::model::{Payload, Request, RequestState, Stake, Unstake};
use crate::oracle::{Oracle, WalletState};
use crate::store::RequestStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub verified: usize,
    pub retriable: usize,
    /// Requests whose wallet could not be read this time.
    pub unchecked: usize,
}

impl std::ops::AddAssign for VerifyReport {
    fn add_assign(&mut self, other: Self) {
        self.verified += other.verified;
        self.retriable += other.retriable;
        self.unchecked += other.unchecked;
    }
}

/// Whether the effect of a sent request is visible in the wallet state.
pub trait Landed: Payload {
    fn landed(&self, state: &WalletState) -> bool;
}

impl Landed for Stake {
    fn landed(&self, state: &WalletState) -> bool {
        !state.is_awaiting(self.round_since)
    }
}

impl Landed for Unstake {
    fn landed(&self, state: &WalletState) -> bool {
        !state.has_pending_unstake()
    }
}

pub struct Verifier {
    stakes: Arc<dyn RequestStore<Stake>>,
    unstakes: Arc<dyn RequestStore<Unstake>>,
    oracle: Oracle,
}

impl Verifier {
    pub fn new(
        stakes: Arc<dyn RequestStore<Stake>>,
        unstakes: Arc<dyn RequestStore<Unstake>>,
        oracle: Oracle,
    ) -> Self {
        Self {
            stakes,
            unstakes,
            oracle,
        }
    }

    pub async fn run_pass(&self) -> Result<VerifyReport> {
        let mut report = self.sweep(self.stakes.as_ref()).await?;
        report += self.sweep(self.unstakes.as_ref()).await?;
        Ok(report)
    }

    pub async fn sweep<P: Landed>(&self, store: &dyn RequestStore<P>) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        let requests = store.find_verifiable().await.map_err(DriverError::Store)?;

        for request in requests {
            let Some(state) = self.wallet_state(&request).await else {
                report.unchecked += 1;
                continue;
            };

            if request.payload.landed(&state) {
                store
                    .set_verified(&request.hash, Utc::now())
                    .await
                    .map_err(DriverError::Store)?;
                info!(kind = %P::KIND, address = %request.address, hash = %request.hash, "request verified");
                report.verified += 1;
            } else {
                store
                    .set_state(&request.hash, RequestState::Retriable)
                    .await
                    .map_err(DriverError::Store)?;
                info!(kind = %P::KIND, address = %request.address, hash = %request.hash, "effect not visible yet, request is retriable");
                report.retriable += 1;
            }
        }

        Ok(report)
    }

    async fn wallet_state<P: Payload>(&self, request: &Request<P>) -> Option<WalletState> {
        let wallet = match request.address.parse::<Address>() {
            Ok(wallet) => wallet,
            Err(err) => {
                warn!(address = %request.address, error = %err, "invalid wallet address");
                return None;
            }
        };
        match self.oracle.wallet_state(&wallet).await {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(address = %request.address, error = %err, "reading wallet state failed");
                None
            }
        }
    }
}

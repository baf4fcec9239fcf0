//! Wiring and lifecycle of a running driver.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::chain::{ChainClient, Signer};
use crate::config::Settings;
use crate::dispatch::{self, Dispatcher};
use crate::error::ConfigError;
use crate::extract::Extractor;
use crate::model::{Stake, Unstake};
use crate::oracle::Oracle;
use crate::schedule;
use crate::stake::StakeAdmission;
use crate::store::{RequestStore, WatermarkStore};
use crate::unstake::UnstakeAdmission;
use crate::verify::Verifier;

/// Builder for [`Driver`].
///
/// ```ignore
/// let driver = DriverBuilder::new(settings)
///     .with_chain(chain)
///     .with_signer(signer)
///     .with_stake_store(stakes)
///     .with_unstake_store(unstakes)
///     .with_watermark_store(memos)
///     .build()?;
///
/// let handle = driver.start().await;
/// // ...
/// handle.shutdown().await;
/// ```
pub struct DriverBuilder {
    settings: Settings,
    chain: Option<Arc<dyn ChainClient>>,
    signer: Option<Arc<dyn Signer>>,
    stakes: Option<Arc<dyn RequestStore<Stake>>>,
    unstakes: Option<Arc<dyn RequestStore<Unstake>>>,
    watermark: Option<Arc<dyn WatermarkStore>>,
}

impl DriverBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            chain: None,
            signer: None,
            stakes: None,
            unstakes: None,
            watermark: None,
        }
    }

    pub fn with_chain(mut self, chain: Arc<dyn ChainClient>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_stake_store(mut self, store: Arc<dyn RequestStore<Stake>>) -> Self {
        self.stakes = Some(store);
        self
    }

    pub fn with_unstake_store(mut self, store: Arc<dyn RequestStore<Unstake>>) -> Self {
        self.unstakes = Some(store);
        self
    }

    pub fn with_watermark_store(mut self, store: Arc<dyn WatermarkStore>) -> Self {
        self.watermark = Some(store);
        self
    }

    pub fn build(self) -> Result<Driver, ConfigError> {
        Ok(Driver {
            chain: self.chain.ok_or(ConfigError::Missing("chain client"))?,
            signer: self.signer.ok_or(ConfigError::Missing("signer"))?,
            stakes: self.stakes.ok_or(ConfigError::Missing("stake store"))?,
            unstakes: self.unstakes.ok_or(ConfigError::Missing("unstake store"))?,
            watermark: self
                .watermark
                .ok_or(ConfigError::Missing("watermark store"))?,
            settings: self.settings,
        })
    }
}

/// A fully wired driver, not yet running.
pub struct Driver {
    settings: Settings,
    chain: Arc<dyn ChainClient>,
    signer: Arc<dyn Signer>,
    stakes: Arc<dyn RequestStore<Stake>>,
    unstakes: Arc<dyn RequestStore<Unstake>>,
    watermark: Arc<dyn WatermarkStore>,
}

impl Driver {
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Spawns the dispatcher, both response listeners and the four periodic
    /// passes.
    pub async fn start(self) -> DriverHandle {
        self.log_startup().await;

        let settings = &self.settings;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(7);

        let (queue, envelopes) = dispatch::queue(settings.queue_capacity);
        let (stake_responses, stake_responses_rx) = mpsc::channel(settings.queue_capacity);
        let (unstake_responses, unstake_responses_rx) = mpsc::channel(settings.queue_capacity);

        let dispatcher = Dispatcher::new(
            self.chain.clone(),
            self.signer.clone(),
            envelopes,
            stake_responses,
            unstake_responses,
        )
        .with_timing(settings.dispatch);
        tasks.push(tokio::spawn(dispatcher.run(shutdown_rx.clone())));
        tasks.push(tokio::spawn(dispatch::listen(
            self.stakes.clone(),
            stake_responses_rx,
        )));
        tasks.push(tokio::spawn(dispatch::listen(
            self.unstakes.clone(),
            unstake_responses_rx,
        )));

        let oracle = Oracle::new(self.chain.clone(), settings.treasury);

        let extractor = Arc::new(
            Extractor::new(
                self.chain.clone(),
                self.watermark.clone(),
                self.stakes.clone(),
                self.unstakes.clone(),
                settings.treasury,
                settings.network,
            )
            .with_page_sizes(settings.pages),
        );
        tasks.push(tokio::spawn(schedule::every(
            "extract",
            settings.extract_interval,
            shutdown_rx.clone(),
            move || {
                let extractor = extractor.clone();
                async move { extractor.run_pass().await }
            },
        )));

        let stake = Arc::new(StakeAdmission::new(
            self.stakes.clone(),
            oracle.clone(),
            queue.clone(),
            settings.max_retry,
        ));
        tasks.push(tokio::spawn(schedule::every(
            "stake",
            settings.stake_interval,
            shutdown_rx.clone(),
            move || {
                let stake = stake.clone();
                async move { stake.run_pass().await }
            },
        )));

        let unstake = Arc::new(UnstakeAdmission::new(
            self.unstakes.clone(),
            oracle.clone(),
            queue,
            settings.max_retry,
        ));
        tasks.push(tokio::spawn(schedule::every(
            "unstake",
            settings.unstake_interval,
            shutdown_rx.clone(),
            move || {
                let unstake = unstake.clone();
                async move { unstake.run_pass().await }
            },
        )));

        let verifier = Arc::new(Verifier::new(
            self.stakes.clone(),
            self.unstakes.clone(),
            oracle,
        ));
        tasks.push(tokio::spawn(schedule::every(
            "verify",
            settings.verify_interval,
            shutdown_rx,
            move || {
                let verifier = verifier.clone();
                async move { verifier.run_pass().await }
            },
        )));

        DriverHandle { shutdown, tasks }
    }

    async fn log_startup(&self) {
        let settings = &self.settings;
        let signer = self.signer.address();
        info!(
            network = %settings.network,
            treasury = %settings.treasury.to_request_form(settings.network),
            signer = %signer.to_request_form(settings.network),
            extract_interval = ?settings.extract_interval,
            stake_interval = ?settings.stake_interval,
            unstake_interval = ?settings.unstake_interval,
            verify_interval = ?settings.verify_interval,
            max_retry = settings.max_retry,
            "starting treasury driver"
        );
        match self.chain.get_account_balance(&signer).await {
            Ok(balance) => info!(balance, "signer wallet balance"),
            Err(err) => warn!(error = %err, "reading signer wallet balance failed"),
        }
    }
}

/// Handle to a running driver.
pub struct DriverHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DriverHandle {
    /// Signals every task to stop and waits for them. Running passes and an
    /// in-flight dispatch finish first; the response listeners stop once the
    /// dispatcher has routed its last response.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in join_all(self.tasks).await {
            if let Err(err) = result {
                error!(error = %err, "driver task ended abnormally");
            }
        }
        info!("treasury driver stopped");
    }
}

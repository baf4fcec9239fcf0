//! Transaction extraction.
//!
//! Walks the treasury's history from the newest transaction back to the
//! watermark, turning relevant messages into `new` requests.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::address::{Address, Network};
use crate::body::{ReserveToken, SaveCoin, OP_RESERVE_TOKEN, OP_SAVE_COIN};
use crate::chain::{ChainClient, Transaction};
use crate::error::{DriverError, Result};
use crate::model::{Request, Stake, StakeRequest, TxInfo, Unstake, UnstakeRequest};
use crate::store::{RequestStore, WatermarkStore};

/// Turns transactions into request candidates.
#[derive(Debug, Clone, Copy)]
pub struct Classifier {
    network: Network,
}

impl Classifier {
    pub fn new(network: Network) -> Self {
        Self { network }
    }

    pub fn classify(&self, transactions: &[Transaction]) -> (Vec<StakeRequest>, Vec<UnstakeRequest>) {
        let mut stakes = Vec::new();
        let mut unstakes = Vec::new();
        for tx in transactions.iter().filter(|tx| tx.success) {
            if let Some(stake) = self.stake_candidate(tx) {
                stakes.push(stake);
            }
            if let Some(unstake) = self.unstake_candidate(tx) {
                unstakes.push(unstake);
            }
        }
        (stakes, unstakes)
    }

    fn info(tx: &Transaction) -> TxInfo {
        TxInfo {
            value: tx.value(),
            time: tx.time(),
            hash: tx.hash.to_hex(),
        }
    }

    /// A single outgoing save-coin message names the wallet and its round.
    pub fn stake_candidate(&self, tx: &Transaction) -> Option<StakeRequest> {
        let matches = tx.out_msgs_with_opcode(OP_SAVE_COIN);
        let msg = match matches.as_slice() {
            [] => return None,
            [msg] => *msg,
            _ => {
                warn!(
                    hash = %tx.hash,
                    count = matches.len(),
                    "more than one save-coin message in one transaction, skipping"
                );
                return None;
            }
        };
        let Some(wallet) = msg.destination else {
            warn!(hash = %tx.hash, "save-coin message without destination, skipping");
            return None;
        };
        let save_coin = match SaveCoin::decode(&msg.body) {
            Ok(save_coin) => save_coin,
            Err(err) => {
                warn!(hash = %tx.hash, error = %err, "decoding save-coin body failed, skipping");
                return None;
            }
        };
        Some(Request::new(
            wallet.to_request_form(self.network),
            Stake {
                round_since: save_coin.round_since,
            },
            Self::info(tx),
        ))
    }

    /// An incoming reserve-token message names the wallet and the tokens.
    pub fn unstake_candidate(&self, tx: &Transaction) -> Option<UnstakeRequest> {
        let msg = tx.in_msg_with_opcode(OP_RESERVE_TOKEN)?;
        let Some(wallet) = msg.source else {
            warn!(hash = %tx.hash, "reserve-token message without source, skipping");
            return None;
        };
        let reserve = match ReserveToken::decode(&msg.body) {
            Ok(reserve) => reserve,
            Err(err) => {
                warn!(hash = %tx.hash, error = %err, "decoding reserve-token body failed, skipping");
                return None;
            }
        };
        Some(Request::new(
            wallet.to_request_form(self.network),
            Unstake {
                tokens: reserve.tokens,
            },
            Self::info(tx),
        ))
    }
}

/// Candidates found by one walk over the history.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub stakes: Vec<StakeRequest>,
    pub unstakes: Vec<UnstakeRequest>,
    /// Transactions newer than the watermark.
    pub seen: usize,
    /// Hash of the newest transaction on chain, if there is one.
    pub newest_hash: Option<String>,
}

/// Outcome of one extraction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractReport {
    pub seen: usize,
    pub stakes: usize,
    pub unstakes: usize,
    pub watermark_moved: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PageSizes {
    /// First page, read from the head of the history.
    pub first: u32,
    /// Following pages, read from a cursor.
    pub next: u32,
}

impl Default for PageSizes {
    fn default() -> Self {
        Self { first: 50, next: 16 }
    }
}

pub struct Extractor {
    chain: Arc<dyn ChainClient>,
    watermark: Arc<dyn WatermarkStore>,
    stakes: Arc<dyn RequestStore<Stake>>,
    unstakes: Arc<dyn RequestStore<Unstake>>,
    treasury: Address,
    classifier: Classifier,
    pages: PageSizes,
}

impl Extractor {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        watermark: Arc<dyn WatermarkStore>,
        stakes: Arc<dyn RequestStore<Stake>>,
        unstakes: Arc<dyn RequestStore<Unstake>>,
        treasury: Address,
        network: Network,
    ) -> Self {
        Self {
            chain,
            watermark,
            stakes,
            unstakes,
            treasury,
            classifier: Classifier::new(network),
            pages: PageSizes::default(),
        }
    }

    pub fn with_page_sizes(mut self, pages: PageSizes) -> Self {
        self.pages = pages;
        self
    }

    /// Reads every transaction newer than `watermark`. Any chain failure
    /// aborts the walk.
    pub async fn extract(&self, watermark: &str) -> Result<Extraction> {
        let mut extraction = Extraction::default();

        let mut page = self
            .chain
            .get_last_transactions(&self.treasury, self.pages.first)
            .await
            .map_err(DriverError::Chain)?;

        extraction.newest_hash = page.first().map(|tx| tx.hash.to_hex());
        match extraction.newest_hash.as_deref() {
            None => {
                debug!("treasury has no transactions yet");
                return Ok(extraction);
            }
            Some(newest) if newest == watermark => {
                debug!("no new transaction to process");
                return Ok(extraction);
            }
            Some(_) => {}
        }

        loop {
            let processed = page.iter().position(|tx| tx.hash.to_hex() == watermark);
            let batch = &page[..processed.unwrap_or(page.len())];

            let (stakes, unstakes) = self.classifier.classify(batch);
            info!(
                total = batch.len(),
                stakes = stakes.len(),
                unstakes = unstakes.len(),
                "processing transactions"
            );
            extraction.seen += batch.len();
            extraction.stakes.extend(stakes);
            extraction.unstakes.extend(unstakes);

            if processed.is_some() {
                break;
            }
            let Some(oldest) = page.last() else {
                break;
            };

            let (cursor_lt, cursor_hash) = (oldest.lt, oldest.hash);
            let mut next = self
                .chain
                .get_transactions(&self.treasury, self.pages.next, cursor_lt, cursor_hash)
                .await
                .map_err(DriverError::Chain)?;
            if next.first().is_some_and(|tx| tx.hash == cursor_hash) {
                next.remove(0);
            }
            if next.is_empty() {
                debug!("reached the beginning of the history");
                break;
            }
            page = next;
        }

        Ok(extraction)
    }

    /// Upserts every candidate. Stops at the first repository failure.
    pub async fn store(&self, extraction: &Extraction) -> Result<()> {
        for request in &extraction.stakes {
            self.stakes
                .insert_if_not_exists(&request.address, &request.payload, &request.hash, &request.info)
                .await
                .map_err(DriverError::Store)?;
        }
        for request in &extraction.unstakes {
            self.unstakes
                .insert_if_not_exists(&request.address, &request.payload, &request.hash, &request.info)
                .await
                .map_err(DriverError::Store)?;
        }
        Ok(())
    }

    /// Extract, store, then move the watermark to the newest transaction.
    ///
    /// The watermark only moves once every candidate is stored, so a failed
    /// pass is repeated in full next time and upserts absorb the overlap.
    pub async fn run_pass(&self) -> Result<ExtractReport> {
        let watermark = self
            .watermark
            .latest_processed_hash()
            .await
            .map_err(DriverError::Store)?;

        let extraction = self.extract(&watermark).await?;
        self.store(&extraction).await?;

        let mut report = ExtractReport {
            seen: extraction.seen,
            stakes: extraction.stakes.len(),
            unstakes: extraction.unstakes.len(),
            watermark_moved: false,
        };

        if let Some(newest) = extraction.newest_hash.as_deref() {
            if newest != watermark {
                self.watermark
                    .set_latest_processed_hash(newest)
                    .await
                    .map_err(DriverError::Store)?;
                report.watermark_moved = true;
            }
        }

        for request in &extraction.stakes {
            info!(address = %request.address, round_since = request.round_since(), hash = %request.hash, "stake request found");
        }
        for request in &extraction.unstakes {
            info!(address = %request.address, tokens = %request.tokens(), hash = %request.hash, "unstake request found");
        }

        Ok(report)
    }
}

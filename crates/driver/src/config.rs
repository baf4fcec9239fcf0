//! Driver configuration.
//!
//! [`DriverConfig`] is the plain, deserializable form. [`DriverConfig::validate`]
//! turns it into [`Settings`], the typed form the driver runs with.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::{Address, Network};
use crate::dispatch::DispatchTiming;
use crate::error::ConfigError;
use crate::extract::PageSizes;

fn default_dispatch_timeout_secs() -> u64 {
    30
}

fn default_seqno_poll_interval_ms() -> u64 {
    500
}

fn default_queue_capacity() -> usize {
    10
}

fn default_first_page_size() -> u32 {
    50
}

fn default_page_size() -> u32 {
    16
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub network: Network,
    pub treasury_address: String,
    pub extract_interval_secs: u64,
    pub stake_interval_secs: u64,
    pub unstake_interval_secs: u64,
    pub verify_interval_secs: u64,
    pub max_retry: u32,
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,
    #[serde(default = "default_seqno_poll_interval_ms")]
    pub seqno_poll_interval_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_first_page_size")]
    pub first_page_size: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub network: Network,
    pub treasury: Address,
    pub extract_interval: Duration,
    pub stake_interval: Duration,
    pub unstake_interval: Duration,
    pub verify_interval: Duration,
    pub max_retry: u32,
    pub dispatch: DispatchTiming,
    pub queue_capacity: usize,
    pub pages: PageSizes,
}

fn interval(secs: u64, process: &'static str) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::InvalidInterval(process));
    }
    Ok(Duration::from_secs(secs))
}

impl DriverConfig {
    pub fn validate(&self) -> Result<Settings, ConfigError> {
        let treasury: Address = self.treasury_address.parse()?;

        if self.max_retry == 0 {
            return Err(ConfigError::Zero("max_retry"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue_capacity"));
        }
        if self.first_page_size == 0 {
            return Err(ConfigError::Zero("first_page_size"));
        }
        if self.page_size == 0 {
            return Err(ConfigError::Zero("page_size"));
        }
        if self.dispatch_timeout_secs == 0 {
            return Err(ConfigError::Zero("dispatch_timeout_secs"));
        }
        if self.seqno_poll_interval_ms == 0 {
            return Err(ConfigError::Zero("seqno_poll_interval_ms"));
        }

        Ok(Settings {
            network: self.network,
            treasury,
            extract_interval: interval(self.extract_interval_secs, "extract")?,
            stake_interval: interval(self.stake_interval_secs, "stake")?,
            unstake_interval: interval(self.unstake_interval_secs, "unstake")?,
            verify_interval: interval(self.verify_interval_secs, "verify")?,
            max_retry: self.max_retry,
            dispatch: DispatchTiming {
                timeout: Duration::from_secs(self.dispatch_timeout_secs),
                poll_interval: Duration::from_millis(self.seqno_poll_interval_ms),
            },
            queue_capacity: self.queue_capacity,
            pages: PageSizes {
                first: self.first_page_size,
                next: self.page_size,
            },
        })
    }
}

use crate::snapshot::DEFAULT_CLICK_COST;
use std::{
    path::PathBuf,
    time::Duration,
};

pub const DEFAULT_SERVER_URL: &str = "http://localhost:8001";
pub const DEFAULT_PASSIVE_INCOME_PERIOD: Duration = Duration::from_secs(30);
pub const DEFAULT_ENERGY_REGEN_PERIOD: Duration = Duration::from_secs(10);
pub const DEFAULT_NOTIFICATION_TTL: Duration = Duration::from_secs(3);

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub server_url: String,
    /// Energy spent per click. Kept configurable until the server exposes it.
    pub click_cost: u32,
    pub passive_income_period: Duration,
    pub energy_regen_period: Duration,
    pub notification_ttl: Duration,
    /// Directory for the on-disk snapshot cache; in-memory when unset.
    pub cache_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            click_cost: DEFAULT_CLICK_COST,
            passive_income_period: DEFAULT_PASSIVE_INCOME_PERIOD,
            energy_regen_period: DEFAULT_ENERGY_REGEN_PERIOD,
            notification_ttl: DEFAULT_NOTIFICATION_TTL,
            cache_dir: None,
        }
    }
}

impl SyncConfig {
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn with_click_cost(mut self, click_cost: u32) -> Self {
        self.click_cost = click_cost;
        self
    }

    pub fn with_passive_income_period(mut self, period: Duration) -> Self {
        self.passive_income_period = period;
        self
    }

    pub fn with_energy_regen_period(mut self, period: Duration) -> Self {
        self.energy_regen_period = period;
        self
    }

    pub fn with_notification_ttl(mut self, ttl: Duration) -> Self {
        self.notification_ttl = ttl;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }
}

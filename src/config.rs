use config::{Config, ConfigError, File};
use serde::Deserialize;

/// Top-level settings: chain connection, grid geometry, fund allocation,
/// dry-run flag, logging.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub network: NetworkConfig,
    pub grid: GridConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Ordered list of witness/full node endpoints; `chain::NodeManager`
    /// rotates between them on transient failure.
    pub endpoints: Vec<String>,
    /// On-chain account id this bot trades from.
    pub account_id: String,
    /// Reference to the signing key (not the key itself — resolved by
    /// whatever wallet layer sits outside this crate).
    pub wallet_private_key: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    crate::consts::MAX_API_RETRIES
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

/// Where the grid's starting price comes from.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPriceSource {
    Pool,
    Orderbook,
    Fixed(f64),
}

/// A price bound expressed either as a multiplier of the start price or
/// as an absolute value.
#[derive(Debug, Clone, Deserialize)]
pub enum PriceBound {
    Multiplier(f64),
    Fixed(f64),
}

impl PriceBound {
    pub fn resolve(&self, start_price: f64) -> f64 {
        match self {
            PriceBound::Multiplier(m) => start_price * m,
            PriceBound::Fixed(v) => *v,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SideCounts {
    pub buy: usize,
    pub sell: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SideWeights {
    pub buy: f64,
    pub sell: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotFunds {
    /// Fraction (0-1) of available quote-asset funds allocated to the
    /// buy side; the remainder funds the sell side in base asset.
    pub buy_percent: f64,
    pub sell_percent: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GridConfig {
    pub start_price: StartPriceSource,
    pub min_price: PriceBound,
    pub max_price: PriceBound,
    pub increment_percent: f64,
    pub target_spread_percent: f64,
    pub active_orders: SideCounts,
    pub weight_distribution: SideWeights,
    pub bot_funds: BotFunds,
    pub asset_a: String,
    pub asset_b: String,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from `config_path`, then apply environment overrides
    /// prefixed `APP__` with `__` as the nesting separator (e.g.
    /// `APP__NETWORK__ACCOUNT_ID=1.2.345`).
    pub fn new(config_path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

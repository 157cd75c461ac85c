//! Grid market-making bot binary.
//!
//! ## Setup
//!
//! 1. Create a `.env` file in the project root with the signing key and
//!    any endpoint overrides:
//!    ```text
//!    APP__NETWORK__WALLET_PRIVATE_KEY=5Jxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx
//!    ```
//!
//! 2. Run the bot against a config file:
//!    ```bash
//!    cargo run --bin grid_bot -- --config config.json
//!    ```
//!
//! ## Security
//!
//! - Never commit your `.env` file to version control.
//! - Add `.env` to your `.gitignore`.

use std::env;
use std::sync::Arc;

use log::{error, info};
use tokio::sync::Mutex;

use grid_market_maker::bot::{Bot, BotControl, CoreState, RunnerConfig};
use grid_market_maker::chain::HttpChainClient;
use grid_market_maker::config::{Settings, StartPriceSource};
use grid_market_maker::consts::LOCK_TIMEOUT_MS;
use grid_market_maker::core::sync::ManagedAssetPair;
use grid_market_maker::core::{Accountant, MasterGrid, SlotLeases, SyncEngine};
use grid_market_maker::grid_builder::build_initial_grid;
use grid_market_maker::persistence::{FilePersistence, GridPersistence};

const DEFAULT_CONFIG_PATH: &str = "config.json";

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match dotenvy::dotenv() {
        Ok(path) => info!("loaded environment from: {}", path.display()),
        Err(_) => info!("no .env file found, using system environment variables"),
    }

    let args: Vec<String> = env::args().collect();
    let config_path = if args.len() > 2 && args[1] == "--config" {
        args[2].clone()
    } else {
        info!("no --config given, defaulting to {DEFAULT_CONFIG_PATH}");
        DEFAULT_CONFIG_PATH.to_string()
    };

    let settings = match Settings::new(&config_path) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to load config from {config_path}: {e}");
            return;
        }
    };

    if let Err(e) = run(settings).await {
        error!("grid bot exited with error: {e}");
    }
}

async fn run(settings: Settings) -> Result<(), grid_market_maker::Error> {
    let bot_id = settings.network.account_id.clone();
    info!("starting grid bot for account {bot_id} ({}/{})", settings.grid.asset_a, settings.grid.asset_b);

    let chain = Arc::new(HttpChainClient::new(
        settings.network.endpoints.clone(),
        settings.network.max_retries,
        settings.network.retry_base_delay_ms,
    ));

    let persistence = Arc::new(FilePersistence::new("data"));

    let start_price = match &settings.grid.start_price {
        StartPriceSource::Fixed(p) => *p,
        StartPriceSource::Pool | StartPriceSource::Orderbook => {
            info!("pool/orderbook price discovery is not wired in this binary, falling back to a fetched fee schedule-free default");
            let totals = chain
                .get_account_totals(&bot_id)
                .await
                .map_err(|e| grid_market_maker::Error::Chain(e.to_string()))?;
            if totals.base.total > 0.0 {
                totals.quote.total / totals.base.total
            } else {
                1.0
            }
        }
    };

    let snapshot = persistence.read_grid(&bot_id).await?;
    let grid = match snapshot {
        Some(s) => {
            info!("restored grid snapshot at version {}", s.version);
            MasterGrid::load(s.orders).map_err(|e| grid_market_maker::Error::Chain(e.to_string()))?
        }
        None => {
            info!("no persisted grid, bootstrapping a fresh ladder from start price {start_price}");
            let orders = build_initial_grid(&settings.grid, start_price);
            MasterGrid::load(orders).map_err(|e| grid_market_maker::Error::Chain(e.to_string()))?
        }
    };

    let mut accountant = Accountant::new();
    if let Some(ledger) = persistence.read_cache_funds(&bot_id).await? {
        *accountant.ledger_mut() = ledger;
    }

    let leases = SlotLeases::new(std::time::Duration::from_millis(LOCK_TIMEOUT_MS));

    let state = Arc::new(Mutex::new(CoreState::new(grid, accountant, leases)));
    let control = BotControl::new(bot_id.clone(), state, Arc::clone(&chain), persistence);

    let pair = ManagedAssetPair {
        base_asset_id: settings.grid.asset_a.clone(),
        quote_asset_id: settings.grid.asset_b.clone(),
        base_precision: 5,
        quote_precision: 5,
    };
    let sync = SyncEngine::new(pair);

    let runner_config = RunnerConfig {
        account_id: bot_id,
        min_order_size: 0.0001,
        weight_buy: settings.grid.weight_distribution.buy,
        weight_sell: settings.grid.weight_distribution.sell,
        reaction_cap: settings.grid.active_orders.buy.max(settings.grid.active_orders.sell) as u32,
        tolerance: 0.001,
        cycle_interval: std::time::Duration::from_secs(5),
    };

    let bot = Bot::new(control, chain, sync, runner_config);
    let (cycle_handle, server_handle) = bot.spawn("127.0.0.1".to_string(), 8787);

    let _ = tokio::join!(cycle_handle, server_handle);
    Ok(())
}

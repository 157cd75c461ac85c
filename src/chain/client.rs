//! Chain client: the five external interface calls the order manager
//! consumes (`getOpenOrders`, `getFillHistory`, `getAccountTotals`,
//! `broadcastBatch`), plus the bot-level account id/asset pair wiring.

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;

use crate::core::errors::CoreError;
use crate::core::pipeline::{Action, BroadcastResult, ChainClient};
use crate::core::sync::{AssetAmount, ChainOrder, FillOp};
use crate::core::types::AccountTotals;

use super::node_manager::NodeManager;

/// Per-asset account totals as returned by `getAccountTotals`.
#[derive(Debug, Clone, Default)]
pub struct AccountBalances {
    pub base: AccountTotals,
    pub quote: AccountTotals,
}

/// Market and per-operation fee rates as returned by `getFeeSchedule`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeeSchedule {
    pub create_fee: f64,
    pub update_fee: f64,
    pub cancel_fee: f64,
    pub market_fee_percent: f64,
    pub taker_fee_percent: f64,
    pub maker_fee_percent: f64,
    pub maker_refund_percent: f64,
}

/// The read side of the chain RPC surface: the queries the sync engine
/// needs that the COW pipeline itself has no use for. Kept separate from
/// `core::pipeline::ChainClient` (broadcast only) so the pipeline's test
/// doubles don't have to stub reads they never call.
#[async_trait]
pub trait ChainDataSource: Send + Sync {
    async fn get_open_orders(&self, account_id: &str) -> Result<Vec<ChainOrder>, CoreError>;

    async fn get_fill_history(
        &self,
        account_id: &str,
        cursor: Option<&str>,
    ) -> Result<Vec<FillOp>, CoreError>;

    async fn get_account_totals(&self, account_id: &str) -> Result<AccountBalances, CoreError>;

    async fn get_fee_schedule(&self) -> Result<FeeSchedule, CoreError>;
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    message: String,
}

/// HTTP JSON-RPC client for the managed chain's witness/full node,
/// wrapping every call in the node manager's endpoint-rotating retry
/// loop.
pub struct HttpChainClient {
    http: reqwest::Client,
    nodes: tokio::sync::Mutex<NodeManager>,
}

impl HttpChainClient {
    pub fn new(endpoints: Vec<String>, max_retries: u32, retry_base_delay_ms: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            nodes: tokio::sync::Mutex::new(NodeManager::new(endpoints, max_retries, retry_base_delay_ms)),
        }
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, CoreError> {
        let mut nodes = self.nodes.lock().await;
        let method = method.to_string();
        nodes
            .with_retry(|endpoint| {
                let http = self.http.clone();
                let method = method.clone();
                let params = params.clone();
                async move {
                    debug!("calling {method} on {endpoint}");
                    let response = http
                        .post(&endpoint)
                        .json(&serde_json::json!({
                            "jsonrpc": "2.0",
                            "id": 1,
                            "method": method,
                            "params": params,
                        }))
                        .send()
                        .await
                        .map_err(|e| CoreError::ChainTransient(e.to_string()))?;

                    let envelope: RpcEnvelope<T> = response
                        .json()
                        .await
                        .map_err(|e| CoreError::ChainTransient(e.to_string()))?;

                    match (envelope.result, envelope.error) {
                        (Some(result), _) => Ok(result),
                        (None, Some(err)) => Err(CoreError::ChainTransient(err.message)),
                        (None, None) => Err(CoreError::ChainTransient("empty rpc response".into())),
                    }
                }
            })
            .await
    }
}

#[async_trait]
impl ChainDataSource for HttpChainClient {
    async fn get_open_orders(&self, account_id: &str) -> Result<Vec<ChainOrder>, CoreError> {
        #[derive(Deserialize)]
        struct Wire {
            id: String,
            sell_price: WireSellPrice,
            for_sale: String,
        }
        #[derive(Deserialize)]
        struct WireSellPrice {
            base: WireAmount,
            quote: WireAmount,
        }
        #[derive(Deserialize)]
        struct WireAmount {
            amount: String,
            asset_id: String,
        }

        let wire: Vec<Wire> = self
            .call("get_full_accounts", serde_json::json!([account_id]))
            .await?;

        Ok(wire
            .into_iter()
            .map(|w| ChainOrder {
                id: w.id,
                sell_price_base: AssetAmount {
                    amount: w.sell_price.base.amount.parse().unwrap_or(0.0),
                    asset_id: w.sell_price.base.asset_id,
                },
                sell_price_quote: AssetAmount {
                    amount: w.sell_price.quote.amount.parse().unwrap_or(0.0),
                    asset_id: w.sell_price.quote.asset_id,
                },
                for_sale: w.for_sale.parse().unwrap_or(0.0),
            })
            .collect())
    }

    async fn get_fill_history(
        &self,
        account_id: &str,
        cursor: Option<&str>,
    ) -> Result<Vec<FillOp>, CoreError> {
        #[derive(Deserialize)]
        struct Wire {
            block_num: u64,
            id: String,
            order_id: String,
            pays_amount: String,
            pays_asset_id: String,
            receives_amount: String,
            receives_asset_id: String,
            #[serde(default = "default_true")]
            is_maker: bool,
        }
        fn default_true() -> bool {
            true
        }

        let wire: Vec<Wire> = self
            .call(
                "get_account_history_operations",
                serde_json::json!([account_id, 4, cursor]),
            )
            .await?;

        Ok(wire
            .into_iter()
            .map(|w| FillOp {
                block_num: w.block_num,
                id: w.id,
                order_id: w.order_id,
                pays: AssetAmount {
                    amount: w.pays_amount.parse().unwrap_or(0.0),
                    asset_id: w.pays_asset_id,
                },
                receives: AssetAmount {
                    amount: w.receives_amount.parse().unwrap_or(0.0),
                    asset_id: w.receives_asset_id,
                },
                is_maker: w.is_maker,
            })
            .collect())
    }

    async fn get_account_totals(&self, account_id: &str) -> Result<AccountBalances, CoreError> {
        self.call("get_account_balances", serde_json::json!([account_id]))
            .await
    }

    async fn get_fee_schedule(&self) -> Result<FeeSchedule, CoreError> {
        self.call("get_fee_schedule", serde_json::json!([])).await
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn broadcast_batch(&self, actions: Vec<Action>) -> Result<Vec<BroadcastResult>, CoreError> {
        #[derive(serde::Serialize)]
        #[serde(tag = "type")]
        enum WireAction {
            Create { slot_id: String, price: f64, size: f64, is_buy: bool },
            Cancel { slot_id: String, chain_order_id: String },
            Update { slot_id: String, chain_order_id: String, new_price: Option<f64>, new_size: Option<f64> },
        }

        let wire_actions: Vec<WireAction> = actions
            .iter()
            .map(|a| match a {
                Action::Create { slot_id, price, size, kind } => WireAction::Create {
                    slot_id: slot_id.clone(),
                    price: *price,
                    size: *size,
                    is_buy: matches!(kind, crate::core::types::OrderKind::Buy),
                },
                Action::Cancel { slot_id, chain_order_id } => WireAction::Cancel {
                    slot_id: slot_id.clone(),
                    chain_order_id: chain_order_id.clone(),
                },
                Action::Update { slot_id, chain_order_id, new_price, new_size } => WireAction::Update {
                    slot_id: slot_id.clone(),
                    chain_order_id: chain_order_id.clone(),
                    new_price: *new_price,
                    new_size: *new_size,
                },
            })
            .collect();

        #[derive(Deserialize)]
        struct WireResult {
            slot_id: String,
            chain_order_id: Option<String>,
            error: Option<String>,
        }

        let results: Vec<WireResult> = self
            .call("broadcast_transaction", serde_json::json!(wire_actions))
            .await?;

        Ok(results
            .into_iter()
            .map(|r| match (r.chain_order_id, r.error) {
                (Some(id), _) => BroadcastResult::Created {
                    slot_id: r.slot_id,
                    chain_order_id: id,
                },
                (None, Some(message)) => BroadcastResult::Failed {
                    slot_id: r.slot_id,
                    message,
                },
                (None, None) => BroadcastResult::Acked { slot_id: r.slot_id },
            })
            .collect())
    }
}

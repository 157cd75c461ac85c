//! In-memory chain double for tests: records every broadcast action and
//! lets the test drive fills and account totals by hand instead of
//! waiting on a real node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::core::errors::CoreError;
use crate::core::pipeline::{Action, BroadcastResult, ChainClient};
use crate::core::sync::{ChainOrder, FillOp};

use super::client::{AccountBalances, ChainDataSource, FeeSchedule};

#[derive(Debug, Clone, Default)]
pub struct MockChainClient {
    pub broadcasts: Arc<Mutex<Vec<Action>>>,
    pub open_orders: Arc<Mutex<Vec<ChainOrder>>>,
    pub fill_history: Arc<Mutex<Vec<FillOp>>>,
    pub balances: Arc<Mutex<AccountBalances>>,
    pub fee_schedule: Arc<Mutex<FeeSchedule>>,
    next_chain_order_id: Arc<AtomicU64>,
    pub should_fail: Arc<Mutex<bool>>,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self {
            broadcasts: Arc::new(Mutex::new(Vec::new())),
            open_orders: Arc::new(Mutex::new(Vec::new())),
            fill_history: Arc::new(Mutex::new(Vec::new())),
            balances: Arc::new(Mutex::new(AccountBalances::default())),
            fee_schedule: Arc::new(Mutex::new(FeeSchedule::default())),
            next_chain_order_id: Arc::new(AtomicU64::new(1)),
            should_fail: Arc::new(Mutex::new(false)),
        }
    }

    pub async fn set_should_fail(&self, fail: bool) {
        *self.should_fail.lock().await = fail;
    }

    pub async fn set_open_orders(&self, orders: Vec<ChainOrder>) {
        *self.open_orders.lock().await = orders;
    }

    pub async fn push_fill(&self, fill: FillOp) {
        self.fill_history.lock().await.push(fill);
    }

    pub async fn set_balances(&self, balances: AccountBalances) {
        *self.balances.lock().await = balances;
    }

    pub async fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().await.len()
    }
}

#[async_trait]
impl ChainDataSource for MockChainClient {
    async fn get_open_orders(&self, _account_id: &str) -> Result<Vec<ChainOrder>, CoreError> {
        if *self.should_fail.lock().await {
            return Err(CoreError::ChainTransient("mock failure".into()));
        }
        Ok(self.open_orders.lock().await.clone())
    }

    async fn get_fill_history(
        &self,
        _account_id: &str,
        _cursor: Option<&str>,
    ) -> Result<Vec<FillOp>, CoreError> {
        if *self.should_fail.lock().await {
            return Err(CoreError::ChainTransient("mock failure".into()));
        }
        Ok(self.fill_history.lock().await.clone())
    }

    async fn get_account_totals(&self, _account_id: &str) -> Result<AccountBalances, CoreError> {
        if *self.should_fail.lock().await {
            return Err(CoreError::ChainTransient("mock failure".into()));
        }
        Ok(self.balances.lock().await.clone())
    }

    async fn get_fee_schedule(&self) -> Result<FeeSchedule, CoreError> {
        if *self.should_fail.lock().await {
            return Err(CoreError::ChainTransient("mock failure".into()));
        }
        Ok(self.fee_schedule.lock().await.clone())
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn broadcast_batch(&self, actions: Vec<Action>) -> Result<Vec<BroadcastResult>, CoreError> {
        if *self.should_fail.lock().await {
            return Err(CoreError::ChainTransient("mock failure".into()));
        }

        let mut results = Vec::with_capacity(actions.len());
        for action in &actions {
            let result = match action {
                Action::Create { slot_id, .. } => {
                    let id = self.next_chain_order_id.fetch_add(1, Ordering::SeqCst);
                    BroadcastResult::Created {
                        slot_id: slot_id.clone(),
                        chain_order_id: format!("mock-{id}"),
                    }
                }
                Action::Cancel { slot_id, .. } | Action::Update { slot_id, .. } => {
                    BroadcastResult::Acked { slot_id: slot_id.clone() }
                }
            };
            results.push(result);
        }

        self.broadcasts.lock().await.extend(actions);
        Ok(results)
    }
}

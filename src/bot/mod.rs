//! Bot: wires the control surface, the cycle runner, and the status
//! server together into one running instance.

pub mod control;
pub mod runner;
pub mod server;

pub use control::{BotControl, CoreState, StatusSummary};
pub use runner::{Runner, RunnerConfig};

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::chain::ChainDataSource;
use crate::core::pipeline::ChainClient;
use crate::core::SyncEngine;
use crate::persistence::GridPersistence;

/// One running bot instance: the shared control surface plus its cycle
/// runner, assembled from a chain client, a sync engine, and the
/// persisted/derived grid state the caller loaded at startup.
pub struct Bot<C, P> {
    pub control: BotControl<C, P>,
    runner: Runner<C, P>,
}

impl<C, P> Bot<C, P>
where
    C: ChainDataSource + ChainClient + Send + Sync + 'static,
    P: GridPersistence + Send + Sync + 'static,
{
    pub fn new(control: BotControl<C, P>, chain: Arc<C>, sync: SyncEngine, config: RunnerConfig) -> Self {
        let runner = Runner::new(control.clone(), chain, sync, config);
        Self { control, runner }
    }

    /// Starts the bot: flips the running flag, then spawns the cycle
    /// loop and the status server as independent background tasks.
    /// Returns both join handles so the caller can await a clean
    /// shutdown after calling `control.stop()`.
    pub fn spawn(mut self, status_host: String, status_port: u16) -> (JoinHandle<()>, JoinHandle<()>) {
        self.control.start();

        let server_control = self.control.clone();
        let server_handle = tokio::spawn(async move {
            server::start_server(server_control, &status_host, status_port).await;
        });

        let cycle_handle = tokio::spawn(async move {
            self.runner.run().await;
        });

        (cycle_handle, server_handle)
    }
}

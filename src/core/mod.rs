//! Order-manager core: master grid, accountant, sync engine, strategy,
//! and the copy-on-write rebalance pipeline.

pub mod accountant;
pub mod audit;
pub mod errors;
pub mod grid;
pub mod locks;
pub mod pipeline;
pub mod strategy;
pub mod sync;
pub mod types;
pub mod working_grid;

pub use accountant::Accountant;
pub use errors::{CoreError, CoreResult};
pub use grid::{ApplyOpts, BootstrapScope, MasterGrid};
pub use locks::SlotLeases;
pub use pipeline::{CowPipeline, PipelineOutcome};
pub use strategy::{GridView, PlannedAction, PlannedStep};
pub use sync::SyncEngine;
pub use types::{FundLedger, Order, OrderKind, OrderState, Side, SlotId};
pub use working_grid::WorkingGrid;

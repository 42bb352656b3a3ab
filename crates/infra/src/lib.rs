//! Infrastructure layer: storage backends, configuration and the services
//! that run inventory workflows against them.

pub mod aggregator;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ledger;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use aggregator::StockAggregator;
pub use config::{BalanceLocking, InventoryConfig};
pub use coordinator::TransactionCoordinator;
pub use error::{InventoryError, StoreError};
pub use ledger::MovementLedger;
pub use store::{InMemoryInventoryStore, InventoryStore, PostgresInventoryStore, StoreTx};

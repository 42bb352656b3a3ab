//! Inventory domain module (movement ledger).
//!
//! This crate contains business rules for inventory, implemented purely as
//! deterministic domain logic (no IO, no HTTP, no storage): the movement
//! model and its invariants, the compound-event records (usage, removal,
//! transfer) and the stock aggregation fold.

pub mod catalog;
pub mod movement;
pub mod removal;
pub mod stock;
pub mod taxability;
pub mod transfer;
pub mod units;
pub mod usage;

pub use catalog::{BeerLot, Catalog, Ingredient, IngredientLot, Resolved, StockLocation};
pub use movement::{
    BackRef, BackRefColumns, BackRefKind, Direction, LotKind, LotRef, Movement, MovementFilter,
    NewMovement, Reason,
};
pub use removal::{
    InventoryRemoval, NewRemoval, RemovalCategory, RemovalFilter, RemovalPatch, RemovalRecord,
    RemovalRequest, RemovalSummary,
};
pub use stock::{LocationQuantity, LotBalance, LotDetail, LotStockLevel, StockLevel};
pub use taxability::{CategoryTaxPolicy, NonTaxablePolicy, TaxClassifier};
pub use transfer::{InventoryTransfer, NewTransfer, TransferRecord, TransferRequest};
pub use usage::{BatchUsageRequest, InventoryUsage, NewUsage, UsagePick, UsageRecord};

//! `brewstock-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod entity;
pub mod error;
pub mod id;

pub use entity::{Entity, SoftDeletable, Visibility};
pub use error::{DomainError, DomainResult};
pub use id::{
    AdjustmentId, BatchId, BeerLotId, IngredientId, IngredientLotId, MovementId, OccupancyId,
    ReceiptId, RemovalId, StockLocationId, TransferId, UsageId,
};

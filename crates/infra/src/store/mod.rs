//! Storage boundary for the movement ledger and its compound-event tables.
//!
//! Reads that don't need atomicity go through [`InventoryStore`]; every write
//! happens inside a [`StoreTx`] obtained from [`InventoryStore::begin`] so a
//! compound operation either commits all of its rows or none of them.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use brewstock_core::{
    BeerLotId, IngredientLotId, MovementId, RemovalId, StockLocationId, TransferId, UsageId,
    Visibility,
};
use brewstock_inventory::{
    BeerLot, Catalog, IngredientLot, InventoryRemoval, InventoryTransfer, InventoryUsage,
    LotBalance, LotKind, LotRef, Movement, MovementFilter, NewMovement, NewRemoval, NewTransfer,
    NewUsage, RemovalFilter, StockLocation,
};

use crate::error::{InventoryError, StoreError};

pub use in_memory::InMemoryInventoryStore;
pub use postgres::PostgresInventoryStore;

#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    /// Movements matching the filter, ordered by `occurred_at` then id, with
    /// lot and location display uuids filled in.
    async fn list_movements(&self, filter: &MovementFilter) -> Result<Vec<Movement>, StoreError>;

    async fn get_movement(
        &self,
        id: MovementId,
        visibility: Visibility,
    ) -> Result<Option<Movement>, StoreError>;

    /// Signed sums of live movements grouped by (lot, location, unit) for
    /// one lot kind.
    async fn lot_balances(&self, kind: LotKind) -> Result<Vec<LotBalance>, StoreError>;

    /// Live lookup rows used to enrich stock views.
    async fn catalog(&self) -> Result<Catalog, StoreError>;

    async fn get_usage(
        &self,
        id: UsageId,
        visibility: Visibility,
    ) -> Result<Option<InventoryUsage>, StoreError>;

    async fn get_removal(
        &self,
        id: RemovalId,
        visibility: Visibility,
    ) -> Result<Option<InventoryRemoval>, StoreError>;

    /// Ordered by `removed_at` then id.
    async fn list_removals(
        &self,
        filter: &RemovalFilter,
    ) -> Result<Vec<InventoryRemoval>, StoreError>;

    async fn get_transfer(
        &self,
        id: TransferId,
        visibility: Visibility,
    ) -> Result<Option<InventoryTransfer>, StoreError>;
}

/// One open transaction. Dropping it without `commit` discards every write.
///
/// Lookups return live rows only.
#[async_trait]
pub trait StoreTx: Send {
    async fn ingredient_lot(&mut self, id: IngredientLotId)
    -> Result<Option<IngredientLot>, StoreError>;

    async fn beer_lot(&mut self, id: BeerLotId) -> Result<Option<BeerLot>, StoreError>;

    async fn stock_location(
        &mut self,
        id: StockLocationId,
    ) -> Result<Option<StockLocation>, StoreError>;

    /// Serialize balance reads for one (lot, location) until this
    /// transaction ends.
    async fn lock_lot_balance(
        &mut self,
        lot: LotRef,
        location: StockLocationId,
    ) -> Result<(), StoreError>;

    /// Live balance summed across every unit, as this transaction sees it.
    async fn lot_balance(&mut self, lot: LotRef, location: StockLocationId)
    -> Result<i64, StoreError>;

    async fn insert_movement(&mut self, movement: NewMovement) -> Result<Movement, StoreError>;

    /// Returns false when the movement is missing or already deleted.
    async fn soft_delete_movement(&mut self, id: MovementId) -> Result<bool, StoreError>;

    /// Live movement with its lot and location uuids, including rows written
    /// earlier in this transaction.
    async fn movement(&mut self, id: MovementId) -> Result<Option<Movement>, StoreError>;

    async fn insert_usage(&mut self, usage: NewUsage) -> Result<InventoryUsage, StoreError>;

    async fn soft_delete_usage(&mut self, id: UsageId) -> Result<bool, StoreError>;

    async fn insert_removal(&mut self, removal: NewRemoval)
    -> Result<InventoryRemoval, StoreError>;

    /// Live removal, locked against concurrent updates where supported.
    async fn removal_for_update(
        &mut self,
        id: RemovalId,
    ) -> Result<Option<InventoryRemoval>, StoreError>;

    /// Persist every mutable column of an existing removal.
    async fn update_removal(
        &mut self,
        removal: &InventoryRemoval,
    ) -> Result<InventoryRemoval, StoreError>;

    async fn soft_delete_removal(&mut self, id: RemovalId) -> Result<bool, StoreError>;

    async fn insert_transfer(
        &mut self,
        transfer: NewTransfer,
    ) -> Result<InventoryTransfer, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> InventoryStore for Arc<S>
where
    S: InventoryStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        (**self).begin().await
    }

    async fn list_movements(&self, filter: &MovementFilter) -> Result<Vec<Movement>, StoreError> {
        (**self).list_movements(filter).await
    }

    async fn get_movement(
        &self,
        id: MovementId,
        visibility: Visibility,
    ) -> Result<Option<Movement>, StoreError> {
        (**self).get_movement(id, visibility).await
    }

    async fn lot_balances(&self, kind: LotKind) -> Result<Vec<LotBalance>, StoreError> {
        (**self).lot_balances(kind).await
    }

    async fn catalog(&self) -> Result<Catalog, StoreError> {
        (**self).catalog().await
    }

    async fn get_usage(
        &self,
        id: UsageId,
        visibility: Visibility,
    ) -> Result<Option<InventoryUsage>, StoreError> {
        (**self).get_usage(id, visibility).await
    }

    async fn get_removal(
        &self,
        id: RemovalId,
        visibility: Visibility,
    ) -> Result<Option<InventoryRemoval>, StoreError> {
        (**self).get_removal(id, visibility).await
    }

    async fn list_removals(
        &self,
        filter: &RemovalFilter,
    ) -> Result<Vec<InventoryRemoval>, StoreError> {
        (**self).list_removals(filter).await
    }

    async fn get_transfer(
        &self,
        id: TransferId,
        visibility: Visibility,
    ) -> Result<Option<InventoryTransfer>, StoreError> {
        (**self).get_transfer(id, visibility).await
    }
}

/// Commit on success, roll back on failure. A failed rollback is logged and
/// the original error returned.
pub(crate) async fn finish<T>(
    tx: Box<dyn StoreTx>,
    result: Result<T, InventoryError>,
) -> Result<T, InventoryError> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::error!(error = %rollback_err, "transaction rollback failed");
            }
            Err(err)
        }
    }
}

//! Read-side stock views computed from the ledger on demand.

use tracing::instrument;

use brewstock_inventory::stock::{ingredient_stock_levels, lot_stock_levels};
use brewstock_inventory::{LotKind, LotStockLevel, StockLevel};

use crate::error::{InventoryError, StoreError};
use crate::store::InventoryStore;

#[derive(Debug, Clone)]
pub struct StockAggregator<S> {
    store: S,
}

impl<S: InventoryStore> StockAggregator<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Per-ingredient, per-unit totals with a per-location breakdown.
    ///
    /// Locations with a zero or negative balance are kept.
    #[instrument(skip(self), err)]
    pub async fn stock_levels(&self) -> Result<Vec<StockLevel>, InventoryError> {
        let balances = self.store.lot_balances(LotKind::Ingredient).await?;
        let catalog = self.store.catalog().await?;
        let levels = ingredient_stock_levels(&balances, &catalog)
            .map_err(|e| StoreError::Corrupt(format!("stock levels: {e}")))?;
        tracing::debug!(ingredients = levels.len(), "computed ingredient stock levels");
        Ok(levels)
    }

    /// Per-(lot, location, unit) balances for one lot kind, positive only.
    #[instrument(skip(self), err)]
    pub async fn lot_stock_levels(
        &self,
        kind: LotKind,
    ) -> Result<Vec<LotStockLevel>, InventoryError> {
        let balances = self.store.lot_balances(kind).await?;
        let catalog = self.store.catalog().await?;
        Ok(lot_stock_levels(kind, &balances, &catalog))
    }
}

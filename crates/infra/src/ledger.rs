//! Movement ledger service: single-entry appends and ledger queries.

use tracing::instrument;

use brewstock_core::{MovementId, Visibility};
use brewstock_inventory::{LotRef, Movement, MovementFilter, NewMovement, Reason};

use crate::error::InventoryError;
use crate::store::{InventoryStore, StoreTx, finish};

/// Appends standalone entries (receipts, adjustments, waste) and reads the
/// ledger. Entries belonging to usages, transfers or removals are written
/// only by [`crate::TransactionCoordinator`].
#[derive(Debug, Clone)]
pub struct MovementLedger<S> {
    store: S,
}

impl<S: InventoryStore> MovementLedger<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    #[instrument(
        skip(self, movement),
        fields(
            lot = %movement.lot,
            location = %movement.location,
            reason = movement.reason.as_str()
        ),
        err
    )]
    pub async fn append(&self, movement: NewMovement) -> Result<Movement, InventoryError> {
        movement.validate()?;
        if matches!(
            movement.reason,
            Reason::Use | Reason::Transfer | Reason::Removal
        ) {
            return Err(InventoryError::validation(format!(
                "movements with reason '{}' are recorded through their {} workflow",
                movement.reason.as_str(),
                movement.reason.required_back_ref().as_str()
            )));
        }

        let mut tx = self.store.begin().await?;
        let result = append_in_tx(tx.as_mut(), movement).await;
        let written = finish(tx, result).await?;

        tracing::info!(movement_id = %written.id, "movement appended");
        Ok(written)
    }

    pub async fn list(&self, filter: &MovementFilter) -> Result<Vec<Movement>, InventoryError> {
        Ok(self.store.list_movements(filter).await?)
    }

    pub async fn get(
        &self,
        id: MovementId,
        visibility: Visibility,
    ) -> Result<Movement, InventoryError> {
        self.store
            .get_movement(id, visibility)
            .await?
            .ok_or_else(|| InventoryError::not_found(format!("movement {id}")))
    }
}

async fn append_in_tx(
    tx: &mut dyn StoreTx,
    movement: NewMovement,
) -> Result<Movement, InventoryError> {
    let lot_uuid = match movement.lot {
        LotRef::Ingredient(id) => tx.ingredient_lot(id).await?.map(|l| l.uuid),
        LotRef::Beer(id) => tx.beer_lot(id).await?.map(|l| l.uuid),
    }
    .ok_or_else(|| InventoryError::validation(format!("{} not found", movement.lot)))?;
    let location_uuid = tx
        .stock_location(movement.location)
        .await?
        .map(|l| l.uuid)
        .ok_or_else(|| {
            InventoryError::validation(format!("stock location {} not found", movement.location))
        })?;

    let written = tx.insert_movement(movement).await?;
    Ok(written.with_display_ids(lot_uuid, location_uuid))
}

//! Transfers: moving one lot's stock between two distinct locations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use brewstock_core::{
    BeerLotId, DomainError, DomainResult, Entity, IngredientLotId, SoftDeletable,
    StockLocationId, TransferId,
};

use crate::catalog::Resolved;
use crate::movement::{BackRef, Direction, LotRef, Movement, NewMovement, Reason};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub ingredient_lot: Option<Resolved<IngredientLotId>>,
    pub beer_lot: Option<Resolved<BeerLotId>>,
    pub source: Resolved<StockLocationId>,
    pub destination: Resolved<StockLocationId>,
    pub amount: i64,
    pub amount_unit: String,
    pub transferred_at: DateTime<Utc>,
    pub notes: Option<String>,
}

impl TransferRequest {
    pub fn validate(&self) -> DomainResult<()> {
        if self.source.id == self.destination.id {
            return Err(DomainError::validation(format!(
                "source and destination must differ (both are location {})",
                self.source.uuid
            )));
        }
        if self.amount <= 0 {
            return Err(DomainError::validation(format!(
                "transfer amount must be positive, got {}",
                self.amount
            )));
        }
        if self.amount_unit.trim().is_empty() {
            return Err(DomainError::validation("transfer amount_unit cannot be empty"));
        }
        self.lot()?;
        Ok(())
    }

    /// The transferred lot and its external id.
    pub fn lot(&self) -> DomainResult<(LotRef, Uuid)> {
        let lot = LotRef::from_columns(
            self.ingredient_lot.map(|l| l.id.get()),
            self.beer_lot.map(|l| l.id.get()),
        )?;
        let uuid = self
            .ingredient_lot
            .map(|l| l.uuid)
            .or(self.beer_lot.map(|l| l.uuid))
            .unwrap_or_default();
        Ok((lot, uuid))
    }

    pub fn new_transfer(&self) -> DomainResult<NewTransfer> {
        let (lot, _) = self.lot()?;
        Ok(NewTransfer {
            lot,
            source_location_id: self.source.id,
            dest_location_id: self.destination.id,
            amount: self.amount,
            amount_unit: self.amount_unit.clone(),
            transferred_at: self.transferred_at,
            notes: self.notes.clone(),
        })
    }
}

/// Transfer row as handed to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransfer {
    pub lot: LotRef,
    pub source_location_id: StockLocationId,
    pub dest_location_id: StockLocationId,
    pub amount: i64,
    pub amount_unit: String,
    pub transferred_at: DateTime<Utc>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryTransfer {
    pub id: TransferId,
    pub uuid: Uuid,
    pub lot: LotRef,
    pub source_location_id: StockLocationId,
    pub dest_location_id: StockLocationId,
    pub amount: i64,
    pub amount_unit: String,
    pub transferred_at: DateTime<Utc>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl InventoryTransfer {
    pub fn from_new(id: TransferId, uuid: Uuid, new: NewTransfer, now: DateTime<Utc>) -> Self {
        Self {
            id,
            uuid,
            lot: new.lot,
            source_location_id: new.source_location_id,
            dest_location_id: new.dest_location_id,
            amount: new.amount,
            amount_unit: new.amount_unit,
            transferred_at: new.transferred_at,
            notes: new.notes,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// `out` at the source and `in` at the destination, both pointing back at
    /// this transfer, with identical lot/amount/unit.
    pub fn paired_movements(&self) -> DomainResult<[NewMovement; 2]> {
        let leg = |location, direction| {
            NewMovement::new(
                self.lot,
                location,
                direction,
                Reason::Transfer,
                self.amount,
                self.amount_unit.clone(),
                self.transferred_at,
                BackRef::Transfer(self.id),
            )
        };
        Ok([
            leg(self.source_location_id, Direction::Out)?,
            leg(self.dest_location_id, Direction::In)?,
        ])
    }
}

impl Entity for InventoryTransfer {
    type Id = TransferId;

    fn id(&self) -> TransferId {
        self.id
    }

    fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl SoftDeletable for InventoryTransfer {
    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }
}

/// A transfer with its two movements (source leg first).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer: InventoryTransfer,
    pub movements: Vec<Movement>,
}

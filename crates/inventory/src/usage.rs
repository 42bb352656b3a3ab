//! Batch usage: one consumption event drawing from several ingredient lots.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use brewstock_core::{
    DomainError, DomainResult, Entity, IngredientLotId, SoftDeletable, StockLocationId, UsageId,
};

use crate::movement::{BackRef, Direction, LotRef, Movement, NewMovement, Reason};

/// One draw from a (lot, location) pair, with identities already resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsagePick {
    pub lot_id: IngredientLotId,
    pub lot_uuid: Uuid,
    pub location_id: StockLocationId,
    pub location_uuid: Uuid,
    pub amount: i64,
    pub amount_unit: String,
}

impl UsagePick {
    pub fn lot(&self) -> LotRef {
        LotRef::Ingredient(self.lot_id)
    }

    /// The `out`/`use` ledger entry this pick produces.
    pub fn movement(&self, usage_id: UsageId, used_at: DateTime<Utc>) -> DomainResult<NewMovement> {
        NewMovement::new(
            self.lot(),
            self.location_id,
            Direction::Out,
            Reason::Use,
            self.amount,
            self.amount_unit.clone(),
            used_at,
            BackRef::Usage(usage_id),
        )
    }

    /// Error raised when the pick asks for more than the ledger holds.
    pub fn insufficient(&self, available: i64) -> DomainError {
        DomainError::validation(format!(
            "insufficient stock for ingredient lot {} at location {}: available {} requested {}",
            self.lot_uuid, self.location_uuid, available, self.amount
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUsageRequest {
    /// External production reference (e.g. the brew batch), if any.
    pub production_ref: Option<Uuid>,
    pub used_at: DateTime<Utc>,
    pub picks: Vec<UsagePick>,
    pub notes: Option<String>,
}

impl BatchUsageRequest {
    /// Shape checks that need no ledger access.
    ///
    /// Picks must be non-empty, each with a positive amount and a unit, and
    /// unique on (lot, location). The same lot at two locations is fine.
    pub fn validate(&self) -> DomainResult<()> {
        if self.picks.is_empty() {
            return Err(DomainError::validation("picks cannot be empty"));
        }

        let mut seen: HashMap<(IngredientLotId, StockLocationId), usize> = HashMap::new();
        for (idx, pick) in self.picks.iter().enumerate() {
            if pick.amount <= 0 {
                return Err(DomainError::validation(format!(
                    "pick {idx}: amount must be positive, got {}",
                    pick.amount
                )));
            }
            if pick.amount_unit.trim().is_empty() {
                return Err(DomainError::validation(format!(
                    "pick {idx}: amount_unit cannot be empty"
                )));
            }
            if let Some(first) = seen.insert((pick.lot_id, pick.location_id), idx) {
                return Err(DomainError::validation(format!(
                    "pick {idx}: duplicate of pick {first} (ingredient lot {} at location {})",
                    pick.lot_uuid, pick.location_uuid
                )));
            }
        }
        Ok(())
    }

    pub fn new_usage(&self) -> NewUsage {
        NewUsage {
            production_ref: self.production_ref,
            used_at: self.used_at,
            notes: self.notes.clone(),
        }
    }
}

/// Usage row as handed to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUsage {
    pub production_ref: Option<Uuid>,
    pub used_at: DateTime<Utc>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryUsage {
    pub id: UsageId,
    pub uuid: Uuid,
    pub production_ref: Option<Uuid>,
    pub used_at: DateTime<Utc>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl InventoryUsage {
    pub fn from_new(id: UsageId, uuid: Uuid, new: NewUsage, now: DateTime<Utc>) -> Self {
        Self {
            id,
            uuid,
            production_ref: new.production_ref,
            used_at: new.used_at,
            notes: new.notes,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

impl Entity for InventoryUsage {
    type Id = UsageId;

    fn id(&self) -> UsageId {
        self.id
    }

    fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl SoftDeletable for InventoryUsage {
    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }
}

/// A usage event together with the movements it wrote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub usage: InventoryUsage,
    pub movements: Vec<Movement>,
}

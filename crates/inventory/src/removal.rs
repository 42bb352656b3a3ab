//! Removals: taxable/non-taxable disposition of packaged product or batches.
//!
//! `amount_bbl` and `is_taxable` are derived fields. They are always computed
//! by [`derive_fields`] from the removal's full current state (never patched
//! incrementally), both on create and after merging a [`RemovalPatch`].

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use brewstock_core::{
    BatchId, BeerLotId, DomainError, DomainResult, Entity, MovementId, OccupancyId, RemovalId,
    SoftDeletable, StockLocationId, Visibility,
};

use crate::catalog::Resolved;
use crate::movement::{BackRef, Direction, LotRef, Movement, NewMovement, Reason};
use crate::taxability::TaxClassifier;
use crate::units;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalCategory {
    Sale,
    Consumption,
    Sample,
    Spoilage,
    Breakage,
    Dump,
    Other,
}

impl RemovalCategory {
    pub const ALL: [RemovalCategory; 7] = [
        RemovalCategory::Sale,
        RemovalCategory::Consumption,
        RemovalCategory::Sample,
        RemovalCategory::Spoilage,
        RemovalCategory::Breakage,
        RemovalCategory::Dump,
        RemovalCategory::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RemovalCategory::Sale => "sale",
            RemovalCategory::Consumption => "consumption",
            RemovalCategory::Sample => "sample",
            RemovalCategory::Spoilage => "spoilage",
            RemovalCategory::Breakage => "breakage",
            RemovalCategory::Dump => "dump",
            RemovalCategory::Other => "other",
        }
    }
}

impl FromStr for RemovalCategory {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RemovalCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("invalid removal category '{s}'")))
    }
}

/// Fields computed from (amount, unit, category).
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RemovalDerived {
    pub amount_bbl: Option<f64>,
    pub is_taxable: bool,
}

pub fn derive_fields(
    amount: i64,
    amount_unit: &str,
    category: RemovalCategory,
    classifier: &dyn TaxClassifier,
) -> RemovalDerived {
    RemovalDerived {
        amount_bbl: units::to_bbl(amount, amount_unit),
        is_taxable: classifier.is_taxable(category),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalRequest {
    pub category: RemovalCategory,
    pub reason: String,
    pub amount: i64,
    pub amount_unit: String,
    pub batch: Option<Resolved<BatchId>>,
    pub beer_lot: Option<Resolved<BeerLotId>>,
    /// Required when `beer_lot` is set; the movement is written here.
    pub location: Option<Resolved<StockLocationId>>,
    pub occupancy: Option<Resolved<OccupancyId>>,
    pub removed_at: DateTime<Utc>,
    pub reference_code: Option<String>,
    pub destination: Option<String>,
    pub notes: Option<String>,
}

impl RemovalRequest {
    pub fn validate(&self) -> DomainResult<()> {
        validate_quantity(&self.reason, self.amount, &self.amount_unit)?;

        if self.batch.is_none() && self.beer_lot.is_none() && self.occupancy.is_none() {
            return Err(DomainError::validation(
                "removal requires at least one of batch, beer lot or occupancy",
            ));
        }
        if let (Some(lot), None) = (self.beer_lot, self.location) {
            return Err(DomainError::validation(format!(
                "removal of beer lot {} requires a stock location",
                lot.uuid
            )));
        }
        Ok(())
    }

    /// Build the removal row, deriving `amount_bbl`/`is_taxable`.
    pub fn new_removal(&self, classifier: &dyn TaxClassifier) -> NewRemoval {
        let derived = derive_fields(self.amount, &self.amount_unit, self.category, classifier);
        NewRemoval {
            category: self.category,
            reason: self.reason.clone(),
            amount: self.amount,
            amount_unit: self.amount_unit.clone(),
            amount_bbl: derived.amount_bbl,
            is_taxable: derived.is_taxable,
            batch_id: self.batch.map(|b| b.id),
            beer_lot_id: self.beer_lot.map(|l| l.id),
            stock_location_id: self.beer_lot.and(self.location).map(|l| l.id),
            occupancy_id: self.occupancy.map(|o| o.id),
            removed_at: self.removed_at,
            reference_code: self.reference_code.clone(),
            destination: self.destination.clone(),
            notes: self.notes.clone(),
        }
    }
}

fn validate_quantity(reason: &str, amount: i64, amount_unit: &str) -> DomainResult<()> {
    if reason.trim().is_empty() {
        return Err(DomainError::validation("removal reason cannot be empty"));
    }
    if amount <= 0 {
        return Err(DomainError::validation(format!(
            "removal amount must be positive, got {amount}"
        )));
    }
    if amount_unit.trim().is_empty() {
        return Err(DomainError::validation("removal amount_unit cannot be empty"));
    }
    Ok(())
}

/// Removal row as handed to storage.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRemoval {
    pub category: RemovalCategory,
    pub reason: String,
    pub amount: i64,
    pub amount_unit: String,
    pub amount_bbl: Option<f64>,
    pub is_taxable: bool,
    pub batch_id: Option<BatchId>,
    pub beer_lot_id: Option<BeerLotId>,
    pub stock_location_id: Option<StockLocationId>,
    pub occupancy_id: Option<OccupancyId>,
    pub removed_at: DateTime<Utc>,
    pub reference_code: Option<String>,
    pub destination: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRemoval {
    pub id: RemovalId,
    pub uuid: Uuid,
    pub category: RemovalCategory,
    pub reason: String,
    pub amount: i64,
    pub amount_unit: String,
    pub amount_bbl: Option<f64>,
    pub is_taxable: bool,
    pub batch_id: Option<BatchId>,
    pub beer_lot_id: Option<BeerLotId>,
    pub stock_location_id: Option<StockLocationId>,
    pub occupancy_id: Option<OccupancyId>,
    /// The paired ledger entry, when the removal draws from a beer lot.
    pub movement_id: Option<MovementId>,
    pub removed_at: DateTime<Utc>,
    pub reference_code: Option<String>,
    pub destination: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl InventoryRemoval {
    pub fn from_new(id: RemovalId, uuid: Uuid, new: NewRemoval, now: DateTime<Utc>) -> Self {
        Self {
            id,
            uuid,
            category: new.category,
            reason: new.reason,
            amount: new.amount,
            amount_unit: new.amount_unit,
            amount_bbl: new.amount_bbl,
            is_taxable: new.is_taxable,
            batch_id: new.batch_id,
            beer_lot_id: new.beer_lot_id,
            stock_location_id: new.stock_location_id,
            occupancy_id: new.occupancy_id,
            movement_id: None,
            removed_at: new.removed_at,
            reference_code: new.reference_code,
            destination: new.destination,
            notes: new.notes,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// The `out`/`removal` ledger entry, if this removal draws from a beer
    /// lot at a location.
    pub fn movement(&self) -> Option<DomainResult<NewMovement>> {
        let (lot, location) = (self.beer_lot_id?, self.stock_location_id?);
        Some(NewMovement::new(
            LotRef::Beer(lot),
            location,
            Direction::Out,
            Reason::Removal,
            self.amount,
            self.amount_unit.clone(),
            self.removed_at,
            BackRef::Removal(self.id),
        ))
    }

    /// Merge a patch, validate the merged state and re-derive the computed
    /// fields from it.
    pub fn apply_patch(
        &mut self,
        patch: &RemovalPatch,
        classifier: &dyn TaxClassifier,
    ) -> DomainResult<PatchEffect> {
        let mut merged = self.clone();
        if let Some(category) = patch.category {
            merged.category = category;
        }
        if let Some(reason) = &patch.reason {
            merged.reason = reason.clone();
        }
        if let Some(amount) = patch.amount {
            merged.amount = amount;
        }
        if let Some(unit) = &patch.amount_unit {
            merged.amount_unit = unit.clone();
        }
        if let Some(removed_at) = patch.removed_at {
            merged.removed_at = removed_at;
        }
        if let Some(code) = &patch.reference_code {
            merged.reference_code = Some(code.clone());
        }
        if let Some(destination) = &patch.destination {
            merged.destination = Some(destination.clone());
        }
        if let Some(notes) = &patch.notes {
            merged.notes = Some(notes.clone());
        }

        validate_quantity(&merged.reason, merged.amount, &merged.amount_unit)?;

        let derived = derive_fields(
            merged.amount,
            &merged.amount_unit,
            merged.category,
            classifier,
        );
        merged.amount_bbl = derived.amount_bbl;
        merged.is_taxable = derived.is_taxable;

        let effect = PatchEffect {
            ledger_stale: merged.amount != self.amount
                || merged.amount_unit != self.amount_unit
                || merged.removed_at != self.removed_at,
        };
        *self = merged;
        Ok(effect)
    }
}

impl Entity for InventoryRemoval {
    type Id = RemovalId;

    fn id(&self) -> RemovalId {
        self.id
    }

    fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl SoftDeletable for InventoryRemoval {
    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }
}

/// Partial update. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalPatch {
    pub category: Option<RemovalCategory>,
    pub reason: Option<String>,
    pub amount: Option<i64>,
    pub amount_unit: Option<String>,
    pub removed_at: Option<DateTime<Utc>>,
    pub reference_code: Option<String>,
    pub destination: Option<String>,
    pub notes: Option<String>,
}

impl RemovalPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// What a merged patch means for the removal's paired movement.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PatchEffect {
    /// Amount, unit or event time changed: the paired movement no longer
    /// matches and must be replaced.
    pub ledger_stale: bool,
}

/// A removal together with its paired movement, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovalRecord {
    pub removal: InventoryRemoval,
    pub movement: Option<Movement>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalFilter {
    pub category: Option<RemovalCategory>,
    pub batch_id: Option<BatchId>,
    pub beer_lot_id: Option<BeerLotId>,
    pub removed_from: Option<DateTime<Utc>>,
    pub removed_to: Option<DateTime<Utc>>,
    pub visibility: Visibility,
}

impl RemovalFilter {
    pub fn matches(&self, removal: &InventoryRemoval) -> bool {
        self.visibility.admits(removal)
            && self.category.is_none_or(|c| removal.category == c)
            && self.batch_id.is_none_or(|b| removal.batch_id == Some(b))
            && self.beer_lot_id.is_none_or(|l| removal.beer_lot_id == Some(l))
            && self.removed_from.is_none_or(|from| removal.removed_at >= from)
            && self.removed_to.is_none_or(|to| removal.removed_at <= to)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryTotal {
    pub category: RemovalCategory,
    pub count: usize,
    pub total_bbl: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemovalSummary {
    pub removal_count: usize,
    pub total_bbl: f64,
    pub taxable_bbl: f64,
    pub tax_free_bbl: f64,
    /// Removals whose unit has no barrel projection; counted, not summed.
    pub unconverted_count: usize,
    pub by_category: Vec<CategoryTotal>,
}

/// Aggregate removals into totals, categories in [`RemovalCategory::ALL`] order.
pub fn summarize<'a>(removals: impl IntoIterator<Item = &'a InventoryRemoval>) -> RemovalSummary {
    let mut summary = RemovalSummary::default();
    let mut per_category: Vec<CategoryTotal> = Vec::new();

    for removal in removals {
        summary.removal_count += 1;

        let bbl = removal.amount_bbl.unwrap_or(0.0);
        match removal.amount_bbl {
            Some(_) if removal.is_taxable => summary.taxable_bbl += bbl,
            Some(_) => summary.tax_free_bbl += bbl,
            None => summary.unconverted_count += 1,
        }
        summary.total_bbl += bbl;

        match per_category.iter_mut().find(|t| t.category == removal.category) {
            Some(total) => {
                total.count += 1;
                total.total_bbl += bbl;
            }
            None => per_category.push(CategoryTotal {
                category: removal.category,
                count: 1,
                total_bbl: bbl,
            }),
        }
    }

    per_category.sort_by_key(|t| t.category);
    summary.by_category = per_category;
    summary
}

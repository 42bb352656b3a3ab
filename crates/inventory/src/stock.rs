//! Stock aggregation: current quantities derived from ledger history.
//!
//! Nothing here is stored. Balances are the signed sum of live movements per
//! (lot, location, unit); units are never converted into each other, so
//! mixed-unit history for one lot/location yields one row per unit.
//! Sums are accumulated wide and must fit back into `i64`; a balance that
//! does not is an invariant violation, not a wrapped number.
//!
//! Two views are built on top of the balances:
//! - [`ingredient_stock_levels`]: per ingredient and unit, across all of its
//!   lots, with a per-location breakdown. Does **not** drop depleted
//!   (zero/negative) locations.
//! - [`lot_stock_levels`]: per physical lot and location. Keeps only
//!   positive balances.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use brewstock_core::{
    BatchId, DomainError, DomainResult, IngredientId, SoftDeletable, StockLocationId,
};

use crate::catalog::{Catalog, StockLocation};
use crate::movement::{LotKind, LotRef, Movement};

/// Signed balance of one (lot, location, unit) group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotBalance {
    pub lot: LotRef,
    pub location: StockLocationId,
    pub amount_unit: String,
    pub quantity: i64,
}

fn narrow(sum: i128, what: impl FnOnce() -> String) -> DomainResult<i64> {
    i64::try_from(sum)
        .map_err(|_| DomainError::invariant(format!("{} is out of range: {sum}", what())))
}

/// Fold live movements into balances, ordered by (lot, location, unit).
///
/// The result does not depend on the order movements are supplied in.
pub fn fold_balances<'a>(
    movements: impl IntoIterator<Item = &'a Movement>,
) -> DomainResult<Vec<LotBalance>> {
    let mut groups: BTreeMap<(LotRef, StockLocationId, &'a str), i128> = BTreeMap::new();
    for movement in movements.into_iter().filter(|m| m.is_live()) {
        *groups
            .entry((movement.lot, movement.location, movement.amount_unit.as_str()))
            .or_insert(0) += i128::from(movement.signed_amount());
    }

    groups
        .into_iter()
        .map(|((lot, location, unit), sum)| {
            let quantity = narrow(sum, || format!("balance of {lot} at location {location}"))?;
            Ok(LotBalance {
                lot,
                location,
                amount_unit: unit.to_string(),
                quantity,
            })
        })
        .collect()
}

/// Available quantity of a lot at a location: live movements summed across
/// every unit they were recorded in.
pub fn balance_of<'a>(
    movements: impl IntoIterator<Item = &'a Movement>,
    lot: LotRef,
    location: StockLocationId,
) -> DomainResult<i64> {
    let sum: i128 = movements
        .into_iter()
        .filter(|m| m.is_live() && m.lot == lot && m.location == location)
        .map(|m| i128::from(m.signed_amount()))
        .sum();
    narrow(sum, || format!("balance of {lot} at location {location}"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationQuantity {
    pub location_id: StockLocationId,
    pub location_uuid: Uuid,
    pub location_name: String,
    pub quantity: i64,
}

/// Current stock of one ingredient in one unit, across its lots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub ingredient_id: IngredientId,
    pub ingredient_uuid: Uuid,
    pub ingredient_name: String,
    pub category: Option<String>,
    pub amount_unit: String,
    pub total: i64,
    pub locations: Vec<LocationQuantity>,
}

pub fn ingredient_stock_levels(
    balances: &[LotBalance],
    catalog: &Catalog,
) -> DomainResult<Vec<StockLevel>> {
    let mut grouped: BTreeMap<(IngredientId, &str), BTreeMap<StockLocationId, i128>> =
        BTreeMap::new();

    for balance in balances {
        let LotRef::Ingredient(lot_id) = balance.lot else {
            continue;
        };
        let Some(lot) = catalog.ingredient_lots.get(&lot_id) else {
            tracing::debug!(lot = %lot_id, "skipping balance of unknown or deleted ingredient lot");
            continue;
        };
        *grouped
            .entry((lot.ingredient_id, balance.amount_unit.as_str()))
            .or_default()
            .entry(balance.location)
            .or_insert(0) += i128::from(balance.quantity);
    }

    let mut levels = Vec::with_capacity(grouped.len());
    for ((ingredient_id, unit), per_location) in grouped {
        let Some(ingredient) = catalog.ingredients.get(&ingredient_id) else {
            tracing::debug!(
                ingredient = %ingredient_id,
                "skipping stock of unknown or deleted ingredient"
            );
            continue;
        };
        let what = || format!("stock of ingredient {ingredient_id} in {unit}");

        let mut locations = Vec::with_capacity(per_location.len());
        let mut total: i128 = 0;
        for (location_id, quantity) in per_location {
            let Some(location) = known_location(catalog, location_id) else {
                continue;
            };
            total += quantity;
            locations.push(LocationQuantity {
                location_id,
                location_uuid: location.uuid,
                location_name: location.name.clone(),
                quantity: narrow(quantity, what)?,
            });
        }
        locations.sort_by(|a, b| {
            a.location_name
                .cmp(&b.location_name)
                .then(a.location_id.cmp(&b.location_id))
        });

        levels.push(StockLevel {
            ingredient_id,
            ingredient_uuid: ingredient.uuid,
            ingredient_name: ingredient.name.clone(),
            category: ingredient.category.clone(),
            amount_unit: unit.to_string(),
            total: narrow(total, what)?,
            locations,
        });
    }

    levels.sort_by(|a, b| {
        a.ingredient_name
            .cmp(&b.ingredient_name)
            .then(a.amount_unit.cmp(&b.amount_unit))
            .then(a.ingredient_id.cmp(&b.ingredient_id))
    });
    Ok(levels)
}

/// Lot-kind specific metadata of a [`LotStockLevel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LotDetail {
    Ingredient {
        ingredient_id: IngredientId,
        ingredient_uuid: Uuid,
        ingredient_name: String,
    },
    Beer {
        batch_id: Option<BatchId>,
        package_format: Option<String>,
        volume_per_unit: Option<i64>,
        /// Whole packages on hand; absent without a usable volume per unit.
        unit_count: Option<i64>,
    },
}

/// Current stock of one physical lot at one location, in one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotStockLevel {
    pub lot: LotRef,
    pub lot_uuid: Uuid,
    pub lot_code: Option<String>,
    /// Received (ingredient) or packaged (beer) time.
    pub lot_date: DateTime<Utc>,
    pub location_id: StockLocationId,
    pub location_uuid: Uuid,
    pub location_name: String,
    pub amount_unit: String,
    pub quantity: i64,
    pub detail: LotDetail,
}

impl LotStockLevel {
    fn display_name(&self) -> &str {
        match &self.detail {
            LotDetail::Ingredient {
                ingredient_name, ..
            } => ingredient_name,
            LotDetail::Beer { .. } => self.lot_code.as_deref().unwrap_or_default(),
        }
    }

    /// Name, newest lot first, then location, unit and lot id.
    fn sort_key(&self) -> (&str, Reverse<DateTime<Utc>>, &str, &str, LotRef) {
        (
            self.display_name(),
            Reverse(self.lot_date),
            self.location_name.as_str(),
            self.amount_unit.as_str(),
            self.lot,
        )
    }
}

/// Packages on hand, truncated toward zero.
///
/// `None` when the volume per unit is missing or not positive.
pub fn unit_count(quantity: i64, volume_per_unit: Option<i64>) -> Option<i64> {
    volume_per_unit
        .filter(|v| *v > 0)
        .map(|per_unit| quantity / per_unit)
}

pub fn lot_stock_levels(
    kind: LotKind,
    balances: &[LotBalance],
    catalog: &Catalog,
) -> Vec<LotStockLevel> {
    let mut levels: Vec<LotStockLevel> = balances
        .iter()
        .filter(|b| b.lot.kind() == kind && b.quantity > 0)
        .filter_map(|balance| {
            let location = known_location(catalog, balance.location)?;
            let (lot_uuid, lot_code, lot_date, detail) = match balance.lot {
                LotRef::Ingredient(lot_id) => {
                    let lot = catalog.ingredient_lots.get(&lot_id)?;
                    let ingredient = catalog.ingredients.get(&lot.ingredient_id)?;
                    (
                        lot.uuid,
                        lot.lot_code.clone(),
                        lot.received_at,
                        LotDetail::Ingredient {
                            ingredient_id: ingredient.id,
                            ingredient_uuid: ingredient.uuid,
                            ingredient_name: ingredient.name.clone(),
                        },
                    )
                }
                LotRef::Beer(lot_id) => {
                    let lot = catalog.beer_lots.get(&lot_id)?;
                    (
                        lot.uuid,
                        lot.lot_code.clone(),
                        lot.packaged_at,
                        LotDetail::Beer {
                            batch_id: lot.batch_id,
                            package_format: lot.package_format.clone(),
                            volume_per_unit: lot.volume_per_unit,
                            unit_count: unit_count(balance.quantity, lot.volume_per_unit),
                        },
                    )
                }
            };

            Some(LotStockLevel {
                lot: balance.lot,
                lot_uuid,
                lot_code,
                lot_date,
                location_id: location.id,
                location_uuid: location.uuid,
                location_name: location.name.clone(),
                amount_unit: balance.amount_unit.clone(),
                quantity: balance.quantity,
                detail,
            })
        })
        .collect();

    levels.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    levels
}

fn known_location(catalog: &Catalog, id: StockLocationId) -> Option<&StockLocation> {
    let location = catalog.locations.get(&id);
    if location.is_none() {
        tracing::debug!(location = %id, "skipping balance at unknown or deleted location");
    }
    location
}

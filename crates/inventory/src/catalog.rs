//! Read-only views of records owned outside the inventory core.
//!
//! Ingredients, lots and stock locations are created by plain CRUD elsewhere;
//! the core only looks them up (existence checks, display metadata).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use brewstock_core::{
    BatchId, BeerLotId, Entity, IngredientId, IngredientLotId, SoftDeletable, StockLocationId,
};

/// An internal identity paired with the external id the caller resolved it from.
///
/// The external id is echoed back on written records so callers can render
/// them without another lookup.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolved<I> {
    pub id: I,
    pub uuid: Uuid,
}

impl<I> Resolved<I> {
    pub fn new(id: I, uuid: Uuid) -> Self {
        Self { id, uuid }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ingredient {
    pub id: IngredientId,
    pub uuid: Uuid,
    pub name: String,
    pub category: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngredientLot {
    pub id: IngredientLotId,
    pub uuid: Uuid,
    pub ingredient_id: IngredientId,
    pub lot_code: Option<String>,
    pub received_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Packaged product lot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeerLot {
    pub id: BeerLotId,
    pub uuid: Uuid,
    pub batch_id: Option<BatchId>,
    pub lot_code: Option<String>,
    pub package_format: Option<String>,
    /// Volume held by one package, in the unit its movements are recorded in.
    pub volume_per_unit: Option<i64>,
    pub packaged_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLocation {
    pub id: StockLocationId,
    pub uuid: Uuid,
    pub name: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

macro_rules! impl_catalog_entity {
    ($t:ty, $id:ty) => {
        impl Entity for $t {
            type Id = $id;

            fn id(&self) -> $id {
                self.id
            }

            fn uuid(&self) -> Uuid {
                self.uuid
            }
        }

        impl SoftDeletable for $t {
            fn deleted_at(&self) -> Option<DateTime<Utc>> {
                self.deleted_at
            }
        }
    };
}

impl_catalog_entity!(Ingredient, IngredientId);
impl_catalog_entity!(IngredientLot, IngredientLotId);
impl_catalog_entity!(BeerLot, BeerLotId);
impl_catalog_entity!(StockLocation, StockLocationId);

/// Snapshot of the live lookup records used to enrich stock views.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub ingredients: HashMap<IngredientId, Ingredient>,
    pub ingredient_lots: HashMap<IngredientLotId, IngredientLot>,
    pub beer_lots: HashMap<BeerLotId, BeerLot>,
    pub locations: HashMap<StockLocationId, StockLocation>,
}

impl Catalog {
    /// Build a catalog from raw rows, dropping soft-deleted ones.
    pub fn from_live(
        ingredients: impl IntoIterator<Item = Ingredient>,
        ingredient_lots: impl IntoIterator<Item = IngredientLot>,
        beer_lots: impl IntoIterator<Item = BeerLot>,
        locations: impl IntoIterator<Item = StockLocation>,
    ) -> Self {
        Self {
            ingredients: index_live(ingredients),
            ingredient_lots: index_live(ingredient_lots),
            beer_lots: index_live(beer_lots),
            locations: index_live(locations),
        }
    }
}

fn index_live<T>(rows: impl IntoIterator<Item = T>) -> HashMap<T::Id, T>
where
    T: Entity + SoftDeletable,
{
    rows.into_iter()
        .filter(|row| row.is_live())
        .map(|row| (row.id(), row))
        .collect()
}

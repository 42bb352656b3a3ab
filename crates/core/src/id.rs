//! Strongly-typed row identifiers used across the domain.
//!
//! Every persisted record carries a surrogate `i64` key (internal identity)
//! and a stable external UUID. Callers resolve external UUIDs to these ids
//! before invoking the inventory core; the core never parses UUID strings.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

macro_rules! impl_row_id {
    ($(#[$meta:meta])* $t:ident, $name:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $t(i64);

        impl $t {
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<i64> for $t {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$t> for i64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = i64::from_str(s)
                    .map_err(|e| DomainError::validation(format!("{}: {}", $name, e)))?;
                Ok(Self(raw))
            }
        }
    };
}

impl_row_id!(
    /// Ledger entry.
    MovementId,
    "MovementId"
);
impl_row_id!(
    /// Consumption event referenced by `use` movements.
    UsageId,
    "UsageId"
);
impl_row_id!(RemovalId, "RemovalId");
impl_row_id!(TransferId, "TransferId");
impl_row_id!(ReceiptId, "ReceiptId");
impl_row_id!(AdjustmentId, "AdjustmentId");
impl_row_id!(IngredientId, "IngredientId");
impl_row_id!(IngredientLotId, "IngredientLotId");
impl_row_id!(
    /// Packaged-product lot.
    BeerLotId,
    "BeerLotId"
);
impl_row_id!(StockLocationId, "StockLocationId");
impl_row_id!(
    /// Production batch owned by the production service.
    BatchId,
    "BatchId"
);
impl_row_id!(
    /// Vessel occupancy owned by the production service.
    OccupancyId,
    "OccupancyId"
);

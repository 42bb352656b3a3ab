//! Movement ledger model: the append-only fact table of stock changes.
//!
//! A [`Movement`] is a signed quantity change for exactly one physical lot at
//! exactly one stock location. The "exactly one lot" rule is carried by the
//! [`LotRef`] sum type; the "at most one back-reference" rule by [`BackRef`].
//! Writers build a [`NewMovement`] and must pass [`NewMovement::validate`],
//! which also enforces the reason → back-reference table.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use brewstock_core::{
    AdjustmentId, BeerLotId, DomainError, DomainResult, Entity, IngredientLotId, MovementId,
    ReceiptId, RemovalId, SoftDeletable, StockLocationId, TransferId, UsageId, Visibility,
};

/// Whether a movement adds stock to or removes stock from its location.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }

    /// `in` contributes positively to a balance, `out` negatively.
    pub fn signed(self, amount: i64) -> i64 {
        match self {
            Direction::In => amount,
            Direction::Out => -amount,
        }
    }
}

impl FromStr for Direction {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            other => Err(DomainError::validation(format!(
                "invalid movement direction '{other}' (expected in or out)"
            ))),
        }
    }
}

/// Why stock moved.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reason {
    Receive,
    Use,
    Transfer,
    Adjust,
    Waste,
    Removal,
}

impl Reason {
    pub const ALL: [Reason; 6] = [
        Reason::Receive,
        Reason::Use,
        Reason::Transfer,
        Reason::Adjust,
        Reason::Waste,
        Reason::Removal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Reason::Receive => "receive",
            Reason::Use => "use",
            Reason::Transfer => "transfer",
            Reason::Adjust => "adjust",
            Reason::Waste => "waste",
            Reason::Removal => "removal",
        }
    }

    /// Reason → back-reference table.
    ///
    /// The match is exhaustive, so a new reason does not compile until it is
    /// mapped here.
    pub const fn required_back_ref(self) -> BackRefKind {
        match self {
            Reason::Receive => BackRefKind::Receipt,
            Reason::Use => BackRefKind::Usage,
            Reason::Transfer => BackRefKind::Transfer,
            Reason::Adjust | Reason::Waste => BackRefKind::Adjustment,
            Reason::Removal => BackRefKind::Removal,
        }
    }

    /// Directions a reason may be recorded with.
    pub fn permits(self, direction: Direction) -> bool {
        match self {
            Reason::Receive => direction == Direction::In,
            Reason::Use | Reason::Waste | Reason::Removal => direction == Direction::Out,
            Reason::Transfer | Reason::Adjust => true,
        }
    }
}

impl FromStr for Reason {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reason::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("invalid movement reason '{s}'")))
    }
}

/// Which domain event table a back-reference points into.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackRefKind {
    Receipt,
    Usage,
    Adjustment,
    Transfer,
    Removal,
}

impl BackRefKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackRefKind::Receipt => "receipt",
            BackRefKind::Usage => "usage",
            BackRefKind::Adjustment => "adjustment",
            BackRefKind::Transfer => "transfer",
            BackRefKind::Removal => "removal",
        }
    }
}

/// Pointer from a movement to the domain event that produced it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum BackRef {
    Receipt(ReceiptId),
    Usage(UsageId),
    Adjustment(AdjustmentId),
    Transfer(TransferId),
    Removal(RemovalId),
}

/// Column-shaped view of a [`BackRef`] (one nullable column per event table).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct BackRefColumns {
    pub receipt_id: Option<i64>,
    pub usage_id: Option<i64>,
    pub adjustment_id: Option<i64>,
    pub transfer_id: Option<i64>,
    pub removal_id: Option<i64>,
}

impl BackRef {
    pub fn kind(&self) -> BackRefKind {
        match self {
            BackRef::Receipt(_) => BackRefKind::Receipt,
            BackRef::Usage(_) => BackRefKind::Usage,
            BackRef::Adjustment(_) => BackRefKind::Adjustment,
            BackRef::Transfer(_) => BackRefKind::Transfer,
            BackRef::Removal(_) => BackRefKind::Removal,
        }
    }

    pub fn columns(back_ref: Option<BackRef>) -> BackRefColumns {
        let mut cols = BackRefColumns::default();
        match back_ref {
            Some(BackRef::Receipt(id)) => cols.receipt_id = Some(id.get()),
            Some(BackRef::Usage(id)) => cols.usage_id = Some(id.get()),
            Some(BackRef::Adjustment(id)) => cols.adjustment_id = Some(id.get()),
            Some(BackRef::Transfer(id)) => cols.transfer_id = Some(id.get()),
            Some(BackRef::Removal(id)) => cols.removal_id = Some(id.get()),
            None => {}
        }
        cols
    }

    /// Decode the nullable back-reference columns of a stored row.
    ///
    /// More than one populated column is an invariant violation.
    pub fn from_columns(cols: BackRefColumns) -> DomainResult<Option<BackRef>> {
        let populated = [
            cols.receipt_id.map(|id| BackRef::Receipt(id.into())),
            cols.usage_id.map(|id| BackRef::Usage(id.into())),
            cols.adjustment_id.map(|id| BackRef::Adjustment(id.into())),
            cols.transfer_id.map(|id| BackRef::Transfer(id.into())),
            cols.removal_id.map(|id| BackRef::Removal(id.into())),
        ];

        let mut found = populated.into_iter().flatten();
        let first = found.next();
        if found.next().is_some() {
            return Err(DomainError::invariant(
                "movement carries more than one back-reference",
            ));
        }
        Ok(first)
    }
}

impl core::fmt::Display for BackRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BackRef::Receipt(id) => write!(f, "receipt {id}"),
            BackRef::Usage(id) => write!(f, "usage {id}"),
            BackRef::Adjustment(id) => write!(f, "adjustment {id}"),
            BackRef::Transfer(id) => write!(f, "transfer {id}"),
            BackRef::Removal(id) => write!(f, "removal {id}"),
        }
    }
}

/// The two kinds of physical lot a movement can reference.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LotKind {
    Ingredient,
    Beer,
}

impl FromStr for LotKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingredient" => Ok(LotKind::Ingredient),
            "beer" => Ok(LotKind::Beer),
            other => Err(DomainError::validation(format!(
                "invalid lot kind '{other}' (expected ingredient or beer)"
            ))),
        }
    }
}

/// Exactly one physical lot: an ingredient lot or a beer lot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum LotRef {
    Ingredient(IngredientLotId),
    Beer(BeerLotId),
}

impl LotRef {
    pub fn kind(&self) -> LotKind {
        match self {
            LotRef::Ingredient(_) => LotKind::Ingredient,
            LotRef::Beer(_) => LotKind::Beer,
        }
    }

    pub fn ingredient_lot_id(&self) -> Option<IngredientLotId> {
        match self {
            LotRef::Ingredient(id) => Some(*id),
            LotRef::Beer(_) => None,
        }
    }

    pub fn beer_lot_id(&self) -> Option<BeerLotId> {
        match self {
            LotRef::Beer(id) => Some(*id),
            LotRef::Ingredient(_) => None,
        }
    }

    /// The single place where "exactly one of ingredient lot / beer lot" is
    /// checked for column-shaped input (stored rows, raw requests).
    pub fn from_columns(
        ingredient_lot_id: Option<i64>,
        beer_lot_id: Option<i64>,
    ) -> DomainResult<LotRef> {
        match (ingredient_lot_id, beer_lot_id) {
            (Some(id), None) => Ok(LotRef::Ingredient(id.into())),
            (None, Some(id)) => Ok(LotRef::Beer(id.into())),
            (Some(_), Some(_)) => Err(DomainError::validation(
                "exactly one of ingredient lot or beer lot is required, got both",
            )),
            (None, None) => Err(DomainError::validation(
                "exactly one of ingredient lot or beer lot is required, got neither",
            )),
        }
    }
}

impl core::fmt::Display for LotRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LotRef::Ingredient(id) => write!(f, "ingredient lot {id}"),
            LotRef::Beer(id) => write!(f, "beer lot {id}"),
        }
    }
}

/// A movement that has not been written yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMovement {
    pub lot: LotRef,
    pub location: StockLocationId,
    pub direction: Direction,
    pub reason: Reason,
    /// Positive quantity; the sign comes from `direction`.
    pub amount: i64,
    /// Free-form unit, not reconciled against other movements of the lot.
    pub amount_unit: String,
    pub occurred_at: DateTime<Utc>,
    pub back_ref: Option<BackRef>,
}

impl NewMovement {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lot: LotRef,
        location: StockLocationId,
        direction: Direction,
        reason: Reason,
        amount: i64,
        amount_unit: impl Into<String>,
        occurred_at: DateTime<Utc>,
        back_ref: BackRef,
    ) -> DomainResult<Self> {
        let movement = Self {
            lot,
            location,
            direction,
            reason,
            amount,
            amount_unit: amount_unit.into(),
            occurred_at,
            back_ref: Some(back_ref),
        };
        movement.validate()?;
        Ok(movement)
    }

    /// Check every write-time invariant of a ledger entry.
    ///
    /// Fields are public, so the ledger re-runs this on every append.
    pub fn validate(&self) -> DomainResult<()> {
        if self.amount <= 0 {
            return Err(DomainError::validation(format!(
                "movement amount must be positive, got {}",
                self.amount
            )));
        }
        if self.amount_unit.trim().is_empty() {
            return Err(DomainError::validation("movement amount_unit cannot be empty"));
        }
        if !self.reason.permits(self.direction) {
            return Err(DomainError::validation(format!(
                "reason '{}' cannot be recorded with direction '{}'",
                self.reason.as_str(),
                self.direction.as_str()
            )));
        }

        let required = self.reason.required_back_ref();
        match self.back_ref {
            Some(back_ref) if back_ref.kind() == required => Ok(()),
            Some(back_ref) => Err(DomainError::invariant(format!(
                "reason '{}' requires a {} back-reference, got {}",
                self.reason.as_str(),
                required.as_str(),
                back_ref
            ))),
            None => Err(DomainError::invariant(format!(
                "reason '{}' requires a {} back-reference",
                self.reason.as_str(),
                required.as_str()
            ))),
        }
    }

    pub fn signed_amount(&self) -> i64 {
        self.direction.signed(self.amount)
    }
}

/// A written ledger entry. Immutable apart from its deletion timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movement {
    pub id: MovementId,
    pub uuid: Uuid,
    pub lot: LotRef,
    pub location: StockLocationId,
    pub direction: Direction,
    pub reason: Reason,
    pub amount: i64,
    pub amount_unit: String,
    pub occurred_at: DateTime<Utc>,
    pub back_ref: Option<BackRef>,
    /// Display field: external id of the referenced lot, when known.
    pub lot_uuid: Option<Uuid>,
    /// Display field: external id of the stock location, when known.
    pub location_uuid: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Movement {
    /// Materialise a validated [`NewMovement`] as a stored row.
    pub fn from_new(id: MovementId, uuid: Uuid, new: NewMovement, now: DateTime<Utc>) -> Self {
        Self {
            id,
            uuid,
            lot: new.lot,
            location: new.location,
            direction: new.direction,
            reason: new.reason,
            amount: new.amount,
            amount_unit: new.amount_unit,
            occurred_at: new.occurred_at,
            back_ref: new.back_ref,
            lot_uuid: None,
            location_uuid: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn signed_amount(&self) -> i64 {
        self.direction.signed(self.amount)
    }

    pub fn with_display_ids(mut self, lot_uuid: Uuid, location_uuid: Uuid) -> Self {
        self.lot_uuid = Some(lot_uuid);
        self.location_uuid = Some(location_uuid);
        self
    }
}

impl Entity for Movement {
    type Id = MovementId;

    fn id(&self) -> MovementId {
        self.id
    }

    fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl SoftDeletable for Movement {
    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }
}

/// Ledger query. Every field narrows the result; `None` means "any".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MovementFilter {
    pub lot: Option<LotRef>,
    pub location: Option<StockLocationId>,
    pub direction: Option<Direction>,
    pub reason: Option<Reason>,
    pub back_ref: Option<BackRef>,
    pub occurred_from: Option<DateTime<Utc>>,
    pub occurred_to: Option<DateTime<Utc>>,
    pub visibility: Visibility,
}

impl MovementFilter {
    pub fn for_back_ref(back_ref: BackRef) -> Self {
        Self {
            back_ref: Some(back_ref),
            ..Self::default()
        }
    }

    pub fn for_lot_at(lot: LotRef, location: StockLocationId) -> Self {
        Self {
            lot: Some(lot),
            location: Some(location),
            ..Self::default()
        }
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn matches(&self, movement: &Movement) -> bool {
        self.visibility.admits(movement)
            && self.lot.is_none_or(|lot| movement.lot == lot)
            && self.location.is_none_or(|loc| movement.location == loc)
            && self.direction.is_none_or(|d| movement.direction == d)
            && self.reason.is_none_or(|r| movement.reason == r)
            && self.back_ref.is_none_or(|b| movement.back_ref == Some(b))
            && self.occurred_from.is_none_or(|from| movement.occurred_at >= from)
            && self.occurred_to.is_none_or(|to| movement.occurred_at <= to)
    }
}

/// Stable ledger order: event time, then insertion order.
pub fn sort_movements(movements: &mut [Movement]) {
    movements.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then(a.id.cmp(&b.id)));
}

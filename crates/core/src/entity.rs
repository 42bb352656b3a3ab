//! Entity traits: identity + soft-delete lifecycle.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Entity marker + minimal interface.
pub trait Entity {
    /// Strongly-typed internal identifier.
    type Id: Copy + Eq + Ord + core::hash::Hash + core::fmt::Debug;

    /// Returns the surrogate (internal) identifier.
    fn id(&self) -> Self::Id;

    /// Returns the stable external identifier.
    fn uuid(&self) -> Uuid;
}

/// Records deleted by stamping a timestamp rather than removing the row.
pub trait SoftDeletable {
    fn deleted_at(&self) -> Option<DateTime<Utc>>;

    fn is_live(&self) -> bool {
        self.deleted_at().is_none()
    }
}

/// Read visibility for soft-deletable records.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum Visibility {
    /// Only rows without a deletion timestamp (the default for every read).
    #[default]
    Live,
    /// Audit/history views: soft-deleted rows are returned too.
    IncludeDeleted,
}

impl Visibility {
    pub fn admits<T: SoftDeletable + ?Sized>(self, record: &T) -> bool {
        match self {
            Visibility::Live => record.is_live(),
            Visibility::IncludeDeleted => true,
        }
    }

    pub fn includes_deleted(self) -> bool {
        matches!(self, Visibility::IncludeDeleted)
    }
}

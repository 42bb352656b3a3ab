//! Postgres-backed inventory store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (serialization failure / deadlock) | `40001` / `40P01` | `Conflict` |
//! | Database (numeric value out of range) | `22003` | `Corrupt` |
//! | Database (other) | Any other | `Database` |
//! | PoolClosed | N/A | `PoolClosed` |
//! | Other | N/A | `Database` |
//!
//! Rows that decode but break a ledger invariant (two lots, two
//! back-references, unknown reason) surface as `Corrupt`.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use brewstock_core::{
    BeerLotId, DomainError, IngredientLotId, MovementId, RemovalId, StockLocationId, TransferId,
    UsageId, Visibility,
};
use brewstock_inventory::{
    BackRef, BackRefColumns, BeerLot, Catalog, Ingredient, IngredientLot, InventoryRemoval,
    InventoryTransfer, InventoryUsage, LotBalance, LotKind, LotRef, Movement, MovementFilter,
    NewMovement, NewRemoval, NewTransfer, NewUsage, RemovalFilter, StockLocation,
};

use super::{InventoryStore, StoreTx};
use crate::config::InventoryConfig;
use crate::error::StoreError;

const SCHEMA: &str = include_str!("../../schema/inventory.sql");

const MOVEMENT_SELECT: &str = r#"
    SELECT
        m.id, m.uuid, m.ingredient_lot_id, m.beer_lot_id, m.stock_location_id,
        m.direction, m.reason, m.amount, m.amount_unit, m.occurred_at,
        m.receipt_id, m.usage_id, m.adjustment_id, m.transfer_id, m.removal_id,
        m.created_at, m.updated_at, m.deleted_at,
        COALESCE(il.uuid, bl.uuid) AS lot_uuid,
        sl.uuid AS location_uuid
    FROM inventory_movement m
    LEFT JOIN ingredient_lot il ON il.id = m.ingredient_lot_id
    LEFT JOIN beer_lot bl ON bl.id = m.beer_lot_id
    LEFT JOIN stock_location sl ON sl.id = m.stock_location_id
"#;

const MOVEMENT_RETURNING: &str = r#"
    RETURNING
        id, uuid, ingredient_lot_id, beer_lot_id, stock_location_id,
        direction, reason, amount, amount_unit, occurred_at,
        receipt_id, usage_id, adjustment_id, transfer_id, removal_id,
        created_at, updated_at, deleted_at,
        NULL::uuid AS lot_uuid,
        NULL::uuid AS location_uuid
"#;

const USAGE_COLUMNS: &str =
    "id, uuid, production_ref, used_at, notes, created_at, updated_at, deleted_at";

const REMOVAL_COLUMNS: &str = r#"
    id, uuid, category, reason, amount, amount_unit, amount_bbl, is_taxable,
    batch_id, beer_lot_id, stock_location_id, occupancy_id, movement_id,
    removed_at, reference_code, destination, notes, created_at, updated_at, deleted_at
"#;

const TRANSFER_COLUMNS: &str = r#"
    id, uuid, ingredient_lot_id, beer_lot_id, source_location_id, dest_location_id,
    amount, amount_unit, transferred_at, notes, created_at, updated_at, deleted_at
"#;

/// Postgres-backed inventory store.
///
/// Every compound write runs in one database transaction opened by
/// [`InventoryStore::begin`]. Balance reads for batch usage can be
/// serialized per (lot, location) with `pg_advisory_xact_lock`.
#[derive(Debug, Clone)]
pub struct PostgresInventoryStore {
    pool: Arc<PgPool>,
}

impl PostgresInventoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool sized and timed from configuration.
    pub async fn connect(config: &InventoryConfig) -> anyhow::Result<Self> {
        let url = config.require_database_url()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.operation_timeout)
            .connect(url)
            .await
            .context("connecting to the inventory database")?;
        Ok(Self::new(pool))
    }

    /// Create the ledger tables if they don't exist yet.
    #[instrument(skip(self), err)]
    pub async fn apply_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("apply_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl InventoryStore for PostgresInventoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresTx { tx }))
    }

    #[instrument(skip(self, filter), fields(visibility = ?filter.visibility), err)]
    async fn list_movements(&self, filter: &MovementFilter) -> Result<Vec<Movement>, StoreError> {
        let back_ref = BackRef::columns(filter.back_ref);
        let sql = format!(
            r#"{MOVEMENT_SELECT}
            WHERE ($1::bigint IS NULL OR m.ingredient_lot_id = $1)
              AND ($2::bigint IS NULL OR m.beer_lot_id = $2)
              AND ($3::bigint IS NULL OR m.stock_location_id = $3)
              AND ($4::text IS NULL OR m.direction = $4)
              AND ($5::text IS NULL OR m.reason = $5)
              AND ($6::bigint IS NULL OR m.receipt_id = $6)
              AND ($7::bigint IS NULL OR m.usage_id = $7)
              AND ($8::bigint IS NULL OR m.adjustment_id = $8)
              AND ($9::bigint IS NULL OR m.transfer_id = $9)
              AND ($10::bigint IS NULL OR m.removal_id = $10)
              AND ($11::timestamptz IS NULL OR m.occurred_at >= $11)
              AND ($12::timestamptz IS NULL OR m.occurred_at <= $12)
              AND ($13 OR m.deleted_at IS NULL)
            ORDER BY m.occurred_at ASC, m.id ASC
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(filter.lot.and_then(|l| l.ingredient_lot_id()).map(|id| id.get()))
            .bind(filter.lot.and_then(|l| l.beer_lot_id()).map(|id| id.get()))
            .bind(filter.location.map(|id| id.get()))
            .bind(filter.direction.map(|d| d.as_str()))
            .bind(filter.reason.map(|r| r.as_str()))
            .bind(back_ref.receipt_id)
            .bind(back_ref.usage_id)
            .bind(back_ref.adjustment_id)
            .bind(back_ref.transfer_id)
            .bind(back_ref.removal_id)
            .bind(filter.occurred_from)
            .bind(filter.occurred_to)
            .bind(filter.visibility.includes_deleted())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_movements", e))?;

        rows.iter().map(decode_movement).collect()
    }

    async fn get_movement(
        &self,
        id: MovementId,
        visibility: Visibility,
    ) -> Result<Option<Movement>, StoreError> {
        let sql = format!("{MOVEMENT_SELECT} WHERE m.id = $1 AND ($2 OR m.deleted_at IS NULL)");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .bind(visibility.includes_deleted())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_movement", e))?;
        row.as_ref().map(decode_movement).transpose()
    }

    #[instrument(skip(self), err)]
    async fn lot_balances(&self, kind: LotKind) -> Result<Vec<LotBalance>, StoreError> {
        let sql = format!(
            r#"
            SELECT
                ingredient_lot_id,
                beer_lot_id,
                stock_location_id,
                amount_unit,
                SUM(CASE WHEN direction = 'in' THEN amount ELSE -amount END)::BIGINT AS quantity
            FROM inventory_movement
            WHERE deleted_at IS NULL AND {} IS NOT NULL
            GROUP BY ingredient_lot_id, beer_lot_id, stock_location_id, amount_unit
            ORDER BY ingredient_lot_id, beer_lot_id, stock_location_id, amount_unit
            "#,
            lot_column(kind)
        );

        let rows = sqlx::query(&sql)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("lot_balances", e))?;

        rows.iter()
            .map(|row| {
                let lot = LotRef::from_columns(
                    row.try_get("ingredient_lot_id").map_err(decode_error)?,
                    row.try_get("beer_lot_id").map_err(decode_error)?,
                )
                .map_err(|e| corrupt("balance row", e))?;
                Ok(LotBalance {
                    lot,
                    location: StockLocationId::new(
                        row.try_get("stock_location_id").map_err(decode_error)?,
                    ),
                    amount_unit: row.try_get("amount_unit").map_err(decode_error)?,
                    quantity: row.try_get("quantity").map_err(decode_error)?,
                })
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn catalog(&self) -> Result<Catalog, StoreError> {
        let ingredients = sqlx::query(
            "SELECT id, uuid, name, category, deleted_at FROM ingredient WHERE deleted_at IS NULL",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("catalog_ingredients", e))?;

        let ingredient_lots = sqlx::query(
            r#"
            SELECT id, uuid, ingredient_id, lot_code, received_at, deleted_at
            FROM ingredient_lot
            WHERE deleted_at IS NULL
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("catalog_ingredient_lots", e))?;

        let beer_lots = sqlx::query(
            r#"
            SELECT id, uuid, batch_id, lot_code, package_format, volume_per_unit,
                   packaged_at, deleted_at
            FROM beer_lot
            WHERE deleted_at IS NULL
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("catalog_beer_lots", e))?;

        let locations = sqlx::query(
            "SELECT id, uuid, name, deleted_at FROM stock_location WHERE deleted_at IS NULL",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("catalog_locations", e))?;

        Ok(Catalog::from_live(
            decode_all(&ingredients, ingredient_from_row)?,
            decode_all(&ingredient_lots, ingredient_lot_from_row)?,
            decode_all(&beer_lots, beer_lot_from_row)?,
            decode_all(&locations, location_from_row)?,
        ))
    }

    async fn get_usage(
        &self,
        id: UsageId,
        visibility: Visibility,
    ) -> Result<Option<InventoryUsage>, StoreError> {
        let sql = format!(
            r#"
            SELECT {USAGE_COLUMNS} FROM inventory_usage
            WHERE id = $1 AND ($2 OR deleted_at IS NULL)
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .bind(visibility.includes_deleted())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_usage", e))?;
        row.as_ref()
            .map(|r| usage_from_row(r).map_err(decode_error))
            .transpose()
    }

    async fn get_removal(
        &self,
        id: RemovalId,
        visibility: Visibility,
    ) -> Result<Option<InventoryRemoval>, StoreError> {
        let sql = format!(
            r#"
            SELECT {REMOVAL_COLUMNS} FROM inventory_removal
            WHERE id = $1 AND ($2 OR deleted_at IS NULL)
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .bind(visibility.includes_deleted())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_removal", e))?;
        row.as_ref().map(decode_removal).transpose()
    }

    #[instrument(skip(self, filter), err)]
    async fn list_removals(
        &self,
        filter: &RemovalFilter,
    ) -> Result<Vec<InventoryRemoval>, StoreError> {
        let sql = format!(
            r#"
            SELECT {REMOVAL_COLUMNS}
            FROM inventory_removal
            WHERE ($1::text IS NULL OR category = $1)
              AND ($2::bigint IS NULL OR batch_id = $2)
              AND ($3::bigint IS NULL OR beer_lot_id = $3)
              AND ($4::timestamptz IS NULL OR removed_at >= $4)
              AND ($5::timestamptz IS NULL OR removed_at <= $5)
              AND ($6 OR deleted_at IS NULL)
            ORDER BY removed_at ASC, id ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.category.map(|c| c.as_str()))
            .bind(filter.batch_id.map(|id| id.get()))
            .bind(filter.beer_lot_id.map(|id| id.get()))
            .bind(filter.removed_from)
            .bind(filter.removed_to)
            .bind(filter.visibility.includes_deleted())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_removals", e))?;
        rows.iter().map(decode_removal).collect()
    }

    async fn get_transfer(
        &self,
        id: TransferId,
        visibility: Visibility,
    ) -> Result<Option<InventoryTransfer>, StoreError> {
        let sql = format!(
            r#"
            SELECT {TRANSFER_COLUMNS} FROM inventory_transfer
            WHERE id = $1 AND ($2 OR deleted_at IS NULL)
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .bind(visibility.includes_deleted())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_transfer", e))?;
        row.as_ref().map(decode_transfer).transpose()
    }
}

struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PostgresTx {
    async fn ingredient_lot(
        &mut self,
        id: IngredientLotId,
    ) -> Result<Option<IngredientLot>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, uuid, ingredient_id, lot_code, received_at, deleted_at
            FROM ingredient_lot
            WHERE id = $1 AND deleted_at IS NULL
            FOR SHARE
            "#,
        )
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("ingredient_lot", e))?;
        row.as_ref()
            .map(|r| ingredient_lot_from_row(r).map_err(decode_error))
            .transpose()
    }

    async fn beer_lot(&mut self, id: BeerLotId) -> Result<Option<BeerLot>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, uuid, batch_id, lot_code, package_format, volume_per_unit,
                   packaged_at, deleted_at
            FROM beer_lot
            WHERE id = $1 AND deleted_at IS NULL
            FOR SHARE
            "#,
        )
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("beer_lot", e))?;
        row.as_ref()
            .map(|r| beer_lot_from_row(r).map_err(decode_error))
            .transpose()
    }

    async fn stock_location(
        &mut self,
        id: StockLocationId,
    ) -> Result<Option<StockLocation>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, uuid, name, deleted_at
            FROM stock_location
            WHERE id = $1 AND deleted_at IS NULL
            FOR SHARE
            "#,
        )
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("stock_location", e))?;
        row.as_ref()
            .map(|r| location_from_row(r).map_err(decode_error))
            .transpose()
    }

    #[instrument(skip(self), fields(lot = %lot, location = %location), err)]
    async fn lock_lot_balance(
        &mut self,
        lot: LotRef,
        location: StockLocationId,
    ) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("inventory_balance:{lot}@{location}"))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_lot_balance", e))?;
        Ok(())
    }

    async fn lot_balance(
        &mut self,
        lot: LotRef,
        location: StockLocationId,
    ) -> Result<i64, StoreError> {
        let (column, lot_id) = match lot {
            LotRef::Ingredient(id) => (lot_column(LotKind::Ingredient), id.get()),
            LotRef::Beer(id) => (lot_column(LotKind::Beer), id.get()),
        };
        let sql = format!(
            r#"
            SELECT COALESCE(
                SUM(CASE WHEN direction = 'in' THEN amount ELSE -amount END), 0
            )::BIGINT AS balance
            FROM inventory_movement
            WHERE deleted_at IS NULL AND {column} = $1 AND stock_location_id = $2
            "#
        );
        let row = sqlx::query(&sql)
            .bind(lot_id)
            .bind(location.get())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lot_balance", e))?;
        row.try_get("balance").map_err(decode_error)
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
    async fn insert_movement(&mut self, movement: NewMovement) -> Result<Movement, StoreError> {
        movement
            .validate()
            .map_err(|e| StoreError::Database(format!("check constraint violated: {e}")))?;
        let back_ref = BackRef::columns(movement.back_ref);
        let sql = format!(
            r#"
            INSERT INTO inventory_movement (
                uuid, ingredient_lot_id, beer_lot_id, stock_location_id,
                direction, reason, amount, amount_unit, occurred_at,
                receipt_id, usage_id, adjustment_id, transfer_id, removal_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            {MOVEMENT_RETURNING}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::now_v7())
            .bind(movement.lot.ingredient_lot_id().map(|id| id.get()))
            .bind(movement.lot.beer_lot_id().map(|id| id.get()))
            .bind(movement.location.get())
            .bind(movement.direction.as_str())
            .bind(movement.reason.as_str())
            .bind(movement.amount)
            .bind(&movement.amount_unit)
            .bind(movement.occurred_at)
            .bind(back_ref.receipt_id)
            .bind(back_ref.usage_id)
            .bind(back_ref.adjustment_id)
            .bind(back_ref.transfer_id)
            .bind(back_ref.removal_id)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_movement", e))?;
        decode_movement(&row)
    }

    async fn soft_delete_movement(&mut self, id: MovementId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE inventory_movement
            SET deleted_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id.get())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("soft_delete_movement", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn movement(&mut self, id: MovementId) -> Result<Option<Movement>, StoreError> {
        let sql = format!("{MOVEMENT_SELECT} WHERE m.id = $1 AND m.deleted_at IS NULL");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("movement", e))?;
        row.as_ref().map(decode_movement).transpose()
    }

    async fn insert_usage(&mut self, usage: NewUsage) -> Result<InventoryUsage, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO inventory_usage (uuid, production_ref, used_at, notes)
            VALUES ($1, $2, $3, $4)
            RETURNING {USAGE_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::now_v7())
            .bind(usage.production_ref)
            .bind(usage.used_at)
            .bind(&usage.notes)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_usage", e))?;
        usage_from_row(&row).map_err(decode_error)
    }

    async fn soft_delete_usage(&mut self, id: UsageId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE inventory_usage
            SET deleted_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id.get())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("soft_delete_usage", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_removal(
        &mut self,
        removal: NewRemoval,
    ) -> Result<InventoryRemoval, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO inventory_removal (
                uuid, category, reason, amount, amount_unit, amount_bbl, is_taxable,
                batch_id, beer_lot_id, stock_location_id, occupancy_id,
                removed_at, reference_code, destination, notes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING {REMOVAL_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::now_v7())
            .bind(removal.category.as_str())
            .bind(&removal.reason)
            .bind(removal.amount)
            .bind(&removal.amount_unit)
            .bind(removal.amount_bbl)
            .bind(removal.is_taxable)
            .bind(removal.batch_id.map(|id| id.get()))
            .bind(removal.beer_lot_id.map(|id| id.get()))
            .bind(removal.stock_location_id.map(|id| id.get()))
            .bind(removal.occupancy_id.map(|id| id.get()))
            .bind(removal.removed_at)
            .bind(&removal.reference_code)
            .bind(&removal.destination)
            .bind(&removal.notes)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_removal", e))?;
        decode_removal(&row)
    }

    async fn removal_for_update(
        &mut self,
        id: RemovalId,
    ) -> Result<Option<InventoryRemoval>, StoreError> {
        let sql = format!(
            r#"
            SELECT {REMOVAL_COLUMNS} FROM inventory_removal
            WHERE id = $1 AND deleted_at IS NULL
            FOR UPDATE
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("removal_for_update", e))?;
        row.as_ref().map(decode_removal).transpose()
    }

    async fn update_removal(
        &mut self,
        removal: &InventoryRemoval,
    ) -> Result<InventoryRemoval, StoreError> {
        let sql = format!(
            r#"
            UPDATE inventory_removal
            SET category = $2,
                reason = $3,
                amount = $4,
                amount_unit = $5,
                amount_bbl = $6,
                is_taxable = $7,
                movement_id = $8,
                removed_at = $9,
                reference_code = $10,
                destination = $11,
                notes = $12,
                updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING {REMOVAL_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(removal.id.get())
            .bind(removal.category.as_str())
            .bind(&removal.reason)
            .bind(removal.amount)
            .bind(&removal.amount_unit)
            .bind(removal.amount_bbl)
            .bind(removal.is_taxable)
            .bind(removal.movement_id.map(|id| id.get()))
            .bind(removal.removed_at)
            .bind(&removal.reference_code)
            .bind(&removal.destination)
            .bind(&removal.notes)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("update_removal", e))?;
        match row {
            Some(row) => decode_removal(&row),
            None => Err(StoreError::Conflict(format!(
                "removal {} is missing or deleted",
                removal.id
            ))),
        }
    }

    async fn soft_delete_removal(&mut self, id: RemovalId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE inventory_removal
            SET deleted_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id.get())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("soft_delete_removal", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_transfer(
        &mut self,
        transfer: NewTransfer,
    ) -> Result<InventoryTransfer, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO inventory_transfer (
                uuid, ingredient_lot_id, beer_lot_id, source_location_id, dest_location_id,
                amount, amount_unit, transferred_at, notes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {TRANSFER_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::now_v7())
            .bind(transfer.lot.ingredient_lot_id().map(|id| id.get()))
            .bind(transfer.lot.beer_lot_id().map(|id| id.get()))
            .bind(transfer.source_location_id.get())
            .bind(transfer.dest_location_id.get())
            .bind(transfer.amount)
            .bind(&transfer.amount_unit)
            .bind(transfer.transferred_at)
            .bind(&transfer.notes)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_transfer", e))?;
        decode_transfer(&row)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn lot_column(kind: LotKind) -> &'static str {
    match kind {
        LotKind::Ingredient => "ingredient_lot_id",
        LotKind::Beer => "beer_lot_id",
    }
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // unique violation, serialization failure, deadlock
                Some("23505") | Some("40001") | Some("40P01") => StoreError::Conflict(msg),
                // a balance sum no longer fits in bigint
                Some("22003") => StoreError::Corrupt(msg),
                _ => StoreError::Database(msg),
            }
        }
        sqlx::Error::PoolClosed => StoreError::PoolClosed,
        sqlx::Error::PoolTimedOut => {
            StoreError::Database(format!("timed out acquiring a connection in {operation}"))
        }
        _ => StoreError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn decode_error(err: sqlx::Error) -> StoreError {
    StoreError::Corrupt(format!("failed to decode row: {err}"))
}

fn corrupt(what: &str, err: DomainError) -> StoreError {
    StoreError::Corrupt(format!("{what}: {err}"))
}

fn decode_all<T>(
    rows: &[PgRow],
    decode: fn(&PgRow) -> Result<T, sqlx::Error>,
) -> Result<Vec<T>, StoreError> {
    rows.iter().map(|r| decode(r).map_err(decode_error)).collect()
}

/// Raw movement row as stored (before ledger invariants are checked).
#[derive(Debug)]
struct MovementRow {
    id: i64,
    uuid: Uuid,
    ingredient_lot_id: Option<i64>,
    beer_lot_id: Option<i64>,
    stock_location_id: i64,
    direction: String,
    reason: String,
    amount: i64,
    amount_unit: String,
    occurred_at: DateTime<Utc>,
    back_ref: BackRefColumns,
    lot_uuid: Option<Uuid>,
    location_uuid: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for MovementRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(MovementRow {
            id: row.try_get("id")?,
            uuid: row.try_get("uuid")?,
            ingredient_lot_id: row.try_get("ingredient_lot_id")?,
            beer_lot_id: row.try_get("beer_lot_id")?,
            stock_location_id: row.try_get("stock_location_id")?,
            direction: row.try_get("direction")?,
            reason: row.try_get("reason")?,
            amount: row.try_get("amount")?,
            amount_unit: row.try_get("amount_unit")?,
            occurred_at: row.try_get("occurred_at")?,
            back_ref: BackRefColumns {
                receipt_id: row.try_get("receipt_id")?,
                usage_id: row.try_get("usage_id")?,
                adjustment_id: row.try_get("adjustment_id")?,
                transfer_id: row.try_get("transfer_id")?,
                removal_id: row.try_get("removal_id")?,
            },
            lot_uuid: row.try_get("lot_uuid")?,
            location_uuid: row.try_get("location_uuid")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}

impl TryFrom<MovementRow> for Movement {
    type Error = StoreError;

    fn try_from(row: MovementRow) -> Result<Self, Self::Error> {
        let what = format!("movement {}", row.id);
        Ok(Movement {
            id: MovementId::new(row.id),
            uuid: row.uuid,
            lot: LotRef::from_columns(row.ingredient_lot_id, row.beer_lot_id)
                .map_err(|e| corrupt(&what, e))?,
            location: StockLocationId::new(row.stock_location_id),
            direction: row.direction.parse().map_err(|e| corrupt(&what, e))?,
            reason: row.reason.parse().map_err(|e| corrupt(&what, e))?,
            amount: row.amount,
            amount_unit: row.amount_unit,
            occurred_at: row.occurred_at,
            back_ref: BackRef::from_columns(row.back_ref).map_err(|e| corrupt(&what, e))?,
            lot_uuid: row.lot_uuid,
            location_uuid: row.location_uuid,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

fn decode_movement(row: &PgRow) -> Result<Movement, StoreError> {
    MovementRow::from_row(row).map_err(decode_error)?.try_into()
}

fn decode_removal(row: &PgRow) -> Result<InventoryRemoval, StoreError> {
    let id: i64 = row.try_get("id").map_err(decode_error)?;
    let category: String = row.try_get("category").map_err(decode_error)?;
    let get_id = |column: &str| -> Result<Option<i64>, StoreError> {
        row.try_get(column).map_err(decode_error)
    };
    Ok(InventoryRemoval {
        id: RemovalId::new(id),
        uuid: row.try_get("uuid").map_err(decode_error)?,
        category: category
            .parse()
            .map_err(|e| corrupt(&format!("removal {id}"), e))?,
        reason: row.try_get("reason").map_err(decode_error)?,
        amount: row.try_get("amount").map_err(decode_error)?,
        amount_unit: row.try_get("amount_unit").map_err(decode_error)?,
        amount_bbl: row.try_get("amount_bbl").map_err(decode_error)?,
        is_taxable: row.try_get("is_taxable").map_err(decode_error)?,
        batch_id: get_id("batch_id")?.map(Into::into),
        beer_lot_id: get_id("beer_lot_id")?.map(Into::into),
        stock_location_id: get_id("stock_location_id")?.map(Into::into),
        occupancy_id: get_id("occupancy_id")?.map(Into::into),
        movement_id: get_id("movement_id")?.map(Into::into),
        removed_at: row.try_get("removed_at").map_err(decode_error)?,
        reference_code: row.try_get("reference_code").map_err(decode_error)?,
        destination: row.try_get("destination").map_err(decode_error)?,
        notes: row.try_get("notes").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
        deleted_at: row.try_get("deleted_at").map_err(decode_error)?,
    })
}

fn decode_transfer(row: &PgRow) -> Result<InventoryTransfer, StoreError> {
    let id: i64 = row.try_get("id").map_err(decode_error)?;
    let lot = LotRef::from_columns(
        row.try_get("ingredient_lot_id").map_err(decode_error)?,
        row.try_get("beer_lot_id").map_err(decode_error)?,
    )
    .map_err(|e| corrupt(&format!("transfer {id}"), e))?;
    Ok(InventoryTransfer {
        id: TransferId::new(id),
        uuid: row.try_get("uuid").map_err(decode_error)?,
        lot,
        source_location_id: StockLocationId::new(
            row.try_get("source_location_id").map_err(decode_error)?,
        ),
        dest_location_id: StockLocationId::new(
            row.try_get("dest_location_id").map_err(decode_error)?,
        ),
        amount: row.try_get("amount").map_err(decode_error)?,
        amount_unit: row.try_get("amount_unit").map_err(decode_error)?,
        transferred_at: row.try_get("transferred_at").map_err(decode_error)?,
        notes: row.try_get("notes").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
        deleted_at: row.try_get("deleted_at").map_err(decode_error)?,
    })
}

fn usage_from_row(row: &PgRow) -> Result<InventoryUsage, sqlx::Error> {
    Ok(InventoryUsage {
        id: UsageId::new(row.try_get("id")?),
        uuid: row.try_get("uuid")?,
        production_ref: row.try_get("production_ref")?,
        used_at: row.try_get("used_at")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn ingredient_from_row(row: &PgRow) -> Result<Ingredient, sqlx::Error> {
    Ok(Ingredient {
        id: row.try_get::<i64, _>("id")?.into(),
        uuid: row.try_get("uuid")?,
        name: row.try_get("name")?,
        category: row.try_get("category")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn ingredient_lot_from_row(row: &PgRow) -> Result<IngredientLot, sqlx::Error> {
    Ok(IngredientLot {
        id: row.try_get::<i64, _>("id")?.into(),
        uuid: row.try_get("uuid")?,
        ingredient_id: row.try_get::<i64, _>("ingredient_id")?.into(),
        lot_code: row.try_get("lot_code")?,
        received_at: row.try_get("received_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn beer_lot_from_row(row: &PgRow) -> Result<BeerLot, sqlx::Error> {
    Ok(BeerLot {
        id: row.try_get::<i64, _>("id")?.into(),
        uuid: row.try_get("uuid")?,
        batch_id: row.try_get::<Option<i64>, _>("batch_id")?.map(Into::into),
        lot_code: row.try_get("lot_code")?,
        package_format: row.try_get("package_format")?,
        volume_per_unit: row.try_get("volume_per_unit")?,
        packaged_at: row.try_get("packaged_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn location_from_row(row: &PgRow) -> Result<StockLocation, sqlx::Error> {
    Ok(StockLocation {
        id: row.try_get::<i64, _>("id")?.into(),
        uuid: row.try_get("uuid")?,
        name: row.try_get("name")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

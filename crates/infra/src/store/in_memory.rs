use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use brewstock_core::{
    BatchId, BeerLotId, Entity, IngredientId, IngredientLotId, MovementId, RemovalId,
    SoftDeletable, StockLocationId, TransferId, UsageId, Visibility,
};
use brewstock_inventory::movement::sort_movements;
use brewstock_inventory::stock::{balance_of, fold_balances};
use brewstock_inventory::{
    BeerLot, Catalog, Ingredient, IngredientLot, InventoryRemoval, InventoryTransfer,
    InventoryUsage, LotBalance, LotKind, LotRef, Movement, MovementFilter, NewMovement, NewRemoval,
    NewTransfer, NewUsage, RemovalFilter, StockLocation,
};

use super::{InventoryStore, StoreTx};
use crate::error::StoreError;

#[derive(Debug, Default, Clone)]
struct Tables {
    ingredients: BTreeMap<IngredientId, Ingredient>,
    ingredient_lots: BTreeMap<IngredientLotId, IngredientLot>,
    beer_lots: BTreeMap<BeerLotId, BeerLot>,
    locations: BTreeMap<StockLocationId, StockLocation>,
    movements: BTreeMap<MovementId, Movement>,
    usages: BTreeMap<UsageId, InventoryUsage>,
    removals: BTreeMap<RemovalId, InventoryRemoval>,
    transfers: BTreeMap<TransferId, InventoryTransfer>,
}

impl Tables {
    /// Overwrite committed rows with a transaction's pending versions.
    fn absorb(&mut self, pending: Tables) {
        self.ingredients.extend(pending.ingredients);
        self.ingredient_lots.extend(pending.ingredient_lots);
        self.beer_lots.extend(pending.beer_lots);
        self.locations.extend(pending.locations);
        self.movements.extend(pending.movements);
        self.usages.extend(pending.usages);
        self.removals.extend(pending.removals);
        self.transfers.extend(pending.transfers);
    }

    fn with_display_ids(&self, movement: Movement) -> Movement {
        let lot_uuid = match movement.lot {
            LotRef::Ingredient(id) => self.ingredient_lots.get(&id).map(|l| l.uuid),
            LotRef::Beer(id) => self.beer_lots.get(&id).map(|l| l.uuid),
        };
        let location_uuid = self.locations.get(&movement.location).map(|l| l.uuid);
        Movement {
            lot_uuid,
            location_uuid,
            ..movement
        }
    }
}

type BalanceKey = (LotRef, StockLocationId);

#[derive(Debug, Default)]
struct Shared {
    tables: RwLock<Tables>,
    next_id: AtomicI64,
    balance_locks: Mutex<HashMap<BalanceKey, Arc<tokio::sync::Mutex<()>>>>,
    /// Writes left before an injected failure fires.
    failing_write: Mutex<Option<usize>>,
}

impl Shared {
    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_write(&self, operation: &str) -> Result<(), StoreError> {
        let mut failing = self
            .failing_write
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *failing {
            Some(0) => {
                *failing = None;
                Err(StoreError::Database(format!(
                    "injected write failure in {operation}"
                )))
            }
            Some(n) => {
                *failing = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// In-memory inventory store.
///
/// Intended for tests/dev. Transactions read committed data overlaid with
/// their own pending writes, and publish those writes atomically on commit.
/// Balance locks are real, so concurrent batch usage behaves the way it does
/// against Postgres under the same locking mode.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryStore {
    shared: Arc<Shared>,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_ingredient(&self, name: &str, category: Option<&str>) -> Ingredient {
        let ingredient = Ingredient {
            id: IngredientId::new(self.shared.next_id()),
            uuid: Uuid::now_v7(),
            name: name.to_string(),
            category: category.map(str::to_string),
            deleted_at: None,
        };
        self.shared
            .write()
            .ingredients
            .insert(ingredient.id, ingredient.clone());
        ingredient
    }

    pub fn seed_ingredient_lot(
        &self,
        ingredient_id: IngredientId,
        lot_code: Option<&str>,
        received_at: DateTime<Utc>,
    ) -> IngredientLot {
        let lot = IngredientLot {
            id: IngredientLotId::new(self.shared.next_id()),
            uuid: Uuid::now_v7(),
            ingredient_id,
            lot_code: lot_code.map(str::to_string),
            received_at,
            deleted_at: None,
        };
        self.shared
            .write()
            .ingredient_lots
            .insert(lot.id, lot.clone());
        lot
    }

    pub fn seed_beer_lot(
        &self,
        batch_id: Option<BatchId>,
        lot_code: Option<&str>,
        package_format: Option<&str>,
        volume_per_unit: Option<i64>,
        packaged_at: DateTime<Utc>,
    ) -> BeerLot {
        let lot = BeerLot {
            id: BeerLotId::new(self.shared.next_id()),
            uuid: Uuid::now_v7(),
            batch_id,
            lot_code: lot_code.map(str::to_string),
            package_format: package_format.map(str::to_string),
            volume_per_unit,
            packaged_at,
            deleted_at: None,
        };
        self.shared.write().beer_lots.insert(lot.id, lot.clone());
        lot
    }

    pub fn seed_location(&self, name: &str) -> StockLocation {
        let location = StockLocation {
            id: StockLocationId::new(self.shared.next_id()),
            uuid: Uuid::now_v7(),
            name: name.to_string(),
            deleted_at: None,
        };
        self.shared
            .write()
            .locations
            .insert(location.id, location.clone());
        location
    }

    pub fn soft_delete_location(&self, id: StockLocationId) -> bool {
        let mut tables = self.shared.write();
        match tables.locations.get_mut(&id) {
            Some(location) if location.is_live() => {
                location.deleted_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    pub fn soft_delete_ingredient_lot(&self, id: IngredientLotId) -> bool {
        let mut tables = self.shared.write();
        match tables.ingredient_lots.get_mut(&id) {
            Some(lot) if lot.is_live() => {
                lot.deleted_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Let `successful_writes` more writes through, then fail the next one.
    pub fn fail_write_after(&self, successful_writes: usize) {
        *self
            .shared
            .failing_write
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(successful_writes);
    }

    /// Every movement row, deleted ones included, in id order.
    pub fn movement_rows(&self) -> Vec<Movement> {
        self.shared.read().movements.values().cloned().collect()
    }

    pub fn usage_rows(&self) -> Vec<InventoryUsage> {
        self.shared.read().usages.values().cloned().collect()
    }

    pub fn removal_rows(&self) -> Vec<InventoryRemoval> {
        self.shared.read().removals.values().cloned().collect()
    }

    pub fn transfer_rows(&self) -> Vec<InventoryTransfer> {
        self.shared.read().transfers.values().cloned().collect()
    }
}

fn live_row<K: Ord, V: SoftDeletable + Clone>(
    pending: &BTreeMap<K, V>,
    committed: &BTreeMap<K, V>,
    id: &K,
) -> Option<V> {
    pending
        .get(id)
        .or_else(|| committed.get(id))
        .filter(|row| row.is_live())
        .cloned()
}

fn visible_row<K: Ord, V: SoftDeletable + Clone>(
    table: &BTreeMap<K, V>,
    id: &K,
    visibility: Visibility,
) -> Option<V> {
    table.get(id).filter(|row| visibility.admits(*row)).cloned()
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        Ok(Box::new(InMemoryTx {
            shared: Arc::clone(&self.shared),
            pending: Tables::default(),
            held_locks: HashSet::new(),
            guards: Vec::new(),
        }))
    }

    async fn list_movements(&self, filter: &MovementFilter) -> Result<Vec<Movement>, StoreError> {
        let tables = self.shared.read();
        let mut movements: Vec<Movement> = tables
            .movements
            .values()
            .filter(|m| filter.matches(m))
            .map(|m| tables.with_display_ids(m.clone()))
            .collect();
        sort_movements(&mut movements);
        Ok(movements)
    }

    async fn get_movement(
        &self,
        id: MovementId,
        visibility: Visibility,
    ) -> Result<Option<Movement>, StoreError> {
        let tables = self.shared.read();
        Ok(visible_row(&tables.movements, &id, visibility).map(|m| tables.with_display_ids(m)))
    }

    async fn lot_balances(&self, kind: LotKind) -> Result<Vec<LotBalance>, StoreError> {
        let tables = self.shared.read();
        let balances = fold_balances(tables.movements.values())
            .map_err(|e| StoreError::Corrupt(format!("lot balances: {e}")))?;
        Ok(balances.into_iter().filter(|b| b.lot.kind() == kind).collect())
    }

    async fn catalog(&self) -> Result<Catalog, StoreError> {
        let tables = self.shared.read();
        Ok(Catalog::from_live(
            tables.ingredients.values().cloned(),
            tables.ingredient_lots.values().cloned(),
            tables.beer_lots.values().cloned(),
            tables.locations.values().cloned(),
        ))
    }

    async fn get_usage(
        &self,
        id: UsageId,
        visibility: Visibility,
    ) -> Result<Option<InventoryUsage>, StoreError> {
        Ok(visible_row(&self.shared.read().usages, &id, visibility))
    }

    async fn get_removal(
        &self,
        id: RemovalId,
        visibility: Visibility,
    ) -> Result<Option<InventoryRemoval>, StoreError> {
        Ok(visible_row(&self.shared.read().removals, &id, visibility))
    }

    async fn list_removals(
        &self,
        filter: &RemovalFilter,
    ) -> Result<Vec<InventoryRemoval>, StoreError> {
        let mut removals: Vec<InventoryRemoval> = self
            .shared
            .read()
            .removals
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        removals.sort_by(|a, b| a.removed_at.cmp(&b.removed_at).then(a.id.cmp(&b.id)));
        Ok(removals)
    }

    async fn get_transfer(
        &self,
        id: TransferId,
        visibility: Visibility,
    ) -> Result<Option<InventoryTransfer>, StoreError> {
        Ok(visible_row(&self.shared.read().transfers, &id, visibility))
    }
}

struct InMemoryTx {
    shared: Arc<Shared>,
    pending: Tables,
    held_locks: HashSet<BalanceKey>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl InMemoryTx {
    fn live_movement(&self, id: MovementId) -> Option<Movement> {
        live_row(&self.pending.movements, &self.shared.read().movements, &id)
    }
}

#[async_trait]
impl StoreTx for InMemoryTx {
    async fn ingredient_lot(
        &mut self,
        id: IngredientLotId,
    ) -> Result<Option<IngredientLot>, StoreError> {
        let committed = self.shared.read();
        Ok(live_row(
            &self.pending.ingredient_lots,
            &committed.ingredient_lots,
            &id,
        ))
    }

    async fn beer_lot(&mut self, id: BeerLotId) -> Result<Option<BeerLot>, StoreError> {
        let committed = self.shared.read();
        Ok(live_row(&self.pending.beer_lots, &committed.beer_lots, &id))
    }

    async fn stock_location(
        &mut self,
        id: StockLocationId,
    ) -> Result<Option<StockLocation>, StoreError> {
        let committed = self.shared.read();
        Ok(live_row(&self.pending.locations, &committed.locations, &id))
    }

    async fn lock_lot_balance(
        &mut self,
        lot: LotRef,
        location: StockLocationId,
    ) -> Result<(), StoreError> {
        let key = (lot, location);
        if self.held_locks.contains(&key) {
            return Ok(());
        }
        let lock = {
            let mut locks = self
                .shared
                .balance_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key).or_default())
        };
        self.guards.push(lock.lock_owned().await);
        self.held_locks.insert(key);
        Ok(())
    }

    async fn lot_balance(
        &mut self,
        lot: LotRef,
        location: StockLocationId,
    ) -> Result<i64, StoreError> {
        let committed = self.shared.read();
        let pending = &self.pending.movements;
        let visible = committed
            .movements
            .values()
            .filter(|m| !pending.contains_key(&m.id))
            .chain(pending.values());
        balance_of(visible, lot, location)
            .map_err(|e| StoreError::Corrupt(format!("lot balance: {e}")))
    }

    async fn insert_movement(&mut self, movement: NewMovement) -> Result<Movement, StoreError> {
        self.shared.check_write("insert_movement")?;
        movement
            .validate()
            .map_err(|e| StoreError::Database(format!("check constraint violated: {e}")))?;
        let row = Movement::from_new(
            MovementId::new(self.shared.next_id()),
            Uuid::now_v7(),
            movement,
            Utc::now(),
        );
        self.pending.movements.insert(row.id, row.clone());
        Ok(row)
    }

    async fn soft_delete_movement(&mut self, id: MovementId) -> Result<bool, StoreError> {
        self.shared.check_write("soft_delete_movement")?;
        let Some(mut movement) = self.live_movement(id) else {
            return Ok(false);
        };
        let now = Utc::now();
        movement.deleted_at = Some(now);
        movement.updated_at = now;
        self.pending.movements.insert(id, movement);
        Ok(true)
    }

    async fn movement(&mut self, id: MovementId) -> Result<Option<Movement>, StoreError> {
        let movement = self.live_movement(id);
        let committed = self.shared.read();
        Ok(movement.map(|m| committed.with_display_ids(m)))
    }

    async fn insert_usage(&mut self, usage: NewUsage) -> Result<InventoryUsage, StoreError> {
        self.shared.check_write("insert_usage")?;
        let row = InventoryUsage::from_new(
            UsageId::new(self.shared.next_id()),
            Uuid::now_v7(),
            usage,
            Utc::now(),
        );
        self.pending.usages.insert(row.id, row.clone());
        Ok(row)
    }

    async fn soft_delete_usage(&mut self, id: UsageId) -> Result<bool, StoreError> {
        self.shared.check_write("soft_delete_usage")?;
        let current = live_row(&self.pending.usages, &self.shared.read().usages, &id);
        let Some(mut usage) = current else {
            return Ok(false);
        };
        let now = Utc::now();
        usage.deleted_at = Some(now);
        usage.updated_at = now;
        self.pending.usages.insert(id, usage);
        Ok(true)
    }

    async fn insert_removal(
        &mut self,
        removal: NewRemoval,
    ) -> Result<InventoryRemoval, StoreError> {
        self.shared.check_write("insert_removal")?;
        let row = InventoryRemoval::from_new(
            RemovalId::new(self.shared.next_id()),
            Uuid::now_v7(),
            removal,
            Utc::now(),
        );
        self.pending.removals.insert(row.id, row.clone());
        Ok(row)
    }

    async fn removal_for_update(
        &mut self,
        id: RemovalId,
    ) -> Result<Option<InventoryRemoval>, StoreError> {
        Ok(live_row(
            &self.pending.removals,
            &self.shared.read().removals,
            &id,
        ))
    }

    async fn update_removal(
        &mut self,
        removal: &InventoryRemoval,
    ) -> Result<InventoryRemoval, StoreError> {
        self.shared.check_write("update_removal")?;
        let exists = live_row(
            &self.pending.removals,
            &self.shared.read().removals,
            &removal.id(),
        )
        .is_some();
        if !exists {
            return Err(StoreError::Conflict(format!(
                "removal {} is missing or deleted",
                removal.id
            )));
        }
        let mut row = removal.clone();
        row.updated_at = Utc::now();
        self.pending.removals.insert(row.id, row.clone());
        Ok(row)
    }

    async fn soft_delete_removal(&mut self, id: RemovalId) -> Result<bool, StoreError> {
        self.shared.check_write("soft_delete_removal")?;
        let current = live_row(&self.pending.removals, &self.shared.read().removals, &id);
        let Some(mut removal) = current else {
            return Ok(false);
        };
        let now = Utc::now();
        removal.deleted_at = Some(now);
        removal.updated_at = now;
        self.pending.removals.insert(id, removal);
        Ok(true)
    }

    async fn insert_transfer(
        &mut self,
        transfer: NewTransfer,
    ) -> Result<InventoryTransfer, StoreError> {
        self.shared.check_write("insert_transfer")?;
        let row = InventoryTransfer::from_new(
            TransferId::new(self.shared.next_id()),
            Uuid::now_v7(),
            transfer,
            Utc::now(),
        );
        self.pending.transfers.insert(row.id, row.clone());
        Ok(row)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTx {
            shared,
            pending,
            guards,
            ..
        } = *self;
        shared.write().absorb(pending);
        drop(guards);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brewstock_core::ReceiptId;
    use brewstock_inventory::{BackRef, Direction, Reason};

    fn receipt(lot: &IngredientLot, location: &StockLocation, amount: i64) -> NewMovement {
        NewMovement::new(
            LotRef::Ingredient(lot.id),
            location.id,
            Direction::In,
            Reason::Receive,
            amount,
            "kg",
            Utc::now(),
            BackRef::Receipt(ReceiptId::new(1)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn uncommitted_writes_are_private_to_their_transaction() {
        let store = InMemoryInventoryStore::new();
        let malt = store.seed_ingredient("Pale Malt", Some("malt"));
        let lot = store.seed_ingredient_lot(malt.id, Some("PM-1"), Utc::now());
        let cellar = store.seed_location("Cellar");

        let mut tx = store.begin().await.unwrap();
        tx.insert_movement(receipt(&lot, &cellar, 40)).await.unwrap();
        assert_eq!(
            tx.lot_balance(LotRef::Ingredient(lot.id), cellar.id).await.unwrap(),
            40
        );
        assert!(store.movement_rows().is_empty());

        tx.commit().await.unwrap();
        assert_eq!(store.movement_rows().len(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_pending_rows() {
        let store = InMemoryInventoryStore::new();
        let malt = store.seed_ingredient("Pale Malt", None);
        let lot = store.seed_ingredient_lot(malt.id, None, Utc::now());
        let cellar = store.seed_location("Cellar");

        let mut tx = store.begin().await.unwrap();
        tx.insert_movement(receipt(&lot, &cellar, 10)).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.movement_rows().is_empty());
    }

    #[tokio::test]
    async fn injected_failure_hits_the_requested_write() {
        let store = InMemoryInventoryStore::new();
        let malt = store.seed_ingredient("Pale Malt", None);
        let lot = store.seed_ingredient_lot(malt.id, None, Utc::now());
        let cellar = store.seed_location("Cellar");
        store.fail_write_after(1);

        let mut tx = store.begin().await.unwrap();
        assert!(tx.insert_movement(receipt(&lot, &cellar, 1)).await.is_ok());
        let err = tx
            .insert_movement(receipt(&lot, &cellar, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
        assert!(tx.insert_movement(receipt(&lot, &cellar, 3)).await.is_ok());
    }

    #[tokio::test]
    async fn lookups_hide_soft_deleted_catalog_rows() {
        let store = InMemoryInventoryStore::new();
        let cellar = store.seed_location("Cellar");
        assert!(store.soft_delete_location(cellar.id));
        assert!(!store.soft_delete_location(cellar.id));

        let mut tx = store.begin().await.unwrap();
        assert!(tx.stock_location(cellar.id).await.unwrap().is_none());
        assert!(store.catalog().await.unwrap().locations.is_empty());
    }

    #[tokio::test]
    async fn listed_movements_carry_display_ids() {
        let store = InMemoryInventoryStore::new();
        let malt = store.seed_ingredient("Pale Malt", None);
        let lot = store.seed_ingredient_lot(malt.id, None, Utc::now());
        let cellar = store.seed_location("Cellar");

        let mut tx = store.begin().await.unwrap();
        tx.insert_movement(receipt(&lot, &cellar, 5)).await.unwrap();
        tx.commit().await.unwrap();

        let listed = store
            .list_movements(&MovementFilter::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].lot_uuid, Some(lot.uuid));
        assert_eq!(listed[0].location_uuid, Some(cellar.uuid));
    }
}

//! Integration tests for the inventory workflows over the in-memory store.
//!
//! Verifies:
//! - Compound workflows commit all of their rows or none
//! - Stock views follow the ledger after usage, removal and transfer
//! - Balance locking closes the batch usage race

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    use brewstock_core::{
        AdjustmentId, BatchId, MovementId, ReceiptId, RemovalId, TransferId, UsageId, Visibility,
    };
    use brewstock_inventory::{
        BackRef, BatchUsageRequest, BeerLot, Catalog, CategoryTaxPolicy, Direction, Ingredient,
        IngredientLot, InventoryRemoval, InventoryTransfer, InventoryUsage, LotBalance, LotKind,
        LotRef, Movement, MovementFilter, NewMovement, Reason, RemovalCategory, RemovalFilter,
        RemovalPatch, RemovalRequest, Resolved, StockLocation, TransferRequest, UsagePick,
    };

    use crate::config::{BalanceLocking, InventoryConfig};
    use crate::error::{InventoryError, StoreError};
    use crate::store::{InMemoryInventoryStore, InventoryStore, StoreTx};
    use crate::{MovementLedger, StockAggregator, TransactionCoordinator};

    struct Brewery {
        store: InMemoryInventoryStore,
        ledger: MovementLedger<InMemoryInventoryStore>,
        coordinator: TransactionCoordinator<InMemoryInventoryStore>,
        aggregator: StockAggregator<InMemoryInventoryStore>,
        malt: Ingredient,
        malt_lot: IngredientLot,
        hops_lot: IngredientLot,
        keg_lot: BeerLot,
        cellar: StockLocation,
        taproom: StockLocation,
    }

    fn setup() -> Brewery {
        setup_with(InventoryConfig::default())
    }

    fn setup_with(config: InventoryConfig) -> Brewery {
        let store = InMemoryInventoryStore::new();
        let received = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();

        let malt = store.seed_ingredient("Pale Malt", Some("malt"));
        let hops = store.seed_ingredient("Cascade", Some("hops"));
        let malt_lot = store.seed_ingredient_lot(malt.id, Some("PM-24-01"), received);
        let hops_lot = store.seed_ingredient_lot(hops.id, Some("CA-24-07"), received);
        let keg_lot = store.seed_beer_lot(
            Some(BatchId::new(900)),
            Some("IPA-0412"),
            Some("keg"),
            Some(31),
            received,
        );
        let cellar = store.seed_location("Cellar");
        let taproom = store.seed_location("Taproom");

        Brewery {
            ledger: MovementLedger::new(store.clone()),
            coordinator: TransactionCoordinator::new(store.clone(), config),
            aggregator: StockAggregator::new(store.clone()),
            store,
            malt,
            malt_lot,
            hops_lot,
            keg_lot,
            cellar,
            taproom,
        }
    }

    impl Brewery {
        async fn receive(&self, lot: LotRef, location: &StockLocation, amount: i64, unit: &str) {
            let movement = NewMovement::new(
                lot,
                location.id,
                Direction::In,
                Reason::Receive,
                amount,
                unit,
                Utc::now(),
                BackRef::Receipt(ReceiptId::new(1)),
            )
            .unwrap();
            self.ledger.append(movement).await.unwrap();
        }

        async fn balance(&self, lot: LotRef, location: &StockLocation) -> i64 {
            self.store
                .lot_balances(lot.kind())
                .await
                .unwrap()
                .into_iter()
                .filter(|b| b.lot == lot && b.location == location.id)
                .map(|b| b.quantity)
                .sum()
        }

        fn pick(&self, lot: &IngredientLot, location: &StockLocation, amount: i64) -> UsagePick {
            UsagePick {
                lot_id: lot.id,
                lot_uuid: lot.uuid,
                location_id: location.id,
                location_uuid: location.uuid,
                amount,
                amount_unit: "kg".into(),
            }
        }

        fn removal(&self, category: RemovalCategory, amount: i64, unit: &str) -> RemovalRequest {
            RemovalRequest {
                category,
                reason: "end of line".into(),
                amount,
                amount_unit: unit.into(),
                batch: Some(Resolved::new(BatchId::new(900), Uuid::from_u128(900))),
                beer_lot: None,
                location: None,
                occupancy: None,
                removed_at: Utc::now(),
                reference_code: None,
                destination: None,
                notes: None,
            }
        }

        fn keg_removal(&self, category: RemovalCategory, amount: i64) -> RemovalRequest {
            RemovalRequest {
                beer_lot: Some(Resolved::new(self.keg_lot.id, self.keg_lot.uuid)),
                location: Some(Resolved::new(self.taproom.id, self.taproom.uuid)),
                ..self.removal(category, amount, "gal")
            }
        }

        fn transfer(&self, amount: i64) -> TransferRequest {
            TransferRequest {
                ingredient_lot: Some(Resolved::new(self.malt_lot.id, self.malt_lot.uuid)),
                beer_lot: None,
                source: Resolved::new(self.cellar.id, self.cellar.uuid),
                destination: Resolved::new(self.taproom.id, self.taproom.uuid),
                amount,
                amount_unit: "kg".into(),
                transferred_at: Utc::now(),
                notes: Some("restock brewhouse".into()),
            }
        }
    }

    fn usage(picks: Vec<UsagePick>) -> BatchUsageRequest {
        BatchUsageRequest {
            production_ref: Some(Uuid::from_u128(42)),
            used_at: Utc::now(),
            picks,
            notes: None,
        }
    }

    // --- batch usage ---

    #[tokio::test]
    async fn usage_rejects_overdraw_and_writes_nothing() {
        let b = setup();
        let malt = LotRef::Ingredient(b.malt_lot.id);
        b.receive(malt, &b.cellar, 150, "kg").await;

        let err = b
            .coordinator
            .record_batch_usage(usage(vec![b.pick(&b.malt_lot, &b.cellar, 200)]))
            .await
            .unwrap_err();

        assert!(matches!(err, InventoryError::Validation(_)));
        assert!(err.client_message().contains("available 150 requested 200"));
        assert_eq!(b.store.movement_rows().len(), 1);
        assert_eq!(b.balance(malt, &b.cellar).await, 150);
    }

    #[tokio::test]
    async fn usage_writes_header_and_one_movement_per_pick() {
        let b = setup();
        b.receive(LotRef::Ingredient(b.malt_lot.id), &b.cellar, 150, "kg").await;
        b.receive(LotRef::Ingredient(b.hops_lot.id), &b.cellar, 10, "kg").await;

        let record = b
            .coordinator
            .record_batch_usage(usage(vec![
                b.pick(&b.malt_lot, &b.cellar, 120),
                b.pick(&b.hops_lot, &b.cellar, 2),
            ]))
            .await
            .unwrap();

        assert_eq!(record.movements.len(), 2);
        for movement in &record.movements {
            assert_eq!(movement.direction, Direction::Out);
            assert_eq!(movement.reason, Reason::Use);
            assert_eq!(movement.back_ref, Some(BackRef::Usage(record.usage.id)));
            assert_eq!(movement.location_uuid, Some(b.cellar.uuid));
        }
        assert_eq!(record.movements[0].lot_uuid, Some(b.malt_lot.uuid));
        assert_eq!(
            b.balance(LotRef::Ingredient(b.malt_lot.id), &b.cellar).await,
            30
        );

        let fetched = b
            .coordinator
            .get_usage(record.usage.id, Visibility::Live)
            .await
            .unwrap();
        assert_eq!(fetched.movements.len(), 2);
        assert_eq!(fetched.usage.production_ref, Some(Uuid::from_u128(42)));
    }

    #[tokio::test]
    async fn usage_failure_mid_write_rolls_back_everything() {
        let b = setup();
        b.receive(LotRef::Ingredient(b.malt_lot.id), &b.cellar, 150, "kg").await;
        b.receive(LotRef::Ingredient(b.hops_lot.id), &b.cellar, 10, "kg").await;
        // usage header and first movement succeed, second movement fails
        b.store.fail_write_after(2);

        let err = b
            .coordinator
            .record_batch_usage(usage(vec![
                b.pick(&b.malt_lot, &b.cellar, 100),
                b.pick(&b.hops_lot, &b.cellar, 5),
            ]))
            .await
            .unwrap_err();

        assert!(matches!(err, InventoryError::Infrastructure(StoreError::Database(_))));
        assert_eq!(err.client_message(), InventoryError::OPAQUE_MESSAGE);
        assert!(b.store.usage_rows().is_empty());
        assert_eq!(b.store.movement_rows().len(), 2);
        assert_eq!(
            b.balance(LotRef::Ingredient(b.malt_lot.id), &b.cellar).await,
            150
        );
    }

    #[tokio::test]
    async fn usage_against_deleted_location_is_a_validation_error() {
        let b = setup();
        b.receive(LotRef::Ingredient(b.malt_lot.id), &b.cellar, 50, "kg").await;
        b.store.soft_delete_location(b.cellar.id);

        let err = b
            .coordinator
            .record_batch_usage(usage(vec![b.pick(&b.malt_lot, &b.cellar, 10)]))
            .await
            .unwrap_err();

        assert!(matches!(err, InventoryError::Validation(msg) if msg.contains("pick 0")));
    }

    #[tokio::test]
    async fn usage_reports_the_first_bad_pick_in_request_order() {
        let b = setup_with(InventoryConfig {
            balance_locking: BalanceLocking::Advisory,
            ..InventoryConfig::default()
        });
        b.receive(LotRef::Ingredient(b.malt_lot.id), &b.cellar, 150, "kg").await;
        b.receive(LotRef::Ingredient(b.hops_lot.id), &b.taproom, 10, "kg").await;
        b.store.soft_delete_location(b.taproom.id);

        // pick 0 is short of stock, pick 1 names a deleted location
        let err = b
            .coordinator
            .record_batch_usage(usage(vec![
                b.pick(&b.malt_lot, &b.cellar, 200),
                b.pick(&b.hops_lot, &b.taproom, 1),
            ]))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            InventoryError::Validation(msg)
                if msg.starts_with("pick 0:") && msg.contains("available 150 requested 200")
        ));
        assert!(b.store.usage_rows().is_empty());
    }

    #[tokio::test]
    async fn deleting_usage_leaves_its_movements_live() {
        let b = setup();
        b.receive(LotRef::Ingredient(b.malt_lot.id), &b.cellar, 100, "kg").await;
        let record = b
            .coordinator
            .record_batch_usage(usage(vec![b.pick(&b.malt_lot, &b.cellar, 40)]))
            .await
            .unwrap();

        b.coordinator.delete_usage(record.usage.id).await.unwrap();

        let err = b
            .coordinator
            .get_usage(record.usage.id, Visibility::Live)
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::NotFound(_)));
        assert_eq!(
            b.balance(LotRef::Ingredient(b.malt_lot.id), &b.cellar).await,
            60
        );
        assert!(matches!(
            b.coordinator.delete_usage(record.usage.id).await,
            Err(InventoryError::NotFound(_))
        ));
    }

    // --- removals ---

    #[tokio::test]
    async fn batch_only_removal_writes_no_movement() {
        let b = setup();

        let record = b
            .coordinator
            .create_removal(b.removal(RemovalCategory::Spoilage, 31, "gal"))
            .await
            .unwrap();

        assert!(record.movement.is_none());
        assert!(record.removal.movement_id.is_none());
        assert_eq!(record.removal.amount_bbl, Some(1.0));
        assert!(!record.removal.is_taxable);
        assert!(b.store.movement_rows().is_empty());
    }

    #[tokio::test]
    async fn beer_lot_removal_pairs_a_movement_and_delete_cascades() {
        let b = setup();
        let keg = LotRef::Beer(b.keg_lot.id);
        b.receive(keg, &b.taproom, 62, "gal").await;

        let record = b
            .coordinator
            .create_removal(b.keg_removal(RemovalCategory::Sale, 31))
            .await
            .unwrap();

        let movement = record.movement.expect("paired movement");
        assert_eq!(record.removal.movement_id, Some(movement.id));
        assert_eq!(movement.back_ref, Some(BackRef::Removal(record.removal.id)));
        assert_eq!(movement.lot_uuid, Some(b.keg_lot.uuid));
        assert_eq!(b.balance(keg, &b.taproom).await, 31);

        b.coordinator
            .delete_removal(record.removal.id)
            .await
            .unwrap();

        assert_eq!(b.balance(keg, &b.taproom).await, 62);
        assert!(matches!(
            b.coordinator
                .get_removal(record.removal.id, Visibility::Live)
                .await,
            Err(InventoryError::NotFound(_))
        ));
        let deleted = b
            .coordinator
            .get_removal(record.removal.id, Visibility::IncludeDeleted)
            .await
            .unwrap();
        assert!(deleted.removal.deleted_at.is_some());
        assert!(deleted.movement.is_some_and(|m| m.deleted_at.is_some()));
    }

    #[tokio::test]
    async fn removal_movement_failure_leaves_no_removal() {
        let b = setup();
        let keg = LotRef::Beer(b.keg_lot.id);
        b.receive(keg, &b.taproom, 62, "gal").await;
        // removal row succeeds, paired movement fails
        b.store.fail_write_after(1);

        let err = b
            .coordinator
            .create_removal(b.keg_removal(RemovalCategory::Sale, 31))
            .await
            .unwrap_err();

        assert!(matches!(err, InventoryError::Infrastructure(StoreError::Database(_))));
        assert!(b.store.removal_rows().is_empty());
        assert_eq!(b.store.movement_rows().len(), 1);
        assert_eq!(b.balance(keg, &b.taproom).await, 62);
    }

    #[tokio::test]
    async fn failed_cascade_keeps_removal_and_movement_live() {
        let b = setup();
        let keg = LotRef::Beer(b.keg_lot.id);
        b.receive(keg, &b.taproom, 62, "gal").await;
        let created = b
            .coordinator
            .create_removal(b.keg_removal(RemovalCategory::Sale, 31))
            .await
            .unwrap();
        // removal soft delete succeeds, movement soft delete fails
        b.store.fail_write_after(1);

        let err = b
            .coordinator
            .delete_removal(created.removal.id)
            .await
            .unwrap_err();

        assert!(matches!(err, InventoryError::Infrastructure(StoreError::Database(_))));
        let stored = b
            .coordinator
            .get_removal(created.removal.id, Visibility::Live)
            .await
            .unwrap();
        assert!(stored.removal.deleted_at.is_none());
        assert!(stored.movement.is_some_and(|m| m.deleted_at.is_none()));
        assert_eq!(b.balance(keg, &b.taproom).await, 31);
    }

    /// Writes go through the in-memory store; movement reads outside a
    /// transaction always fail.
    #[derive(Debug, Clone)]
    struct MovementReadsDown(InMemoryInventoryStore);

    fn movement_reads_down() -> StoreError {
        StoreError::Database("movement reads unavailable".into())
    }

    #[async_trait]
    impl InventoryStore for MovementReadsDown {
        async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
            self.0.begin().await
        }

        async fn list_movements(&self, _: &MovementFilter) -> Result<Vec<Movement>, StoreError> {
            Err(movement_reads_down())
        }

        async fn get_movement(
            &self,
            _: MovementId,
            _: Visibility,
        ) -> Result<Option<Movement>, StoreError> {
            Err(movement_reads_down())
        }

        async fn lot_balances(&self, kind: LotKind) -> Result<Vec<LotBalance>, StoreError> {
            self.0.lot_balances(kind).await
        }

        async fn catalog(&self) -> Result<Catalog, StoreError> {
            self.0.catalog().await
        }

        async fn get_usage(
            &self,
            id: UsageId,
            visibility: Visibility,
        ) -> Result<Option<InventoryUsage>, StoreError> {
            self.0.get_usage(id, visibility).await
        }

        async fn get_removal(
            &self,
            id: RemovalId,
            visibility: Visibility,
        ) -> Result<Option<InventoryRemoval>, StoreError> {
            self.0.get_removal(id, visibility).await
        }

        async fn list_removals(
            &self,
            filter: &RemovalFilter,
        ) -> Result<Vec<InventoryRemoval>, StoreError> {
            self.0.list_removals(filter).await
        }

        async fn get_transfer(
            &self,
            id: TransferId,
            visibility: Visibility,
        ) -> Result<Option<InventoryTransfer>, StoreError> {
            self.0.get_transfer(id, visibility).await
        }
    }

    #[tokio::test]
    async fn committed_removal_writes_return_their_movement() {
        let b = setup();
        let keg = LotRef::Beer(b.keg_lot.id);
        b.receive(keg, &b.taproom, 93, "gal").await;
        let coordinator = TransactionCoordinator::new(
            MovementReadsDown(b.store.clone()),
            InventoryConfig::default(),
        );

        let created = coordinator
            .create_removal(b.keg_removal(RemovalCategory::Sale, 31))
            .await
            .unwrap();
        let movement = created.movement.expect("paired movement");
        assert_eq!(movement.lot_uuid, Some(b.keg_lot.uuid));
        assert_eq!(movement.location_uuid, Some(b.taproom.uuid));

        let annotated = coordinator
            .update_removal(
                created.removal.id,
                RemovalPatch {
                    notes: Some("keg returned dented".into()),
                    ..RemovalPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(annotated.movement.map(|m| m.id), Some(movement.id));

        let resized = coordinator
            .update_removal(
                created.removal.id,
                RemovalPatch {
                    amount: Some(62),
                    ..RemovalPatch::default()
                },
            )
            .await
            .unwrap();
        let replacement = resized.movement.expect("replacement movement");
        assert_ne!(replacement.id, movement.id);
        assert_eq!(replacement.amount, 62);
        assert_eq!(replacement.lot_uuid, Some(b.keg_lot.uuid));
        assert_eq!(b.balance(keg, &b.taproom).await, 31);
    }

    #[tokio::test]
    async fn removal_patch_replaces_a_stale_movement() {
        let b = setup();
        let keg = LotRef::Beer(b.keg_lot.id);
        b.receive(keg, &b.taproom, 93, "gal").await;
        let created = b
            .coordinator
            .create_removal(b.keg_removal(RemovalCategory::Sale, 31))
            .await
            .unwrap();
        let first_movement = created.removal.movement_id;

        let updated = b
            .coordinator
            .update_removal(
                created.removal.id,
                RemovalPatch {
                    amount: Some(62),
                    ..RemovalPatch::default()
                },
            )
            .await
            .unwrap();

        assert_ne!(updated.removal.movement_id, first_movement);
        assert_eq!(updated.removal.amount_bbl, Some(2.0));
        assert_eq!(updated.movement.map(|m| m.amount), Some(62));
        assert_eq!(b.balance(keg, &b.taproom).await, 31);
    }

    #[tokio::test]
    async fn removal_patch_of_notes_keeps_the_movement() {
        let b = setup();
        b.receive(LotRef::Beer(b.keg_lot.id), &b.taproom, 31, "gal").await;
        let created = b
            .coordinator
            .create_removal(b.keg_removal(RemovalCategory::Sample, 1))
            .await
            .unwrap();

        let updated = b
            .coordinator
            .update_removal(
                created.removal.id,
                RemovalPatch {
                    notes: Some("sent to the lab".into()),
                    ..RemovalPatch::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.removal.movement_id, created.removal.movement_id);
        assert_eq!(updated.removal.notes.as_deref(), Some("sent to the lab"));

        let err = b
            .coordinator
            .update_removal(created.removal.id, RemovalPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::Validation(_)));
    }

    #[tokio::test]
    async fn invalid_patch_leaves_the_removal_untouched() {
        let b = setup();
        let created = b
            .coordinator
            .create_removal(b.removal(RemovalCategory::Dump, 31, "gal"))
            .await
            .unwrap();

        let err = b
            .coordinator
            .update_removal(
                created.removal.id,
                RemovalPatch {
                    amount: Some(0),
                    ..RemovalPatch::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::Validation(_)));

        let stored = b
            .coordinator
            .get_removal(created.removal.id, Visibility::Live)
            .await
            .unwrap();
        assert_eq!(stored.removal.amount, 31);
    }

    #[tokio::test]
    async fn removal_summary_splits_taxable_volume() {
        let b = setup();
        let coordinator = TransactionCoordinator::new(b.store.clone(), InventoryConfig::default())
            .with_classifier(Arc::new(CategoryTaxPolicy::new([RemovalCategory::Sale])));

        coordinator
            .create_removal(b.removal(RemovalCategory::Sale, 62, "gal"))
            .await
            .unwrap();
        coordinator
            .create_removal(b.removal(RemovalCategory::Dump, 31, "gal"))
            .await
            .unwrap();
        coordinator
            .create_removal(b.removal(RemovalCategory::Other, 4, "cases"))
            .await
            .unwrap();

        let summary = coordinator
            .removal_summary(&RemovalFilter::default())
            .await
            .unwrap();
        assert_eq!(summary.removal_count, 3);
        assert_eq!(summary.taxable_bbl, 2.0);
        assert_eq!(summary.tax_free_bbl, 1.0);
        assert_eq!(summary.unconverted_count, 1);

        let sales = coordinator
            .list_removals(&RemovalFilter {
                category: Some(RemovalCategory::Sale),
                ..RemovalFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(sales.len(), 1);
        assert!(sales[0].is_taxable);
    }

    // --- transfers ---

    #[tokio::test]
    async fn transfer_writes_paired_movements_and_moves_stock() {
        let b = setup();
        let malt = LotRef::Ingredient(b.malt_lot.id);
        b.receive(malt, &b.cellar, 100, "kg").await;

        let record = b.coordinator.create_transfer(b.transfer(40)).await.unwrap();

        let [outbound, inbound] = [&record.movements[0], &record.movements[1]];
        assert_eq!(outbound.direction, Direction::Out);
        assert_eq!(outbound.location, b.cellar.id);
        assert_eq!(inbound.direction, Direction::In);
        assert_eq!(inbound.location, b.taproom.id);
        for movement in &record.movements {
            assert_eq!(movement.reason, Reason::Transfer);
            assert_eq!(movement.amount, 40);
            assert_eq!(movement.back_ref, Some(BackRef::Transfer(record.transfer.id)));
        }
        assert_eq!(b.balance(malt, &b.cellar).await, 60);
        assert_eq!(b.balance(malt, &b.taproom).await, 40);

        let fetched = b
            .coordinator
            .get_transfer(record.transfer.id, Visibility::Live)
            .await
            .unwrap();
        assert_eq!(fetched.movements.len(), 2);
    }

    #[tokio::test]
    async fn transfer_second_leg_failure_rolls_back() {
        let b = setup();
        let malt = LotRef::Ingredient(b.malt_lot.id);
        b.receive(malt, &b.cellar, 100, "kg").await;
        // header and outbound leg succeed, inbound leg fails
        b.store.fail_write_after(2);

        let err = b
            .coordinator
            .create_transfer(b.transfer(40))
            .await
            .unwrap_err();

        assert!(matches!(err, InventoryError::Infrastructure(StoreError::Database(_))));
        assert!(b.store.transfer_rows().is_empty());
        assert_eq!(b.store.movement_rows().len(), 1);
        assert_eq!(b.balance(malt, &b.cellar).await, 100);
        assert_eq!(b.balance(malt, &b.taproom).await, 0);
    }

    #[tokio::test]
    async fn transfer_rejects_same_location_and_unknown_lot() {
        let b = setup();

        let mut same = b.transfer(5);
        same.destination = same.source;
        assert!(matches!(
            b.coordinator.create_transfer(same).await,
            Err(InventoryError::Validation(_))
        ));

        b.store.soft_delete_ingredient_lot(b.malt_lot.id);
        assert!(matches!(
            b.coordinator.create_transfer(b.transfer(5)).await,
            Err(InventoryError::Validation(msg)) if msg.contains("not found")
        ));
        assert!(b.store.movement_rows().is_empty());
    }

    // --- ledger and views ---

    #[tokio::test]
    async fn ledger_only_appends_standalone_entries() {
        let b = setup();
        let lot = LotRef::Ingredient(b.malt_lot.id);

        let waste = NewMovement::new(
            lot,
            b.cellar.id,
            Direction::Out,
            Reason::Waste,
            3,
            "kg",
            Utc::now(),
            BackRef::Adjustment(AdjustmentId::new(8)),
        )
        .unwrap();
        let written = b.ledger.append(waste).await.unwrap();
        assert_eq!(written.lot_uuid, Some(b.malt_lot.uuid));

        let mut transfer_leg = NewMovement::new(
            lot,
            b.cellar.id,
            Direction::In,
            Reason::Adjust,
            3,
            "kg",
            Utc::now(),
            BackRef::Adjustment(AdjustmentId::new(8)),
        )
        .unwrap();
        transfer_leg.reason = Reason::Transfer;
        assert!(matches!(
            b.ledger.append(transfer_leg).await,
            Err(InventoryError::Validation(_))
        ));

        b.store.soft_delete_location(b.taproom.id);
        let err = b
            .ledger
            .append(NewMovement {
                lot,
                location: b.taproom.id,
                direction: Direction::In,
                reason: Reason::Receive,
                amount: 1,
                amount_unit: "kg".into(),
                occurred_at: Utc::now(),
                back_ref: Some(BackRef::Receipt(ReceiptId::new(2))),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::Validation(msg) if msg.contains("stock location")));

        let listed = b
            .ledger
            .list(&MovementFilter::for_lot_at(lot, b.cellar.id))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(
            b.ledger.get(written.id, Visibility::Live).await.unwrap().id,
            written.id
        );
    }

    #[tokio::test]
    async fn stock_views_disagree_on_empty_locations() {
        let b = setup();
        let malt = LotRef::Ingredient(b.malt_lot.id);
        b.receive(malt, &b.cellar, 25, "kg").await;
        b.coordinator.create_transfer(b.transfer(25)).await.unwrap();

        let levels = b.aggregator.stock_levels().await.unwrap();
        let malt_level = levels
            .iter()
            .find(|l| l.ingredient_id == b.malt.id)
            .expect("malt level");
        assert_eq!(malt_level.total, 25);
        let cellar = malt_level
            .locations
            .iter()
            .find(|l| l.location_id == b.cellar.id)
            .expect("cellar row kept at zero");
        assert_eq!(cellar.quantity, 0);

        let lots = b
            .aggregator
            .lot_stock_levels(LotKind::Ingredient)
            .await
            .unwrap();
        assert_eq!(lots.len(), 1);
        assert_eq!(lots[0].location_id, b.taproom.id);
        assert_eq!(lots[0].quantity, 25);
    }

    #[tokio::test]
    async fn balances_past_i64_surface_as_corrupt_data() {
        let b = setup();
        let malt = LotRef::Ingredient(b.malt_lot.id);
        b.receive(malt, &b.cellar, i64::MAX, "kg").await;
        b.receive(malt, &b.cellar, i64::MAX, "kg").await;

        let err = b.aggregator.stock_levels().await.unwrap_err();
        assert!(matches!(err, InventoryError::Infrastructure(StoreError::Corrupt(_))));
        assert_eq!(err.client_message(), InventoryError::OPAQUE_MESSAGE);

        let err = b
            .coordinator
            .record_batch_usage(usage(vec![b.pick(&b.malt_lot, &b.cellar, 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::Infrastructure(StoreError::Corrupt(_))));
        assert!(b.store.usage_rows().is_empty());
    }

    // --- concurrency ---

    fn adjust_out(lot: LotRef, location: &StockLocation, amount: i64) -> NewMovement {
        NewMovement::new(
            lot,
            location.id,
            Direction::Out,
            Reason::Adjust,
            amount,
            "kg",
            Utc::now(),
            BackRef::Adjustment(AdjustmentId::new(1)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn unlocked_balance_reads_can_overdraw() {
        let b = setup();
        let malt = LotRef::Ingredient(b.malt_lot.id);
        b.receive(malt, &b.cellar, 150, "kg").await;

        let mut first = b.store.begin().await.unwrap();
        let mut second = b.store.begin().await.unwrap();
        assert_eq!(first.lot_balance(malt, b.cellar.id).await.unwrap(), 150);
        assert_eq!(second.lot_balance(malt, b.cellar.id).await.unwrap(), 150);

        first.insert_movement(adjust_out(malt, &b.cellar, 100)).await.unwrap();
        second.insert_movement(adjust_out(malt, &b.cellar, 100)).await.unwrap();
        first.commit().await.unwrap();
        second.commit().await.unwrap();

        assert_eq!(b.balance(malt, &b.cellar).await, -50);
    }

    #[tokio::test]
    async fn balance_lock_serializes_readers() {
        let b = setup();
        let malt = LotRef::Ingredient(b.malt_lot.id);
        b.receive(malt, &b.cellar, 150, "kg").await;

        let mut first = b.store.begin().await.unwrap();
        let mut second = b.store.begin().await.unwrap();
        first.lock_lot_balance(malt, b.cellar.id).await.unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_millis(20),
            second.lock_lot_balance(malt, b.cellar.id),
        )
        .await;
        assert!(blocked.is_err());

        first.insert_movement(adjust_out(malt, &b.cellar, 100)).await.unwrap();
        first.commit().await.unwrap();

        second.lock_lot_balance(malt, b.cellar.id).await.unwrap();
        assert_eq!(second.lot_balance(malt, b.cellar.id).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn usage_times_out_while_another_writer_holds_the_lock() {
        let b = setup_with(InventoryConfig {
            operation_timeout: Duration::from_millis(30),
            balance_locking: BalanceLocking::Advisory,
            ..InventoryConfig::default()
        });
        let malt = LotRef::Ingredient(b.malt_lot.id);
        b.receive(malt, &b.cellar, 150, "kg").await;

        let mut holder = b.store.begin().await.unwrap();
        holder.lock_lot_balance(malt, b.cellar.id).await.unwrap();

        let err = b
            .coordinator
            .record_batch_usage(usage(vec![b.pick(&b.malt_lot, &b.cellar, 10)]))
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::Infrastructure(StoreError::Timeout(_))));

        holder.rollback().await.unwrap();
        let record = b
            .coordinator
            .record_batch_usage(usage(vec![b.pick(&b.malt_lot, &b.cellar, 10)]))
            .await
            .unwrap();
        assert_eq!(record.movements.len(), 1);
        assert_eq!(b.balance(malt, &b.cellar).await, 140);
    }

    // --- properties ---

    proptest::proptest! {
        #[test]
        fn sequential_usage_never_overdraws(
            received in 0i64..500,
            requests in proptest::collection::vec(1i64..200, 1..12),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            runtime.block_on(async {
                let b = setup();
                let malt = LotRef::Ingredient(b.malt_lot.id);
                if received > 0 {
                    b.receive(malt, &b.cellar, received, "kg").await;
                }

                let mut accepted = 0;
                for amount in requests {
                    let outcome = b
                        .coordinator
                        .record_batch_usage(usage(vec![b.pick(&b.malt_lot, &b.cellar, amount)]))
                        .await;
                    match outcome {
                        Ok(_) => accepted += amount,
                        Err(err) => assert!(matches!(err, InventoryError::Validation(_))),
                    }
                    assert!(b.balance(malt, &b.cellar).await >= 0);
                }
                assert_eq!(b.balance(malt, &b.cellar).await, received - accepted);
            });
        }
    }
}

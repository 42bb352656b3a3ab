//! Transaction coordinator for the compound inventory workflows.
//!
//! Each workflow writes its header row and every related movement in one
//! store transaction, under the configured deadline. Dropping the
//! transaction on timeout or error rolls everything back.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use tracing::instrument;

use brewstock_core::{RemovalId, TransferId, UsageId, Visibility};
use brewstock_inventory::removal::summarize;
use brewstock_inventory::{
    BackRef, BatchUsageRequest, InventoryRemoval, LotRef, MovementFilter, NonTaxablePolicy,
    RemovalFilter, RemovalPatch, RemovalRecord, RemovalRequest, RemovalSummary, TaxClassifier,
    TransferRecord, TransferRequest, UsageRecord,
};

use crate::config::{BalanceLocking, InventoryConfig};
use crate::error::{InventoryError, StoreError};
use crate::store::{InventoryStore, StoreTx, finish};

#[derive(Debug, Clone)]
pub struct TransactionCoordinator<S> {
    store: S,
    classifier: Arc<dyn TaxClassifier>,
    config: InventoryConfig,
}

impl<S: InventoryStore> TransactionCoordinator<S> {
    /// Removals are classified non-taxable until a classifier is supplied.
    pub fn new(store: S, config: InventoryConfig) -> Self {
        Self {
            store,
            classifier: Arc::new(NonTaxablePolicy),
            config,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn TaxClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one workflow under the operation deadline and log how it ended.
    async fn run<T>(
        &self,
        operation: &'static str,
        work: impl Future<Output = Result<T, InventoryError>>,
    ) -> Result<T, InventoryError> {
        let timeout = self.config.operation_timeout;
        let result = match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(timeout).into()),
        };
        match &result {
            Ok(_) => tracing::info!(operation, "committed"),
            Err(err) if err.is_client_error() => {
                tracing::info!(operation, error = %err, "rejected")
            }
            Err(err) => tracing::error!(operation, error = %err, "failed; rolled back"),
        }
        result
    }

    // --- batch usage ---

    #[instrument(
        skip(self, request),
        fields(picks = request.picks.len(), production_ref = ?request.production_ref)
    )]
    pub async fn record_batch_usage(
        &self,
        request: BatchUsageRequest,
    ) -> Result<UsageRecord, InventoryError> {
        request.validate()?;
        self.run("record_batch_usage", async {
            let mut tx = self.store.begin().await?;
            let result = self.batch_usage_in_tx(tx.as_mut(), &request).await;
            finish(tx, result).await
        })
        .await
    }

    async fn batch_usage_in_tx(
        &self,
        tx: &mut dyn StoreTx,
        request: &BatchUsageRequest,
    ) -> Result<UsageRecord, InventoryError> {
        if self.config.balance_locking == BalanceLocking::Advisory {
            // Fixed order so overlapping requests can't deadlock.
            let keys: BTreeSet<_> = request
                .picks
                .iter()
                .map(|p| (p.lot(), p.location_id))
                .collect();
            for (lot, location) in keys {
                tx.lock_lot_balance(lot, location).await?;
            }
        }

        // Resolve and check picks in request order so the first bad pick is
        // the one reported.
        for (idx, pick) in request.picks.iter().enumerate() {
            if tx.ingredient_lot(pick.lot_id).await?.is_none() {
                return Err(InventoryError::validation(format!(
                    "pick {idx}: ingredient lot {} not found",
                    pick.lot_uuid
                )));
            }
            if tx.stock_location(pick.location_id).await?.is_none() {
                return Err(InventoryError::validation(format!(
                    "pick {idx}: stock location {} not found",
                    pick.location_uuid
                )));
            }
            let available = tx.lot_balance(pick.lot(), pick.location_id).await?;
            if pick.amount > available {
                let shortfall = pick.insufficient(available);
                return Err(InventoryError::validation(format!(
                    "pick {idx}: {}",
                    shortfall.message()
                )));
            }
        }

        let usage = tx.insert_usage(request.new_usage()).await?;
        let mut movements = Vec::with_capacity(request.picks.len());
        for pick in &request.picks {
            let written = tx
                .insert_movement(pick.movement(usage.id, request.used_at)?)
                .await?;
            movements.push(written.with_display_ids(pick.lot_uuid, pick.location_uuid));
        }

        Ok(UsageRecord { usage, movements })
    }

    pub async fn get_usage(
        &self,
        id: UsageId,
        visibility: Visibility,
    ) -> Result<UsageRecord, InventoryError> {
        let usage = self
            .store
            .get_usage(id, visibility)
            .await?
            .ok_or_else(|| InventoryError::not_found(format!("usage {id}")))?;
        let movements = self
            .store
            .list_movements(
                &MovementFilter::for_back_ref(BackRef::Usage(id)).with_visibility(visibility),
            )
            .await?;
        Ok(UsageRecord { usage, movements })
    }

    /// Soft-delete the usage header. Its movements stay live, so stock
    /// consumed by the usage is not restored.
    #[instrument(skip(self), fields(usage_id = %id))]
    pub async fn delete_usage(&self, id: UsageId) -> Result<(), InventoryError> {
        self.run("delete_usage", async {
            let mut tx = self.store.begin().await?;
            let result = match tx.soft_delete_usage(id).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(InventoryError::not_found(format!("usage {id}"))),
                Err(err) => Err(err.into()),
            };
            finish(tx, result).await
        })
        .await
    }

    // --- removals ---

    #[instrument(
        skip(self, request),
        fields(category = request.category.as_str(), amount = request.amount)
    )]
    pub async fn create_removal(
        &self,
        request: RemovalRequest,
    ) -> Result<RemovalRecord, InventoryError> {
        request.validate()?;
        self.run("create_removal", async {
            let mut tx = self.store.begin().await?;
            let result = self.create_removal_in_tx(tx.as_mut(), &request).await;
            finish(tx, result).await
        })
        .await
    }

    async fn create_removal_in_tx(
        &self,
        tx: &mut dyn StoreTx,
        request: &RemovalRequest,
    ) -> Result<RemovalRecord, InventoryError> {
        if let Some(lot) = request.beer_lot {
            if tx.beer_lot(lot.id).await?.is_none() {
                return Err(InventoryError::validation(format!(
                    "beer lot {} not found",
                    lot.uuid
                )));
            }
        }
        if let (Some(_), Some(location)) = (request.beer_lot, request.location) {
            if tx.stock_location(location.id).await?.is_none() {
                return Err(InventoryError::validation(format!(
                    "stock location {} not found",
                    location.uuid
                )));
            }
        }

        let mut removal = tx
            .insert_removal(request.new_removal(self.classifier.as_ref()))
            .await?;
        let mut movement = None;
        if let Some(new) = removal.movement() {
            let written = tx.insert_movement(new?).await?;
            removal.movement_id = Some(written.id);
            removal = tx.update_removal(&removal).await?;
            movement = Some(match (request.beer_lot, request.location) {
                (Some(lot), Some(location)) => written.with_display_ids(lot.uuid, location.uuid),
                _ => written,
            });
        }
        Ok(RemovalRecord { removal, movement })
    }

    /// Patch a removal. When amount, unit or time changes, the paired
    /// movement is replaced in the same transaction.
    #[instrument(skip(self, patch), fields(removal_id = %id))]
    pub async fn update_removal(
        &self,
        id: RemovalId,
        patch: RemovalPatch,
    ) -> Result<RemovalRecord, InventoryError> {
        if patch.is_empty() {
            return Err(InventoryError::validation(
                "removal patch contains no changes",
            ));
        }
        self.run("update_removal", async {
            let mut tx = self.store.begin().await?;
            let result = self.update_removal_in_tx(tx.as_mut(), id, &patch).await;
            finish(tx, result).await
        })
        .await
    }

    async fn update_removal_in_tx(
        &self,
        tx: &mut dyn StoreTx,
        id: RemovalId,
        patch: &RemovalPatch,
    ) -> Result<RemovalRecord, InventoryError> {
        let mut removal = tx
            .removal_for_update(id)
            .await?
            .ok_or_else(|| InventoryError::not_found(format!("removal {id}")))?;

        let effect = removal.apply_patch(patch, self.classifier.as_ref())?;
        if effect.ledger_stale {
            if let Some(stale) = removal.movement_id.take() {
                tx.soft_delete_movement(stale).await?;
            }
            if let Some(movement) = removal.movement() {
                let written = tx.insert_movement(movement?).await?;
                removal.movement_id = Some(written.id);
            }
            tracing::debug!(
                removal_id = %id,
                movement_id = ?removal.movement_id,
                "replaced removal movement"
            );
        }

        let removal = tx.update_removal(&removal).await?;
        let movement = match removal.movement_id {
            Some(movement_id) => tx.movement(movement_id).await?,
            None => None,
        };
        Ok(RemovalRecord { removal, movement })
    }

    /// Soft-delete a removal and its paired movement together.
    #[instrument(skip(self), fields(removal_id = %id))]
    pub async fn delete_removal(&self, id: RemovalId) -> Result<(), InventoryError> {
        self.run("delete_removal", async {
            let mut tx = self.store.begin().await?;
            let result = delete_removal_in_tx(tx.as_mut(), id).await;
            finish(tx, result).await
        })
        .await
    }

    pub async fn get_removal(
        &self,
        id: RemovalId,
        visibility: Visibility,
    ) -> Result<RemovalRecord, InventoryError> {
        let removal = self
            .store
            .get_removal(id, visibility)
            .await?
            .ok_or_else(|| InventoryError::not_found(format!("removal {id}")))?;
        let movement = match removal.movement_id {
            Some(movement_id) => self.store.get_movement(movement_id, visibility).await?,
            None => None,
        };
        Ok(RemovalRecord { removal, movement })
    }

    pub async fn list_removals(
        &self,
        filter: &RemovalFilter,
    ) -> Result<Vec<InventoryRemoval>, InventoryError> {
        Ok(self.store.list_removals(filter).await?)
    }

    /// Barrel totals over the removals matching `filter`.
    pub async fn removal_summary(
        &self,
        filter: &RemovalFilter,
    ) -> Result<RemovalSummary, InventoryError> {
        let removals = self.store.list_removals(filter).await?;
        Ok(summarize(&removals))
    }

    // --- transfers ---

    #[instrument(
        skip(self, request),
        fields(
            source = %request.source.id,
            destination = %request.destination.id,
            amount = request.amount
        )
    )]
    pub async fn create_transfer(
        &self,
        request: TransferRequest,
    ) -> Result<TransferRecord, InventoryError> {
        request.validate()?;
        self.run("create_transfer", async {
            let mut tx = self.store.begin().await?;
            let result = transfer_in_tx(tx.as_mut(), &request).await;
            finish(tx, result).await
        })
        .await
    }

    pub async fn get_transfer(
        &self,
        id: TransferId,
        visibility: Visibility,
    ) -> Result<TransferRecord, InventoryError> {
        let transfer = self
            .store
            .get_transfer(id, visibility)
            .await?
            .ok_or_else(|| InventoryError::not_found(format!("transfer {id}")))?;
        let movements = self
            .store
            .list_movements(
                &MovementFilter::for_back_ref(BackRef::Transfer(id)).with_visibility(visibility),
            )
            .await?;
        Ok(TransferRecord {
            transfer,
            movements,
        })
    }
}

async fn delete_removal_in_tx(tx: &mut dyn StoreTx, id: RemovalId) -> Result<(), InventoryError> {
    let removal = tx
        .removal_for_update(id)
        .await?
        .ok_or_else(|| InventoryError::not_found(format!("removal {id}")))?;
    tx.soft_delete_removal(id).await?;
    if let Some(movement_id) = removal.movement_id {
        tx.soft_delete_movement(movement_id).await?;
    }
    Ok(())
}

async fn transfer_in_tx(
    tx: &mut dyn StoreTx,
    request: &TransferRequest,
) -> Result<TransferRecord, InventoryError> {
    let (lot, lot_uuid) = request.lot()?;
    let lot_exists = match lot {
        LotRef::Ingredient(id) => tx.ingredient_lot(id).await?.is_some(),
        LotRef::Beer(id) => tx.beer_lot(id).await?.is_some(),
    };
    if !lot_exists {
        return Err(InventoryError::validation(format!(
            "lot {lot_uuid} not found"
        )));
    }
    for (side, location) in [("source", request.source), ("destination", request.destination)] {
        if tx.stock_location(location.id).await?.is_none() {
            return Err(InventoryError::validation(format!(
                "{side} location {} not found",
                location.uuid
            )));
        }
    }

    let transfer = tx.insert_transfer(request.new_transfer()?).await?;
    let [outbound, inbound] = transfer.paired_movements()?;
    let outbound = tx
        .insert_movement(outbound)
        .await?
        .with_display_ids(lot_uuid, request.source.uuid);
    let inbound = tx
        .insert_movement(inbound)
        .await?
        .with_display_ids(lot_uuid, request.destination.uuid);

    Ok(TransferRecord {
        transfer,
        movements: vec![outbound, inbound],
    })
}

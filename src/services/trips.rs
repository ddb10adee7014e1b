use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    entities::{
        clinical_case::{self, Entity as ClinicalCaseEntity},
        clinical_trip::{self, Entity as ClinicalTripEntity, TripStatus},
        inventory_transaction::{
            self, system_note, Entity as InventoryTransactionEntity, Inspection, TxnAction,
            NOTE_TAG_POOL_RETURN, NOTE_TAG_TRIP_RETURN,
        },
        site::Entity as SiteEntity,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::cases::{
        allocate_item_on, compact_trip_on, ensure_in_progress, find_case_on, find_trip_on,
        insert_checkout_rows_on, AdditionalCaseInput, CaseItemInput,
    },
};

#[derive(Debug, Clone)]
pub struct CreateTripInput {
    pub site_id: String,
    pub trip_date: NaiveDate,
    pub items: Vec<CaseItemInput>,
}

/// Manages the shared pool of a trip: stock checked out against the trip as
/// a whole, assigned to individual cases only as devices actually get used.
#[derive(Clone)]
pub struct TripService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl TripService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Creates a trip with an initial pool of checked-out stock and no cases
    /// yet. Cases attach later via `add_case_to_trip`.
    #[instrument(skip(self, input), fields(site_id = %input.site_id))]
    pub async fn create_trip(
        &self,
        input: CreateTripInput,
    ) -> Result<clinical_trip::Model, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        SiteEntity::find_by_id(&input.site_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Site {} not found", input.site_id)))?;

        let trip = clinical_trip::ActiveModel {
            id: Set(Uuid::new_v4()),
            trip_date: Set(input.trip_date),
            site_id: Set(input.site_id.clone()),
            status: Set(TripStatus::Out.as_str().to_string()),
            ..Default::default()
        };
        let trip = trip.insert(&txn).await.map_err(ServiceError::db_error)?;

        for item in &input.items {
            let picks = allocate_item_on(&txn, item, input.trip_date).await?;
            insert_checkout_rows_on(
                &txn,
                &picks,
                item.product_type,
                input.trip_date,
                TxnAction::CheckoutTrip,
                None,
                Some(trip.id),
            )
            .await?;
        }

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(trip_id = %trip.id, "Trip created");
        let _ = self.event_sender.send(Event::TripCreated(trip.id)).await;
        Ok(trip)
    }

    /// Checks additional stock out into an open trip's pool.
    #[instrument(skip(self, items))]
    pub async fn add_pool_items(
        &self,
        trip_id: Uuid,
        items: Vec<CaseItemInput>,
    ) -> Result<Vec<inventory_transaction::Model>, ServiceError> {
        if items.is_empty() {
            return Err(ServiceError::ValidationError(
                "item list must not be empty".to_string(),
            ));
        }

        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let trip = find_trip_on(&txn, trip_id).await?;
        ensure_trip_open(&trip)?;

        let mut created = Vec::new();
        for item in &items {
            let picks = allocate_item_on(&txn, item, trip.trip_date).await?;
            let rows = insert_checkout_rows_on(
                &txn,
                &picks,
                item.product_type,
                trip.trip_date,
                TxnAction::CheckoutTrip,
                None,
                Some(trip.id),
            )
            .await?;
            created.extend(rows);
        }

        txn.commit().await.map_err(ServiceError::db_error)?;
        Ok(created)
    }

    /// Attributes pool rows to a case of the same trip. Rows already claimed
    /// by a sibling cannot be reassigned.
    #[instrument(skip(self, txn_ids))]
    pub async fn assign_items_to_case(
        &self,
        trip_id: Uuid,
        case_id: Uuid,
        txn_ids: Vec<Uuid>,
    ) -> Result<Vec<inventory_transaction::Model>, ServiceError> {
        if txn_ids.is_empty() {
            return Err(ServiceError::ValidationError(
                "transaction id list must not be empty".to_string(),
            ));
        }

        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let trip = find_trip_on(&txn, trip_id).await?;
        ensure_trip_open(&trip)?;
        let case = find_case_on(&txn, case_id).await?;
        ensure_in_progress(&case)?;
        if case.trip_id != Some(trip_id) {
            return Err(ServiceError::InvalidOperation(format!(
                "case {} does not belong to trip {}",
                case_id, trip_id
            )));
        }

        let mut updated = Vec::with_capacity(txn_ids.len());
        for txn_id in &txn_ids {
            let row = InventoryTransactionEntity::find_by_id(*txn_id)
                .filter(inventory_transaction::Column::TripId.eq(trip_id))
                .filter(inventory_transaction::Column::DeletedAt.is_null())
                .one(&txn)
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!(
                        "Transaction {} not found in trip {}",
                        txn_id, trip_id
                    ))
                })?;

            match row.action() {
                Some(TxnAction::CheckoutCase) | Some(TxnAction::CheckoutTrip) => {}
                _ => {
                    return Err(ServiceError::InvalidOperation(format!(
                        "transaction {} is not a pool checkout and cannot be assigned",
                        txn_id
                    )))
                }
            }
            if row.case_id.is_some() {
                return Err(ServiceError::Conflict(format!(
                    "transaction {} is already assigned to a case",
                    txn_id
                )));
            }

            let mut active: inventory_transaction::ActiveModel = row.into();
            active.case_id = Set(Some(case_id));
            active.action = Set(TxnAction::CheckoutCase.as_str().to_string());
            updated.push(active.update(&txn).await.map_err(ServiceError::db_error)?);
        }

        txn.commit().await.map_err(ServiceError::db_error)?;

        let _ = self
            .event_sender
            .send(Event::PoolItemsAssigned {
                trip_id,
                case_id,
                count: updated.len(),
            })
            .await;
        Ok(updated)
    }

    /// Sends unused pool units back to stock before the trip is over. The
    /// checkout row is voided and a paired receipt row records the event
    /// without changing the balance a second time.
    #[instrument(skip(self, txn_ids))]
    pub async fn return_items(
        &self,
        trip_id: Uuid,
        txn_ids: Vec<Uuid>,
    ) -> Result<(), ServiceError> {
        if txn_ids.is_empty() {
            return Err(ServiceError::ValidationError(
                "transaction id list must not be empty".to_string(),
            ));
        }

        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let trip = find_trip_on(&txn, trip_id).await?;
        ensure_trip_open(&trip)?;

        for txn_id in &txn_ids {
            let row = InventoryTransactionEntity::find_by_id(*txn_id)
                .filter(inventory_transaction::Column::TripId.eq(trip_id))
                .filter(inventory_transaction::Column::DeletedAt.is_null())
                .one(&txn)
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!(
                        "Transaction {} not found in trip {}",
                        txn_id, trip_id
                    ))
                })?;

            match row.action() {
                Some(TxnAction::CheckoutCase) | Some(TxnAction::CheckoutTrip) => {}
                _ => {
                    return Err(ServiceError::InvalidOperation(format!(
                        "transaction {} is not a pool checkout and cannot be returned",
                        txn_id
                    )))
                }
            }
            if row.case_id.is_some() {
                return Err(ServiceError::Conflict(format!(
                    "transaction {} is assigned to a case and cannot be pool-returned",
                    txn_id
                )));
            }

            insert_return_receipt_on(&txn, &row, NOTE_TAG_POOL_RETURN).await?;

            let mut active: inventory_transaction::ActiveModel = row.into();
            active.deleted_at = Set(Some(Utc::now()));
            active.update(&txn).await.map_err(ServiceError::db_error)?;
        }

        txn.commit().await.map_err(ServiceError::db_error)?;

        let _ = self
            .event_sender
            .send(Event::PoolItemsReturned {
                trip_id,
                count: txn_ids.len(),
            })
            .await;
        Ok(())
    }

    /// Creates a new case attached to an open trip; its requested items go
    /// into the shared pool.
    #[instrument(skip(self, input))]
    pub async fn add_case_to_trip(
        &self,
        trip_id: Uuid,
        input: AdditionalCaseInput,
    ) -> Result<clinical_case::Model, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let trip = find_trip_on(&txn, trip_id).await?;
        ensure_trip_open(&trip)?;

        let case_id =
            crate::entities::clinical_case::derive_case_id(&trip.site_id, &input.patient_id);
        if ClinicalCaseEntity::find_by_id(case_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .is_some()
        {
            return Err(ServiceError::Conflict(format!(
                "a case for patient {} at site {} already exists",
                input.patient_id, trip.site_id
            )));
        }

        let case = clinical_case::ActiveModel {
            id: Set(case_id),
            case_no: Set(input.case_no.clone()),
            site_id: Set(trip.site_id.clone()),
            patient_id: Set(input.patient_id.clone()),
            case_date: Set(trip.trip_date),
            operator: Set(input.operator.clone()),
            trip_id: Set(Some(trip_id)),
            status: Set(crate::entities::clinical_case::CaseStatus::InProgress
                .as_str()
                .to_string()),
            ..Default::default()
        };
        let case = case.insert(&txn).await.map_err(ServiceError::db_error)?;

        for item in &input.items {
            let picks = allocate_item_on(&txn, item, trip.trip_date).await?;
            insert_checkout_rows_on(
                &txn,
                &picks,
                item.product_type,
                trip.trip_date,
                TxnAction::CheckoutTrip,
                None,
                Some(trip_id),
            )
            .await?;
        }

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(case_id = %case.id, trip_id = %trip_id, "Case added to trip");
        let _ = self
            .event_sender
            .send(Event::CaseCreated {
                case_id: case.id,
                trip_id: Some(trip_id),
            })
            .await;
        Ok(case)
    }

    /// Detaches an in-progress case from its trip, taking its assigned rows
    /// with it as a standalone case. Compacts the trip away when a single
    /// sibling remains.
    #[instrument(skip(self))]
    pub async fn remove_case_from_trip(
        &self,
        trip_id: Uuid,
        case_id: Uuid,
    ) -> Result<(), ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let trip = find_trip_on(&txn, trip_id).await?;
        ensure_trip_open(&trip)?;
        let case = find_case_on(&txn, case_id).await?;
        ensure_in_progress(&case)?;
        if case.trip_id != Some(trip_id) {
            return Err(ServiceError::InvalidOperation(format!(
                "case {} does not belong to trip {}",
                case_id, trip_id
            )));
        }

        let assigned = InventoryTransactionEntity::find()
            .filter(inventory_transaction::Column::CaseId.eq(case_id))
            .filter(inventory_transaction::Column::DeletedAt.is_null())
            .all(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        for row in assigned {
            let mut active: inventory_transaction::ActiveModel = row.into();
            active.trip_id = Set(None);
            active.update(&txn).await.map_err(ServiceError::db_error)?;
        }

        let mut active: clinical_case::ActiveModel = case.into();
        active.trip_id = Set(None);
        active.update(&txn).await.map_err(ServiceError::db_error)?;

        let remaining = ClinicalCaseEntity::find()
            .filter(clinical_case::Column::TripId.eq(trip_id))
            .all(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        if remaining.len() == 1 {
            compact_trip_on(&txn, trip_id, &remaining[0]).await?;
            let _ = self.event_sender.send(Event::TripDeleted(trip_id)).await;
        }

        txn.commit().await.map_err(ServiceError::db_error)?;

        let _ = self.event_sender.send(Event::CaseUpdated(case_id)).await;
        Ok(())
    }

    /// Closes a trip once every attached case is completed, returning any
    /// still-pooled units to stock. Normally the completion engine does this
    /// when the last sibling completes; the explicit form covers trips whose
    /// cases were all detached or that never had any.
    #[instrument(skip(self))]
    pub async fn complete_trip(&self, trip_id: Uuid) -> Result<usize, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let trip = find_trip_on(&txn, trip_id).await?;
        if trip.is_completed() {
            return Err(ServiceError::Conflict(format!(
                "trip {} is already completed",
                trip_id
            )));
        }

        let open_cases = ClinicalCaseEntity::find()
            .filter(clinical_case::Column::TripId.eq(trip_id))
            .filter(
                clinical_case::Column::Status
                    .eq(crate::entities::clinical_case::CaseStatus::InProgress.as_str()),
            )
            .count(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        if open_cases > 0 {
            return Err(ServiceError::InvalidOperation(format!(
                "trip {} still has {} case(s) in progress",
                trip_id, open_cases
            )));
        }

        // Unassigned stock that nobody consumed has to be returned through
        // the pool-return operation before an explicit close.
        let outstanding = unmatched_pool_rows_on(&txn, trip_id)
            .await?
            .into_iter()
            .filter(|row| row.case_id.is_none())
            .count();
        if outstanding > 0 {
            return Err(ServiceError::InvalidOperation(format!(
                "trip {} has {} unassigned pool item(s) outstanding",
                trip_id, outstanding
            )));
        }

        let returned = finalize_trip_on(&txn, &trip).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(trip_id = %trip_id, returned, "Trip completed");
        let _ = self.event_sender.send(Event::TripCompleted(trip_id)).await;
        Ok(returned)
    }

    /// Deletes an empty trip, releasing any remaining pool stock. Trips with
    /// attached cases are deleted through the case-group endpoint instead.
    #[instrument(skip(self))]
    pub async fn delete_trip(&self, trip_id: Uuid) -> Result<(), ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let trip = find_trip_on(&txn, trip_id).await?;
        ensure_trip_open(&trip)?;

        let attached = ClinicalCaseEntity::find()
            .filter(clinical_case::Column::TripId.eq(trip_id))
            .count(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        if attached > 0 {
            return Err(ServiceError::InvalidOperation(format!(
                "trip {} has {} attached case(s)",
                trip_id, attached
            )));
        }

        let rows = InventoryTransactionEntity::find()
            .filter(inventory_transaction::Column::TripId.eq(trip_id))
            .filter(inventory_transaction::Column::DeletedAt.is_null())
            .all(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        for row in rows {
            let mut active: inventory_transaction::ActiveModel = row.into();
            active.deleted_at = Set(Some(Utc::now()));
            active.update(&txn).await.map_err(ServiceError::db_error)?;
        }

        ClinicalTripEntity::delete_by_id(trip_id)
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(trip_id = %trip_id, "Trip deleted");
        let _ = self.event_sender.send(Event::TripDeleted(trip_id)).await;
        Ok(())
    }

    pub async fn get_trip(&self, trip_id: Uuid) -> Result<clinical_trip::Model, ServiceError> {
        find_trip_on(&*self.db, trip_id).await
    }

    /// Lists trips with pagination, newest first.
    #[instrument(skip(self))]
    pub async fn list_trips(
        &self,
        site_id: Option<String>,
        status: Option<TripStatus>,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<clinical_trip::Model>, u64), ServiceError> {
        let db = &*self.db;

        let mut query = ClinicalTripEntity::find();
        if let Some(site_id) = site_id {
            query = query.filter(clinical_trip::Column::SiteId.eq(site_id));
        }
        if let Some(status) = status {
            query = query.filter(clinical_trip::Column::Status.eq(status.as_str()));
        }

        let paginator = query
            .order_by_desc(clinical_trip::Column::TripDate)
            .paginate(db, limit);
        let total = paginator
            .num_items()
            .await
            .map_err(ServiceError::db_error)?;
        let items = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::db_error)?;

        Ok((items, total))
    }

    /// Unassigned pool rows of a trip. Only checkout rows belong to the
    /// pool; derived receipt rows share the trip tag but are history.
    pub async fn pool_items(
        &self,
        trip_id: Uuid,
    ) -> Result<Vec<inventory_transaction::Model>, ServiceError> {
        let db = &*self.db;
        find_trip_on(db, trip_id).await?;

        InventoryTransactionEntity::find()
            .filter(inventory_transaction::Column::TripId.eq(trip_id))
            .filter(inventory_transaction::Column::CaseId.is_null())
            .filter(inventory_transaction::Column::Action.is_in([
                TxnAction::CheckoutCase.as_str(),
                TxnAction::CheckoutTrip.as_str(),
            ]))
            .filter(inventory_transaction::Column::DeletedAt.is_null())
            .order_by_asc(inventory_transaction::Column::CreatedAt)
            .order_by_asc(inventory_transaction::Column::Id)
            .all(db)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Cases attached to a trip.
    pub async fn trip_cases(
        &self,
        trip_id: Uuid,
    ) -> Result<Vec<clinical_case::Model>, ServiceError> {
        let db = &*self.db;
        find_trip_on(db, trip_id).await?;

        ClinicalCaseEntity::find()
            .filter(clinical_case::Column::TripId.eq(trip_id))
            .order_by_asc(clinical_case::Column::CreatedAt)
            .all(db)
            .await
            .map_err(ServiceError::db_error)
    }
}

pub(crate) fn ensure_trip_open(trip: &clinical_trip::Model) -> Result<(), ServiceError> {
    if trip.is_completed() {
        return Err(ServiceError::InvalidOperation(format!(
            "trip {} is completed",
            trip.id
        )));
    }
    Ok(())
}

/// Writes the balance-neutral receipt row that pairs with a returned
/// checkout. The sentinel note marks the row as system-derived so the
/// balance fold and the completion engine can tell it from operator input.
pub(crate) async fn insert_return_receipt_on<C: ConnectionTrait>(
    conn: &C,
    checkout: &inventory_transaction::Model,
    note_tag: &str,
) -> Result<inventory_transaction::Model, ServiceError> {
    let model = inventory_transaction::ActiveModel {
        id: Set(Uuid::new_v4()),
        txn_date: Set(checkout.txn_date),
        action: Set(TxnAction::ReturnCase.as_str().to_string()),
        product_type: Set(checkout.product_type.clone()),
        spec_no: Set(checkout.spec_no.clone()),
        serial_no: Set(checkout.serial_no.clone()),
        qty: Set(checkout.qty),
        exp_date: Set(checkout.exp_date),
        batch_no: Set(checkout.batch_no.clone()),
        case_id: Set(None),
        trip_id: Set(checkout.trip_id),
        inspection: Set(Some(Inspection::Accept.as_str().to_string())),
        return_condition: Set(None),
        notes: Set(Some(system_note(note_tag))),
        deleted_at: Set(None),
        ..Default::default()
    };
    model.insert(conn).await.map_err(ServiceError::db_error)
}

/// Returns the trip's unconsumed checked-out units to stock and marks the
/// trip completed. Consumption is matched by count per `(spec_no,
/// serial_no)`: each recorded usage consumes one checkout of the same key,
/// and every checkout beyond that gets a paired return receipt. The checkout
/// rows themselves stay live; reversal only has to drop the receipts.
pub(crate) async fn finalize_trip_on<C: ConnectionTrait>(
    conn: &C,
    trip: &clinical_trip::Model,
) -> Result<usize, ServiceError> {
    let unmatched = unmatched_pool_rows_on(conn, trip.id).await?;
    let returned = unmatched.len();
    for row in &unmatched {
        insert_return_receipt_on(conn, row, NOTE_TAG_TRIP_RETURN).await?;
    }

    let mut active: clinical_trip::ActiveModel = trip.clone().into();
    active.status = Set(TripStatus::Completed.as_str().to_string());
    active.update(conn).await.map_err(ServiceError::db_error)?;

    Ok(returned)
}

/// Live checkout rows of a trip not covered by a recorded usage of the same
/// `(spec_no, serial_no)` key. Earliest checkouts are treated as the
/// consumed ones.
pub(crate) async fn unmatched_pool_rows_on<C: ConnectionTrait>(
    conn: &C,
    trip_id: Uuid,
) -> Result<Vec<inventory_transaction::Model>, ServiceError> {
    let rows = InventoryTransactionEntity::find()
        .filter(inventory_transaction::Column::TripId.eq(trip_id))
        .filter(inventory_transaction::Column::DeletedAt.is_null())
        .order_by_asc(inventory_transaction::Column::CreatedAt)
        .order_by_asc(inventory_transaction::Column::Id)
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    let mut used_counts: HashMap<(String, Option<String>), usize> = HashMap::new();
    for row in &rows {
        if row.action() == Some(TxnAction::UsedCase) {
            *used_counts
                .entry((row.spec_no.clone(), row.serial_no.clone()))
                .or_default() += 1;
        }
    }

    let mut unmatched = Vec::new();
    for row in rows {
        match row.action() {
            Some(TxnAction::CheckoutCase) | Some(TxnAction::CheckoutTrip) => {}
            _ => continue,
        }
        let key = (row.spec_no.clone(), row.serial_no.clone());
        match used_counts.get_mut(&key) {
            Some(count) if *count > 0 => *count -= 1,
            _ => unmatched.push(row),
        }
    }
    Ok(unmatched)
}

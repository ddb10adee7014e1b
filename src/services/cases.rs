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
        clinical_case::{self, derive_case_id, CaseStatus, Entity as ClinicalCaseEntity},
        clinical_trip::{self, Entity as ClinicalTripEntity, TripStatus},
        inventory_transaction::{
            self, Entity as InventoryTransactionEntity, ProductType, TxnAction,
        },
        product_spec::Entity as ProductSpecEntity,
        site::Entity as SiteEntity,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::balance::{pick_products_on, serial_balance_on, stock_candidates_on, PickedProduct},
};

/// One requested device line. When `serial_no` is set the caller substitutes
/// a specific unit; otherwise the allocator picks FIFO-by-expiry.
#[derive(Debug, Clone)]
pub struct CaseItemInput {
    pub product_type: ProductType,
    pub spec_no: String,
    pub serial_no: Option<String>,
    pub qty: i32,
}

#[derive(Debug, Clone)]
pub struct CreateCaseInput {
    pub site_id: String,
    pub patient_id: String,
    pub case_date: NaiveDate,
    pub case_no: Option<String>,
    pub operator: Option<String>,
    pub items: Vec<CaseItemInput>,
    /// Non-empty list triggers creation of a trip grouping all the cases.
    pub additional_cases: Vec<AdditionalCaseInput>,
}

#[derive(Debug, Clone)]
pub struct AdditionalCaseInput {
    pub patient_id: String,
    pub case_no: Option<String>,
    pub operator: Option<String>,
    pub items: Vec<CaseItemInput>,
}

#[derive(Debug, Clone)]
pub struct CreatedCase {
    pub case_id: Uuid,
    pub trip_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateCaseInfoInput {
    pub case_no: Option<String>,
    pub case_date: Option<NaiveDate>,
    pub operator: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateCaseItemInput {
    pub qty: Option<i32>,
    pub exp_date: Option<NaiveDate>,
    pub batch_no: Option<String>,
    pub notes: Option<String>,
}

/// Flat read model handed to the document-rendering collaborator.
#[derive(Debug, Clone)]
pub struct PackingList {
    pub case: clinical_case::Model,
    pub site_name: String,
    pub items: Vec<PackingListItem>,
}

#[derive(Debug, Clone)]
pub struct PackingListItem {
    pub txn_id: Uuid,
    pub spec_no: String,
    pub product_type: String,
    pub serial_no: Option<String>,
    pub batch_no: Option<String>,
    pub exp_date: Option<NaiveDate>,
    pub qty: i32,
    pub disposition: String,
    /// False for shared trip-pool units not yet attributed to this case.
    pub assigned: bool,
    pub notes: Option<String>,
}

pub(crate) async fn find_case_on<C: ConnectionTrait>(
    conn: &C,
    case_id: Uuid,
) -> Result<clinical_case::Model, ServiceError> {
    ClinicalCaseEntity::find_by_id(case_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Case {} not found", case_id)))
}

pub(crate) async fn find_trip_on<C: ConnectionTrait>(
    conn: &C,
    trip_id: Uuid,
) -> Result<clinical_trip::Model, ServiceError> {
    ClinicalTripEntity::find_by_id(trip_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Trip {} not found", trip_id)))
}

pub(crate) fn ensure_in_progress(case: &clinical_case::Model) -> Result<(), ServiceError> {
    if case.is_completed() {
        return Err(ServiceError::InvalidOperation(format!(
            "case {} is completed and can no longer be modified",
            case.id
        )));
    }
    Ok(())
}

async fn ensure_site_exists<C: ConnectionTrait>(conn: &C, site_id: &str) -> Result<(), ServiceError> {
    SiteEntity::find_by_id(site_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Site {} not found", site_id)))?;
    Ok(())
}

async fn ensure_spec_valid<C: ConnectionTrait>(
    conn: &C,
    spec_no: &str,
    product_type: ProductType,
) -> Result<(), ServiceError> {
    let spec = ProductSpecEntity::find_by_id(spec_no)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Product spec {} not found", spec_no)))?;

    if spec.product_type != product_type.as_str() {
        return Err(ServiceError::ValidationError(format!(
            "spec {} is a {}, not a {}",
            spec_no,
            spec.product_type,
            product_type.as_str()
        )));
    }
    Ok(())
}

/// Resolves a requested item line into concrete picked units, failing with
/// an insufficient-stock error when the request cannot be filled in full.
pub(crate) async fn allocate_item_on<C: ConnectionTrait>(
    conn: &C,
    item: &CaseItemInput,
    reference_date: NaiveDate,
) -> Result<Vec<PickedProduct>, ServiceError> {
    if item.qty <= 0 {
        return Err(ServiceError::ValidationError(
            "item quantity must be positive".to_string(),
        ));
    }
    ensure_spec_valid(conn, &item.spec_no, item.product_type).await?;

    if let Some(serial) = item.serial_no.as_deref() {
        // Manual substitution: the caller chose a specific unit.
        let candidates =
            stock_candidates_on(conn, &item.spec_no, item.product_type, reference_date).await?;
        let candidate = candidates
            .into_iter()
            .find(|c| c.serial_no == serial)
            .filter(|c| c.on_hand >= item.qty)
            .ok_or_else(|| {
                ServiceError::InsufficientStock(format!(
                    "serial {} of {} is not available in quantity {}",
                    serial, item.spec_no, item.qty
                ))
            })?;

        Ok((0..item.qty)
            .map(|_| PickedProduct {
                serial_no: candidate.serial_no.clone(),
                spec_no: item.spec_no.clone(),
                exp_date: candidate.exp_date,
                batch_no: candidate.batch_no.clone(),
                qty: 1,
            })
            .collect())
    } else {
        let picked = pick_products_on(
            conn,
            &item.spec_no,
            item.product_type,
            reference_date,
            item.qty,
        )
        .await?;
        if (picked.len() as i32) < item.qty {
            return Err(ServiceError::InsufficientStock(format!(
                "only {} of {} unit(s) of {} available",
                picked.len(),
                item.qty,
                item.spec_no
            )));
        }
        Ok(picked)
    }
}

/// Writes one checkout ledger row per picked unit.
pub(crate) async fn insert_checkout_rows_on<C: ConnectionTrait>(
    conn: &C,
    picks: &[PickedProduct],
    product_type: ProductType,
    txn_date: NaiveDate,
    action: TxnAction,
    case_id: Option<Uuid>,
    trip_id: Option<Uuid>,
) -> Result<Vec<inventory_transaction::Model>, ServiceError> {
    let mut created = Vec::with_capacity(picks.len());
    for pick in picks {
        let model = inventory_transaction::ActiveModel {
            id: Set(Uuid::new_v4()),
            txn_date: Set(txn_date),
            action: Set(action.as_str().to_string()),
            product_type: Set(product_type.as_str().to_string()),
            spec_no: Set(pick.spec_no.clone()),
            serial_no: Set(Some(pick.serial_no.clone())),
            qty: Set(pick.qty),
            exp_date: Set(Some(pick.exp_date)),
            batch_no: Set(pick.batch_no.clone()),
            case_id: Set(case_id),
            trip_id: Set(trip_id),
            inspection: Set(None),
            return_condition: Set(None),
            notes: Set(None),
            deleted_at: Set(None),
            ..Default::default()
        };
        created.push(model.insert(conn).await.map_err(ServiceError::db_error)?);
    }
    Ok(created)
}

async fn ensure_case_id_free<C: ConnectionTrait>(
    conn: &C,
    case_id: Uuid,
    site_id: &str,
    patient_id: &str,
) -> Result<(), ServiceError> {
    let existing = ClinicalCaseEntity::find_by_id(case_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?;
    if existing.is_some() {
        return Err(ServiceError::Conflict(format!(
            "a case for patient {} at site {} already exists",
            patient_id, site_id
        )));
    }
    Ok(())
}

async fn ensure_case_no_free<C: ConnectionTrait>(
    conn: &C,
    case_no: &str,
    exclude: Option<Uuid>,
) -> Result<(), ServiceError> {
    let mut query =
        ClinicalCaseEntity::find().filter(clinical_case::Column::CaseNo.eq(case_no));
    if let Some(id) = exclude {
        query = query.filter(clinical_case::Column::Id.ne(id));
    }
    let existing = query.one(conn).await.map_err(ServiceError::db_error)?;
    if existing.is_some() {
        return Err(ServiceError::Conflict(format!(
            "case number {} is already in use",
            case_no
        )));
    }
    Ok(())
}

async fn insert_case_on<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
    site_id: &str,
    patient_id: &str,
    case_date: NaiveDate,
    case_no: Option<String>,
    operator: Option<String>,
    trip_id: Option<Uuid>,
) -> Result<clinical_case::Model, ServiceError> {
    let model = clinical_case::ActiveModel {
        id: Set(id),
        case_no: Set(case_no),
        site_id: Set(site_id.to_string()),
        patient_id: Set(patient_id.to_string()),
        case_date: Set(case_date),
        operator: Set(operator),
        trip_id: Set(trip_id),
        status: Set(CaseStatus::InProgress.as_str().to_string()),
        ..Default::default()
    };
    model.insert(conn).await.map_err(ServiceError::db_error)
}

/// Service owning the case lifecycle: creation, metadata and item mutation,
/// trip promotion, and deletion. Completion lives in the completion service.
#[derive(Clone)]
pub struct CaseService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl CaseService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Creates a case, allocating stock for each requested item. When
    /// `additional_cases` is non-empty a trip is created and every requested
    /// unit becomes a shared pool row instead of being pre-assigned.
    #[instrument(skip(self, input), fields(site_id = %input.site_id))]
    pub async fn create_case(&self, input: CreateCaseInput) -> Result<CreatedCase, ServiceError> {
        if input.items.is_empty() {
            return Err(ServiceError::ValidationError(
                "a case requires at least one item".to_string(),
            ));
        }

        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        ensure_site_exists(&txn, &input.site_id).await?;

        let case_id = derive_case_id(&input.site_id, &input.patient_id);
        ensure_case_id_free(&txn, case_id, &input.site_id, &input.patient_id).await?;
        if let Some(case_no) = input.case_no.as_deref() {
            ensure_case_no_free(&txn, case_no, None).await?;
        }

        let trip_id = if input.additional_cases.is_empty() {
            None
        } else {
            // Sibling ids are deterministic too; catch duplicates inside the
            // request before touching the ledger.
            let mut sibling_ids = vec![case_id];
            for sibling in &input.additional_cases {
                let id = derive_case_id(&input.site_id, &sibling.patient_id);
                if sibling_ids.contains(&id) {
                    return Err(ServiceError::Conflict(format!(
                        "duplicate patient {} in multi-case request",
                        sibling.patient_id
                    )));
                }
                ensure_case_id_free(&txn, id, &input.site_id, &sibling.patient_id).await?;
                if let Some(case_no) = sibling.case_no.as_deref() {
                    ensure_case_no_free(&txn, case_no, None).await?;
                }
                sibling_ids.push(id);
            }

            let trip = clinical_trip::ActiveModel {
                id: Set(Uuid::new_v4()),
                trip_date: Set(input.case_date),
                site_id: Set(input.site_id.clone()),
                status: Set(TripStatus::Out.as_str().to_string()),
                ..Default::default()
            };
            let trip = trip.insert(&txn).await.map_err(ServiceError::db_error)?;
            Some(trip.id)
        };

        let case = insert_case_on(
            &txn,
            case_id,
            &input.site_id,
            &input.patient_id,
            input.case_date,
            input.case_no.clone(),
            input.operator.clone(),
            trip_id,
        )
        .await?;

        let mut created_siblings = Vec::new();
        let mut all_items: Vec<CaseItemInput> = input.items.clone();
        if let Some(trip_id) = trip_id {
            for sibling in &input.additional_cases {
                let sibling_case = insert_case_on(
                    &txn,
                    derive_case_id(&input.site_id, &sibling.patient_id),
                    &input.site_id,
                    &sibling.patient_id,
                    input.case_date,
                    sibling.case_no.clone(),
                    sibling.operator.clone(),
                    Some(trip_id),
                )
                .await?;
                created_siblings.push(sibling_case.id);
                all_items.extend(sibling.items.iter().cloned());
            }
        }

        // Standalone items are attributed to the case immediately; trip items
        // all land in the shared pool and are assigned later.
        let (row_case_id, row_trip_id) = match trip_id {
            Some(trip_id) => (None, Some(trip_id)),
            None => (Some(case.id), None),
        };
        for item in &all_items {
            let picks = allocate_item_on(&txn, item, input.case_date).await?;
            insert_checkout_rows_on(
                &txn,
                &picks,
                item.product_type,
                input.case_date,
                TxnAction::CheckoutCase,
                row_case_id,
                row_trip_id,
            )
            .await?;
        }

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(case_id = %case.id, trip_id = ?trip_id, "Case created");
        let _ = self
            .event_sender
            .send(Event::CaseCreated {
                case_id: case.id,
                trip_id,
            })
            .await;
        if let Some(trip_id) = trip_id {
            let _ = self.event_sender.send(Event::TripCreated(trip_id)).await;
            for sibling in created_siblings {
                let _ = self
                    .event_sender
                    .send(Event::CaseCreated {
                        case_id: sibling,
                        trip_id: Some(trip_id),
                    })
                    .await;
            }
        }

        Ok(CreatedCase {
            case_id: case.id,
            trip_id,
        })
    }

    /// Attaches a new related case to an existing one. A standalone case is
    /// promoted: a trip is created and its already-checked-out rows move into
    /// the shared pool (one-way; only last-sibling compaction undoes it).
    #[instrument(skip(self, input))]
    pub async fn add_related_case(
        &self,
        case_id: Uuid,
        input: AdditionalCaseInput,
    ) -> Result<CreatedCase, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let case = find_case_on(&txn, case_id).await?;
        ensure_in_progress(&case)?;

        let new_case_id = derive_case_id(&case.site_id, &input.patient_id);
        ensure_case_id_free(&txn, new_case_id, &case.site_id, &input.patient_id).await?;
        if let Some(case_no) = input.case_no.as_deref() {
            ensure_case_no_free(&txn, case_no, None).await?;
        }

        let (trip_id, promoted) = match case.trip_id {
            Some(trip_id) => {
                let trip = find_trip_on(&txn, trip_id).await?;
                if trip.is_completed() {
                    return Err(ServiceError::InvalidOperation(format!(
                        "trip {} is completed",
                        trip_id
                    )));
                }
                (trip_id, false)
            }
            None => {
                let trip = clinical_trip::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    trip_date: Set(case.case_date),
                    site_id: Set(case.site_id.clone()),
                    status: Set(TripStatus::Out.as_str().to_string()),
                    ..Default::default()
                };
                let trip = trip.insert(&txn).await.map_err(ServiceError::db_error)?;

                // Promote the existing checkout rows into the shared pool.
                let rows = InventoryTransactionEntity::find()
                    .filter(inventory_transaction::Column::CaseId.eq(case.id))
                    .filter(inventory_transaction::Column::DeletedAt.is_null())
                    .all(&txn)
                    .await
                    .map_err(ServiceError::db_error)?;
                for row in rows {
                    let mut active: inventory_transaction::ActiveModel = row.into();
                    active.case_id = Set(None);
                    active.trip_id = Set(Some(trip.id));
                    active.update(&txn).await.map_err(ServiceError::db_error)?;
                }

                let mut active: clinical_case::ActiveModel = case.clone().into();
                active.trip_id = Set(Some(trip.id));
                active.update(&txn).await.map_err(ServiceError::db_error)?;

                (trip.id, true)
            }
        };

        let new_case = insert_case_on(
            &txn,
            new_case_id,
            &case.site_id,
            &input.patient_id,
            case.case_date,
            input.case_no.clone(),
            input.operator.clone(),
            Some(trip_id),
        )
        .await?;

        for item in &input.items {
            let picks = allocate_item_on(&txn, item, case.case_date).await?;
            insert_checkout_rows_on(
                &txn,
                &picks,
                item.product_type,
                case.case_date,
                TxnAction::CheckoutCase,
                None,
                Some(trip_id),
            )
            .await?;
        }

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(case_id = %new_case.id, trip_id = %trip_id, promoted, "Related case added");
        if promoted {
            let _ = self.event_sender.send(Event::TripCreated(trip_id)).await;
        }
        let _ = self
            .event_sender
            .send(Event::CaseCreated {
                case_id: new_case.id,
                trip_id: Some(trip_id),
            })
            .await;

        Ok(CreatedCase {
            case_id: new_case.id,
            trip_id: Some(trip_id),
        })
    }

    /// Updates case metadata. Only allowed while in progress.
    #[instrument(skip(self, input))]
    pub async fn update_case_info(
        &self,
        case_id: Uuid,
        input: UpdateCaseInfoInput,
    ) -> Result<clinical_case::Model, ServiceError> {
        let db = &*self.db;

        let case = find_case_on(db, case_id).await?;
        ensure_in_progress(&case)?;

        if let Some(case_no) = input.case_no.as_deref() {
            ensure_case_no_free(db, case_no, Some(case_id)).await?;
        }

        let mut active: clinical_case::ActiveModel = case.into();
        if let Some(case_no) = input.case_no {
            active.case_no = Set(Some(case_no));
        }
        if let Some(case_date) = input.case_date {
            active.case_date = Set(case_date);
        }
        if let Some(operator) = input.operator {
            active.operator = Set(Some(operator));
        }

        let updated = active.update(db).await.map_err(ServiceError::db_error)?;
        let _ = self.event_sender.send(Event::CaseUpdated(case_id)).await;
        Ok(updated)
    }

    /// Adds allocated units to a case. For a trip-linked case the units land
    /// in the trip's shared pool, not on the case itself.
    #[instrument(skip(self, item))]
    pub async fn add_case_item(
        &self,
        case_id: Uuid,
        item: CaseItemInput,
    ) -> Result<Vec<inventory_transaction::Model>, ServiceError> {
        self.add_case_items_batch(case_id, vec![item]).await
    }

    /// Batch form of item addition; all lines land or none do.
    #[instrument(skip(self, items))]
    pub async fn add_case_items_batch(
        &self,
        case_id: Uuid,
        items: Vec<CaseItemInput>,
    ) -> Result<Vec<inventory_transaction::Model>, ServiceError> {
        if items.is_empty() {
            return Err(ServiceError::ValidationError(
                "item list must not be empty".to_string(),
            ));
        }

        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let case = find_case_on(&txn, case_id).await?;
        ensure_in_progress(&case)?;

        let (row_case_id, row_trip_id) = match case.trip_id {
            Some(trip_id) => (None, Some(trip_id)),
            None => (Some(case.id), None),
        };

        let mut created = Vec::new();
        for item in &items {
            let picks = allocate_item_on(&txn, item, case.case_date).await?;
            let rows = insert_checkout_rows_on(
                &txn,
                &picks,
                item.product_type,
                case.case_date,
                TxnAction::CheckoutCase,
                row_case_id,
                row_trip_id,
            )
            .await?;
            created.extend(rows);
        }

        txn.commit().await.map_err(ServiceError::db_error)?;

        let _ = self.event_sender.send(Event::CaseUpdated(case_id)).await;
        Ok(created)
    }

    async fn owned_item_on<C: ConnectionTrait>(
        conn: &C,
        case: &clinical_case::Model,
        txn_id: Uuid,
    ) -> Result<inventory_transaction::Model, ServiceError> {
        let row = InventoryTransactionEntity::find_by_id(txn_id)
            .filter(inventory_transaction::Column::DeletedAt.is_null())
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Transaction {} not found", txn_id)))?;

        let owned = row.case_id == Some(case.id)
            || (case.trip_id.is_some() && row.trip_id == case.trip_id);
        if !owned {
            return Err(ServiceError::NotFound(format!(
                "Transaction {} does not belong to case {}",
                txn_id, case.id
            )));
        }

        match row.action() {
            Some(TxnAction::CheckoutCase) | Some(TxnAction::CheckoutTrip) => Ok(row),
            _ => Err(ServiceError::InvalidOperation(format!(
                "transaction {} is a derived row and cannot be edited",
                txn_id
            ))),
        }
    }

    /// Edits one checkout row of an in-progress case.
    #[instrument(skip(self, input))]
    pub async fn update_case_item(
        &self,
        case_id: Uuid,
        txn_id: Uuid,
        input: UpdateCaseItemInput,
    ) -> Result<inventory_transaction::Model, ServiceError> {
        let db = &*self.db;

        let case = find_case_on(db, case_id).await?;
        ensure_in_progress(&case)?;
        let row = Self::owned_item_on(db, &case, txn_id).await?;

        if let Some(qty) = input.qty {
            if qty <= 0 {
                return Err(ServiceError::ValidationError(
                    "quantity must be positive".to_string(),
                ));
            }
            // Raising a checkout draws extra stock; the increase must fit
            // within the serial's remaining on-hand quantity.
            if qty > row.qty {
                let extra = qty - row.qty;
                if let (Some(product_type), Some(serial)) = (
                    ProductType::from_str(&row.product_type),
                    row.serial_no.as_deref(),
                ) {
                    let on_hand = serial_balance_on(db, &row.spec_no, product_type, serial).await?;
                    if on_hand < extra {
                        return Err(ServiceError::InsufficientStock(format!(
                            "serial {} of {} has {} on hand, cannot draw {} more",
                            serial, row.spec_no, on_hand, extra
                        )));
                    }
                }
            }
        }

        let mut active: inventory_transaction::ActiveModel = row.into();
        if let Some(qty) = input.qty {
            active.qty = Set(qty);
        }
        if let Some(exp_date) = input.exp_date {
            active.exp_date = Set(Some(exp_date));
        }
        if let Some(batch_no) = input.batch_no {
            active.batch_no = Set(Some(batch_no));
        }
        if let Some(notes) = input.notes {
            active.notes = Set(Some(notes));
        }

        let updated = active.update(db).await.map_err(ServiceError::db_error)?;
        let _ = self.event_sender.send(Event::CaseUpdated(case_id)).await;
        Ok(updated)
    }

    /// Soft-deletes one checkout row of an in-progress case, restoring the
    /// unit to stock.
    #[instrument(skip(self))]
    pub async fn delete_case_item(&self, case_id: Uuid, txn_id: Uuid) -> Result<(), ServiceError> {
        let db = &*self.db;

        let case = find_case_on(db, case_id).await?;
        ensure_in_progress(&case)?;
        let row = Self::owned_item_on(db, &case, txn_id).await?;

        let mut active: inventory_transaction::ActiveModel = row.into();
        active.deleted_at = Set(Some(Utc::now()));
        active.update(db).await.map_err(ServiceError::db_error)?;

        let _ = self.event_sender.send(Event::CaseUpdated(case_id)).await;
        Ok(())
    }

    /// Deletes an in-progress case. A standalone case releases its stock by
    /// soft-deleting its checkout rows; a trip-linked case returns its
    /// assigned rows to the shared pool, compacting the trip away when only
    /// one sibling remains.
    #[instrument(skip(self))]
    pub async fn delete_case(&self, case_id: Uuid) -> Result<(), ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let case = find_case_on(&txn, case_id).await?;
        if case.is_completed() {
            return Err(ServiceError::InvalidOperation(format!(
                "case {} is completed and cannot be deleted",
                case_id
            )));
        }

        match case.trip_id {
            None => {
                let rows = InventoryTransactionEntity::find()
                    .filter(inventory_transaction::Column::CaseId.eq(case.id))
                    .filter(inventory_transaction::Column::DeletedAt.is_null())
                    .all(&txn)
                    .await
                    .map_err(ServiceError::db_error)?;
                for row in rows {
                    let mut active: inventory_transaction::ActiveModel = row.into();
                    active.deleted_at = Set(Some(Utc::now()));
                    active.update(&txn).await.map_err(ServiceError::db_error)?;
                }
                ClinicalCaseEntity::delete_by_id(case.id)
                    .exec(&txn)
                    .await
                    .map_err(ServiceError::db_error)?;
            }
            Some(trip_id) => {
                let siblings = ClinicalCaseEntity::find()
                    .filter(clinical_case::Column::TripId.eq(trip_id))
                    .all(&txn)
                    .await
                    .map_err(ServiceError::db_error)?;
                if siblings.iter().any(|s| s.is_completed()) {
                    return Err(ServiceError::InvalidOperation(format!(
                        "trip {} has a completed case; its cases cannot be deleted",
                        trip_id
                    )));
                }

                // Return this case's assigned units to the shared pool.
                let assigned = InventoryTransactionEntity::find()
                    .filter(inventory_transaction::Column::CaseId.eq(case.id))
                    .filter(inventory_transaction::Column::DeletedAt.is_null())
                    .all(&txn)
                    .await
                    .map_err(ServiceError::db_error)?;
                for row in assigned {
                    let mut active: inventory_transaction::ActiveModel = row.into();
                    active.case_id = Set(None);
                    active.update(&txn).await.map_err(ServiceError::db_error)?;
                }

                ClinicalCaseEntity::delete_by_id(case.id)
                    .exec(&txn)
                    .await
                    .map_err(ServiceError::db_error)?;

                let remaining: Vec<_> = siblings
                    .into_iter()
                    .filter(|s| s.id != case.id)
                    .collect();
                if remaining.len() == 1 {
                    compact_trip_on(&txn, trip_id, &remaining[0]).await?;
                    let _ = self.event_sender.send(Event::TripDeleted(trip_id)).await;
                }
            }
        }

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(case_id = %case_id, "Case deleted");
        let _ = self.event_sender.send(Event::CaseDeleted(case_id)).await;
        Ok(())
    }

    /// Deletes a whole trip group: every sibling case, every pool row, and
    /// the trip record itself.
    #[instrument(skip(self))]
    pub async fn delete_all_related_cases(&self, case_id: Uuid) -> Result<(), ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let case = find_case_on(&txn, case_id).await?;
        let trip_id = case.trip_id.ok_or_else(|| {
            ServiceError::InvalidOperation(format!("case {} is not part of a trip", case_id))
        })?;

        let siblings = ClinicalCaseEntity::find()
            .filter(clinical_case::Column::TripId.eq(trip_id))
            .all(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        if siblings.iter().any(|s| s.is_completed()) {
            return Err(ServiceError::InvalidOperation(format!(
                "trip {} has a completed case; the group cannot be deleted",
                trip_id
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

        let sibling_ids: Vec<Uuid> = siblings.iter().map(|s| s.id).collect();
        ClinicalCaseEntity::delete_many()
            .filter(clinical_case::Column::TripId.eq(trip_id))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        ClinicalTripEntity::delete_by_id(trip_id)
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(trip_id = %trip_id, "Trip group deleted");
        for id in sibling_ids {
            let _ = self.event_sender.send(Event::CaseDeleted(id)).await;
        }
        let _ = self.event_sender.send(Event::TripDeleted(trip_id)).await;
        Ok(())
    }

    pub async fn get_case(&self, case_id: Uuid) -> Result<clinical_case::Model, ServiceError> {
        find_case_on(&*self.db, case_id).await
    }

    /// Ledger rows attributed to the case (assigned rows only, for
    /// trip-linked cases).
    pub async fn case_items(
        &self,
        case_id: Uuid,
    ) -> Result<Vec<inventory_transaction::Model>, ServiceError> {
        let db = &*self.db;
        find_case_on(db, case_id).await?;

        InventoryTransactionEntity::find()
            .filter(inventory_transaction::Column::CaseId.eq(case_id))
            .filter(inventory_transaction::Column::DeletedAt.is_null())
            .order_by_asc(inventory_transaction::Column::CreatedAt)
            .order_by_asc(inventory_transaction::Column::Id)
            .all(db)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Lists cases with pagination, newest first.
    #[instrument(skip(self))]
    pub async fn list_cases(
        &self,
        site_id: Option<String>,
        status: Option<CaseStatus>,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<clinical_case::Model>, u64), ServiceError> {
        let db = &*self.db;

        let mut query = ClinicalCaseEntity::find();
        if let Some(site_id) = site_id {
            query = query.filter(clinical_case::Column::SiteId.eq(site_id));
        }
        if let Some(status) = status {
            query = query.filter(clinical_case::Column::Status.eq(status.as_str()));
        }

        let paginator = query
            .order_by_desc(clinical_case::Column::CaseDate)
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

    /// Builds the flat packing-list read model consumed by the document
    /// renderer. Shared pool units of a trip-linked case are included but
    /// flagged as unassigned.
    #[instrument(skip(self))]
    pub async fn packing_list(&self, case_id: Uuid) -> Result<PackingList, ServiceError> {
        let db = &*self.db;

        let case = find_case_on(db, case_id).await?;
        let site = SiteEntity::find_by_id(&case.site_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?;

        let mut rows = InventoryTransactionEntity::find()
            .filter(inventory_transaction::Column::CaseId.eq(case.id))
            .filter(inventory_transaction::Column::DeletedAt.is_null())
            .order_by_asc(inventory_transaction::Column::CreatedAt)
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        let mut items: Vec<PackingListItem> = rows
            .drain(..)
            .map(|row| to_packing_item(row, true))
            .collect();

        if let Some(trip_id) = case.trip_id {
            let pool = InventoryTransactionEntity::find()
                .filter(inventory_transaction::Column::TripId.eq(trip_id))
                .filter(inventory_transaction::Column::CaseId.is_null())
                .filter(inventory_transaction::Column::Action.is_in([
                    TxnAction::CheckoutCase.as_str(),
                    TxnAction::CheckoutTrip.as_str(),
                ]))
                .filter(inventory_transaction::Column::DeletedAt.is_null())
                .order_by_asc(inventory_transaction::Column::CreatedAt)
                .all(db)
                .await
                .map_err(ServiceError::db_error)?;
            items.extend(pool.into_iter().map(|row| to_packing_item(row, false)));
        }

        Ok(PackingList {
            site_name: site.map(|s| s.name).unwrap_or_default(),
            case,
            items,
        })
    }
}

fn to_packing_item(row: inventory_transaction::Model, assigned: bool) -> PackingListItem {
    PackingListItem {
        txn_id: row.id,
        spec_no: row.spec_no,
        product_type: row.product_type,
        serial_no: row.serial_no,
        batch_no: row.batch_no,
        exp_date: row.exp_date,
        qty: row.qty,
        disposition: row.action,
        assigned,
        notes: row.notes,
    }
}

/// Converts the last remaining sibling of a trip back into a standalone
/// case: every surviving trip row becomes a plain case-tagged checkout and
/// the trip record is removed.
pub(crate) async fn compact_trip_on<C: ConnectionTrait>(
    conn: &C,
    trip_id: Uuid,
    survivor: &clinical_case::Model,
) -> Result<(), ServiceError> {
    let rows = InventoryTransactionEntity::find()
        .filter(inventory_transaction::Column::TripId.eq(trip_id))
        .filter(inventory_transaction::Column::DeletedAt.is_null())
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;
    for row in rows {
        let is_checkout = matches!(
            row.action(),
            Some(TxnAction::CheckoutCase) | Some(TxnAction::CheckoutTrip)
        );
        let mut active: inventory_transaction::ActiveModel = row.into();
        active.trip_id = Set(None);
        if is_checkout {
            active.case_id = Set(Some(survivor.id));
            active.action = Set(TxnAction::CheckoutCase.as_str().to_string());
        }
        // Receipt rows from mid-trip returns keep their action and stay
        // unattributed; they are history, not stock to hand the survivor.
        active.update(conn).await.map_err(ServiceError::db_error)?;
    }

    let mut active: clinical_case::ActiveModel = survivor.clone().into();
    active.trip_id = Set(None);
    active.update(conn).await.map_err(ServiceError::db_error)?;

    ClinicalTripEntity::delete_by_id(trip_id)
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    Ok(())
}

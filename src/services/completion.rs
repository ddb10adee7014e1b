use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    entities::{
        clinical_case::{self, CaseStatus, Entity as ClinicalCaseEntity},
        clinical_trip::{self, TripStatus},
        inventory_transaction::{
            self, encode_condition_codes, system_note, Entity as InventoryTransactionEntity,
            Inspection, TxnAction, NOTE_TAG_RETURN, NOTE_TAG_TRIP_RETURN, NOTE_TAG_USED,
        },
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::cases::{find_case_on, find_trip_on},
    services::trips::finalize_trip_on,
};

/// One reconciliation decision for a checked-out unit. `accepted` and
/// `return_condition` only apply when `returned` is true.
#[derive(Debug, Clone)]
pub struct CompletionItem {
    pub txn_id: Uuid,
    pub returned: bool,
    pub accepted: Option<bool>,
    pub return_condition: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub case_id: Uuid,
    pub status: CaseStatus,
    /// Set when this completion was the trip's last and triggered the
    /// automatic return of unconsumed pool stock.
    pub trip_completed: Option<Uuid>,
}

/// Executes the in-progress-to-completed transition of a case and its exact
/// inverse. All derived ledger writes of one call land atomically.
#[derive(Clone)]
pub struct CompletionService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl CompletionService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Completes a case, recording a disposition for each chargeable unit.
    ///
    /// Standalone cases demand an exhaustive submission over their checked-out
    /// rows and materialize every disposition immediately. Trip-linked cases
    /// accept a partial submission (siblings reconcile independently); used
    /// units are recorded at once while returns stay in the pool until the
    /// last sibling completes, at which point unconsumed pool stock is
    /// receipted back automatically.
    #[instrument(skip(self, items))]
    pub async fn complete_case(
        &self,
        case_id: Uuid,
        items: Vec<CompletionItem>,
    ) -> Result<CompletionOutcome, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let case = find_case_on(&txn, case_id).await?;
        if case.is_completed() {
            return Err(ServiceError::Conflict(format!(
                "case {} is already completed",
                case_id
            )));
        }

        let mut seen = HashSet::new();
        for item in &items {
            if !seen.insert(item.txn_id) {
                return Err(ServiceError::Conflict(format!(
                    "transaction {} appears more than once in the submission",
                    item.txn_id
                )));
            }
            if item.returned && item.accepted.is_none() {
                return Err(ServiceError::ValidationError(format!(
                    "returned transaction {} is missing an accept/reject decision",
                    item.txn_id
                )));
            }
        }

        let trip_completed = match case.trip_id {
            None => {
                self.complete_standalone(&txn, &case, &items).await?;
                None
            }
            Some(trip_id) => self.complete_in_trip(&txn, &case, trip_id, &items).await?,
        };

        let mut active: clinical_case::ActiveModel = case.into();
        active.status = Set(CaseStatus::Completed.as_str().to_string());
        active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(case_id = %case_id, trip_completed = ?trip_completed, "Case completed");
        let _ = self.event_sender.send(Event::CaseCompleted(case_id)).await;
        if let Some(trip_id) = trip_completed {
            let _ = self.event_sender.send(Event::TripCompleted(trip_id)).await;
        }

        Ok(CompletionOutcome {
            case_id,
            status: CaseStatus::Completed,
            trip_completed,
        })
    }

    async fn complete_standalone<C: ConnectionTrait>(
        &self,
        conn: &C,
        case: &clinical_case::Model,
        items: &[CompletionItem],
    ) -> Result<(), ServiceError> {
        let chargeable = InventoryTransactionEntity::find()
            .filter(inventory_transaction::Column::CaseId.eq(case.id))
            .filter(inventory_transaction::Column::Action.eq(TxnAction::CheckoutCase.as_str()))
            .filter(inventory_transaction::Column::DeletedAt.is_null())
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let chargeable_ids: HashSet<Uuid> = chargeable.iter().map(|r| r.id).collect();
        let submitted_ids: HashSet<Uuid> = items.iter().map(|i| i.txn_id).collect();
        if chargeable_ids != submitted_ids {
            return Err(ServiceError::Conflict(format!(
                "submission must cover each of the case's {} checked-out unit(s) exactly once",
                chargeable_ids.len()
            )));
        }

        let by_id: HashMap<Uuid, &inventory_transaction::Model> =
            chargeable.iter().map(|r| (r.id, r)).collect();
        for item in items {
            let row = by_id[&item.txn_id];
            self.write_disposition(conn, case, row, item, None).await?;
        }
        Ok(())
    }

    async fn complete_in_trip<C: ConnectionTrait>(
        &self,
        conn: &C,
        case: &clinical_case::Model,
        trip_id: Uuid,
        items: &[CompletionItem],
    ) -> Result<Option<Uuid>, ServiceError> {
        let trip = find_trip_on(conn, trip_id).await?;

        let chargeable = chargeable_trip_rows_on(conn, trip_id).await?;
        let by_id: HashMap<Uuid, &inventory_transaction::Model> =
            chargeable.iter().map(|r| (r.id, r)).collect();

        for item in items {
            let row = by_id.get(&item.txn_id).copied().ok_or_else(|| {
                ServiceError::Conflict(format!(
                    "transaction {} is not chargeable for this case",
                    item.txn_id
                ))
            })?;
            // Returns are deferred: the unit stays in the pool until every
            // sibling has completed, since another case might still claim it.
            if !item.returned {
                self.write_used_row(conn, case, row, Some(trip_id)).await?;
            }
        }

        let open_siblings = ClinicalCaseEntity::find()
            .filter(clinical_case::Column::TripId.eq(trip_id))
            .filter(clinical_case::Column::Id.ne(case.id))
            .filter(clinical_case::Column::Status.eq(CaseStatus::InProgress.as_str()))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        if open_siblings.is_empty() {
            finalize_trip_on(conn, &trip).await?;
            Ok(Some(trip_id))
        } else {
            Ok(None)
        }
    }

    async fn write_disposition<C: ConnectionTrait>(
        &self,
        conn: &C,
        case: &clinical_case::Model,
        row: &inventory_transaction::Model,
        item: &CompletionItem,
        trip_id: Option<Uuid>,
    ) -> Result<(), ServiceError> {
        if !item.returned {
            return self.write_used_row(conn, case, row, trip_id).await;
        }

        let accepted = item.accepted.unwrap_or(false);
        let inspection = if accepted {
            Inspection::Accept
        } else {
            Inspection::Reject
        };
        self.write_derived_row(
            conn,
            case,
            row,
            TxnAction::ReturnCase,
            Some(inspection),
            encode_condition_codes(&item.return_condition),
            NOTE_TAG_RETURN,
            trip_id,
        )
        .await?;

        if !accepted {
            // Rejected clinical returns are salvaged into demo stock.
            self.write_derived_row(
                conn,
                case,
                row,
                TxnAction::MoveDemo,
                None,
                None,
                NOTE_TAG_RETURN,
                trip_id,
            )
            .await?;
        }
        Ok(())
    }

    async fn write_used_row<C: ConnectionTrait>(
        &self,
        conn: &C,
        case: &clinical_case::Model,
        row: &inventory_transaction::Model,
        trip_id: Option<Uuid>,
    ) -> Result<(), ServiceError> {
        self.write_derived_row(
            conn,
            case,
            row,
            TxnAction::UsedCase,
            None,
            None,
            NOTE_TAG_USED,
            trip_id,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_derived_row<C: ConnectionTrait>(
        &self,
        conn: &C,
        case: &clinical_case::Model,
        row: &inventory_transaction::Model,
        action: TxnAction,
        inspection: Option<Inspection>,
        return_condition: Option<String>,
        note_tag: &str,
        trip_id: Option<Uuid>,
    ) -> Result<(), ServiceError> {
        let model = inventory_transaction::ActiveModel {
            id: Set(Uuid::new_v4()),
            txn_date: Set(case.case_date),
            action: Set(action.as_str().to_string()),
            product_type: Set(row.product_type.clone()),
            spec_no: Set(row.spec_no.clone()),
            serial_no: Set(row.serial_no.clone()),
            qty: Set(row.qty),
            exp_date: Set(row.exp_date),
            batch_no: Set(row.batch_no.clone()),
            case_id: Set(Some(case.id)),
            trip_id: Set(trip_id),
            inspection: Set(inspection.map(|i| i.as_str().to_string())),
            return_condition: Set(return_condition),
            notes: Set(Some(system_note(note_tag))),
            deleted_at: Set(None),
            ..Default::default()
        };
        model.insert(conn).await.map_err(ServiceError::db_error)?;
        Ok(())
    }

    /// Reverses a completed case, deleting exactly the derived rows the
    /// forward transition produced and flipping the case back to in
    /// progress. Reversing one sibling of a fully completed trip also drops
    /// the trip-wide automatic returns and reopens the trip; siblings'
    /// usage rows and statuses are untouched.
    #[instrument(skip(self))]
    pub async fn reverse_completion(
        &self,
        case_id: Uuid,
    ) -> Result<CompletionOutcome, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let case = find_case_on(&txn, case_id).await?;
        if !case.is_completed() {
            return Err(ServiceError::InvalidOperation(format!(
                "case {} is not completed",
                case_id
            )));
        }

        match case.trip_id {
            None => {
                // Everything except the original checkout rows is derived.
                InventoryTransactionEntity::delete_many()
                    .filter(inventory_transaction::Column::CaseId.eq(case.id))
                    .filter(
                        inventory_transaction::Column::Action
                            .ne(TxnAction::CheckoutCase.as_str()),
                    )
                    .exec(&txn)
                    .await
                    .map_err(ServiceError::db_error)?;
            }
            Some(trip_id) => {
                let trip = find_trip_on(&txn, trip_id).await?;

                InventoryTransactionEntity::delete_many()
                    .filter(inventory_transaction::Column::TripId.eq(trip_id))
                    .filter(
                        inventory_transaction::Column::Action
                            .eq(TxnAction::ReturnCase.as_str()),
                    )
                    .filter(
                        inventory_transaction::Column::Notes
                            .eq(system_note(NOTE_TAG_TRIP_RETURN)),
                    )
                    .exec(&txn)
                    .await
                    .map_err(ServiceError::db_error)?;

                InventoryTransactionEntity::delete_many()
                    .filter(inventory_transaction::Column::CaseId.eq(case.id))
                    .filter(
                        inventory_transaction::Column::Action.eq(TxnAction::UsedCase.as_str()),
                    )
                    .exec(&txn)
                    .await
                    .map_err(ServiceError::db_error)?;

                if trip.is_completed() {
                    let mut active: clinical_trip::ActiveModel = trip.into();
                    active.status = Set(TripStatus::Out.as_str().to_string());
                    active.update(&txn).await.map_err(ServiceError::db_error)?;
                    let _ = self.event_sender.send(Event::TripReopened(trip_id)).await;
                }
            }
        }

        let trip_id = case.trip_id;
        let mut active: clinical_case::ActiveModel = case.into();
        active.status = Set(CaseStatus::InProgress.as_str().to_string());
        active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(case_id = %case_id, trip_id = ?trip_id, "Case completion reversed");
        let _ = self
            .event_sender
            .send(Event::CaseCompletionReversed(case_id))
            .await;

        Ok(CompletionOutcome {
            case_id,
            status: CaseStatus::InProgress,
            trip_completed: None,
        })
    }
}

/// Chargeable rows of a trip: its live case-checkout rows minus those
/// already consumed. Consumption is matched per `(spec_no, serial_no)` by
/// count, earliest checkout first, because lot-style serials can have
/// several outstanding checkouts and usages under the same key.
pub(crate) async fn chargeable_trip_rows_on<C: ConnectionTrait>(
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

    let mut chargeable = Vec::new();
    for row in rows {
        if row.action() != Some(TxnAction::CheckoutCase) {
            continue;
        }
        let key = (row.spec_no.clone(), row.serial_no.clone());
        match used_counts.get_mut(&key) {
            Some(count) if *count > 0 => *count -= 1,
            _ => chargeable.push(row),
        }
    }
    Ok(chargeable)
}

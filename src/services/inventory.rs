use std::sync::Arc;

use chrono::NaiveDate;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    entities::inventory_transaction::{
        self, encode_condition_codes, Entity as InventoryTransactionEntity, Inspection,
        ProductType, TxnAction,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::balance::BalanceService,
};

/// A stock movement recorded outside of any case: receipt, ship-out, or a
/// move into the demo pool.
#[derive(Debug, Clone)]
pub struct StockMovementInput {
    pub txn_date: NaiveDate,
    pub product_type: ProductType,
    pub spec_no: String,
    pub serial_no: Option<String>,
    pub qty: i32,
    pub exp_date: Option<NaiveDate>,
    pub batch_no: Option<String>,
    pub inspection: Option<Inspection>,
    pub condition_codes: Vec<i32>,
    pub notes: Option<String>,
}

/// Filters for listing ledger rows.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub spec_no: Option<String>,
    pub action: Option<TxnAction>,
    pub case_id: Option<Uuid>,
    pub trip_id: Option<Uuid>,
}

/// Service for recording and browsing ledger transactions outside the
/// case/trip flows.
#[derive(Clone)]
pub struct InventoryService {
    db: Arc<DatabaseConnection>,
    balance: BalanceService,
    event_sender: EventSender,
}

impl InventoryService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        balance: BalanceService,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db,
            balance,
            event_sender,
        }
    }

    fn validate(input: &StockMovementInput) -> Result<(), ServiceError> {
        if input.qty <= 0 {
            return Err(ServiceError::ValidationError(
                "quantity must be positive".to_string(),
            ));
        }
        if input.spec_no.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "spec_no must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    async fn insert_movement(
        &self,
        action: TxnAction,
        input: StockMovementInput,
    ) -> Result<inventory_transaction::Model, ServiceError> {
        let db = &*self.db;

        let model = inventory_transaction::ActiveModel {
            id: Set(Uuid::new_v4()),
            txn_date: Set(input.txn_date),
            action: Set(action.as_str().to_string()),
            product_type: Set(input.product_type.as_str().to_string()),
            spec_no: Set(input.spec_no.clone()),
            serial_no: Set(input.serial_no.clone()),
            qty: Set(input.qty),
            exp_date: Set(input.exp_date),
            batch_no: Set(input.batch_no.clone()),
            case_id: Set(None),
            trip_id: Set(None),
            inspection: Set(input.inspection.map(|i| i.as_str().to_string())),
            return_condition: Set(encode_condition_codes(&input.condition_codes)),
            notes: Set(input.notes.clone()),
            deleted_at: Set(None),
            ..Default::default()
        };

        model.insert(db).await.map_err(ServiceError::db_error)
    }

    /// Records a receipt of sellable stock.
    #[instrument(skip(self, input), fields(spec_no = %input.spec_no))]
    pub async fn receive_stock(
        &self,
        input: StockMovementInput,
    ) -> Result<inventory_transaction::Model, ServiceError> {
        Self::validate(&input)?;

        let created = self.insert_movement(TxnAction::ReceiveStock, input).await?;

        info!(txn_id = %created.id, "Stock receipt recorded");
        let _ = self
            .event_sender
            .send(Event::StockReceived {
                txn_id: created.id,
                spec_no: created.spec_no.clone(),
                qty: created.qty,
            })
            .await;

        Ok(created)
    }

    /// Records a ship-out. Fails when the serial's raw on-hand quantity would
    /// go negative.
    #[instrument(skip(self, input), fields(spec_no = %input.spec_no))]
    pub async fn ship_stock(
        &self,
        input: StockMovementInput,
    ) -> Result<inventory_transaction::Model, ServiceError> {
        Self::validate(&input)?;

        if let Some(serial) = input.serial_no.as_deref() {
            let on_hand = self
                .balance
                .serial_balance(&input.spec_no, input.product_type, serial)
                .await?;
            if on_hand < input.qty {
                return Err(ServiceError::InsufficientStock(format!(
                    "serial {} of {} has {} on hand, cannot ship {}",
                    serial, input.spec_no, on_hand, input.qty
                )));
            }
        }

        let created = self.insert_movement(TxnAction::ShipStock, input).await?;

        info!(txn_id = %created.id, "Stock ship-out recorded");
        let _ = self
            .event_sender
            .send(Event::StockShipped {
                txn_id: created.id,
                spec_no: created.spec_no.clone(),
                qty: created.qty,
            })
            .await;

        Ok(created)
    }

    /// Moves a unit into the demo pool, taking it out of clinical stock.
    #[instrument(skip(self, input), fields(spec_no = %input.spec_no))]
    pub async fn move_to_demo(
        &self,
        input: StockMovementInput,
    ) -> Result<inventory_transaction::Model, ServiceError> {
        Self::validate(&input)?;

        let created = self.insert_movement(TxnAction::MoveDemo, input).await?;

        info!(txn_id = %created.id, "Demo-pool move recorded");
        let _ = self
            .event_sender
            .send(Event::StockMovedToDemo {
                txn_id: created.id,
                spec_no: created.spec_no.clone(),
                qty: created.qty,
            })
            .await;

        Ok(created)
    }

    /// Lists non-deleted transactions with pagination, newest first.
    #[instrument(skip(self))]
    pub async fn list_transactions(
        &self,
        filter: TransactionFilter,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<inventory_transaction::Model>, u64), ServiceError> {
        let db = &*self.db;

        let mut query = InventoryTransactionEntity::find()
            .filter(inventory_transaction::Column::DeletedAt.is_null());

        if let Some(spec_no) = &filter.spec_no {
            query = query.filter(inventory_transaction::Column::SpecNo.eq(spec_no));
        }
        if let Some(action) = filter.action {
            query = query.filter(inventory_transaction::Column::Action.eq(action.as_str()));
        }
        if let Some(case_id) = filter.case_id {
            query = query.filter(inventory_transaction::Column::CaseId.eq(case_id));
        }
        if let Some(trip_id) = filter.trip_id {
            query = query.filter(inventory_transaction::Column::TripId.eq(trip_id));
        }

        let paginator = query
            .order_by_desc(inventory_transaction::Column::CreatedAt)
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

    /// Soft-deletes a user-entered transaction. Rows owned by a case or trip
    /// must go through the case/trip operations instead.
    #[instrument(skip(self))]
    pub async fn delete_transaction(&self, txn_id: Uuid) -> Result<(), ServiceError> {
        let db = &*self.db;

        let txn = InventoryTransactionEntity::find_by_id(txn_id)
            .filter(inventory_transaction::Column::DeletedAt.is_null())
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Transaction {} not found", txn_id)))?;

        if txn.case_id.is_some() || txn.trip_id.is_some() {
            return Err(ServiceError::InvalidOperation(
                "transaction belongs to a case or trip; use the case/trip operations".to_string(),
            ));
        }

        let mut active: inventory_transaction::ActiveModel = txn.into();
        active.deleted_at = Set(Some(chrono::Utc::now()));
        active.update(db).await.map_err(ServiceError::db_error)?;

        let _ = self.event_sender.send(Event::TransactionDeleted(txn_id)).await;
        Ok(())
    }
}

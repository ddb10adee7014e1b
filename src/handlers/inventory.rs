use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::inventory_transaction::{self, Inspection, ProductType, TxnAction},
    errors::ServiceError,
    services::balance::{PickedProduct, StockCandidate},
    services::inventory::{StockMovementInput, TransactionFilter},
    ApiResponse, ApiResult, AppState, PaginatedResponse,
};

/// Ledger row as exposed over the API.
#[derive(Debug, Serialize, ToSchema)]
pub struct TransactionView {
    pub id: Uuid,
    pub txn_date: NaiveDate,
    pub action: String,
    pub product_type: String,
    pub spec_no: String,
    pub serial_no: Option<String>,
    pub qty: i32,
    pub exp_date: Option<NaiveDate>,
    pub batch_no: Option<String>,
    pub case_id: Option<Uuid>,
    pub trip_id: Option<Uuid>,
    pub inspection: Option<String>,
    pub return_condition: Vec<i32>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<inventory_transaction::Model> for TransactionView {
    fn from(model: inventory_transaction::Model) -> Self {
        let return_condition = model.condition_codes();
        Self {
            id: model.id,
            txn_date: model.txn_date,
            action: model.action,
            product_type: model.product_type,
            spec_no: model.spec_no,
            serial_no: model.serial_no,
            qty: model.qty,
            exp_date: model.exp_date,
            batch_no: model.batch_no,
            case_id: model.case_id,
            trip_id: model.trip_id,
            inspection: model.inspection,
            return_condition,
            notes: model.notes,
            created_at: model.created_at,
        }
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct StockMovementRequest {
    pub txn_date: NaiveDate,
    pub product_type: String,
    #[validate(length(min = 1, message = "spec_no cannot be empty"))]
    pub spec_no: String,
    pub serial_no: Option<String>,
    #[validate(range(min = 1, message = "qty must be positive"))]
    pub qty: i32,
    pub exp_date: Option<NaiveDate>,
    pub batch_no: Option<String>,
    pub inspection: Option<String>,
    #[serde(default)]
    pub return_condition: Vec<i32>,
    pub notes: Option<String>,
}

impl StockMovementRequest {
    fn into_input(self) -> Result<StockMovementInput, ServiceError> {
        let product_type = parse_product_type(&self.product_type)?;
        let inspection = match self.inspection.as_deref() {
            None => None,
            Some(raw) => Some(Inspection::from_str(raw).ok_or_else(|| {
                ServiceError::ValidationError(format!("unknown inspection result: {}", raw))
            })?),
        };
        Ok(StockMovementInput {
            txn_date: self.txn_date,
            product_type,
            spec_no: self.spec_no,
            serial_no: self.serial_no,
            qty: self.qty,
            exp_date: self.exp_date,
            batch_no: self.batch_no,
            inspection,
            condition_codes: self.return_condition,
            notes: self.notes,
        })
    }
}

pub(crate) fn parse_product_type(raw: &str) -> Result<ProductType, ServiceError> {
    ProductType::from_str(raw)
        .ok_or_else(|| ServiceError::ValidationError(format!("unknown product type: {}", raw)))
}

#[derive(Debug, Deserialize, Default, ToSchema)]
pub struct TransactionListQuery {
    /// Page number (1-indexed)
    pub page: Option<u64>,
    /// Page size (max 100)
    pub limit: Option<u64>,
    pub spec_no: Option<String>,
    pub action: Option<String>,
    pub case_id: Option<Uuid>,
    pub trip_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CandidateQuery {
    pub spec_no: String,
    pub product_type: String,
    pub reference_date: NaiveDate,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PickQuery {
    pub spec_no: String,
    pub product_type: String,
    pub reference_date: NaiveDate,
    pub qty: i32,
}

pub async fn receive_stock(
    State(state): State<AppState>,
    Json(payload): Json<StockMovementRequest>,
) -> ApiResult<TransactionView> {
    payload.validate()?;
    let created = state
        .services
        .inventory
        .receive_stock(payload.into_input()?)
        .await?;
    Ok(Json(ApiResponse::success(TransactionView::from(created))))
}

pub async fn ship_stock(
    State(state): State<AppState>,
    Json(payload): Json<StockMovementRequest>,
) -> ApiResult<TransactionView> {
    payload.validate()?;
    let created = state
        .services
        .inventory
        .ship_stock(payload.into_input()?)
        .await?;
    Ok(Json(ApiResponse::success(TransactionView::from(created))))
}

pub async fn move_to_demo(
    State(state): State<AppState>,
    Json(payload): Json<StockMovementRequest>,
) -> ApiResult<TransactionView> {
    payload.validate()?;
    let created = state
        .services
        .inventory
        .move_to_demo(payload.into_input()?)
        .await?;
    Ok(Json(ApiResponse::success(TransactionView::from(created))))
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Query(query): Query<TransactionListQuery>,
) -> ApiResult<PaginatedResponse<TransactionView>> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);

    let action = match query.action.as_deref() {
        None => None,
        Some(raw) => Some(TxnAction::from_str(raw).ok_or_else(|| {
            ServiceError::ValidationError(format!("unknown ledger action: {}", raw))
        })?),
    };

    let filter = TransactionFilter {
        spec_no: query.spec_no,
        action,
        case_id: query.case_id,
        trip_id: query.trip_id,
    };

    let (records, total) = state
        .services
        .inventory
        .list_transactions(filter, page, limit)
        .await?;
    let items: Vec<TransactionView> = records.into_iter().map(TransactionView::from).collect();
    let total_pages = total.div_ceil(limit);

    Ok(Json(ApiResponse::success(PaginatedResponse {
        items,
        total,
        page,
        limit,
        total_pages,
    })))
}

pub async fn delete_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    state.services.inventory.delete_transaction(id).await?;
    Ok(Json(ApiResponse::success(json!({
        "transaction_id": id,
        "status": "deleted"
    }))))
}

/// FIFO-ordered candidates for a spec, as of the reference date.
pub async fn get_candidates(
    State(state): State<AppState>,
    Query(query): Query<CandidateQuery>,
) -> ApiResult<Vec<StockCandidate>> {
    let product_type = parse_product_type(&query.product_type)?;
    let candidates = state
        .services
        .balance
        .stock_candidates(&query.spec_no, product_type, query.reference_date)
        .await?;
    Ok(Json(ApiResponse::success(candidates)))
}

/// Greedy allocation preview. Under-fills silently when stock is short, just
/// like the allocation performed during case creation.
pub async fn pick_products(
    State(state): State<AppState>,
    Query(query): Query<PickQuery>,
) -> ApiResult<Vec<PickedProduct>> {
    let product_type = parse_product_type(&query.product_type)?;
    let picked = state
        .services
        .balance
        .pick_products(&query.spec_no, product_type, query.reference_date, query.qty)
        .await?;
    Ok(Json(ApiResponse::success(picked)))
}

/// All eligible units, uncapped, for manual substitution.
pub async fn available_products(
    State(state): State<AppState>,
    Query(query): Query<CandidateQuery>,
) -> ApiResult<Vec<PickedProduct>> {
    let product_type = parse_product_type(&query.product_type)?;
    let available = state
        .services
        .balance
        .available_products(&query.spec_no, product_type, query.reference_date)
        .await?;
    Ok(Json(ApiResponse::success(available)))
}

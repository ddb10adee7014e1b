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
    entities::clinical_trip::{self, TripStatus},
    errors::ServiceError,
    handlers::cases::{CaseItemRequest, CaseView, RelatedCaseRequest},
    handlers::inventory::TransactionView,
    services::trips::CreateTripInput,
    ApiResponse, ApiResult, AppState, PaginatedResponse,
};

#[derive(Debug, Serialize, ToSchema)]
pub struct TripView {
    pub id: Uuid,
    pub trip_date: NaiveDate,
    pub site_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<clinical_trip::Model> for TripView {
    fn from(model: clinical_trip::Model) -> Self {
        Self {
            id: model.id,
            trip_date: model.trip_date,
            site_id: model.site_id,
            status: model.status,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateTripRequest {
    #[validate(length(min = 1, message = "site_id cannot be empty"))]
    pub site_id: String,
    pub trip_date: NaiveDate,
    #[serde(default)]
    pub items: Vec<CaseItemRequest>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct AssignItemsRequest {
    pub case_id: Uuid,
    #[validate(length(min = 1, message = "txn_ids cannot be empty"))]
    pub txn_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ReturnItemsRequest {
    #[validate(length(min = 1, message = "txn_ids cannot be empty"))]
    pub txn_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize, Default, ToSchema)]
pub struct TripListQuery {
    /// Page number (1-indexed)
    pub page: Option<u64>,
    /// Page size (max 100)
    pub limit: Option<u64>,
    pub site_id: Option<String>,
    pub status: Option<String>,
}

pub async fn create_trip(
    State(state): State<AppState>,
    Json(payload): Json<CreateTripRequest>,
) -> ApiResult<TripView> {
    payload.validate()?;

    let items = payload
        .items
        .into_iter()
        .map(CaseItemRequest::into_input)
        .collect::<Result<Vec<_>, _>>()?;

    let trip = state
        .services
        .trips
        .create_trip(CreateTripInput {
            site_id: payload.site_id,
            trip_date: payload.trip_date,
            items,
        })
        .await?;
    Ok(Json(ApiResponse::success(TripView::from(trip))))
}

pub async fn get_trip(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<TripView> {
    let trip = state.services.trips.get_trip(id).await?;
    Ok(Json(ApiResponse::success(TripView::from(trip))))
}

pub async fn list_trips(
    State(state): State<AppState>,
    Query(query): Query<TripListQuery>,
) -> ApiResult<PaginatedResponse<TripView>> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);

    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(TripStatus::from_str(raw).ok_or_else(|| {
            ServiceError::ValidationError(format!("unknown trip status: {}", raw))
        })?),
    };

    let (records, total) = state
        .services
        .trips
        .list_trips(query.site_id, status, page, limit)
        .await?;
    let items: Vec<TripView> = records.into_iter().map(TripView::from).collect();
    let total_pages = total.div_ceil(limit);

    Ok(Json(ApiResponse::success(PaginatedResponse {
        items,
        total,
        page,
        limit,
        total_pages,
    })))
}

pub async fn get_pool_items(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<TransactionView>> {
    let rows = state.services.trips.pool_items(id).await?;
    let items: Vec<TransactionView> = rows.into_iter().map(TransactionView::from).collect();
    Ok(Json(ApiResponse::success(items)))
}

pub async fn get_trip_cases(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<CaseView>> {
    let cases = state.services.trips.trip_cases(id).await?;
    let items: Vec<CaseView> = cases.into_iter().map(CaseView::from).collect();
    Ok(Json(ApiResponse::success(items)))
}

pub async fn add_pool_items(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<Vec<CaseItemRequest>>,
) -> ApiResult<Vec<TransactionView>> {
    for item in &payload {
        item.validate()?;
    }
    let items = payload
        .into_iter()
        .map(CaseItemRequest::into_input)
        .collect::<Result<Vec<_>, _>>()?;

    let created = state.services.trips.add_pool_items(id, items).await?;
    let items: Vec<TransactionView> = created.into_iter().map(TransactionView::from).collect();
    Ok(Json(ApiResponse::success(items)))
}

pub async fn assign_items_to_case(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AssignItemsRequest>,
) -> ApiResult<Vec<TransactionView>> {
    payload.validate()?;
    let updated = state
        .services
        .trips
        .assign_items_to_case(id, payload.case_id, payload.txn_ids)
        .await?;
    let items: Vec<TransactionView> = updated.into_iter().map(TransactionView::from).collect();
    Ok(Json(ApiResponse::success(items)))
}

pub async fn return_items(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReturnItemsRequest>,
) -> ApiResult<serde_json::Value> {
    payload.validate()?;
    let count = payload.txn_ids.len();
    state.services.trips.return_items(id, payload.txn_ids).await?;
    Ok(Json(ApiResponse::success(json!({
        "trip_id": id,
        "returned": count
    }))))
}

pub async fn add_case_to_trip(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RelatedCaseRequest>,
) -> ApiResult<CaseView> {
    payload.validate()?;
    let case = state
        .services
        .trips
        .add_case_to_trip(id, payload.into_input()?)
        .await?;
    Ok(Json(ApiResponse::success(CaseView::from(case))))
}

pub async fn remove_case_from_trip(
    State(state): State<AppState>,
    Path((id, case_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<serde_json::Value> {
    state
        .services
        .trips
        .remove_case_from_trip(id, case_id)
        .await?;
    Ok(Json(ApiResponse::success(json!({
        "trip_id": id,
        "case_id": case_id,
        "status": "detached"
    }))))
}

pub async fn complete_trip(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    let returned = state.services.trips.complete_trip(id).await?;
    Ok(Json(ApiResponse::success(json!({
        "trip_id": id,
        "status": "completed",
        "returned": returned
    }))))
}

pub async fn delete_trip(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    state.services.trips.delete_trip(id).await?;
    Ok(Json(ApiResponse::success(json!({
        "trip_id": id,
        "status": "deleted"
    }))))
}

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
    entities::clinical_case::{self, CaseStatus},
    errors::ServiceError,
    handlers::inventory::{parse_product_type, TransactionView},
    services::cases::{
        AdditionalCaseInput, CaseItemInput, CreateCaseInput, PackingList, PackingListItem,
        UpdateCaseInfoInput, UpdateCaseItemInput,
    },
    services::completion::CompletionItem,
    ApiResponse, ApiResult, AppState, PaginatedResponse,
};

#[derive(Debug, Serialize, ToSchema)]
pub struct CaseView {
    pub id: Uuid,
    pub case_no: Option<String>,
    pub site_id: String,
    pub patient_id: String,
    pub case_date: NaiveDate,
    pub operator: Option<String>,
    pub trip_id: Option<Uuid>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<clinical_case::Model> for CaseView {
    fn from(model: clinical_case::Model) -> Self {
        Self {
            id: model.id,
            case_no: model.case_no,
            site_id: model.site_id,
            patient_id: model.patient_id,
            case_date: model.case_date,
            operator: model.operator,
            trip_id: model.trip_id,
            status: model.status,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct CaseItemRequest {
    pub product_type: String,
    #[validate(length(min = 1, message = "spec_no cannot be empty"))]
    pub spec_no: String,
    /// Specific unit to substitute; omitted for a FIFO pick
    pub serial_no: Option<String>,
    #[validate(range(min = 1, message = "qty must be positive"))]
    pub qty: i32,
}

impl CaseItemRequest {
    pub(crate) fn into_input(self) -> Result<CaseItemInput, ServiceError> {
        let product_type = parse_product_type(&self.product_type)?;
        Ok(CaseItemInput {
            product_type,
            spec_no: self.spec_no,
            serial_no: self.serial_no,
            qty: self.qty,
        })
    }
}

fn into_item_inputs(items: Vec<CaseItemRequest>) -> Result<Vec<CaseItemInput>, ServiceError> {
    items
        .into_iter()
        .map(CaseItemRequest::into_input)
        .collect()
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RelatedCaseRequest {
    #[validate(length(min = 1, message = "patient_id cannot be empty"))]
    pub patient_id: String,
    pub case_no: Option<String>,
    pub operator: Option<String>,
    /// May be empty when the case will be served from an existing trip pool
    #[serde(default)]
    pub items: Vec<CaseItemRequest>,
}

impl RelatedCaseRequest {
    pub(crate) fn into_input(self) -> Result<AdditionalCaseInput, ServiceError> {
        Ok(AdditionalCaseInput {
            patient_id: self.patient_id,
            case_no: self.case_no,
            operator: self.operator,
            items: into_item_inputs(self.items)?,
        })
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateCaseRequest {
    #[validate(length(min = 1, message = "site_id cannot be empty"))]
    pub site_id: String,
    #[validate(length(min = 1, message = "patient_id cannot be empty"))]
    pub patient_id: String,
    pub case_date: NaiveDate,
    pub case_no: Option<String>,
    pub operator: Option<String>,
    #[validate(length(min = 1, message = "items cannot be empty"))]
    pub items: Vec<CaseItemRequest>,
    /// Additional cases served by the same logistics run; non-empty
    /// triggers trip creation
    #[serde(default)]
    pub additional_cases: Vec<RelatedCaseRequest>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreatedCaseResponse {
    pub case_id: Uuid,
    pub trip_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Default, ToSchema)]
pub struct UpdateCaseInfoRequest {
    pub case_no: Option<String>,
    pub case_date: Option<NaiveDate>,
    pub operator: Option<String>,
}

#[derive(Debug, Deserialize, Default, ToSchema)]
pub struct UpdateCaseItemRequest {
    pub qty: Option<i32>,
    pub exp_date: Option<NaiveDate>,
    pub batch_no: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize, Default, ToSchema)]
pub struct CaseListQuery {
    /// Page number (1-indexed)
    pub page: Option<u64>,
    /// Page size (max 100)
    pub limit: Option<u64>,
    pub site_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CompletionItemRequest {
    pub txn_id: Uuid,
    pub returned: bool,
    pub accepted: Option<bool>,
    #[serde(default)]
    pub return_condition: Vec<i32>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CompleteCaseRequest {
    pub items: Vec<CompletionItemRequest>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CompletionResponse {
    pub case_id: Uuid,
    pub status: String,
    pub trip_completed: Option<Uuid>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PackingListResponse {
    pub case: CaseView,
    pub site_name: String,
    pub items: Vec<PackingListItemView>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PackingListItemView {
    pub txn_id: Uuid,
    pub spec_no: String,
    pub product_type: String,
    pub serial_no: Option<String>,
    pub batch_no: Option<String>,
    pub exp_date: Option<NaiveDate>,
    pub qty: i32,
    pub disposition: String,
    pub assigned: bool,
    pub notes: Option<String>,
}

impl From<PackingListItem> for PackingListItemView {
    fn from(item: PackingListItem) -> Self {
        Self {
            txn_id: item.txn_id,
            spec_no: item.spec_no,
            product_type: item.product_type,
            serial_no: item.serial_no,
            batch_no: item.batch_no,
            exp_date: item.exp_date,
            qty: item.qty,
            disposition: item.disposition,
            assigned: item.assigned,
            notes: item.notes,
        }
    }
}

impl From<PackingList> for PackingListResponse {
    fn from(list: PackingList) -> Self {
        Self {
            case: CaseView::from(list.case),
            site_name: list.site_name,
            items: list
                .items
                .into_iter()
                .map(PackingListItemView::from)
                .collect(),
        }
    }
}

pub async fn create_case(
    State(state): State<AppState>,
    Json(payload): Json<CreateCaseRequest>,
) -> ApiResult<CreatedCaseResponse> {
    payload.validate()?;
    for related in &payload.additional_cases {
        related.validate()?;
    }

    let input = CreateCaseInput {
        site_id: payload.site_id,
        patient_id: payload.patient_id,
        case_date: payload.case_date,
        case_no: payload.case_no,
        operator: payload.operator,
        items: into_item_inputs(payload.items)?,
        additional_cases: payload
            .additional_cases
            .into_iter()
            .map(RelatedCaseRequest::into_input)
            .collect::<Result<Vec<_>, _>>()?,
    };

    let created = state.services.cases.create_case(input).await?;
    Ok(Json(ApiResponse::success(CreatedCaseResponse {
        case_id: created.case_id,
        trip_id: created.trip_id,
    })))
}

pub async fn get_case(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<CaseView> {
    let case = state.services.cases.get_case(id).await?;
    Ok(Json(ApiResponse::success(CaseView::from(case))))
}

pub async fn list_cases(
    State(state): State<AppState>,
    Query(query): Query<CaseListQuery>,
) -> ApiResult<PaginatedResponse<CaseView>> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);

    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(CaseStatus::from_str(raw).ok_or_else(|| {
            ServiceError::ValidationError(format!("unknown case status: {}", raw))
        })?),
    };

    let (records, total) = state
        .services
        .cases
        .list_cases(query.site_id, status, page, limit)
        .await?;
    let items: Vec<CaseView> = records.into_iter().map(CaseView::from).collect();
    let total_pages = total.div_ceil(limit);

    Ok(Json(ApiResponse::success(PaginatedResponse {
        items,
        total,
        page,
        limit,
        total_pages,
    })))
}

pub async fn get_case_items(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<TransactionView>> {
    let rows = state.services.cases.case_items(id).await?;
    let items: Vec<TransactionView> = rows.into_iter().map(TransactionView::from).collect();
    Ok(Json(ApiResponse::success(items)))
}

pub async fn update_case_info(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateCaseInfoRequest>,
) -> ApiResult<CaseView> {
    let input = UpdateCaseInfoInput {
        case_no: payload.case_no,
        case_date: payload.case_date,
        operator: payload.operator,
    };
    let updated = state.services.cases.update_case_info(id, input).await?;
    Ok(Json(ApiResponse::success(CaseView::from(updated))))
}

pub async fn add_case_items(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<Vec<CaseItemRequest>>,
) -> ApiResult<Vec<TransactionView>> {
    for item in &payload {
        item.validate()?;
    }
    let created = state
        .services
        .cases
        .add_case_items_batch(id, into_item_inputs(payload)?)
        .await?;
    let items: Vec<TransactionView> = created.into_iter().map(TransactionView::from).collect();
    Ok(Json(ApiResponse::success(items)))
}

pub async fn update_case_item(
    State(state): State<AppState>,
    Path((id, txn_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<UpdateCaseItemRequest>,
) -> ApiResult<TransactionView> {
    let input = UpdateCaseItemInput {
        qty: payload.qty,
        exp_date: payload.exp_date,
        batch_no: payload.batch_no,
        notes: payload.notes,
    };
    let updated = state
        .services
        .cases
        .update_case_item(id, txn_id, input)
        .await?;
    Ok(Json(ApiResponse::success(TransactionView::from(updated))))
}

pub async fn delete_case_item(
    State(state): State<AppState>,
    Path((id, txn_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<serde_json::Value> {
    state.services.cases.delete_case_item(id, txn_id).await?;
    Ok(Json(ApiResponse::success(json!({
        "case_id": id,
        "transaction_id": txn_id,
        "status": "deleted"
    }))))
}

pub async fn add_related_case(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RelatedCaseRequest>,
) -> ApiResult<CreatedCaseResponse> {
    payload.validate()?;
    let created = state
        .services
        .cases
        .add_related_case(id, payload.into_input()?)
        .await?;
    Ok(Json(ApiResponse::success(CreatedCaseResponse {
        case_id: created.case_id,
        trip_id: created.trip_id,
    })))
}

pub async fn delete_case(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    state.services.cases.delete_case(id).await?;
    Ok(Json(ApiResponse::success(json!({
        "case_id": id,
        "status": "deleted"
    }))))
}

pub async fn delete_all_related_cases(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    state.services.cases.delete_all_related_cases(id).await?;
    Ok(Json(ApiResponse::success(json!({
        "case_id": id,
        "status": "group_deleted"
    }))))
}

pub async fn complete_case(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CompleteCaseRequest>,
) -> ApiResult<CompletionResponse> {
    let items: Vec<CompletionItem> = payload
        .items
        .into_iter()
        .map(|item| CompletionItem {
            txn_id: item.txn_id,
            returned: item.returned,
            accepted: item.accepted,
            return_condition: item.return_condition,
        })
        .collect();

    let outcome = state.services.completion.complete_case(id, items).await?;
    Ok(Json(ApiResponse::success(CompletionResponse {
        case_id: outcome.case_id,
        status: outcome.status.as_str().to_string(),
        trip_completed: outcome.trip_completed,
    })))
}

pub async fn reverse_completion(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<CompletionResponse> {
    let outcome = state.services.completion.reverse_completion(id).await?;
    Ok(Json(ApiResponse::success(CompletionResponse {
        case_id: outcome.case_id,
        status: outcome.status.as_str().to_string(),
        trip_completed: outcome.trip_completed,
    })))
}

pub async fn get_packing_list(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<PackingListResponse> {
    let list = state.services.cases.packing_list(id).await?;
    Ok(Json(ApiResponse::success(PackingListResponse::from(list))))
}

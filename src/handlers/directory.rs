use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::Deserialize;
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    entities::{product_spec, site},
    errors::ServiceError,
    handlers::inventory::parse_product_type,
    ApiResponse, ApiResult, AppState,
};
use sea_orm::{ActiveModelTrait, EntityTrait, QueryOrder, Set};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateSiteRequest {
    #[validate(length(min = 1, message = "id cannot be empty"))]
    pub id: String,
    #[validate(length(min = 1, message = "name cannot be empty"))]
    pub name: String,
    pub city: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateProductSpecRequest {
    #[validate(length(min = 1, message = "spec_no cannot be empty"))]
    pub spec_no: String,
    pub product_type: String,
    pub description: Option<String>,
    /// Compatible counterpart spec (valve for a delivery system and vice
    /// versa)
    pub fits_spec_no: Option<String>,
}

pub async fn list_sites(State(state): State<AppState>) -> ApiResult<Vec<site::Model>> {
    let sites = site::Entity::find()
        .order_by_asc(site::Column::Id)
        .all(&*state.db)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(Json(ApiResponse::success(sites)))
}

pub async fn get_site(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<site::Model> {
    let found = site::Entity::find_by_id(&id)
        .one(&*state.db)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Site {} not found", id)))?;
    Ok(Json(ApiResponse::success(found)))
}

pub async fn create_site(
    State(state): State<AppState>,
    Json(payload): Json<CreateSiteRequest>,
) -> ApiResult<site::Model> {
    payload.validate()?;

    if site::Entity::find_by_id(&payload.id)
        .one(&*state.db)
        .await
        .map_err(ServiceError::db_error)?
        .is_some()
    {
        return Err(ServiceError::Conflict(format!(
            "site {} already exists",
            payload.id
        )));
    }

    let model = site::ActiveModel {
        id: Set(payload.id),
        name: Set(payload.name),
        city: Set(payload.city),
        ..Default::default()
    };
    let created = model
        .insert(&*state.db)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(Json(ApiResponse::success(created)))
}

pub async fn list_product_specs(
    State(state): State<AppState>,
) -> ApiResult<Vec<product_spec::Model>> {
    let specs = product_spec::Entity::find()
        .order_by_asc(product_spec::Column::SpecNo)
        .all(&*state.db)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(Json(ApiResponse::success(specs)))
}

pub async fn get_product_spec(
    State(state): State<AppState>,
    Path(spec_no): Path<String>,
) -> ApiResult<product_spec::Model> {
    let found = product_spec::Entity::find_by_id(&spec_no)
        .one(&*state.db)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Product spec {} not found", spec_no)))?;
    Ok(Json(ApiResponse::success(found)))
}

pub async fn create_product_spec(
    State(state): State<AppState>,
    Json(payload): Json<CreateProductSpecRequest>,
) -> ApiResult<product_spec::Model> {
    payload.validate()?;
    let product_type = parse_product_type(&payload.product_type)?;

    if product_spec::Entity::find_by_id(&payload.spec_no)
        .one(&*state.db)
        .await
        .map_err(ServiceError::db_error)?
        .is_some()
    {
        return Err(ServiceError::Conflict(format!(
            "product spec {} already exists",
            payload.spec_no
        )));
    }

    let model = product_spec::ActiveModel {
        spec_no: Set(payload.spec_no),
        product_type: Set(product_type.as_str().to_string()),
        description: Set(payload.description),
        fits_spec_no: Set(payload.fits_spec_no),
        ..Default::default()
    };
    let created = model
        .insert(&*state.db)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(Json(ApiResponse::success(created)))
}

//! Inventory allocation and case/trip reconciliation service for implant
//! valves and delivery systems.
//!
//! All stock state is derived from an append-only transaction ledger;
//! balances are folds over it, never stored counters.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod services;

use std::sync::Arc;

use axum::{
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub services: handlers::AppServices,
}

// Common query parameters for list endpoints
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_page() -> u64 {
    1
}
fn default_limit() -> u64 {
    20
}

// Common response wrappers
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub total_pages: u64,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
        }
    }
}

/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

pub fn api_v1_routes() -> Router<AppState> {
    let inventory = Router::new()
        .route("/inventory/receipts", post(handlers::inventory::receive_stock))
        .route("/inventory/shipments", post(handlers::inventory::ship_stock))
        .route("/inventory/demo-moves", post(handlers::inventory::move_to_demo))
        .route(
            "/inventory/transactions",
            get(handlers::inventory::list_transactions),
        )
        .route(
            "/inventory/transactions/:id",
            delete(handlers::inventory::delete_transaction),
        )
        .route(
            "/inventory/candidates",
            get(handlers::inventory::get_candidates),
        )
        .route("/inventory/picks", get(handlers::inventory::pick_products))
        .route(
            "/inventory/availability",
            get(handlers::inventory::available_products),
        );

    let cases = Router::new()
        .route(
            "/cases",
            get(handlers::cases::list_cases).post(handlers::cases::create_case),
        )
        .route(
            "/cases/:id",
            get(handlers::cases::get_case)
                .put(handlers::cases::update_case_info)
                .delete(handlers::cases::delete_case),
        )
        .route(
            "/cases/:id/items",
            get(handlers::cases::get_case_items).post(handlers::cases::add_case_items),
        )
        .route(
            "/cases/:id/items/:txn_id",
            put(handlers::cases::update_case_item).delete(handlers::cases::delete_case_item),
        )
        .route(
            "/cases/:id/related",
            post(handlers::cases::add_related_case),
        )
        .route(
            "/cases/:id/related/all",
            delete(handlers::cases::delete_all_related_cases),
        )
        .route("/cases/:id/complete", post(handlers::cases::complete_case))
        .route(
            "/cases/:id/reverse-completion",
            post(handlers::cases::reverse_completion),
        )
        .route(
            "/cases/:id/packing-list",
            get(handlers::cases::get_packing_list),
        );

    let trips = Router::new()
        .route(
            "/trips",
            get(handlers::trips::list_trips).post(handlers::trips::create_trip),
        )
        .route(
            "/trips/:id",
            get(handlers::trips::get_trip).delete(handlers::trips::delete_trip),
        )
        .route(
            "/trips/:id/pool",
            get(handlers::trips::get_pool_items).post(handlers::trips::add_pool_items),
        )
        .route(
            "/trips/:id/assign",
            post(handlers::trips::assign_items_to_case),
        )
        .route("/trips/:id/return", post(handlers::trips::return_items))
        .route("/trips/:id/cases", 
            get(handlers::trips::get_trip_cases).post(handlers::trips::add_case_to_trip),
        )
        .route(
            "/trips/:id/cases/:case_id",
            delete(handlers::trips::remove_case_from_trip),
        )
        .route("/trips/:id/complete", post(handlers::trips::complete_trip));

    let directory = Router::new()
        .route(
            "/sites",
            get(handlers::directory::list_sites).post(handlers::directory::create_site),
        )
        .route("/sites/:id", get(handlers::directory::get_site))
        .route(
            "/product-specs",
            get(handlers::directory::list_product_specs)
                .post(handlers::directory::create_product_spec),
        )
        .route(
            "/product-specs/:spec_no",
            get(handlers::directory::get_product_spec),
        );

    Router::new()
        .merge(inventory)
        .merge(cases)
        .merge(trips)
        .merge(directory)
        .route("/health", get(handlers::health::health_check))
}

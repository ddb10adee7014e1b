mod common;

use axum::http::{Method, StatusCode};
use serde_json::json;
use uuid::Uuid;

use caseflow_api::entities::inventory_transaction::ProductType;
use common::{data, TestApp};

async fn seed(app: &TestApp) {
    app.seed_site("SITE-01").await;
    app.seed_spec("V-23", ProductType::Valve).await;
    app.seed_stock("V-23", ProductType::Valve, "SN-A", "2025-06-01", 1).await;
    app.seed_stock("V-23", ProductType::Valve, "SN-B", "2025-09-01", 1).await;
}

async fn create_bare_trip(app: &TestApp, qty: i32) -> Uuid {
    let body = app
        .request_json(
            Method::POST,
            "/api/v1/trips",
            Some(json!({
                "site_id": "SITE-01",
                "trip_date": "2025-02-10",
                "items": [{"product_type": "VALVE", "spec_no": "V-23", "qty": qty}]
            })),
            StatusCode::OK,
        )
        .await;
    data(&body)["id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn a_trip_can_be_stocked_before_any_case_exists() {
    let app = TestApp::new().await;
    seed(&app).await;

    let trip_id = create_bare_trip(&app, 1).await;

    // Trip checkouts subtract from sellable stock.
    let body = app
        .request_json(
            Method::GET,
            "/api/v1/inventory/candidates?spec_no=V-23&product_type=VALVE&reference_date=2025-01-01",
            None,
            StatusCode::OK,
        )
        .await;
    let candidates = data(&body).as_array().unwrap().clone();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0]["serial_no"], json!("SN-B"));

    let body = app
        .request_json(
            Method::POST,
            &format!("/api/v1/trips/{trip_id}/pool"),
            Some(json!([{"product_type": "VALVE", "spec_no": "V-23", "qty": 1}])),
            StatusCode::OK,
        )
        .await;
    let added = data(&body).as_array().unwrap().clone();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0]["action"], json!("OUT_TRIP"));
    assert_eq!(added[0]["serial_no"], json!("SN-B"));
}

#[tokio::test]
async fn attaching_a_case_claims_pool_stock_without_new_allocation() {
    let app = TestApp::new().await;
    seed(&app).await;

    let trip_id = create_bare_trip(&app, 2).await;

    let body = app
        .request_json(
            Method::POST,
            &format!("/api/v1/trips/{trip_id}/cases"),
            Some(json!({"patient_id": "PAT-1"})),
            StatusCode::OK,
        )
        .await;
    let case_id: Uuid = data(&body)["id"].as_str().unwrap().parse().unwrap();
    assert_eq!(data(&body)["trip_id"], json!(trip_id.to_string()));

    let pool = app
        .request_json(
            Method::GET,
            &format!("/api/v1/trips/{trip_id}/pool"),
            None,
            StatusCode::OK,
        )
        .await;
    let rows = data(&pool).as_array().unwrap().clone();
    assert_eq!(rows.len(), 2);

    let txn_id = rows[0]["id"].as_str().unwrap();
    app.request_json(
        Method::POST,
        &format!("/api/v1/trips/{trip_id}/assign"),
        Some(json!({"case_id": case_id, "txn_ids": [txn_id]})),
        StatusCode::OK,
    )
    .await;

    // No stock was touched: still one unit shelved, one pooled, one assigned.
    let body = app
        .request_json(
            Method::GET,
            "/api/v1/inventory/candidates?spec_no=V-23&product_type=VALVE&reference_date=2025-01-01",
            None,
            StatusCode::OK,
        )
        .await;
    assert!(data(&body).as_array().unwrap().is_empty());
}

#[tokio::test]
async fn completing_a_trip_with_open_cases_is_rejected() {
    let app = TestApp::new().await;
    seed(&app).await;

    let trip_id = create_bare_trip(&app, 1).await;
    app.request_json(
        Method::POST,
        &format!("/api/v1/trips/{trip_id}/cases"),
        Some(json!({"patient_id": "PAT-1"})),
        StatusCode::OK,
    )
    .await;

    app.request_json(
        Method::POST,
        &format!("/api/v1/trips/{trip_id}/complete"),
        None,
        StatusCode::BAD_REQUEST,
    )
    .await;
}

#[tokio::test]
async fn completing_a_trip_with_leftover_pool_stock_is_rejected() {
    let app = TestApp::new().await;
    seed(&app).await;

    let trip_id = create_bare_trip(&app, 1).await;
    app.request_json(
        Method::POST,
        &format!("/api/v1/trips/{trip_id}/complete"),
        None,
        StatusCode::BAD_REQUEST,
    )
    .await;

    // Returning the unit clears the way.
    let pool = app
        .request_json(
            Method::GET,
            &format!("/api/v1/trips/{trip_id}/pool"),
            None,
            StatusCode::OK,
        )
        .await;
    let txn_id = data(&pool).as_array().unwrap()[0]["id"].as_str().unwrap().to_string();
    app.request_json(
        Method::POST,
        &format!("/api/v1/trips/{trip_id}/return"),
        Some(json!({"txn_ids": [txn_id]})),
        StatusCode::OK,
    )
    .await;
    app.request_json(
        Method::POST,
        &format!("/api/v1/trips/{trip_id}/complete"),
        None,
        StatusCode::OK,
    )
    .await;

    // Completed trips refuse further mutation.
    app.request_json(
        Method::POST,
        &format!("/api/v1/trips/{trip_id}/complete"),
        None,
        StatusCode::CONFLICT,
    )
    .await;
    app.request_json(
        Method::POST,
        &format!("/api/v1/trips/{trip_id}/pool"),
        Some(json!([{"product_type": "VALVE", "spec_no": "V-23", "qty": 1}])),
        StatusCode::BAD_REQUEST,
    )
    .await;
}

#[tokio::test]
async fn trips_with_attached_cases_cannot_be_deleted() {
    let app = TestApp::new().await;
    seed(&app).await;

    let trip_id = create_bare_trip(&app, 1).await;
    app.request_json(
        Method::POST,
        &format!("/api/v1/trips/{trip_id}/cases"),
        Some(json!({"patient_id": "PAT-1"})),
        StatusCode::OK,
    )
    .await;

    app.request_json(
        Method::DELETE,
        &format!("/api/v1/trips/{trip_id}"),
        None,
        StatusCode::BAD_REQUEST,
    )
    .await;
}

#[tokio::test]
async fn deleting_an_empty_trip_restores_pool_stock() {
    let app = TestApp::new().await;
    seed(&app).await;

    let trip_id = create_bare_trip(&app, 2).await;
    app.request_json(
        Method::DELETE,
        &format!("/api/v1/trips/{trip_id}"),
        None,
        StatusCode::OK,
    )
    .await;

    app.request_json(
        Method::GET,
        &format!("/api/v1/trips/{trip_id}"),
        None,
        StatusCode::NOT_FOUND,
    )
    .await;

    let body = app
        .request_json(
            Method::GET,
            "/api/v1/inventory/candidates?spec_no=V-23&product_type=VALVE&reference_date=2025-01-01",
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(data(&body).as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn detaching_a_case_makes_it_standalone_again() {
    let app = TestApp::new().await;
    seed(&app).await;

    let trip_id = create_bare_trip(&app, 1).await;
    let body = app
        .request_json(
            Method::POST,
            &format!("/api/v1/trips/{trip_id}/cases"),
            Some(json!({"patient_id": "PAT-1"})),
            StatusCode::OK,
        )
        .await;
    let case_id: Uuid = data(&body)["id"].as_str().unwrap().parse().unwrap();

    app.request_json(
        Method::DELETE,
        &format!("/api/v1/trips/{trip_id}/cases/{case_id}"),
        None,
        StatusCode::OK,
    )
    .await;

    let body = app
        .request_json(
            Method::GET,
            &format!("/api/v1/cases/{case_id}"),
            None,
            StatusCode::OK,
        )
        .await;
    assert!(data(&body)["trip_id"].is_null());

    // The caseless trip stays around with its pooled stock.
    let body = app
        .request_json(
            Method::GET,
            &format!("/api/v1/trips/{trip_id}"),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(data(&body)["status"], json!("OUT"));
}

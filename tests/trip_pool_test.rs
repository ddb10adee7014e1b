mod common;

use axum::http::{Method, StatusCode};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde_json::{json, Value};
use uuid::Uuid;

use caseflow_api::entities::inventory_transaction::{self, ProductType};
use common::{data, TestApp};

async fn seed_valves(app: &TestApp, spec_no: &str, serials: &[(&str, &str)]) {
    app.seed_spec(spec_no, ProductType::Valve).await;
    for (serial, exp) in serials {
        app.seed_stock(spec_no, ProductType::Valve, serial, exp, 1).await;
    }
}

/// Creates a two-sibling trip. The first sibling requests `first_qty` units
/// and the second `second_qty`; everything lands in the shared pool.
async fn create_trip_pair(
    app: &TestApp,
    spec_no: &str,
    first_qty: i32,
    second_qty: i32,
) -> (Uuid, Uuid, Uuid) {
    let body = app
        .request_json(
            Method::POST,
            "/api/v1/cases",
            Some(json!({
                "site_id": "SITE-01",
                "patient_id": "PAT-1",
                "case_date": "2025-02-10",
                "items": [{"product_type": "VALVE", "spec_no": spec_no, "qty": first_qty}],
                "additional_cases": [{
                    "patient_id": "PAT-2",
                    "items": [{"product_type": "VALVE", "spec_no": spec_no, "qty": second_qty}]
                }]
            })),
            StatusCode::OK,
        )
        .await;
    let first: Uuid = data(&body)["case_id"]
        .as_str()
        .expect("case_id")
        .parse()
        .expect("uuid");
    let trip_id: Uuid = data(&body)["trip_id"]
        .as_str()
        .expect("trip_id")
        .parse()
        .expect("uuid");

    let body = app
        .request_json(
            Method::GET,
            &format!("/api/v1/trips/{trip_id}/cases"),
            None,
            StatusCode::OK,
        )
        .await;
    let second: Uuid = data(&body)
        .as_array()
        .expect("cases array")
        .iter()
        .find(|c| c["patient_id"] == json!("PAT-2"))
        .expect("second sibling")["id"]
        .as_str()
        .expect("id")
        .parse()
        .expect("uuid");

    (first, second, trip_id)
}

async fn pool_rows(app: &TestApp, trip_id: Uuid) -> Vec<Value> {
    let body = app
        .request_json(
            Method::GET,
            &format!("/api/v1/trips/{trip_id}/pool"),
            None,
            StatusCode::OK,
        )
        .await;
    data(&body).as_array().expect("pool array").clone()
}

fn row_id(row: &Value) -> Uuid {
    row["id"].as_str().expect("row id").parse().expect("uuid")
}

fn pool_row_by_serial(rows: &[Value], serial: &str) -> Uuid {
    row_id(
        rows.iter()
            .find(|r| r["serial_no"] == json!(serial))
            .expect("pool row for serial"),
    )
}

async fn trip_returns(app: &TestApp, trip_id: Uuid) -> Vec<inventory_transaction::Model> {
    inventory_transaction::Entity::find()
        .filter(inventory_transaction::Column::TripId.eq(trip_id))
        .filter(inventory_transaction::Column::Action.eq("REC_CASE"))
        .all(&*app.state.db)
        .await
        .expect("ledger query")
}

async fn trip_status(app: &TestApp, trip_id: Uuid) -> String {
    let body = app
        .request_json(
            Method::GET,
            &format!("/api/v1/trips/{trip_id}"),
            None,
            StatusCode::OK,
        )
        .await;
    data(&body)["status"].as_str().expect("status").to_string()
}

#[tokio::test]
async fn multi_case_creation_pools_every_unit() {
    let app = TestApp::new().await;
    app.seed_site("SITE-01").await;
    seed_valves(
        &app,
        "V-23",
        &[("SN-X", "2025-04-01"), ("SN-Y", "2025-06-01"), ("SN-Z", "2025-09-01")],
    )
    .await;

    let (first, _, trip_id) = create_trip_pair(&app, "V-23", 2, 1).await;

    let pool = pool_rows(&app, trip_id).await;
    assert_eq!(pool.len(), 3);
    assert!(pool.iter().all(|r| r["case_id"].is_null()));
    assert!(pool.iter().all(|r| r["action"] == json!("OUT_CASE")));

    // Nothing is attributed to the first sibling yet.
    let body = app
        .request_json(
            Method::GET,
            &format!("/api/v1/cases/{first}/items"),
            None,
            StatusCode::OK,
        )
        .await;
    assert!(data(&body).as_array().expect("array").is_empty());
}

#[tokio::test]
async fn pool_rows_cannot_be_assigned_twice() {
    let app = TestApp::new().await;
    app.seed_site("SITE-01").await;
    seed_valves(&app, "V-23", &[("SN-X", "2025-04-01"), ("SN-Y", "2025-06-01")]).await;

    let (first, second, trip_id) = create_trip_pair(&app, "V-23", 1, 1).await;
    let pool = pool_rows(&app, trip_id).await;
    let target = pool_row_by_serial(&pool, "SN-X");

    app.request_json(
        Method::POST,
        &format!("/api/v1/trips/{trip_id}/assign"),
        Some(json!({"case_id": first, "txn_ids": [target]})),
        StatusCode::OK,
    )
    .await;

    app.request_json(
        Method::POST,
        &format!("/api/v1/trips/{trip_id}/assign"),
        Some(json!({"case_id": second, "txn_ids": [target]})),
        StatusCode::CONFLICT,
    )
    .await;

    // The assigned row now belongs to the first sibling.
    let body = app
        .request_json(
            Method::GET,
            &format!("/api/v1/cases/{first}/items"),
            None,
            StatusCode::OK,
        )
        .await;
    let items = data(&body).as_array().expect("array").clone();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["serial_no"], json!("SN-X"));
}

#[tokio::test]
async fn mid_trip_return_restores_stock() {
    let app = TestApp::new().await;
    app.seed_site("SITE-01").await;
    seed_valves(&app, "V-23", &[("SN-X", "2025-04-01"), ("SN-Y", "2025-06-01")]).await;

    let (_, _, trip_id) = create_trip_pair(&app, "V-23", 1, 1).await;
    let pool = pool_rows(&app, trip_id).await;
    let target = pool_row_by_serial(&pool, "SN-Y");

    app.request_json(
        Method::POST,
        &format!("/api/v1/trips/{trip_id}/return"),
        Some(json!({"txn_ids": [target]})),
        StatusCode::OK,
    )
    .await;

    // The unit left the pool and is pickable again.
    let pool = pool_rows(&app, trip_id).await;
    assert_eq!(pool.len(), 1);
    assert_eq!(pool[0]["serial_no"], json!("SN-X"));

    let body = app
        .request_json(
            Method::GET,
            "/api/v1/inventory/candidates?spec_no=V-23&product_type=VALVE&reference_date=2025-01-01",
            None,
            StatusCode::OK,
        )
        .await;
    let candidates = data(&body).as_array().expect("array").clone();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0]["serial_no"], json!("SN-Y"));

    // The mid-trip return is recorded distinctly from end-of-trip returns.
    let returns = trip_returns(&app, trip_id).await;
    assert_eq!(returns.len(), 1);
    assert_eq!(returns[0].notes.as_deref(), Some("$sys:pool-return"));
}

#[tokio::test]
async fn pool_returns_materialize_only_after_all_siblings_complete() {
    let app = TestApp::new().await;
    app.seed_site("SITE-01").await;
    seed_valves(
        &app,
        "V-23",
        &[("SN-X", "2025-04-01"), ("SN-Y", "2025-06-01"), ("SN-Z", "2025-09-01")],
    )
    .await;

    let (first, second, trip_id) = create_trip_pair(&app, "V-23", 2, 1).await;
    let pool = pool_rows(&app, trip_id).await;
    let x = pool_row_by_serial(&pool, "SN-X");
    let y = pool_row_by_serial(&pool, "SN-Y");
    let z = pool_row_by_serial(&pool, "SN-Z");

    app.request_json(
        Method::POST,
        &format!("/api/v1/cases/{first}/complete"),
        Some(json!({"items": [
            {"txn_id": x, "returned": false},
            {"txn_id": y, "returned": true, "accepted": true},
        ]})),
        StatusCode::OK,
    )
    .await;

    // The returned unit stays in the pool; no receipt row yet.
    assert!(trip_returns(&app, trip_id).await.is_empty());
    assert_eq!(trip_status(&app, trip_id).await, "OUT");

    app.request_json(
        Method::POST,
        &format!("/api/v1/cases/{second}/complete"),
        Some(json!({"items": [{"txn_id": z, "returned": false}]})),
        StatusCode::OK,
    )
    .await;

    // Auto-return fired exactly once, for the single unconsumed unit.
    let returns = trip_returns(&app, trip_id).await;
    assert_eq!(returns.len(), 1);
    assert_eq!(returns[0].serial_no.as_deref(), Some("SN-Y"));
    assert_eq!(returns[0].notes.as_deref(), Some("$sys:trip-return"));
    assert_eq!(returns[0].inspection.as_deref(), Some("ACCEPT"));
    assert_eq!(trip_status(&app, trip_id).await, "COMPLETED");

    // And the returned unit is back in sellable stock.
    let body = app
        .request_json(
            Method::GET,
            "/api/v1/inventory/candidates?spec_no=V-23&product_type=VALVE&reference_date=2025-01-01",
            None,
            StatusCode::OK,
        )
        .await;
    let candidates = data(&body).as_array().expect("array").clone();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0]["serial_no"], json!("SN-Y"));
}

#[tokio::test]
async fn reversing_one_sibling_undoes_the_trip_wide_return_only() {
    let app = TestApp::new().await;
    app.seed_site("SITE-01").await;
    seed_valves(
        &app,
        "V-23",
        &[("SN-X", "2025-04-01"), ("SN-Y", "2025-06-01"), ("SN-Z", "2025-09-01")],
    )
    .await;

    let (first, second, trip_id) = create_trip_pair(&app, "V-23", 2, 1).await;
    let pool = pool_rows(&app, trip_id).await;
    let x = pool_row_by_serial(&pool, "SN-X");
    let y = pool_row_by_serial(&pool, "SN-Y");
    let z = pool_row_by_serial(&pool, "SN-Z");

    app.request_json(
        Method::POST,
        &format!("/api/v1/cases/{first}/complete"),
        Some(json!({"items": [
            {"txn_id": x, "returned": false},
            {"txn_id": y, "returned": true, "accepted": true},
        ]})),
        StatusCode::OK,
    )
    .await;
    app.request_json(
        Method::POST,
        &format!("/api/v1/cases/{second}/complete"),
        Some(json!({"items": [{"txn_id": z, "returned": false}]})),
        StatusCode::OK,
    )
    .await;

    app.request_json(
        Method::POST,
        &format!("/api/v1/cases/{second}/reverse-completion"),
        None,
        StatusCode::OK,
    )
    .await;

    // Trip-wide auto-returns are gone and the trip is open again.
    assert!(trip_returns(&app, trip_id).await.is_empty());
    assert_eq!(trip_status(&app, trip_id).await, "OUT");

    // The reversed sibling's usage is gone; the other sibling's remains.
    let used = inventory_transaction::Entity::find()
        .filter(inventory_transaction::Column::TripId.eq(trip_id))
        .filter(inventory_transaction::Column::Action.eq("USED_CASE"))
        .all(&*app.state.db)
        .await
        .expect("ledger query");
    assert_eq!(used.len(), 1);
    assert_eq!(used[0].case_id, Some(first));
    assert_eq!(used[0].serial_no.as_deref(), Some("SN-X"));

    let body = app
        .request_json(
            Method::GET,
            &format!("/api/v1/cases/{first}"),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(data(&body)["status"], json!("COMPLETED"));
}

#[tokio::test]
async fn deleting_a_sibling_compacts_the_trip_away() {
    let app = TestApp::new().await;
    app.seed_site("SITE-01").await;
    seed_valves(&app, "V-23", &[("SN-X", "2025-04-01"), ("SN-Y", "2025-06-01")]).await;

    let (first, second, trip_id) = create_trip_pair(&app, "V-23", 1, 1).await;

    app.request_json(
        Method::DELETE,
        &format!("/api/v1/cases/{second}"),
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
            &format!("/api/v1/cases/{first}"),
            None,
            StatusCode::OK,
        )
        .await;
    assert!(data(&body)["trip_id"].is_null());

    // All surviving rows are plain case-tagged checkouts.
    let rows = inventory_transaction::Entity::find()
        .filter(inventory_transaction::Column::CaseId.eq(first))
        .filter(inventory_transaction::Column::DeletedAt.is_null())
        .all(&*app.state.db)
        .await
        .expect("ledger query");
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.trip_id.is_none() && r.action == "OUT_CASE"));
}

#[tokio::test]
async fn group_delete_removes_cases_pool_and_trip() {
    let app = TestApp::new().await;
    app.seed_site("SITE-01").await;
    seed_valves(&app, "V-23", &[("SN-X", "2025-04-01"), ("SN-Y", "2025-06-01")]).await;

    let (first, second, trip_id) = create_trip_pair(&app, "V-23", 1, 1).await;

    app.request_json(
        Method::DELETE,
        &format!("/api/v1/cases/{first}/related/all"),
        None,
        StatusCode::OK,
    )
    .await;

    for case in [first, second] {
        app.request_json(
            Method::GET,
            &format!("/api/v1/cases/{case}"),
            None,
            StatusCode::NOT_FOUND,
        )
        .await;
    }
    app.request_json(
        Method::GET,
        &format!("/api/v1/trips/{trip_id}"),
        None,
        StatusCode::NOT_FOUND,
    )
    .await;

    // The pooled stock is back on the shelf.
    let body = app
        .request_json(
            Method::GET,
            "/api/v1/inventory/candidates?spec_no=V-23&product_type=VALVE&reference_date=2025-01-01",
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(data(&body).as_array().expect("array").len(), 2);
}

#[tokio::test]
async fn lot_style_serials_match_by_count() {
    let app = TestApp::new().await;
    app.seed_site("SITE-01").await;
    app.seed_spec("DS-7", ProductType::DeliverySystem).await;
    app.seed_stock("DS-7", ProductType::DeliverySystem, "L-1", "2025-12-01", 2)
        .await;

    let body = app
        .request_json(
            Method::POST,
            "/api/v1/cases",
            Some(json!({
                "site_id": "SITE-01",
                "patient_id": "PAT-1",
                "case_date": "2025-02-10",
                "items": [{"product_type": "DELIVERY_SYSTEM", "spec_no": "DS-7", "qty": 1}],
                "additional_cases": [{
                    "patient_id": "PAT-2",
                    "items": [{"product_type": "DELIVERY_SYSTEM", "spec_no": "DS-7", "qty": 1}]
                }]
            })),
            StatusCode::OK,
        )
        .await;
    let first: Uuid = data(&body)["case_id"].as_str().unwrap().parse().unwrap();
    let trip_id: Uuid = data(&body)["trip_id"].as_str().unwrap().parse().unwrap();

    let cases = app
        .request_json(
            Method::GET,
            &format!("/api/v1/trips/{trip_id}/cases"),
            None,
            StatusCode::OK,
        )
        .await;
    let second: Uuid = data(&cases)
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["patient_id"] == json!("PAT-2"))
        .unwrap()["id"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();

    // Two checkout rows share the (spec, serial) key; the pool lists them
    // earliest first, the same order consumption is matched in.
    let pool = pool_rows(&app, trip_id).await;
    assert_eq!(pool.len(), 2);
    let earliest = row_id(&pool[0]);
    let remaining = row_id(&pool[1]);

    app.request_json(
        Method::POST,
        &format!("/api/v1/cases/{first}/complete"),
        Some(json!({"items": [{"txn_id": earliest, "returned": false}]})),
        StatusCode::OK,
    )
    .await;

    // The consumed count now covers the earliest row: it is no longer
    // chargeable, while the second row still is.
    app.request_json(
        Method::POST,
        &format!("/api/v1/cases/{second}/complete"),
        Some(json!({"items": [{"txn_id": earliest, "returned": false}]})),
        StatusCode::CONFLICT,
    )
    .await;
    app.request_json(
        Method::POST,
        &format!("/api/v1/cases/{second}/complete"),
        Some(json!({"items": [{"txn_id": remaining, "returned": false}]})),
        StatusCode::OK,
    )
    .await;
}

#[tokio::test]
async fn return_receipts_never_rejoin_the_pool() {
    let app = TestApp::new().await;
    app.seed_site("SITE-01").await;
    seed_valves(&app, "V-23", &[("SN-X", "2025-04-01"), ("SN-Y", "2025-06-01")]).await;

    let (first, _, trip_id) = create_trip_pair(&app, "V-23", 1, 1).await;
    let pool = pool_rows(&app, trip_id).await;
    let target = pool_row_by_serial(&pool, "SN-Y");

    app.request_json(
        Method::POST,
        &format!("/api/v1/trips/{trip_id}/return"),
        Some(json!({"txn_ids": [target]})),
        StatusCode::OK,
    )
    .await;

    // The paired receipt carries the trip tag and no case_id, but it is not
    // checked-out stock and must stay out of the pool listing.
    let pool = pool_rows(&app, trip_id).await;
    assert_eq!(pool.len(), 1);
    assert_eq!(pool[0]["serial_no"], json!("SN-X"));

    let receipt_id = trip_returns(&app, trip_id).await[0].id;
    app.request_json(
        Method::POST,
        &format!("/api/v1/trips/{trip_id}/assign"),
        Some(json!({"case_id": first, "txn_ids": [receipt_id]})),
        StatusCode::BAD_REQUEST,
    )
    .await;
    app.request_json(
        Method::POST,
        &format!("/api/v1/trips/{trip_id}/return"),
        Some(json!({"txn_ids": [receipt_id]})),
        StatusCode::BAD_REQUEST,
    )
    .await;

    // The receipt row itself is untouched by either rejection.
    let returns = trip_returns(&app, trip_id).await;
    assert_eq!(returns.len(), 1);
    assert_eq!(returns[0].case_id, None);
    assert_eq!(returns[0].notes.as_deref(), Some("$sys:pool-return"));
}

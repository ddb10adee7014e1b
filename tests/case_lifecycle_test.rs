mod common;

use axum::http::{Method, StatusCode};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde_json::{json, Value};
use uuid::Uuid;

use caseflow_api::entities::inventory_transaction::{self, ProductType, TxnAction};
use common::{data, TestApp};

async fn seed_valves(app: &TestApp, spec_no: &str, serials: &[(&str, &str)]) {
    app.seed_spec(spec_no, ProductType::Valve).await;
    for (serial, exp) in serials {
        app.seed_stock(spec_no, ProductType::Valve, serial, exp, 1).await;
    }
}

async fn create_case(app: &TestApp, site: &str, patient: &str, spec_no: &str, qty: i32) -> Uuid {
    let body = app
        .request_json(
            Method::POST,
            "/api/v1/cases",
            Some(json!({
                "site_id": site,
                "patient_id": patient,
                "case_date": "2025-02-10",
                "operator": "Dr. Adler",
                "items": [
                    {"product_type": "VALVE", "spec_no": spec_no, "qty": qty}
                ]
            })),
            StatusCode::OK,
        )
        .await;
    let id = data(&body)["case_id"].as_str().expect("case_id").to_string();
    id.parse().expect("case id is a uuid")
}

async fn case_item_ids(app: &TestApp, case_id: Uuid) -> Vec<Uuid> {
    let body = app
        .request_json(
            Method::GET,
            &format!("/api/v1/cases/{case_id}/items"),
            None,
            StatusCode::OK,
        )
        .await;
    data(&body)
        .as_array()
        .expect("items array")
        .iter()
        .map(|item| {
            item["id"]
                .as_str()
                .expect("item id")
                .parse()
                .expect("item id is a uuid")
        })
        .collect()
}

async fn ledger_rows(app: &TestApp, case_id: Uuid) -> Vec<inventory_transaction::Model> {
    inventory_transaction::Entity::find()
        .filter(inventory_transaction::Column::CaseId.eq(case_id))
        .all(&*app.state.db)
        .await
        .expect("ledger query")
}

fn used_decision(txn_id: Uuid) -> Value {
    json!({"txn_id": txn_id, "returned": false})
}

#[tokio::test]
async fn creating_a_case_allocates_oldest_expiry_first() {
    let app = TestApp::new().await;
    app.seed_site("SITE-01").await;
    seed_valves(&app, "V-23", &[("SN-B", "2025-09-01"), ("SN-A", "2025-04-01")]).await;

    let case_id = create_case(&app, "SITE-01", "PAT-1", "V-23", 1).await;

    let rows = ledger_rows(&app, case_id).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].action, "OUT_CASE");
    assert_eq!(rows[0].serial_no.as_deref(), Some("SN-A"));
    assert_eq!(rows[0].trip_id, None);
}

#[tokio::test]
async fn insufficient_stock_fails_the_whole_creation() {
    let app = TestApp::new().await;
    app.seed_site("SITE-01").await;
    seed_valves(&app, "V-23", &[("SN-A", "2025-04-01")]).await;

    app.request_json(
        Method::POST,
        "/api/v1/cases",
        Some(json!({
            "site_id": "SITE-01",
            "patient_id": "PAT-1",
            "case_date": "2025-02-10",
            "items": [{"product_type": "VALVE", "spec_no": "V-23", "qty": 2}]
        })),
        StatusCode::UNPROCESSABLE_ENTITY,
    )
    .await;

    // Nothing landed: no case and no checkout rows.
    let body = app
        .request_json(Method::GET, "/api/v1/cases", None, StatusCode::OK)
        .await;
    assert_eq!(data(&body)["total"], json!(0));
    let rows = inventory_transaction::Entity::find()
        .filter(inventory_transaction::Column::Action.eq(TxnAction::CheckoutCase.as_str()))
        .all(&*app.state.db)
        .await
        .expect("ledger query");
    assert!(rows.is_empty());
}

#[tokio::test]
async fn same_site_and_patient_conflicts() {
    let app = TestApp::new().await;
    app.seed_site("SITE-01").await;
    seed_valves(&app, "V-23", &[("SN-A", "2025-04-01"), ("SN-B", "2025-09-01")]).await;

    create_case(&app, "SITE-01", "PAT-1", "V-23", 1).await;

    app.request_json(
        Method::POST,
        "/api/v1/cases",
        Some(json!({
            "site_id": "SITE-01",
            "patient_id": "PAT-1",
            "case_date": "2025-03-01",
            "items": [{"product_type": "VALVE", "spec_no": "V-23", "qty": 1}]
        })),
        StatusCode::CONFLICT,
    )
    .await;
}

#[tokio::test]
async fn standalone_completion_must_be_exhaustive() {
    let app = TestApp::new().await;
    app.seed_site("SITE-01").await;
    seed_valves(&app, "V-23", &[("SN-A", "2025-04-01"), ("SN-B", "2025-09-01")]).await;

    let case_id = create_case(&app, "SITE-01", "PAT-1", "V-23", 2).await;
    let items = case_item_ids(&app, case_id).await;
    assert_eq!(items.len(), 2);

    app.request_json(
        Method::POST,
        &format!("/api/v1/cases/{case_id}/complete"),
        Some(json!({"items": [used_decision(items[0])]})),
        StatusCode::CONFLICT,
    )
    .await;

    // Failed completion wrote nothing.
    let rows = ledger_rows(&app, case_id).await;
    assert!(rows.iter().all(|r| r.action == "OUT_CASE"));
    let body = app
        .request_json(
            Method::GET,
            &format!("/api/v1/cases/{case_id}"),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(data(&body)["status"], json!("IN_PROGRESS"));
}

#[tokio::test]
async fn completion_writes_dispositions_and_reversal_is_exact() {
    let app = TestApp::new().await;
    app.seed_site("SITE-01").await;
    seed_valves(
        &app,
        "V-23",
        &[("SN-A", "2025-04-01"), ("SN-B", "2025-09-01"), ("SN-C", "2025-12-01")],
    )
    .await;

    let case_id = create_case(&app, "SITE-01", "PAT-1", "V-23", 3).await;
    let items = case_item_ids(&app, case_id).await;

    app.request_json(
        Method::POST,
        &format!("/api/v1/cases/{case_id}/complete"),
        Some(json!({"items": [
            used_decision(items[0]),
            {"txn_id": items[1], "returned": true, "accepted": true},
            {"txn_id": items[2], "returned": true, "accepted": false, "return_condition": [2, 5]},
        ]})),
        StatusCode::OK,
    )
    .await;

    let rows = ledger_rows(&app, case_id).await;
    let count = |action: &str| rows.iter().filter(|r| r.action == action).count();
    assert_eq!(count("OUT_CASE"), 3);
    assert_eq!(count("USED_CASE"), 1);
    assert_eq!(count("REC_CASE"), 2);
    // Rejected return is salvaged into demo stock.
    assert_eq!(count("MOVE_DEMO"), 1);

    let rejected = rows
        .iter()
        .find(|r| r.action == "REC_CASE" && r.inspection.as_deref() == Some("REJECT"))
        .expect("rejected return row");
    assert_eq!(rejected.condition_codes(), vec![2, 5]);

    // Re-completing a completed case conflicts.
    app.request_json(
        Method::POST,
        &format!("/api/v1/cases/{case_id}/complete"),
        Some(json!({"items": []})),
        StatusCode::CONFLICT,
    )
    .await;

    // Mutating a completed case is an invalid operation.
    app.request_json(
        Method::POST,
        &format!("/api/v1/cases/{case_id}/items"),
        Some(json!([{"product_type": "VALVE", "spec_no": "V-23", "qty": 1}])),
        StatusCode::BAD_REQUEST,
    )
    .await;

    app.request_json(
        Method::POST,
        &format!("/api/v1/cases/{case_id}/reverse-completion"),
        None,
        StatusCode::OK,
    )
    .await;

    // Only the original checkout rows survive the reversal.
    let rows = ledger_rows(&app, case_id).await;
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.action == "OUT_CASE"));
    let body = app
        .request_json(
            Method::GET,
            &format!("/api/v1/cases/{case_id}"),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(data(&body)["status"], json!("IN_PROGRESS"));

    // Reversing an in-progress case is rejected.
    app.request_json(
        Method::POST,
        &format!("/api/v1/cases/{case_id}/reverse-completion"),
        None,
        StatusCode::BAD_REQUEST,
    )
    .await;
}

#[tokio::test]
async fn deleting_a_case_releases_its_stock() {
    let app = TestApp::new().await;
    app.seed_site("SITE-01").await;
    seed_valves(&app, "V-23", &[("SN-A", "2025-04-01")]).await;

    let case_id = create_case(&app, "SITE-01", "PAT-1", "V-23", 1).await;

    let body = app
        .request_json(
            Method::GET,
            "/api/v1/inventory/candidates?spec_no=V-23&product_type=VALVE&reference_date=2025-01-01",
            None,
            StatusCode::OK,
        )
        .await;
    assert!(data(&body).as_array().expect("array").is_empty());

    app.request_json(
        Method::DELETE,
        &format!("/api/v1/cases/{case_id}"),
        None,
        StatusCode::OK,
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
    assert_eq!(data(&body).as_array().expect("array").len(), 1);

    app.request_json(
        Method::GET,
        &format!("/api/v1/cases/{case_id}"),
        None,
        StatusCode::NOT_FOUND,
    )
    .await;
}

#[tokio::test]
async fn updating_metadata_checks_case_no_uniqueness() {
    let app = TestApp::new().await;
    app.seed_site("SITE-01").await;
    seed_valves(&app, "V-23", &[("SN-A", "2025-04-01"), ("SN-B", "2025-09-01")]).await;

    let first = create_case(&app, "SITE-01", "PAT-1", "V-23", 1).await;
    let second = create_case(&app, "SITE-01", "PAT-2", "V-23", 1).await;

    app.request_json(
        Method::PUT,
        &format!("/api/v1/cases/{first}"),
        Some(json!({"case_no": "CASE-100"})),
        StatusCode::OK,
    )
    .await;

    app.request_json(
        Method::PUT,
        &format!("/api/v1/cases/{second}"),
        Some(json!({"case_no": "CASE-100"})),
        StatusCode::CONFLICT,
    )
    .await;
}

#[tokio::test]
async fn creating_a_case_with_no_items_is_rejected() {
    let app = TestApp::new().await;
    app.seed_site("SITE-01").await;
    app.seed_spec("V-23", ProductType::Valve).await;

    app.request_json(
        Method::POST,
        "/api/v1/cases",
        Some(json!({
            "site_id": "SITE-01",
            "patient_id": "PAT-1",
            "case_date": "2025-02-10",
            "items": []
        })),
        StatusCode::BAD_REQUEST,
    )
    .await;
}

#[tokio::test]
async fn raising_an_item_quantity_cannot_overdraw_the_serial() {
    let app = TestApp::new().await;
    app.seed_site("SITE-01").await;
    app.seed_spec("V-23", ProductType::Valve).await;
    app.seed_stock("V-23", ProductType::Valve, "SN-A", "2025-04-01", 3).await;

    let case_id = create_case(&app, "SITE-01", "PAT-1", "V-23", 2).await;
    let items = case_item_ids(&app, case_id).await;

    // Only one unit is still on the shelf; drawing two more must fail.
    app.request_json(
        Method::PUT,
        &format!("/api/v1/cases/{case_id}/items/{}", items[0]),
        Some(json!({"qty": 3})),
        StatusCode::UNPROCESSABLE_ENTITY,
    )
    .await;

    app.request_json(
        Method::PUT,
        &format!("/api/v1/cases/{case_id}/items/{}", items[0]),
        Some(json!({"qty": 2})),
        StatusCode::OK,
    )
    .await;

    // The serial is now fully drawn down.
    let body = app
        .request_json(
            Method::GET,
            "/api/v1/inventory/candidates?spec_no=V-23&product_type=VALVE&reference_date=2025-01-01",
            None,
            StatusCode::OK,
        )
        .await;
    assert!(data(&body).as_array().expect("array").is_empty());
}

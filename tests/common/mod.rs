#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::NaiveDate;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

use caseflow_api::{
    config::AppConfig,
    db,
    entities::inventory_transaction::{Inspection, ProductType},
    events::{self, EventSender},
    handlers::AppServices,
    services::inventory::StockMovementInput,
    AppState,
};

/// Helper harness for spinning up an application state backed by a
/// throwaway SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    db_path: std::path::PathBuf,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    /// Construct a new test application with fresh database state.
    pub async fn new() -> Self {
        let db_path = std::env::temp_dir().join(format!("caseflow_test_{}.db", Uuid::new_v4()));
        let _ = std::fs::remove_file(&db_path);

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.auto_migrate = true;
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let services = AppServices::new(db_arc.clone(), event_sender.clone());
        let state = AppState {
            db: db_arc,
            config: cfg,
            event_sender,
            services,
        };

        let router = Router::new()
            .nest("/api/v1", caseflow_api::api_v1_routes())
            .with_state(state.clone());

        Self {
            router,
            state,
            db_path,
            _event_task: event_task,
        }
    }

    /// Send a JSON request against the router.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Send a request and decode the JSON body, asserting the status.
    pub async fn request_json(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        expected: StatusCode,
    ) -> Value {
        let response = self.request(method, uri, body).await;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("failed to read response body");
        assert_eq!(
            status,
            expected,
            "unexpected status, body: {}",
            String::from_utf8_lossy(&bytes)
        );
        if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("response body should be JSON")
        }
    }

    /// Seed a site directory entry.
    pub async fn seed_site(&self, id: &str) {
        self.request_json(
            Method::POST,
            "/api/v1/sites",
            Some(json!({"id": id, "name": format!("Hospital {id}"), "city": "Vienna"})),
            StatusCode::OK,
        )
        .await;
    }

    /// Seed a product spec directory entry.
    pub async fn seed_spec(&self, spec_no: &str, product_type: ProductType) {
        let type_str = match product_type {
            ProductType::Valve => "VALVE",
            ProductType::DeliverySystem => "DELIVERY_SYSTEM",
        };
        self.request_json(
            Method::POST,
            "/api/v1/product-specs",
            Some(json!({"spec_no": spec_no, "product_type": type_str})),
            StatusCode::OK,
        )
        .await;
    }

    /// Record a stock receipt directly through the service layer.
    pub async fn seed_stock(
        &self,
        spec_no: &str,
        product_type: ProductType,
        serial_no: &str,
        exp_date: &str,
        qty: i32,
    ) {
        self.state
            .services
            .inventory
            .receive_stock(StockMovementInput {
                txn_date: date("2025-01-01"),
                product_type,
                spec_no: spec_no.to_string(),
                serial_no: Some(serial_no.to_string()),
                qty,
                exp_date: Some(date(exp_date)),
                batch_no: Some(format!("B-{serial_no}")),
                inspection: Some(Inspection::Accept),
                condition_codes: vec![],
                notes: None,
            })
            .await
            .expect("failed to seed stock");
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.db_path);
    }
}

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("valid test date")
}

/// Extracts `data` from the standard response envelope.
pub fn data(body: &Value) -> &Value {
    assert_eq!(body["success"], json!(true), "expected success: {}", body);
    &body["data"]
}

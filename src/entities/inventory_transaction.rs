use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Note prefix marking ledger rows written by the reconciliation engine
/// rather than entered by a user.
pub const SYSTEM_NOTE_PREFIX: &str = "$sys";

/// Sub-tag for rows recording a unit consumed in a case.
pub const NOTE_TAG_USED: &str = "used";
/// Sub-tag for rows recording a unit returned at case completion.
pub const NOTE_TAG_RETURN: &str = "return";
/// Sub-tag for explicit mid-trip returns of unassigned pool rows.
pub const NOTE_TAG_POOL_RETURN: &str = "pool-return";
/// Sub-tag for the automatic end-of-trip return of unconsumed pool rows.
pub const NOTE_TAG_TRIP_RETURN: &str = "trip-return";

/// Builds the system note for a derived row, e.g. `$sys:used`.
pub fn system_note(tag: &str) -> String {
    format!("{SYSTEM_NOTE_PREFIX}:{tag}")
}

/// Ledger actions for inventory transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnAction {
    /// Receipt into sellable stock
    ReceiveStock,
    /// Shipped out (sold/consigned away)
    ShipStock,
    /// Checked out to a clinical case (or a trip's shared pool)
    CheckoutCase,
    /// Checked out as extra stock carried on a trip
    CheckoutTrip,
    /// Returned to stock from a case or trip
    ReturnCase,
    /// Consumed in a case (terminal; the unit already left the shelf)
    UsedCase,
    /// Moved into the demo pool (not eligible for clinical use)
    MoveDemo,
}

impl TxnAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxnAction::ReceiveStock => "REC_CN",
            TxnAction::ShipStock => "OUT_CN",
            TxnAction::CheckoutCase => "OUT_CASE",
            TxnAction::CheckoutTrip => "OUT_TRIP",
            TxnAction::ReturnCase => "REC_CASE",
            TxnAction::UsedCase => "USED_CASE",
            TxnAction::MoveDemo => "MOVE_DEMO",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "REC_CN" => Some(TxnAction::ReceiveStock),
            "OUT_CN" => Some(TxnAction::ShipStock),
            "OUT_CASE" => Some(TxnAction::CheckoutCase),
            "OUT_TRIP" => Some(TxnAction::CheckoutTrip),
            "REC_CASE" => Some(TxnAction::ReturnCase),
            "USED_CASE" => Some(TxnAction::UsedCase),
            "MOVE_DEMO" => Some(TxnAction::MoveDemo),
            _ => None,
        }
    }
}

/// Device product categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductType {
    Valve,
    DeliverySystem,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Valve => "VALVE",
            ProductType::DeliverySystem => "DELIVERY_SYSTEM",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "VALVE" => Some(ProductType::Valve),
            "DELIVERY_SYSTEM" => Some(ProductType::DeliverySystem),
            _ => None,
        }
    }
}

/// Outcome of the inspection performed on a returned unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Inspection {
    Accept,
    Reject,
}

impl Inspection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Inspection::Accept => "ACCEPT",
            Inspection::Reject => "REJECT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ACCEPT" => Some(Inspection::Accept),
            "REJECT" => Some(Inspection::Reject),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "inventory_transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub txn_date: NaiveDate,
    pub action: String, // Storing as string in DB, but will convert to/from TxnAction
    pub product_type: String,
    pub spec_no: String,
    pub serial_no: Option<String>,
    pub qty: i32,
    pub exp_date: Option<NaiveDate>,
    pub batch_no: Option<String>,
    pub case_id: Option<Uuid>,
    pub trip_id: Option<Uuid>,
    pub inspection: Option<String>,
    /// JSON array of checklist condition codes, e.g. `[3,7]`
    pub return_condition: Option<String>,
    pub notes: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Model {
    pub fn action(&self) -> Option<TxnAction> {
        TxnAction::from_str(&self.action)
    }

    pub fn inspection(&self) -> Option<Inspection> {
        self.inspection.as_deref().and_then(Inspection::from_str)
    }

    /// True when this row was written by the engine, optionally matching a
    /// specific sub-tag.
    pub fn has_system_tag(&self, tag: &str) -> bool {
        self.notes.as_deref() == Some(system_note(tag).as_str())
    }

    /// Decodes the JSON condition-code list (empty when absent).
    pub fn condition_codes(&self) -> Vec<i32> {
        self.return_condition
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

/// Encodes checklist condition codes as the JSON column value.
/// Empty lists are stored as NULL.
pub fn encode_condition_codes(codes: &[i32]) -> Option<String> {
    if codes.is_empty() {
        None
    } else {
        serde_json::to_string(codes).ok()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, _insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        if let ActiveValue::NotSet = active_model.created_at {
            active_model.created_at = Set(Utc::now());
        }
        Ok(active_model)
    }
}

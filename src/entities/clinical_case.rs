use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed namespace for deriving case ids from `site_id:patient_id`.
/// The same site/patient pair always maps to the same case id, which is how
/// duplicate case creation is detected.
pub const CASE_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6b, 0x1d, 0x40, 0x2e, 0x9c, 0x5f, 0x4a, 0x83, 0xb7, 0x21, 0x0d, 0x64, 0xe9, 0x3a, 0x55,
    0xc8,
]);

/// Derives the deterministic case id for a site/patient pair.
pub fn derive_case_id(site_id: &str, patient_id: &str) -> Uuid {
    Uuid::new_v5(
        &CASE_ID_NAMESPACE,
        format!("{site_id}:{patient_id}").as_bytes(),
    )
}

/// Lifecycle states of a clinical case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaseStatus {
    InProgress,
    Completed,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::InProgress => "IN_PROGRESS",
            CaseStatus::Completed => "COMPLETED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "IN_PROGRESS" => Some(CaseStatus::InProgress),
            "COMPLETED" => Some(CaseStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "clinical_cases")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    /// Optional human-assigned label, unique when present
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

impl Model {
    pub fn status(&self) -> Option<CaseStatus> {
        CaseStatus::from_str(&self.status)
    }

    pub fn is_completed(&self) -> bool {
        self.status() == Some(CaseStatus::Completed)
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
        let now = Utc::now();
        if let ActiveValue::NotSet = active_model.created_at {
            active_model.created_at = Set(now);
        }
        active_model.updated_at = Set(now);
        Ok(active_model)
    }
}

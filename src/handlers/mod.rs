use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::{
    events::EventSender,
    services::{
        balance::BalanceService, cases::CaseService, completion::CompletionService,
        inventory::InventoryService, trips::TripService,
    },
};

pub mod cases;
pub mod directory;
pub mod health;
pub mod inventory;
pub mod trips;

/// Bundle of the domain services behind the HTTP layer, sharing one
/// connection pool and one event channel.
#[derive(Clone)]
pub struct AppServices {
    pub balance: BalanceService,
    pub inventory: InventoryService,
    pub cases: CaseService,
    pub trips: TripService,
    pub completion: CompletionService,
}

impl AppServices {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        let balance = BalanceService::new(db.clone());
        Self {
            inventory: InventoryService::new(db.clone(), balance.clone(), event_sender.clone()),
            cases: CaseService::new(db.clone(), event_sender.clone()),
            trips: TripService::new(db.clone(), event_sender.clone()),
            completion: CompletionService::new(db, event_sender),
            balance,
        }
    }
}

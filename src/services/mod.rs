pub mod balance;
pub mod cases;
pub mod completion;
pub mod inventory;
pub mod trips;

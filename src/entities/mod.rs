pub mod clinical_case;
pub mod clinical_trip;
pub mod inventory_transaction;
pub mod product_spec;
pub mod site;

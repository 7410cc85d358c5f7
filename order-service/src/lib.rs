pub mod api;
pub mod ledger;
pub mod models;
pub mod schema;

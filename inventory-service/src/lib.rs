pub mod handlers;
pub mod models;
pub mod reservation;
pub mod schema;

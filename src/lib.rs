pub mod auth;
pub mod error;
pub mod feed;
pub mod models;
pub mod openapi;
pub mod repo;
pub mod resources;
pub mod routes;
pub mod tags;
pub mod uploads;

// Re-export commonly used items for tests / external users
pub use routes::{config, AppState};

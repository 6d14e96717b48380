pub mod auth;
pub mod body;
pub mod client;
pub mod config;
pub mod error;
pub mod fanout;
pub mod imager;
pub mod media;
pub mod models;
pub mod openapi;
pub mod parent_cache;
pub mod protocol;
pub mod rate_limit; // in-memory rate limiting
pub mod router;
pub mod routes;
pub mod services;
pub mod socket;
pub mod store;
pub mod writer;

// Re-export commonly used items for tests / external users
pub use config::Config;
pub use routes::{config, AppState};
pub use services::Services;

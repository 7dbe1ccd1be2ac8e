pub mod api;
pub mod catalog;
pub mod config;
pub mod consumers;
pub mod models;
pub mod saga;
pub mod schema;
pub mod store;

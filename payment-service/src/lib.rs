pub mod api;
pub mod config;
pub mod consumers;
pub mod gateway;
pub mod models;
pub mod processor;
pub mod schema;
pub mod store;
pub mod webhook;

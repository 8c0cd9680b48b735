pub mod api;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod geo;
pub mod models;
pub mod observability;
pub mod protocol;
pub mod session;

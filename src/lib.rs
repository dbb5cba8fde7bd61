pub mod app;
pub mod attribution;
pub mod auth;
pub mod client_info;
pub mod config;
pub mod error;
pub mod ingest;
pub mod query;
pub mod storage;
pub mod tracker;
pub mod types;

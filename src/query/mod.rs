pub mod cache;
pub mod handler;
pub mod stats;

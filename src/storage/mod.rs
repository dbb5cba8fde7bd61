pub mod migrations;
pub mod page_views;
pub mod sessions;
pub mod sqlite;
pub mod sweep;

pub mod dispatch;
pub mod models;
pub mod persistence;
pub mod sqlite;

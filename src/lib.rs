pub mod api;
pub mod auth;
pub mod automation;
pub mod client;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod serial;
pub mod snapshot_store;
pub mod state;
pub mod store;

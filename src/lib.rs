#![forbid(unsafe_code)]

// partysync library - watch-party room sync server

pub mod auth;
pub mod config;
pub mod db;
pub mod metrics;
pub mod room;
pub mod signaling;
pub mod store;

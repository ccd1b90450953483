pub mod app;
pub mod audit;
pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod memory;
pub mod sessions;
pub mod state;
pub mod users;

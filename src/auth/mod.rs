use crate::state::AppState;
use axum::Router;

pub mod dto;
pub mod extractors;
pub mod handlers;
pub mod notifier;
pub mod services;
pub mod token;

pub use notifier::{LogNotifier, Notifier};
pub use services::{AuthService, ClientInfo};

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::auth_routes())
        .merge(handlers::me_routes())
}

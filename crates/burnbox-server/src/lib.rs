pub mod auth;
pub mod code;
pub mod error;
pub mod handlers;
pub mod lookup;
pub mod reaper;
pub mod server;
pub mod service;
pub mod store;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: service::SecretService,
    /// Bearer token for the admin prune route; the route is unmounted when `None`.
    pub admin_token: Option<String>,
}

pub use error::SecretError;
pub use server::{build_router, read_secret_file, resolve_data_dir, run, ServerConfig};
pub use service::{SecretService, ServiceConfig};

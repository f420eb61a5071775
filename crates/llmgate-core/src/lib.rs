pub mod auth;
pub mod bootstrap;
pub mod cache;
pub mod classify;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod state;
pub mod upstream_client;

pub use auth::AuthKeys;
pub use bootstrap::bootstrap_config_from_env;
pub use cache::{CachedCompletion, Fingerprint, ResponseCache};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use error::error_response;
pub use handler::router;
pub use state::AppState;

pub mod access;
pub mod auth;
pub mod channels;
pub mod directory;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod routes;
pub mod service;
pub mod threads;
pub mod users;
pub mod workspaces;

pub use auth::{AppState, AppStateInner, AuthUser};
pub use error::ApiError;
pub use routes::router;
pub use service::MessageService;

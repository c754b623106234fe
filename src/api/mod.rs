//! Admin API: WebSocket protocol, users/roles, model drawing.

pub mod draw;
pub mod handler;
pub mod users;

pub use handler::{ApiContext, ApiSession};
pub use users::{Role, User, UserStore};

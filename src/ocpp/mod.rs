//! OCPP adapter: framing, connection registry, outbound commands,
//! charging-profile discipline, inbound handling and the server itself.

pub mod commands;
pub mod connections;
pub mod frame;
pub mod handler;
pub mod profile;
pub mod server;

pub use commands::{CommandSender, SharedCommandSender};
pub use connections::{ConnectionRegistry, SharedConnectionRegistry};
pub use frame::OcppFrame;
pub use handler::OcppHandler;
pub use server::{OcppServer, ServerError};

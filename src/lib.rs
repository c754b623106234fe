//! # ampshare
//!
//! OCPP 1.6 Central System / local controller with smart charging: a
//! periodic allocator distributes a bounded current budget across nested
//! charger groups, honoring per-session priorities, daily schedules and
//! per-connector limits.
//!
//! ## Layout
//!
//! - **support**: cross-cutting utilities (errors, shutdown, crypto, audit)
//! - **model**: groups, chargers, tags, sessions, schedules, the registry
//! - **ocpp**: OCPP-J framing, connections, commands, profiles, server
//! - **allocator**: the rebalancing algorithm and its control loop
//! - **api**: admin WebSocket API with users and roles
//! - **watchdog**: stale-session reaper
//! - **config**: TOML configuration

pub mod allocator;
pub mod api;
pub mod config;
pub mod model;
pub mod ocpp;
pub mod support;
pub mod watchdog;

pub use config::AppConfig;
pub use model::{ModelRegistry, RegistrySettings};
pub use ocpp::{OcppServer, ServerError};

//! Smart-charging allocator: the periodic rebalancing of offers across
//! allocation groups.

pub mod plan;
pub mod runner;

pub use plan::{plan, OfferChange, Plan, PlateauCap};
pub use runner::AllocatorRunner;

//! Domain model: groups, chargers, tags, sessions, schedules and the
//! registry that owns them.

pub mod charger;
pub mod firmware;
pub mod group;
pub mod registry;
pub mod schedule;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod tag;

pub use charger::{Charger, Connector, ConnectorStatus};
pub use firmware::FirmwareRecord;
pub use group::Group;
pub use registry::{AuthOutcome, Model, ModelRegistry, RegistrySettings};
pub use schedule::Schedule;
pub use session::{ChargingSession, ClosedSession, OfferRecord, SessionHistoryWriter};
pub use snapshot::Snapshot;
pub use tag::{Tag, TagStatus};

pub mod conversions;
pub mod entity;
pub mod events;
pub mod progress;

pub use entity::{AssetPair, EntityFacts, EntityKind, EntityRecord, EntityState, EventCounters, EventGap};
pub use events::{ChainEvent, EventKind, EventPayload};
pub use progress::{BlockRange, Checkpoint, DeploymentCache, DeploymentEntry, Progress, SourceProgress};

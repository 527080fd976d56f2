//! apiary-core - Domain types for the apiary orchestrator.
//!
//! Pure data: node identifiers, mail records, the swarm configuration, the
//! topology snapshot, bus events, and the error taxonomy. No I/O lives here;
//! persistence and runtime behavior belong to `apiary-store` and
//! `apiary-hive`.

pub mod error;
pub mod event;
pub mod ids;
pub mod mail;
pub mod swarm;
pub mod topology;

pub use error::{HiveError, HiveResult};
pub use event::{BeeStatus, HiveEvent, QueueSnapshot};
pub use ids::{NodeId, HUMAN_NODE, MAILBOX_PREFIX, SYSTEM_SENDER};
pub use mail::{AttachmentRef, Mail, MailMetadata, MailStatus, MailType, Priority};
pub use swarm::{Bee, Connection, MailboxDef, SwarmConfig};
pub use topology::{MergedConnection, Topology};

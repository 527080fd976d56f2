//! apiary-hive - Orchestration runtime for the apiary message plane.
//!
//! Wires the filesystem stores into a running orchestrator: the topology
//! validated mail router, per-agent outbox watchers, the queue-depth
//! counter, the bounded event bus, and the container supervisor. The
//! [`Hive`] facade is the entry point for gateways and CLIs.

pub mod bus;
pub mod container;
pub mod counter;
pub mod hive;
pub mod router;
pub mod supervisor;
pub mod watcher;

pub use apiary_store::{BlobMeta, DataRoot};
pub use bus::{EventBus, EventStream};
pub use container::{
    backend_from_env, ContainerBackend, ContainerBind, ContainerSpec, ContainerState,
    DockerBackend, NullBackend, DEFAULT_CALL_DEADLINE,
};
pub use counter::InboxCounter;
pub use hive::{Hive, HiveConfig};
pub use router::{MailRouter, RouteOutcome};
pub use supervisor::{HierarchyFile, NeighborRef, Supervisor, SupervisorConfig};
pub use watcher::OutboxWatchers;

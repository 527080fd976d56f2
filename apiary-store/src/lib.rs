//! apiary-store - Filesystem persistence for the apiary orchestrator.
//!
//! Four stores share one data root: file-per-mail queue directories for
//! agents and mailboxes, the single-file human inbox/outbox, the swarm
//! registry, and the attachment blob store. All writes follow the same
//! contract: temporary sibling, fsync, rename.

pub mod blobs;
pub mod human_store;
pub mod layout;
pub mod mail_store;
pub mod registry;

pub use blobs::{BlobMeta, BlobStore};
pub use human_store::HumanStore;
pub use layout::DataRoot;
pub use registry::SwarmRegistry;

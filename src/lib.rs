#![forbid(unsafe_code)]

//! EntDB: a multi-tenant, event-sourced graph database service.
//!
//! Writes flow through the [`coord::Coordinator`], which validates
//! against the frozen [`schema::SchemaRegistry`], frames one durable
//! record per atomic transaction and appends it to the [`wal`]. The
//! [`apply::Applier`] consumes the log per partition and materializes
//! events into per-tenant SQLite stores ([`store`]) with exactly-once
//! semantics. The [`archive`] and [`snapshot`] workers offload the log
//! and the derived stores to an object store so [`recovery`] can rebuild
//! any tenant from (snapshot + archive tail + live WAL).

pub mod apply;
pub mod archive;
pub mod config;
pub mod coord;
pub mod core;
pub mod error;
pub mod objstore;
pub mod recovery;
pub mod schema;
pub mod server;
pub mod snapshot;
pub mod store;
pub mod telemetry;
pub mod wal;

pub use error::{Error, ErrorCode, ErrorPayload, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the everyday types at the crate root.
pub use crate::coord::{Coordinator, ExecuteRequest, Receipt};
pub use crate::core::{
    ActorId, EventId, IdempotencyKey, NodeId, NodeRef, Operation, Payload, Principal,
    SchemaFingerprint, TenantId, TransactionEvent, Value,
};
pub use crate::schema::{EdgeTypeDef, FieldDef, FieldKind, NodeTypeDef, SchemaRegistry};
pub use crate::server::{Server, ServerHandle};
pub use crate::store::{ReadAccess, SnippetExtractors};
pub use crate::wal::{Wal, WalPosition};

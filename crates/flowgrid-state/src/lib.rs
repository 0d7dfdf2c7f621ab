//! flowgrid-state — durable execution store for the dispatch engine.
//!
//! Backed by [redb](https://docs.rs/redb), holds executions, immutable
//! version sets, the image registry (versions and rampups), project
//! versions, and per-execution log lines.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Execution keys are zero-padded ids so table order is id order.
//!
//! The claim operation (`claim_batch`) runs inside a single redb write
//! transaction. redb admits one writer at a time and holds an exclusive
//! lock on the database file, so two claimers can never both move the same
//! READY execution to DISPATCHING.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod flow;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use flow::FlowNode;
pub use store::StateStore;
pub use types::*;

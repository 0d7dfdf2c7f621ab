//! redb table definitions for the Flowgrid state store.
//!
//! Most tables use `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Executions keyed by zero-padded execution id.
pub const EXECUTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("executions");

/// Version sets keyed by zero-padded version set id.
pub const VERSION_SETS: TableDefinition<&str, &[u8]> = TableDefinition::new("version_sets");

/// Version set content digest → version set id.
pub const VERSION_SET_DIGESTS: TableDefinition<&str, u64> =
    TableDefinition::new("version_set_digests");

/// Registered image versions keyed by `{image_type}:{version}`.
pub const IMAGE_VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("image_versions");

/// Rampup plans keyed by `{image_type}`.
pub const IMAGE_RAMPUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("image_rampups");

/// Latest uploaded version keyed by project id.
pub const PROJECT_VERSIONS: TableDefinition<u32, u32> = TableDefinition::new("project_versions");

/// Execution log lines keyed by `{execution_id}:{seq}`.
pub const EXECUTION_LOGS: TableDefinition<&str, &[u8]> = TableDefinition::new("execution_logs");

/// Monotonic id counters keyed by counter name.
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

//! StateStore — redb-backed persistence for the dispatch engine.
//!
//! Provides typed operations over executions, version sets, the image
//! registry, project versions, and execution logs. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use flowgrid_core::epoch_millis;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert a redb error into a `StateError` tagged with the failing operation.
macro_rules! map_err {
    (Open) => {
        |e| StateError::Open(e.to_string())
    };
    ($op:literal) => {
        |e| StateError::Storage {
            op: $op,
            reason: e.to_string(),
        }
    };
}

fn encode<T: Serialize + ?Sized>(record: &'static str, value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StateError::Encode {
        record,
        reason: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(record: &'static str, bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Corrupt {
        record,
        reason: e.to_string(),
    })
}

const EXECUTION_COUNTER: &str = "execution_id";
const VERSION_SET_COUNTER: &str = "version_set_id";
const LOG_COUNTER: &str = "log_seq";

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!("ensure_tables"))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(EXECUTIONS).map_err(map_err!("ensure_tables"))?;
        txn.open_table(VERSION_SETS).map_err(map_err!("ensure_tables"))?;
        txn.open_table(VERSION_SET_DIGESTS).map_err(map_err!("ensure_tables"))?;
        txn.open_table(IMAGE_VERSIONS).map_err(map_err!("ensure_tables"))?;
        txn.open_table(IMAGE_RAMPUPS).map_err(map_err!("ensure_tables"))?;
        txn.open_table(PROJECT_VERSIONS).map_err(map_err!("ensure_tables"))?;
        txn.open_table(EXECUTION_LOGS).map_err(map_err!("ensure_tables"))?;
        txn.open_table(COUNTERS).map_err(map_err!("ensure_tables"))?;
        txn.commit().map_err(map_err!("ensure_tables"))?;
        Ok(())
    }

    /// Bump a named counter inside an open write transaction.
    fn next_id(txn: &redb::WriteTransaction, counter: &'static str) -> StateResult<u64> {
        let mut table = txn.open_table(COUNTERS).map_err(map_err!("next_id"))?;
        let current = table
            .get(counter)
            .map_err(map_err!("next_id"))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        let next = current
            .checked_add(1)
            .ok_or(StateError::CounterExhausted(counter))?;
        table.insert(counter, next).map_err(map_err!("next_id"))?;
        Ok(next)
    }

    // ── Executions ─────────────────────────────────────────────────

    /// Store a new execution, assigning it the next id.
    pub fn insert_execution(&self, mut execution: Execution) -> StateResult<Execution> {
        let txn = self.db.begin_write().map_err(map_err!("insert_execution"))?;
        execution.id = Self::next_id(&txn, EXECUTION_COUNTER)?;
        let key = execution.table_key();
        let value = encode("execution", &execution)?;
        {
            let mut table = txn.open_table(EXECUTIONS).map_err(map_err!("insert_execution"))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!("insert_execution"))?;
        }
        txn.commit().map_err(map_err!("insert_execution"))?;
        debug!(execution_id = execution.id, flow = %execution.flow_name(), "execution inserted");
        Ok(execution)
    }

    /// Get an execution by id.
    pub fn get_execution(&self, id: ExecutionId) -> StateResult<Option<Execution>> {
        let key = execution_key(id);
        let txn = self.db.begin_read().map_err(map_err!("get_execution"))?;
        let table = txn.open_table(EXECUTIONS).map_err(map_err!("get_execution"))?;
        match table.get(key.as_str()).map_err(map_err!("get_execution"))? {
            Some(guard) => {
                let execution: Execution =
                    decode("execution", guard.value())?;
                Ok(Some(execution))
            }
            None => Ok(None),
        }
    }

    /// Overwrite an existing execution.
    pub fn update_execution(&self, execution: &Execution) -> StateResult<()> {
        let key = execution.table_key();
        let value = encode("execution", execution)?;
        let txn = self.db.begin_write().map_err(map_err!("update_execution"))?;
        {
            let mut table = txn.open_table(EXECUTIONS).map_err(map_err!("update_execution"))?;
            if table.get(key.as_str()).map_err(map_err!("update_execution"))?.is_none() {
                return Err(StateError::ExecutionNotFound(execution.id));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!("update_execution"))?;
        }
        txn.commit().map_err(map_err!("update_execution"))?;
        debug!(execution_id = execution.id, status = %execution.status, "execution updated");
        Ok(())
    }

    /// Apply `apply` to an execution only if it is currently in `expected`.
    ///
    /// Returns the updated execution, or `None` if the row is missing or in
    /// another status. Read, check, and write share one write transaction.
    pub fn transition_execution(
        &self,
        id: ExecutionId,
        expected: Status,
        apply: impl FnOnce(&mut Execution),
    ) -> StateResult<Option<Execution>> {
        let key = execution_key(id);
        let txn = self.db.begin_write().map_err(map_err!("transition_execution"))?;
        let updated = {
            let mut table = txn.open_table(EXECUTIONS).map_err(map_err!("transition_execution"))?;
            let current: Option<Execution> = match table.get(key.as_str()).map_err(map_err!("transition_execution"))? {
                Some(guard) => Some(
                    decode("execution", guard.value())?,
                ),
                None => None,
            };
            match current {
                Some(mut execution) if execution.status == expected => {
                    apply(&mut execution);
                    execution.update_time = epoch_millis();
                    let value = encode("execution", &execution)?;
                    table
                        .insert(key.as_str(), value.as_slice())
                        .map_err(map_err!("transition_execution"))?;
                    Some(execution)
                }
                _ => None,
            }
        };
        txn.commit().map_err(map_err!("transition_execution"))?;
        if let Some(execution) = &updated {
            debug!(execution_id = id, from = %expected, to = %execution.status, "execution transitioned");
        }
        Ok(updated)
    }

    /// List executions matching a predicate, in id order.
    fn scan_executions(&self, keep: impl Fn(&Execution) -> bool) -> StateResult<Vec<Execution>> {
        let txn = self.db.begin_read().map_err(map_err!("scan_executions"))?;
        let table = txn.open_table(EXECUTIONS).map_err(map_err!("scan_executions"))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!("scan_executions"))? {
            let (_, value) = entry.map_err(map_err!("scan_executions"))?;
            let execution: Execution =
                decode("execution", value.value())?;
            if keep(&execution) {
                results.push(execution);
            }
        }
        Ok(results)
    }

    /// List all executions.
    pub fn list_executions(&self) -> StateResult<Vec<Execution>> {
        self.scan_executions(|_| true)
    }

    /// List executions that have not reached a finished status.
    pub fn list_unfinished(&self) -> StateResult<Vec<Execution>> {
        self.scan_executions(|e| !e.status.is_finished())
    }

    /// List executions in a status, oldest submission first.
    pub fn list_by_status(&self, status: Status) -> StateResult<Vec<Execution>> {
        let mut results = self.scan_executions(|e| e.status == status)?;
        results.sort_by_key(|e| (e.submit_time, e.id));
        Ok(results)
    }

    /// Atomically move up to `batch_size` containerized executions from
    /// `from` to `to`, oldest submission first, and return their ids.
    ///
    /// The read, filter, and update happen in one write transaction, so
    /// concurrent claimers never receive the same id.
    pub fn claim_batch(
        &self,
        batch_size: usize,
        from: Status,
        to: Status,
    ) -> StateResult<Vec<ExecutionId>> {
        let batch_size = batch_size.max(1);
        let txn = self.db.begin_write().map_err(map_err!("claim_batch"))?;
        let mut claimed = Vec::new();
        {
            let mut table = txn.open_table(EXECUTIONS).map_err(map_err!("claim_batch"))?;
            let mut candidates: Vec<Execution> = Vec::new();
            for entry in table.iter().map_err(map_err!("claim_batch"))? {
                let (_, value) = entry.map_err(map_err!("claim_batch"))?;
                let execution: Execution =
                    decode("execution", value.value())?;
                if execution.status == from
                    && execution.dispatch_method == DispatchMethod::Containerized
                {
                    candidates.push(execution);
                }
            }
            candidates.sort_by_key(|e| (e.submit_time, e.id));
            candidates.truncate(batch_size);

            let now = epoch_millis();
            for mut execution in candidates {
                execution.status = to;
                execution.update_time = now;
                let key = execution.table_key();
                let value = encode("execution", &execution)?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!("claim_batch"))?;
                claimed.push(execution.id);
            }
        }
        txn.commit().map_err(map_err!("claim_batch"))?;
        if !claimed.is_empty() {
            debug!(count = claimed.len(), %from, %to, "executions claimed");
        }
        Ok(claimed)
    }

    /// Executions that have been in `status` for longer than `older_than`,
    /// measured with the status-specific clock.
    pub fn fetch_stale(
        &self,
        status: Status,
        older_than: Duration,
        now: u64,
    ) -> StateResult<Vec<Execution>> {
        let cutoff = now.saturating_sub(older_than.as_millis() as u64);
        let clock = status.stale_clock();
        let mut results =
            self.scan_executions(|e| e.status == status && e.clock_time(clock) < cutoff)?;
        results.sort_by_key(|e| (e.clock_time(clock), e.id));
        Ok(results)
    }

    // ── Version sets ───────────────────────────────────────────────

    /// Return the version set for this mapping, creating it if no set with
    /// identical content exists yet.
    pub fn get_or_create_version_set(
        &self,
        versions: BTreeMap<String, VersionInfo>,
    ) -> StateResult<VersionSet> {
        let digest = VersionSet::digest_of(&versions);
        let txn = self.db.begin_write().map_err(map_err!("get_or_create_version_set"))?;

        let existing_id = {
            let digests = txn.open_table(VERSION_SET_DIGESTS).map_err(map_err!("get_or_create_version_set"))?;
            digests
                .get(digest.as_str())
                .map_err(map_err!("get_or_create_version_set"))?
                .map(|guard| guard.value())
        };
        if let Some(id) = existing_id {
            let sets = txn.open_table(VERSION_SETS).map_err(map_err!("get_or_create_version_set"))?;
            let key = version_set_key(id);
            if let Some(guard) = sets.get(key.as_str()).map_err(map_err!("get_or_create_version_set"))? {
                let set: VersionSet =
                    decode("version set", guard.value())?;
                return Ok(set);
            }
        }

        let set = VersionSet {
            id: Self::next_id(&txn, VERSION_SET_COUNTER)?,
            digest: digest.clone(),
            versions,
            created_at: epoch_millis(),
        };
        let key = set.table_key();
        let value = encode("version set", &set)?;
        {
            let mut sets = txn.open_table(VERSION_SETS).map_err(map_err!("get_or_create_version_set"))?;
            sets.insert(key.as_str(), value.as_slice())
                .map_err(map_err!("get_or_create_version_set"))?;
            let mut digests = txn.open_table(VERSION_SET_DIGESTS).map_err(map_err!("get_or_create_version_set"))?;
            digests
                .insert(digest.as_str(), set.id)
                .map_err(map_err!("get_or_create_version_set"))?;
        }
        txn.commit().map_err(map_err!("get_or_create_version_set"))?;
        debug!(version_set_id = set.id, %digest, "version set created");
        Ok(set)
    }

    /// Get a version set by id.
    pub fn get_version_set(&self, id: VersionSetId) -> StateResult<Option<VersionSet>> {
        let key = version_set_key(id);
        let txn = self.db.begin_read().map_err(map_err!("get_version_set"))?;
        let table = txn.open_table(VERSION_SETS).map_err(map_err!("get_version_set"))?;
        match table.get(key.as_str()).map_err(map_err!("get_version_set"))? {
            Some(guard) => {
                let set: VersionSet =
                    decode("version set", guard.value())?;
                Ok(Some(set))
            }
            None => Ok(None),
        }
    }

    // ── Image registry ─────────────────────────────────────────────

    /// Insert or update a registered image version.
    pub fn put_image_version(&self, image: &ImageVersion) -> StateResult<()> {
        let key = image.table_key();
        let value = encode("image version", image)?;
        let txn = self.db.begin_write().map_err(map_err!("put_image_version"))?;
        {
            let mut table = txn.open_table(IMAGE_VERSIONS).map_err(map_err!("put_image_version"))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!("put_image_version"))?;
        }
        txn.commit().map_err(map_err!("put_image_version"))?;
        debug!(%key, state = ?image.state, "image version stored");
        Ok(())
    }

    /// Get one version of an image type. The type is matched case-insensitively.
    pub fn get_image_version(
        &self,
        image_type: &str,
        version: &str,
    ) -> StateResult<Option<ImageVersion>> {
        let key = image_version_key(image_type, version);
        let txn = self.db.begin_read().map_err(map_err!("get_image_version"))?;
        let table = txn.open_table(IMAGE_VERSIONS).map_err(map_err!("get_image_version"))?;
        match table.get(key.as_str()).map_err(map_err!("get_image_version"))? {
            Some(guard) => {
                let image: ImageVersion =
                    decode("image version", guard.value())?;
                Ok(Some(image))
            }
            None => Ok(None),
        }
    }

    /// All versions of an image type, oldest first.
    pub fn list_image_versions(&self, image_type: &str) -> StateResult<Vec<ImageVersion>> {
        let prefix = format!("{}:", image_type.to_ascii_lowercase());
        let txn = self.db.begin_read().map_err(map_err!("list_image_versions"))?;
        let table = txn.open_table(IMAGE_VERSIONS).map_err(map_err!("list_image_versions"))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!("list_image_versions"))? {
            let (key, value) = entry.map_err(map_err!("list_image_versions"))?;
            if key.value().starts_with(&prefix) {
                let image: ImageVersion =
                    decode("image version", value.value())?;
                results.push(image);
            }
        }
        results.sort_by_key(|image| image.created_at);
        Ok(results)
    }

    /// Replace the rampup plan for an image type.
    pub fn put_image_rampups(&self, image_type: &str, plan: &[ImageRampup]) -> StateResult<()> {
        let key = image_type.to_ascii_lowercase();
        let value = encode("rampup plan", plan)?;
        let txn = self.db.begin_write().map_err(map_err!("put_image_rampups"))?;
        {
            let mut table = txn.open_table(IMAGE_RAMPUPS).map_err(map_err!("put_image_rampups"))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!("put_image_rampups"))?;
        }
        txn.commit().map_err(map_err!("put_image_rampups"))?;
        debug!(image_type = %key, slices = plan.len(), "rampup plan stored");
        Ok(())
    }

    /// The rampup plan for an image type, empty when none is configured.
    pub fn get_image_rampups(&self, image_type: &str) -> StateResult<Vec<ImageRampup>> {
        let key = image_type.to_ascii_lowercase();
        let txn = self.db.begin_read().map_err(map_err!("get_image_rampups"))?;
        let table = txn.open_table(IMAGE_RAMPUPS).map_err(map_err!("get_image_rampups"))?;
        match table.get(key.as_str()).map_err(map_err!("get_image_rampups"))? {
            Some(guard) => decode("rampup plan", guard.value()),
            None => Ok(Vec::new()),
        }
    }

    // ── Projects ───────────────────────────────────────────────────

    /// Record the latest uploaded version of a project.
    pub fn set_project_version(&self, project_id: u32, version: u32) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!("set_project_version"))?;
        {
            let mut table = txn.open_table(PROJECT_VERSIONS).map_err(map_err!("set_project_version"))?;
            table.insert(project_id, version).map_err(map_err!("set_project_version"))?;
        }
        txn.commit().map_err(map_err!("set_project_version"))?;
        Ok(())
    }

    pub fn get_project_version(&self, project_id: u32) -> StateResult<Option<u32>> {
        let txn = self.db.begin_read().map_err(map_err!("get_project_version"))?;
        let table = txn.open_table(PROJECT_VERSIONS).map_err(map_err!("get_project_version"))?;
        Ok(table
            .get(project_id)
            .map_err(map_err!("get_project_version"))?
            .map(|guard| guard.value()))
    }

    // ── Execution logs ─────────────────────────────────────────────

    /// Append a line to an execution's log.
    pub fn append_execution_log(&self, execution_id: ExecutionId, message: &str) -> StateResult<()> {
        let line = ExecutionLogLine {
            execution_id,
            at: epoch_millis(),
            message: message.to_string(),
        };
        let value = encode("log line", &line)?;
        let txn = self.db.begin_write().map_err(map_err!("append_execution_log"))?;
        let seq = Self::next_id(&txn, LOG_COUNTER)?;
        let key = format!("{}:{seq:020}", execution_key(execution_id));
        {
            let mut table = txn.open_table(EXECUTION_LOGS).map_err(map_err!("append_execution_log"))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!("append_execution_log"))?;
        }
        txn.commit().map_err(map_err!("append_execution_log"))?;
        Ok(())
    }

    /// All log lines of an execution, in append order.
    pub fn list_execution_logs(&self, execution_id: ExecutionId) -> StateResult<Vec<ExecutionLogLine>> {
        let prefix = format!("{}:", execution_key(execution_id));
        let txn = self.db.begin_read().map_err(map_err!("list_execution_logs"))?;
        let table = txn.open_table(EXECUTION_LOGS).map_err(map_err!("list_execution_logs"))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!("list_execution_logs"))? {
            let (key, value) = entry.map_err(map_err!("list_execution_logs"))?;
            if key.value().starts_with(&prefix) {
                let line: ExecutionLogLine =
                    decode("log line", value.value())?;
                results.push(line);
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ready(flow: &str) -> Execution {
        Execution::new(1, "proj", flow, "alice")
    }

    fn image(image_type: &str, version: &str, state: ImageState, created_at: u64) -> ImageVersion {
        ImageVersion {
            image_type: image_type.to_string(),
            version: version.to_string(),
            state,
            created_at,
        }
    }

    // ── Executions ─────────────────────────────────────────────────

    #[test]
    fn insert_assigns_increasing_ids() {
        let store = StateStore::open_in_memory().unwrap();
        let a = store.insert_execution(ready("a")).unwrap();
        let b = store.insert_execution(ready("b")).unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(store.get_execution(2).unwrap(), Some(b));
    }

    #[test]
    fn get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_execution(99).unwrap().is_none());
    }

    #[test]
    fn update_missing_execution_fails() {
        let store = StateStore::open_in_memory().unwrap();
        let mut exec = ready("a");
        exec.id = 42;
        assert!(matches!(
            store.update_execution(&exec),
            Err(StateError::ExecutionNotFound(42))
        ));
    }

    #[test]
    fn corrupt_row_names_the_record() {
        let store = StateStore::open_in_memory().unwrap();
        let exec = store.insert_execution(ready("a")).unwrap();
        let txn = store.db.begin_write().unwrap();
        {
            let mut table = txn.open_table(EXECUTIONS).unwrap();
            table.insert(exec.table_key().as_str(), b"not json".as_slice()).unwrap();
        }
        txn.commit().unwrap();

        let err = store.get_execution(exec.id).unwrap_err();
        assert!(matches!(err, StateError::Corrupt { record: "execution", .. }));
        assert!(!err.is_storage());
        assert!(err.to_string().starts_with("corrupt execution row"));
        assert!(store.list_by_status(Status::Ready).is_err());
    }

    #[test]
    fn exhausted_counter_is_reported() {
        let store = StateStore::open_in_memory().unwrap();
        let txn = store.db.begin_write().unwrap();
        {
            let mut table = txn.open_table(COUNTERS).unwrap();
            table.insert(EXECUTION_COUNTER, u64::MAX).unwrap();
        }
        txn.commit().unwrap();

        let err = store.insert_execution(ready("a")).unwrap_err();
        assert!(matches!(err, StateError::CounterExhausted(EXECUTION_COUNTER)));
        assert_eq!(err.to_string(), "execution_id counter exhausted");
        assert!(store.list_executions().unwrap().is_empty());
    }

    #[test]
    fn unfinished_and_by_status() {
        let store = StateStore::open_in_memory().unwrap();
        let mut done = store.insert_execution(ready("done")).unwrap();
        done.status = Status::Succeeded;
        store.update_execution(&done).unwrap();
        store.insert_execution(ready("queued")).unwrap();

        let unfinished = store.list_unfinished().unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].flow_id, "queued");

        let succeeded = store.list_by_status(Status::Succeeded).unwrap();
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].id, done.id);
    }

    #[test]
    fn claim_batch_takes_oldest_first_and_respects_size() {
        let store = StateStore::open_in_memory().unwrap();
        for (i, flow) in ["c", "a", "b"].iter().enumerate() {
            let mut exec = ready(flow);
            exec.submit_time = 1000 - i as u64;
            store.insert_execution(exec).unwrap();
        }

        let first = store
            .claim_batch(2, Status::Ready, Status::Dispatching)
            .unwrap();
        assert_eq!(first, vec![3, 2]);

        let rest = store
            .claim_batch(2, Status::Ready, Status::Dispatching)
            .unwrap();
        assert_eq!(rest, vec![1]);

        assert!(store
            .claim_batch(2, Status::Ready, Status::Dispatching)
            .unwrap()
            .is_empty());
        for id in 1..=3 {
            let exec = store.get_execution(id).unwrap().unwrap();
            assert_eq!(exec.status, Status::Dispatching);
        }
    }

    #[test]
    fn claim_batch_skips_poll_executions() {
        let store = StateStore::open_in_memory().unwrap();
        let mut poll = ready("legacy");
        poll.dispatch_method = DispatchMethod::Poll;
        store.insert_execution(poll).unwrap();
        let container = store.insert_execution(ready("isolated")).unwrap();

        let claimed = store
            .claim_batch(10, Status::Ready, Status::Dispatching)
            .unwrap();
        assert_eq!(claimed, vec![container.id]);
    }

    #[test]
    fn concurrent_claims_never_overlap() {
        let store = StateStore::open_in_memory().unwrap();
        let total = 60;
        for i in 0..total {
            store.insert_execution(ready(&format!("flow{i}"))).unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let mut mine = Vec::new();
                    loop {
                        let ids = store
                            .claim_batch(3, Status::Ready, Status::Dispatching)
                            .unwrap();
                        if ids.is_empty() {
                            break;
                        }
                        mine.extend(ids);
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut count = 0;
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "execution {id} claimed twice");
                count += 1;
            }
        }
        assert_eq!(count, total);
        assert_eq!(seen, (1..=total as u64).collect::<HashSet<_>>());
    }

    #[test]
    fn fetch_stale_uses_status_clock() {
        let store = StateStore::open_in_memory().unwrap();
        let now = 10 * 60 * 60 * 1000;

        let mut old_prep = ready("old");
        old_prep.status = Status::Preparing;
        old_prep.submit_time = now - 20 * 60 * 1000;
        let old_prep = store.insert_execution(old_prep).unwrap();

        let mut fresh_prep = ready("fresh");
        fresh_prep.status = Status::Preparing;
        fresh_prep.submit_time = now - 5 * 60 * 1000;
        store.insert_execution(fresh_prep).unwrap();

        let mut killing = ready("killing");
        killing.status = Status::Killing;
        killing.submit_time = now - 5 * 60 * 60 * 1000;
        killing.update_time = now - 60 * 1000;
        store.insert_execution(killing).unwrap();

        let stale = store
            .fetch_stale(Status::Preparing, Duration::from_secs(15 * 60), now)
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old_prep.id);

        // Old submission but recently updated: not stale while killing.
        let stale = store
            .fetch_stale(Status::Killing, Duration::from_secs(15 * 60), now)
            .unwrap();
        assert!(stale.is_empty());
    }

    // ── Version sets ───────────────────────────────────────────────

    #[test]
    fn identical_version_sets_are_reused() {
        let store = StateStore::open_in_memory().unwrap();
        let mut versions = BTreeMap::new();
        versions.insert("java".to_string(), VersionInfo::new("1.2.0", ImageState::Active));

        let first = store.get_or_create_version_set(versions.clone()).unwrap();
        let second = store.get_or_create_version_set(versions.clone()).unwrap();
        assert_eq!(first.id, second.id);

        versions.insert("pig".to_string(), VersionInfo::new("0.9", ImageState::New));
        let third = store.get_or_create_version_set(versions).unwrap();
        assert_ne!(third.id, first.id);

        // The original set is untouched.
        let reloaded = store.get_version_set(first.id).unwrap().unwrap();
        assert_eq!(reloaded.versions.len(), 1);
    }

    // ── Image registry ─────────────────────────────────────────────

    #[test]
    fn image_versions_are_case_insensitive() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_image_version(&image("Spark", "3.1", ImageState::Active, 10))
            .unwrap();
        assert!(store.get_image_version("spark", "3.1").unwrap().is_some());
        assert!(store.get_image_version("SPARK", "3.1").unwrap().is_some());
        assert!(store.get_image_version("spark", "3.2").unwrap().is_none());
    }

    #[test]
    fn list_image_versions_sorted_by_creation() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_image_version(&image("java", "2.0", ImageState::Active, 20))
            .unwrap();
        store
            .put_image_version(&image("java", "1.0", ImageState::Deprecated, 10))
            .unwrap();
        store
            .put_image_version(&image("javax", "9.0", ImageState::Active, 5))
            .unwrap();

        let versions = store.list_image_versions("java").unwrap();
        let names: Vec<_> = versions.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(names, vec!["1.0", "2.0"]);
    }

    #[test]
    fn rampups_default_to_empty() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_image_rampups("java").unwrap().is_empty());
        let plan = vec![
            ImageRampup { version: "1.0".to_string(), percent: 70 },
            ImageRampup { version: "1.1".to_string(), percent: 30 },
        ];
        store.put_image_rampups("Java", &plan).unwrap();
        assert_eq!(store.get_image_rampups("java").unwrap(), plan);
    }

    #[test]
    fn project_versions() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.get_project_version(7).unwrap(), None);
        store.set_project_version(7, 3).unwrap();
        store.set_project_version(7, 4).unwrap();
        assert_eq!(store.get_project_version(7).unwrap(), Some(4));
    }

    #[test]
    fn transition_only_from_expected_status() {
        let store = StateStore::open_in_memory().unwrap();
        let exec = store.insert_execution(ready("flow")).unwrap();

        let moved = store
            .transition_execution(exec.id, Status::Dispatching, |e| e.status = Status::Preparing)
            .unwrap();
        assert!(moved.is_none());
        assert_eq!(store.get_execution(exec.id).unwrap().unwrap().status, Status::Ready);

        let moved = store
            .transition_execution(exec.id, Status::Ready, |e| {
                e.status = Status::Dispatching;
                e.version_set_id = Some(3);
            })
            .unwrap()
            .unwrap();
        assert_eq!(moved.status, Status::Dispatching);
        let stored = store.get_execution(exec.id).unwrap().unwrap();
        assert_eq!(stored.version_set_id, Some(3));

        assert!(store
            .transition_execution(404, Status::Ready, |_| {})
            .unwrap()
            .is_none());
    }

    // ── Logs ───────────────────────────────────────────────────────

    #[test]
    fn execution_logs_keep_order_per_execution() {
        let store = StateStore::open_in_memory().unwrap();
        store.append_execution_log(1, "first").unwrap();
        store.append_execution_log(2, "other").unwrap();
        store.append_execution_log(1, "second").unwrap();

        let lines = store.list_execution_logs(1).unwrap();
        let messages: Vec<_> = lines.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
    }

    // ── Persistence ────────────────────────────────────────────────

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowgrid.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store.insert_execution(ready("persisted")).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        let exec = store.get_execution(1).unwrap().unwrap();
        assert_eq!(exec.flow_id, "persisted");
        let next = store.insert_execution(ready("next")).unwrap();
        assert_eq!(next.id, 2);
    }
}

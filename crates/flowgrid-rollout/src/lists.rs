//! Hot-reloadable allow/deny lists.
//!
//! Each list holds an immutable collection behind an `Arc`. Readers take the
//! read lock only long enough to clone the current `Arc`, then evaluate on
//! that snapshot with no lock held. Writers build a new collection and swap
//! the pointer, so a reader never sees a half-applied update.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

/// Allow-list entry that admits every job type.
pub const ALL_JOB_TYPES: &str = "ALL";

fn to_set<I, S>(items: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .map(|s| s.as_ref().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Copy-on-write cell. Reads hold the lock for one `Arc` clone; `update`
/// holds it for the copy as well.
#[derive(Debug)]
struct Snapshot<T> {
    current: RwLock<Arc<T>>,
}

impl<T: Clone> Snapshot<T> {
    fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
        }
    }

    fn load(&self) -> Arc<T> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, value: T) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(value);
    }

    /// Apply `f` to a copy of the current value and publish the result.
    /// Holding the write lock across the copy keeps concurrent updates
    /// from overwriting each other.
    fn update(&self, f: impl FnOnce(&mut T)) {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = T::clone(&current);
        f(&mut next);
        *current = Arc::new(next);
    }
}

/// Shared copy-on-write string set.
#[derive(Debug)]
struct SnapshotSet {
    inner: Snapshot<BTreeSet<String>>,
}

impl SnapshotSet {
    fn new(items: BTreeSet<String>) -> Self {
        Self {
            inner: Snapshot::new(items),
        }
    }

    fn snapshot(&self) -> Arc<BTreeSet<String>> {
        self.inner.load()
    }

    fn replace(&self, items: BTreeSet<String>) {
        self.inner.store(items);
    }

    fn append(&self, items: &BTreeSet<String>) {
        self.inner.update(|set| set.extend(items.iter().cloned()));
    }

    fn remove(&self, items: &BTreeSet<String>) {
        self.inner.update(|set| set.retain(|item| !items.contains(item)));
    }
}

// ── Job types ──────────────────────────────────────────────────────

/// Job types allowed to run in containers.
#[derive(Debug)]
pub struct JobTypeAllowList {
    types: SnapshotSet,
}

impl JobTypeAllowList {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            types: SnapshotSet::new(to_set(types)),
        }
    }

    pub fn snapshot(&self) -> Arc<BTreeSet<String>> {
        self.types.snapshot()
    }

    pub fn replace<I: IntoIterator<Item = S>, S: AsRef<str>>(&self, types: I) {
        self.types.replace(to_set(types));
    }

    pub fn append<I: IntoIterator<Item = S>, S: AsRef<str>>(&self, types: I) {
        self.types.append(&to_set(types));
    }

    pub fn remove<I: IntoIterator<Item = S>, S: AsRef<str>>(&self, types: I) {
        self.types.remove(&to_set(types));
    }

    /// First job type not on the list, or `None` if all are allowed.
    pub fn first_disallowed<'a>(&self, job_types: &'a BTreeSet<String>) -> Option<&'a str> {
        let allowed = self.snapshot();
        if allowed.contains(ALL_JOB_TYPES) {
            return None;
        }
        job_types
            .iter()
            .find(|job_type| !allowed.contains(*job_type))
            .map(String::as_str)
    }
}

// ── Proxy users ────────────────────────────────────────────────────

/// Proxy users whose flows must stay on the shared executors.
#[derive(Debug)]
pub struct ProxyUserDenyList {
    users: SnapshotSet,
}

impl ProxyUserDenyList {
    pub fn new<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            users: SnapshotSet::new(to_set(users)),
        }
    }

    pub fn snapshot(&self) -> Arc<BTreeSet<String>> {
        self.users.snapshot()
    }

    pub fn replace<I: IntoIterator<Item = S>, S: AsRef<str>>(&self, users: I) {
        self.users.replace(to_set(users));
    }

    pub fn append<I: IntoIterator<Item = S>, S: AsRef<str>>(&self, users: I) {
        self.users.append(&to_set(users));
    }

    pub fn remove<I: IntoIterator<Item = S>, S: AsRef<str>>(&self, users: I) {
        self.users.remove(&to_set(users));
    }

    /// First required user that is denied.
    pub fn first_denied<'a>(&self, users: &'a BTreeSet<String>) -> Option<&'a str> {
        let denied = self.snapshot();
        users
            .iter()
            .find(|user| denied.contains(*user))
            .map(String::as_str)
    }
}

// ── Project versions ───────────────────────────────────────────────

/// Project id → highest version that must not run in containers.
#[derive(Debug)]
pub struct ProjectVersionDenyList {
    entries: Snapshot<BTreeMap<u32, u32>>,
}

impl ProjectVersionDenyList {
    pub fn new(entries: BTreeMap<u32, u32>) -> Self {
        Self {
            entries: Snapshot::new(entries),
        }
    }

    pub fn snapshot(&self) -> Arc<BTreeMap<u32, u32>> {
        self.entries.load()
    }

    pub fn replace(&self, entries: BTreeMap<u32, u32>) {
        self.entries.store(entries);
    }

    pub fn set(&self, project_id: u32, version: u32) {
        self.entries.update(|map| {
            map.insert(project_id, version);
        });
    }

    pub fn remove(&self, project_id: u32) {
        self.entries.update(|map| {
            map.remove(&project_id);
        });
    }

    pub fn denies(&self, project_id: u32, project_version: u32) -> bool {
        self.entries
            .load()
            .get(&project_id)
            .is_some_and(|denied| project_version <= *denied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn sentinel_allows_everything() {
        let list = JobTypeAllowList::new(["ALL"]);
        assert_eq!(list.first_disallowed(&set(&["java", "anything"])), None);
    }

    #[test]
    fn allow_list_requires_subset() {
        let list = JobTypeAllowList::new(["java", "command"]);
        assert_eq!(list.first_disallowed(&set(&["java"])), None);
        assert_eq!(list.first_disallowed(&set(&["java", "pig"])), Some("pig"));
        assert_eq!(list.first_disallowed(&BTreeSet::new()), None);
    }

    #[test]
    fn allow_list_mutations() {
        let list = JobTypeAllowList::new(["java"]);
        list.append(["pig", " spark ", ""]);
        assert_eq!(*list.snapshot(), set(&["java", "pig", "spark"]));
        list.remove(["java"]);
        assert_eq!(*list.snapshot(), set(&["pig", "spark"]));
        list.replace(["ALL"]);
        assert_eq!(*list.snapshot(), set(&["ALL"]));
    }

    #[test]
    fn old_snapshot_is_unaffected_by_update() {
        let list = JobTypeAllowList::new(["java"]);
        let before = list.snapshot();
        list.append(["pig"]);
        assert_eq!(*before, set(&["java"]));
        assert_eq!(list.snapshot().len(), 2);
    }

    #[test]
    fn deny_list_intersection() {
        let list = ProxyUserDenyList::new(["svc_acct"]);
        assert_eq!(list.first_denied(&set(&["alice", "svc_acct"])), Some("svc_acct"));
        assert_eq!(list.first_denied(&set(&["alice"])), None);
        list.remove(["svc_acct"]);
        assert_eq!(list.first_denied(&set(&["svc_acct"])), None);
        list.append(["bob"]);
        assert_eq!(list.first_denied(&set(&["bob"])), Some("bob"));
    }

    #[test]
    fn project_version_deny_is_inclusive() {
        let list = ProjectVersionDenyList::new(BTreeMap::from([(7, 3)]));
        assert!(list.denies(7, 2));
        assert!(list.denies(7, 3));
        assert!(!list.denies(7, 4));
        assert!(!list.denies(8, 1));
        list.set(8, 1);
        assert!(list.denies(8, 1));
        list.remove(7);
        assert!(!list.denies(7, 1));
    }

    #[test]
    fn readers_see_whole_lists_during_replacement() {
        let list = Arc::new(JobTypeAllowList::new(["java", "pig"]));
        let writer = {
            let list = list.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    if i % 2 == 0 {
                        list.replace(["spark", "hive"]);
                    } else {
                        list.replace(["java", "pig"]);
                    }
                }
            })
        };
        let old = set(&["java", "pig"]);
        let new = set(&["spark", "hive"]);
        for _ in 0..200 {
            let seen = list.snapshot();
            assert!(*seen == old || *seen == new, "partial list {seen:?}");
        }
        writer.join().unwrap();
    }

    #[test]
    fn concurrent_appends_are_not_lost() {
        let list = Arc::new(ProxyUserDenyList::new(Vec::<String>::new()));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let list = list.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        list.append([format!("user-{t}-{i}")]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(list.snapshot().len(), 200);
    }
}

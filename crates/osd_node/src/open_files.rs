//! Registry of files currently open on a stage.
//!
//! Files are opened implicitly by the first request that touches them and
//! stay open until their deadline passes without another request. Two
//! deadline indexes allow the periodic sweep to find expired entries without
//! scanning the whole table.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::capability::Capability;
use crate::error::OsdError;
use crate::request::FileId;

/// Copy-on-write policy chosen when a file is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CowPolicy {
    NoCow,
    /// Create one new version on the first write after open.
    CowOnce,
}

impl CowPolicy {
    pub fn for_capability(capability: Option<&Capability>) -> Self {
        match capability {
            Some(cap) if cap.snapshots_enabled => Self::CowOnce,
            _ => Self::NoCow,
        }
    }
}

/// Lock holder: one process on one client.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockOwner {
    pub client_uuid: String,
    pub pid: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdvisoryLock {
    pub owner: LockOwner,
    pub offset: u64,
    /// Zero extends the lock to the end of the file.
    pub length: u64,
    pub exclusive: bool,
}

impl AdvisoryLock {
    fn end(&self) -> u64 {
        if self.length == 0 {
            u64::MAX
        } else {
            self.offset.saturating_add(self.length)
        }
    }

    pub fn overlaps(&self, other: &AdvisoryLock) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    pub fn conflicts_with(&self, other: &AdvisoryLock) -> bool {
        self.owner != other.owner
            && self.overlaps(other)
            && (self.exclusive || other.exclusive)
    }
}

#[derive(Clone, Debug)]
pub struct OpenFile {
    file_id: FileId,
    deadline_ms: u64,
    write_deadline_ms: u64,
    cow_policy: CowPolicy,
    write: bool,
    delete_on_close: bool,
    locks: BTreeMap<LockOwner, AdvisoryLock>,
}

impl OpenFile {
    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }

    pub fn cow_policy(&self) -> CowPolicy {
        self.cow_policy
    }

    pub fn is_written(&self) -> bool {
        self.write
    }

    pub fn delete_on_close(&self) -> bool {
        self.delete_on_close
    }

    pub fn locks(&self) -> impl Iterator<Item = &AdvisoryLock> {
        self.locks.values()
    }

    fn conflicting(&self, lock: &AdvisoryLock) -> Option<&AdvisoryLock> {
        self.locks.values().find(|held| held.conflicts_with(lock))
    }
}

/// Result of one deadline sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Entries removed because their deadline passed.
    pub closed: Vec<OpenFile>,
    /// Files that were written and went idle; a new version should be created.
    pub versioned: Vec<FileId>,
}

#[derive(Default)]
pub struct OpenFileTable {
    entries: HashMap<FileId, OpenFile>,
    by_deadline: BTreeSet<(u64, FileId)>,
    by_write_deadline: BTreeSet<(u64, FileId)>,
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, file_id: &FileId) -> bool {
        self.entries.contains_key(file_id)
    }

    pub fn get(&self, file_id: &FileId) -> Option<&OpenFile> {
        self.entries.get(file_id)
    }

    /// Open `file_id` or extend its deadline.
    ///
    /// Returns the copy-on-write policy in effect and whether the file was
    /// opened by this call. An already-open file keeps its policy.
    pub fn open_or_refresh(
        &mut self,
        file_id: &FileId,
        capability: Option<&Capability>,
        deadline_ms: u64,
    ) -> (CowPolicy, bool) {
        let write = capability.is_some_and(Capability::opens_for_write);
        if let Some(policy) = self.refresh(file_id, deadline_ms, write) {
            return (policy, false);
        }
        let policy = CowPolicy::for_capability(capability);
        self.open(file_id.clone(), deadline_ms, policy, write);
        (policy, true)
    }

    /// Insert a new entry. No-op if the file is already open.
    pub fn open(&mut self, file_id: FileId, deadline_ms: u64, cow_policy: CowPolicy, write: bool) {
        if self.entries.contains_key(&file_id) {
            return;
        }
        self.by_deadline.insert((deadline_ms, file_id.clone()));
        if write {
            self.by_write_deadline.insert((deadline_ms, file_id.clone()));
        }
        self.entries.insert(
            file_id.clone(),
            OpenFile {
                file_id,
                deadline_ms,
                write_deadline_ms: if write { deadline_ms } else { 0 },
                cow_policy,
                write,
                delete_on_close: false,
                locks: BTreeMap::new(),
            },
        );
    }

    /// Extend an open file's deadline; deadlines never move backwards.
    ///
    /// Returns `None` if the file is not open.
    pub fn refresh(&mut self, file_id: &FileId, deadline_ms: u64, write: bool) -> Option<CowPolicy> {
        let entry = self.entries.get_mut(file_id)?;
        if deadline_ms > entry.deadline_ms {
            self.by_deadline.remove(&(entry.deadline_ms, file_id.clone()));
            self.by_deadline.insert((deadline_ms, file_id.clone()));
            entry.deadline_ms = deadline_ms;
        }
        if write {
            let write_deadline = deadline_ms.max(entry.write_deadline_ms);
            if entry.write {
                self.by_write_deadline
                    .remove(&(entry.write_deadline_ms, file_id.clone()));
            }
            self.by_write_deadline
                .insert((write_deadline, file_id.clone()));
            entry.write = true;
            entry.write_deadline_ms = write_deadline;
        }
        Some(entry.cow_policy)
    }

    /// Mark an open file for deletion once it is closed.
    pub fn set_delete_on_close(&mut self, file_id: &FileId) -> bool {
        match self.entries.get_mut(file_id) {
            Some(entry) => {
                entry.delete_on_close = true;
                true
            }
            None => false,
        }
    }

    /// Remove an entry regardless of its deadline.
    pub fn close(&mut self, file_id: &FileId) -> Option<OpenFile> {
        let entry = self.entries.remove(file_id)?;
        self.by_deadline.remove(&(entry.deadline_ms, file_id.clone()));
        if entry.write {
            self.by_write_deadline
                .remove(&(entry.write_deadline_ms, file_id.clone()));
        }
        Some(entry)
    }

    /// Close every entry whose deadline is strictly before `now_ms`, then
    /// report written files whose write deadline passed.
    pub fn sweep(&mut self, now_ms: u64) -> SweepReport {
        let mut report = SweepReport::default();

        while let Some((deadline, file_id)) = self.by_deadline.first().cloned() {
            if deadline >= now_ms {
                break;
            }
            if let Some(entry) = self.close(&file_id) {
                report.closed.push(entry);
            } else {
                self.by_deadline.remove(&(deadline, file_id));
            }
        }

        while let Some((deadline, file_id)) = self.by_write_deadline.first().cloned() {
            if deadline >= now_ms {
                break;
            }
            self.by_write_deadline.remove(&(deadline, file_id.clone()));
            if let Some(entry) = self.entries.get_mut(&file_id) {
                entry.write = false;
                entry.write_deadline_ms = 0;
                report.versioned.push(file_id);
            }
        }

        report
    }

    /// Take or replace `lock.owner`'s lock on an open file.
    pub fn acquire_lock(&mut self, file_id: &FileId, lock: AdvisoryLock) -> Result<AdvisoryLock, OsdError> {
        let entry = self
            .entries
            .get_mut(file_id)
            .ok_or_else(|| OsdError::NotOpen(file_id.to_string()))?;
        if let Some(held) = entry.conflicting(&lock) {
            return Err(OsdError::LockConflict(held.clone()));
        }
        entry.locks.insert(lock.owner.clone(), lock.clone());
        Ok(lock)
    }

    /// The first conflicting lock, or `lock` itself if it could be granted.
    pub fn check_lock(&self, file_id: &FileId, lock: AdvisoryLock) -> Result<AdvisoryLock, OsdError> {
        let entry = self
            .entries
            .get(file_id)
            .ok_or_else(|| OsdError::NotOpen(file_id.to_string()))?;
        Ok(entry.conflicting(&lock).cloned().unwrap_or(lock))
    }

    pub fn release_lock(&mut self, file_id: &FileId, owner: &LockOwner) -> Result<Option<AdvisoryLock>, OsdError> {
        let entry = self
            .entries
            .get_mut(file_id)
            .ok_or_else(|| OsdError::NotOpen(file_id.to_string()))?;
        Ok(entry.locks.remove(owner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::AccessMode;

    fn file(n: u32) -> FileId {
        FileId::new(format!("vol:{n}"))
    }

    fn owner(client: &str, pid: u32) -> LockOwner {
        LockOwner {
            client_uuid: client.to_string(),
            pid,
        }
    }

    fn lock(client: &str, offset: u64, length: u64, exclusive: bool) -> AdvisoryLock {
        AdvisoryLock {
            owner: owner(client, 1),
            offset,
            length,
            exclusive,
        }
    }

    fn cap(snapshots_enabled: bool, mode: AccessMode) -> Capability {
        Capability {
            subject: "alice".to_string(),
            file_id: "vol:1".to_string(),
            access_mode: mode,
            expires_ms: u64::MAX,
            epoch: 0,
            priority: 0,
            snapshots_enabled,
            signature: String::new(),
        }
    }

    #[test]
    fn cow_policy_is_chosen_on_open_and_kept() {
        let mut table = OpenFileTable::new();
        let f = file(1);
        assert_eq!(
            table.open_or_refresh(&f, Some(&cap(true, AccessMode::RDWR)), 100),
            (CowPolicy::CowOnce, true)
        );
        // A later capability without snapshots does not change the policy.
        assert_eq!(
            table.open_or_refresh(&f, Some(&cap(false, AccessMode::RDWR)), 200),
            (CowPolicy::CowOnce, false)
        );
        assert_eq!(
            table.open_or_refresh(&file(2), None, 100),
            (CowPolicy::NoCow, true)
        );
    }

    #[test]
    fn deadlines_never_move_backwards() {
        let mut table = OpenFileTable::new();
        let f = file(1);
        table.open(f.clone(), 500, CowPolicy::NoCow, false);
        table.refresh(&f, 300, false);
        assert_eq!(table.get(&f).unwrap().deadline_ms(), 500);
        table.refresh(&f, 700, false);
        assert_eq!(table.get(&f).unwrap().deadline_ms(), 700);
        // The sweep index follows the extended deadline.
        assert!(table.sweep(650).closed.is_empty());
        assert!(table.contains(&f));
    }

    #[test]
    fn sweep_closes_strictly_expired_entries() {
        let mut table = OpenFileTable::new();
        table.open(file(1), 100, CowPolicy::NoCow, false);
        table.open(file(2), 200, CowPolicy::NoCow, false);

        assert!(table.sweep(100).closed.is_empty());
        let report = table.sweep(101);
        assert_eq!(report.closed.len(), 1);
        assert_eq!(report.closed[0].file_id(), &file(1));
        assert!(!table.contains(&file(1)));
        assert!(table.contains(&file(2)));
    }

    #[test]
    fn written_files_are_reported_once_and_stay_open() {
        let mut table = OpenFileTable::new();
        let f = file(1);
        table.open_or_refresh(&f, Some(&cap(true, AccessMode::WRONLY)), 100);
        table.refresh(&f, 1_000, false);

        let report = table.sweep(150);
        assert!(report.closed.is_empty());
        assert_eq!(report.versioned, vec![f.clone()]);
        assert!(!table.get(&f).unwrap().is_written());

        assert!(table.sweep(200).versioned.is_empty());
    }

    #[test]
    fn expired_written_file_is_closed_not_versioned() {
        let mut table = OpenFileTable::new();
        let f = file(1);
        table.open_or_refresh(&f, Some(&cap(true, AccessMode::RDWR)), 100);
        let report = table.sweep(101);
        assert_eq!(report.closed.len(), 1);
        assert!(report.closed[0].is_written());
        assert!(report.versioned.is_empty());
    }

    #[test]
    fn locks_conflict_across_owners_only() {
        let mut table = OpenFileTable::new();
        let f = file(1);
        table.open(f.clone(), 100, CowPolicy::NoCow, false);

        table.acquire_lock(&f, lock("a", 0, 10, true)).unwrap();
        let err = table.acquire_lock(&f, lock("b", 5, 10, false)).unwrap_err();
        assert_eq!(err, OsdError::LockConflict(lock("a", 0, 10, true)));

        // Non-overlapping range and same-owner replacement are fine.
        table.acquire_lock(&f, lock("b", 10, 5, true)).unwrap();
        table.acquire_lock(&f, lock("a", 0, 2, true)).unwrap();
        assert_eq!(table.get(&f).unwrap().locks().count(), 2);

        assert_eq!(
            table.check_lock(&f, lock("c", 12, 1, false)).unwrap(),
            lock("b", 10, 5, true)
        );
        assert_eq!(
            table.check_lock(&f, lock("c", 3, 1, false)).unwrap(),
            lock("c", 3, 1, false)
        );

        assert_eq!(
            table.release_lock(&f, &owner("b", 1)).unwrap(),
            Some(lock("b", 10, 5, true))
        );
        assert_eq!(table.release_lock(&f, &owner("b", 1)).unwrap(), None);
    }

    #[test]
    fn zero_length_lock_extends_to_end_of_file() {
        let whole = lock("a", 100, 0, false);
        assert!(whole.overlaps(&lock("b", u64::MAX - 1, 1, true)));
        assert!(!whole.overlaps(&lock("b", 0, 100, true)));
        // Shared locks never conflict.
        assert!(!whole.conflicts_with(&lock("b", 200, 1, false)));
    }

    #[test]
    fn lock_ops_require_open_file() {
        let mut table = OpenFileTable::new();
        let err = table.acquire_lock(&file(9), lock("a", 0, 1, true)).unwrap_err();
        assert!(matches!(err, OsdError::NotOpen(_)));
    }
}

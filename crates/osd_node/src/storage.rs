//! Durable per-file state: replica-view records and object data.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PersistMode};

use crate::request::FileId;

/// Persisted replica-set view of one file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ViewRecord {
    pub version: u64,
    pub invalidated: bool,
    /// Unix millis of the last change.
    pub modified_ms: u64,
}

const VIEW_RECORD_LEN: usize = 8 + 1 + 8;

impl ViewRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(VIEW_RECORD_LEN);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.push(self.invalidated as u8);
        out.extend_from_slice(&self.modified_ms.to_be_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let version = read_u64(data, &mut offset)?;
        let invalidated = read_u8(data, &mut offset)? != 0;
        let modified_ms = read_u64(data, &mut offset)?;
        Ok(Self {
            version,
            invalidated,
            modified_ms,
        })
    }
}

/// Storage backing a stage. Calls are synchronous and may block briefly.
pub trait StorageEngine: Send + Sync + 'static {
    /// Stored view record; files never seen report version 0, valid.
    fn view_record(&self, file_id: &FileId) -> anyhow::Result<ViewRecord>;
    fn set_view_record(&self, file_id: &FileId, record: &ViewRecord) -> anyhow::Result<()>;

    fn read_object(&self, file_id: &FileId, object_no: u64) -> anyhow::Result<Option<Vec<u8>>>;
    fn write_object(&self, file_id: &FileId, object_no: u64, data: &[u8]) -> anyhow::Result<()>;
    fn delete_object(&self, file_id: &FileId, object_no: u64) -> anyhow::Result<()>;
    /// Object numbers stored for `file_id`, ascending.
    fn object_numbers(&self, file_id: &FileId) -> anyhow::Result<Vec<u64>>;

    /// Whether any object data is stored for `file_id`.
    fn file_exists(&self, file_id: &FileId) -> anyhow::Result<bool>;
    /// Remove every object of `file_id`. The view record stays: a deleted
    /// file must not fall back to an older view.
    fn delete_file(&self, file_id: &FileId) -> anyhow::Result<()>;
    /// Files with object data.
    fn list_files(&self) -> anyhow::Result<Vec<FileId>>;
}

/// In-memory engine for tests and diskless nodes.
#[derive(Default)]
pub struct MemoryStorage {
    views: RwLock<HashMap<FileId, ViewRecord>>,
    objects: RwLock<BTreeMap<FileId, BTreeMap<u64, Vec<u8>>>>,
    fail_view_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent view-record writes fail until reset.
    pub fn fail_view_writes(&self, fail: bool) {
        self.fail_view_writes.store(fail, Ordering::SeqCst);
    }
}

fn poisoned() -> anyhow::Error {
    anyhow::anyhow!("memory storage lock poisoned")
}

impl StorageEngine for MemoryStorage {
    fn view_record(&self, file_id: &FileId) -> anyhow::Result<ViewRecord> {
        let guard = self.views.read().map_err(|_| poisoned())?;
        Ok(guard.get(file_id).copied().unwrap_or_default())
    }

    fn set_view_record(&self, file_id: &FileId, record: &ViewRecord) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.fail_view_writes.load(Ordering::SeqCst),
            "view record write failed for {file_id}"
        );
        let mut guard = self.views.write().map_err(|_| poisoned())?;
        guard.insert(file_id.clone(), *record);
        Ok(())
    }

    fn read_object(&self, file_id: &FileId, object_no: u64) -> anyhow::Result<Option<Vec<u8>>> {
        let guard = self.objects.read().map_err(|_| poisoned())?;
        Ok(guard
            .get(file_id)
            .and_then(|objects| objects.get(&object_no))
            .cloned())
    }

    fn write_object(&self, file_id: &FileId, object_no: u64, data: &[u8]) -> anyhow::Result<()> {
        let mut guard = self.objects.write().map_err(|_| poisoned())?;
        guard
            .entry(file_id.clone())
            .or_default()
            .insert(object_no, data.to_vec());
        Ok(())
    }

    fn delete_object(&self, file_id: &FileId, object_no: u64) -> anyhow::Result<()> {
        let mut guard = self.objects.write().map_err(|_| poisoned())?;
        if let Some(objects) = guard.get_mut(file_id) {
            objects.remove(&object_no);
            if objects.is_empty() {
                guard.remove(file_id);
            }
        }
        Ok(())
    }

    fn object_numbers(&self, file_id: &FileId) -> anyhow::Result<Vec<u64>> {
        let guard = self.objects.read().map_err(|_| poisoned())?;
        Ok(guard
            .get(file_id)
            .map(|objects| objects.keys().copied().collect())
            .unwrap_or_default())
    }

    fn file_exists(&self, file_id: &FileId) -> anyhow::Result<bool> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.contains_key(file_id))
    }

    fn delete_file(&self, file_id: &FileId) -> anyhow::Result<()> {
        self.objects.write().map_err(|_| poisoned())?.remove(file_id);
        Ok(())
    }

    fn list_files(&self) -> anyhow::Result<Vec<FileId>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.keys().cloned().collect())
    }
}

/// fjall-backed engine. View records are synced to disk before a write
/// returns; object data relies on the journal.
pub struct FjallStorage {
    keyspace: Arc<Keyspace>,
    views: fjall::PartitionHandle,
    objects: fjall::PartitionHandle,
}

impl FjallStorage {
    pub fn open(keyspace: Arc<Keyspace>) -> anyhow::Result<Self> {
        let views = keyspace.open_partition("view_records", PartitionCreateOptions::default())?;
        let objects = keyspace.open_partition("objects", PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            views,
            objects,
        })
    }

    pub fn open_dir(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path.as_ref())
            .open()
            .context("open fjall keyspace")?;
        Self::open(Arc::new(keyspace))
    }
}

impl StorageEngine for FjallStorage {
    fn view_record(&self, file_id: &FileId) -> anyhow::Result<ViewRecord> {
        match self.views.get(file_id.as_str().as_bytes())? {
            Some(bytes) => ViewRecord::decode(&bytes)
                .with_context(|| format!("decode view record of {file_id}")),
            None => Ok(ViewRecord::default()),
        }
    }

    fn set_view_record(&self, file_id: &FileId, record: &ViewRecord) -> anyhow::Result<()> {
        self.views
            .insert(file_id.as_str().as_bytes(), record.encode())?;
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("persist view record")?;
        Ok(())
    }

    fn read_object(&self, file_id: &FileId, object_no: u64) -> anyhow::Result<Option<Vec<u8>>> {
        let key = encode_object_key(file_id, object_no);
        Ok(self.objects.get(key)?.map(|bytes| bytes.to_vec()))
    }

    fn write_object(&self, file_id: &FileId, object_no: u64, data: &[u8]) -> anyhow::Result<()> {
        let key = encode_object_key(file_id, object_no);
        self.objects.insert(key, data)?;
        Ok(())
    }

    fn delete_object(&self, file_id: &FileId, object_no: u64) -> anyhow::Result<()> {
        let key = encode_object_key(file_id, object_no);
        self.objects.remove(key)?;
        Ok(())
    }

    fn object_numbers(&self, file_id: &FileId) -> anyhow::Result<Vec<u64>> {
        let prefix = encode_file_prefix(file_id);
        let mut out = Vec::new();
        for item in self.objects.prefix(&prefix) {
            let (key, _) = item?;
            if let Some((_, object_no)) = decode_object_key(&key) {
                out.push(object_no);
            }
        }
        Ok(out)
    }

    fn file_exists(&self, file_id: &FileId) -> anyhow::Result<bool> {
        let prefix = encode_file_prefix(file_id);
        match self.objects.prefix(&prefix).next() {
            Some(item) => item.map(|_| true).map_err(Into::into),
            None => Ok(false),
        }
    }

    fn delete_file(&self, file_id: &FileId) -> anyhow::Result<()> {
        let prefix = encode_file_prefix(file_id);
        let mut batch = self.keyspace.batch();
        for item in self.objects.prefix(&prefix) {
            let (key, _) = item?;
            batch.remove(&self.objects, key);
        }
        batch.commit().context("delete file batch")?;
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("persist file deletion")?;
        Ok(())
    }

    fn list_files(&self) -> anyhow::Result<Vec<FileId>> {
        let mut files = BTreeSet::new();
        for item in self.objects.iter() {
            let (key, _) = item?;
            if let Some((file_id, _)) = decode_object_key(&key) {
                files.insert(file_id);
            }
        }
        Ok(files.into_iter().collect())
    }
}

fn encode_file_prefix(file_id: &FileId) -> Vec<u8> {
    let raw = file_id.as_str().as_bytes();
    let mut out = Vec::with_capacity(4 + raw.len());
    out.extend_from_slice(&(raw.len() as u32).to_be_bytes());
    out.extend_from_slice(raw);
    out
}

fn encode_object_key(file_id: &FileId, object_no: u64) -> Vec<u8> {
    let mut out = encode_file_prefix(file_id);
    out.extend_from_slice(&object_no.to_be_bytes());
    out
}

fn decode_object_key(key: &[u8]) -> Option<(FileId, u64)> {
    let mut offset = 0usize;
    let len = read_u32(key, &mut offset).ok()? as usize;
    if offset + len + 8 != key.len() {
        return None;
    }
    let file_id = std::str::from_utf8(&key[offset..offset + len]).ok()?;
    offset += len;
    let object_no = read_u64(key, &mut offset).ok()?;
    Some((FileId::new(file_id), object_no))
}

fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

fn read_u8(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset < data.len(), "short u8");
    let out = data[*offset];
    *offset += 1;
    Ok(out)
}

fn read_u64(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

//! Durable per-agent state
//!
//! One [`AgentRecord`] per [`AgentKind`]: the only memory carried between
//! otherwise stateless invocations of the same kind. Updates are
//! read-modify-write under a per-kind lock, so work on different kinds never
//! contends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::agent::{AgentKind, AgentRecord};
use crate::error::StoreError;

/// Name of the record file inside a kind's directory
const RECORD_FILE: &str = "record.json";

/// Key-value store of agent records
pub trait AgentStateStore: Send + Sync {
    /// Current record for a kind, creating an idle one on first reference
    fn get(&self, kind: &AgentKind) -> Result<AgentRecord, StoreError>;

    /// Apply `mutator` atomically and return the stored result
    fn update(
        &self,
        kind: &AgentKind,
        mutator: &mut dyn FnMut(&mut AgentRecord),
    ) -> Result<AgentRecord, StoreError>;

    /// Every kind that has a record
    fn kinds(&self) -> Result<Vec<AgentKind>, StoreError>;
}

/// Records kept for the lifetime of the process
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<AgentKind, Arc<Mutex<AgentRecord>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, kind: &AgentKind) -> Arc<Mutex<AgentRecord>> {
        if let Some(entry) = self.records.read().get(kind) {
            return Arc::clone(entry);
        }
        let mut records = self.records.write();
        Arc::clone(
            records
                .entry(kind.clone())
                .or_insert_with(|| Arc::new(Mutex::new(AgentRecord::new(kind.clone())))),
        )
    }
}

impl AgentStateStore for MemoryStore {
    fn get(&self, kind: &AgentKind) -> Result<AgentRecord, StoreError> {
        Ok(self.entry(kind).lock().clone())
    }

    fn update(
        &self,
        kind: &AgentKind,
        mutator: &mut dyn FnMut(&mut AgentRecord),
    ) -> Result<AgentRecord, StoreError> {
        let entry = self.entry(kind);
        let mut record = entry.lock();
        mutator(&mut record);
        record.touch();
        Ok(record.clone())
    }

    fn kinds(&self) -> Result<Vec<AgentKind>, StoreError> {
        let mut kinds: Vec<_> = self.records.read().keys().cloned().collect();
        kinds.sort();
        Ok(kinds)
    }
}

/// Records persisted as `<root>/<kind>/record.json`
///
/// Writes go to a temporary file that is renamed over the record, so a
/// reader never sees a half-written record.
pub struct FileStore {
    root: PathBuf,
    locks: Mutex<HashMap<AgentKind, Arc<Mutex<()>>>>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        debug!(root = %root.display(), "Opened agent state store");
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Record location; names that would leave `root` are refused
    fn record_path(&self, kind: &AgentKind) -> Result<PathBuf, StoreError> {
        if !AgentKind::is_valid_name(kind.as_str()) {
            return Err(StoreError::InvalidKind(kind.to_string()));
        }
        Ok(self.root.join(kind.as_str()).join(RECORD_FILE))
    }

    fn lock_for(&self, kind: &AgentKind) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.lock().entry(kind.clone()).or_default())
    }

    fn read_record(&self, kind: &AgentKind) -> Result<Option<AgentRecord>, StoreError> {
        let path = self.record_path(kind)?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn write_record(&self, record: &AgentRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.kind)?;
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| StoreError::Io { path, source }
        };

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(io_err(dir))?;
        }
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(record)?;
        std::fs::write(&tmp, contents).map_err(io_err(tmp.as_path()))?;
        std::fs::rename(&tmp, &path).map_err(io_err(path.as_path()))?;
        Ok(())
    }
}

impl AgentStateStore for FileStore {
    fn get(&self, kind: &AgentKind) -> Result<AgentRecord, StoreError> {
        let lock = self.lock_for(kind);
        let _guard = lock.lock();
        match self.read_record(kind)? {
            Some(record) => Ok(record),
            None => {
                let record = AgentRecord::new(kind.clone());
                self.write_record(&record)?;
                Ok(record)
            }
        }
    }

    fn update(
        &self,
        kind: &AgentKind,
        mutator: &mut dyn FnMut(&mut AgentRecord),
    ) -> Result<AgentRecord, StoreError> {
        let lock = self.lock_for(kind);
        let _guard = lock.lock();
        let mut record = self
            .read_record(kind)?
            .unwrap_or_else(|| AgentRecord::new(kind.clone()));
        mutator(&mut record);
        record.touch();
        self.write_record(&record)?;
        Ok(record)
    }

    fn kinds(&self) -> Result<Vec<AgentKind>, StoreError> {
        let entries = std::fs::read_dir(&self.root).map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })?;
        let mut kinds = Vec::new();
        for entry in entries.flatten() {
            if entry.path().join(RECORD_FILE).is_file() {
                kinds.push(AgentKind::from(entry.file_name().to_string_lossy().into_owned()));
            }
        }
        kinds.sort();
        Ok(kinds)
    }
}

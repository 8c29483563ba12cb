//! File-backed record tables for the local durable storage mode.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use resilience_core::{Clock, EntityBackend, RemoteError, StoredRecord};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{LocalStoreError, RecordTable, UniqueConstraint};

/// Backend that keeps each collection in `<dir>/<collection>.json`.
///
/// Collections are loaded on first use and rewritten atomically after every
/// mutation. A write that fails to persist leaves the in-memory table
/// untouched. Without a directory the store lives only in memory.
#[derive(Clone)]
pub struct DurableBackend {
    dir: Option<PathBuf>,
    tables: Arc<Mutex<HashMap<String, RecordTable>>>,
    constraints: Arc<Vec<UniqueConstraint>>,
    clock: Arc<dyn Clock>,
}

impl DurableBackend {
    pub fn open(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self::with_dir(Some(dir.into()), clock)
    }

    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::with_dir(None, clock)
    }

    fn with_dir(dir: Option<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir,
            tables: Arc::new(Mutex::new(HashMap::new())),
            constraints: Arc::new(Vec::new()),
            clock,
        }
    }

    pub fn with_unique(mut self, collection: &str, field: &str) -> Self {
        let mut constraints = (*self.constraints).clone();
        constraints.push(UniqueConstraint::new(collection, field));
        self.constraints = Arc::new(constraints);
        self
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn collection_path(&self, collection: &str) -> Result<Option<PathBuf>, RemoteError> {
        let valid = !collection.is_empty()
            && collection
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !valid {
            return Err(RemoteError::status(
                400,
                None,
                format!("invalid collection name '{collection}'"),
            ));
        }
        Ok(self
            .dir
            .as_ref()
            .map(|dir| dir.join(format!("{collection}.json"))))
    }

    fn constraints_for(&self, collection: &str) -> Vec<UniqueConstraint> {
        self.constraints
            .iter()
            .filter(|c| c.collection == collection)
            .cloned()
            .collect()
    }

    fn read<R>(
        &self,
        collection: &str,
        f: impl FnOnce(&RecordTable) -> R,
    ) -> Result<R, RemoteError> {
        let path = self.collection_path(collection)?;
        let mut tables = self.tables.lock();
        let table = loaded(&mut tables, collection, path.as_deref())?;
        Ok(f(table))
    }

    /// Apply `f` to a copy of the table, persist it, then publish it.
    fn mutate<R>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut RecordTable) -> Result<R, RemoteError>,
    ) -> Result<R, RemoteError> {
        let path = self.collection_path(collection)?;
        let mut tables = self.tables.lock();
        let mut draft = loaded(&mut tables, collection, path.as_deref())?.clone();
        let result = f(&mut draft)?;

        if let Some(path) = path.as_deref() {
            save_table(path, collection, &draft)?;
            debug!(collection, records = draft.len(), "local collection saved");
        }
        tables.insert(collection.to_owned(), draft);
        Ok(result)
    }
}

impl std::fmt::Debug for DurableBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableBackend")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EntityBackend for DurableBackend {
    fn label(&self) -> &'static str {
        "local"
    }

    async fn insert(
        &self,
        collection: &str,
        owner_id: &str,
        fields: Value,
    ) -> Result<StoredRecord, RemoteError> {
        let constraints = self.constraints_for(collection);
        let now = self.clock.now_ms();
        self.mutate(collection, |table| {
            table.insert(owner_id, fields, now, &constraints)
        })
    }

    async fn update_if_unmodified(
        &self,
        collection: &str,
        owner_id: &str,
        id: &str,
        expected_updated_at_ms: u64,
        patch: Value,
    ) -> Result<StoredRecord, RemoteError> {
        let constraints = self.constraints_for(collection);
        let now = self.clock.now_ms();
        self.mutate(collection, |table| {
            table.update_if_unmodified(owner_id, id, expected_updated_at_ms, patch, now, &constraints)
        })
    }

    async fn delete(&self, collection: &str, owner_id: &str, id: &str) -> Result<(), RemoteError> {
        self.mutate(collection, |table| table.delete(owner_id, id))
    }

    async fn list(
        &self,
        collection: &str,
        owner_id: &str,
    ) -> Result<Vec<StoredRecord>, RemoteError> {
        self.read(collection, |table| table.list(owner_id))
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

fn loaded<'a>(
    tables: &'a mut HashMap<String, RecordTable>,
    collection: &str,
    path: Option<&Path>,
) -> Result<&'a mut RecordTable, RemoteError> {
    if !tables.contains_key(collection) {
        let table = match path {
            Some(path) => load_table(path)?.unwrap_or_default(),
            None => RecordTable::default(),
        };
        tables.insert(collection.to_owned(), table);
    }
    tables
        .get_mut(collection)
        .ok_or_else(|| RemoteError::status(500, None, "collection vanished while loading"))
}

fn load_table(path: &Path) -> Result<Option<RecordTable>, LocalStoreError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LocalStoreError::Io {
                action: "reading",
                path: path.display().to_string(),
                source,
            });
        }
    };

    serde_json::from_str::<RecordTable>(&raw)
        .map(Some)
        .map_err(|source| {
            warn!(path = %path.display(), error = %source, "local collection is unreadable");
            LocalStoreError::Corrupt {
                path: path.display().to_string(),
                source,
            }
        })
}

fn save_table(path: &Path, collection: &str, table: &RecordTable) -> Result<(), LocalStoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err("creating directory", parent))?;
    }

    let encoded = serde_json::to_vec(table).map_err(|source| LocalStoreError::Encode {
        collection: collection.to_owned(),
        source,
    })?;
    let temp_path = temp_path_for(path);
    fs::write(&temp_path, encoded).map_err(io_err("writing temp file", &temp_path))?;

    if fs::rename(&temp_path, path).is_err() {
        // Windows does not allow replacing existing files via rename.
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                let _ = fs::remove_file(&temp_path);
                return Err(io_err("replacing", path)(source));
            }
        }
        fs::rename(&temp_path, path).map_err(|source| {
            let _ = fs::remove_file(&temp_path);
            io_err("renaming into", path)(source)
        })?;
    }

    Ok(())
}

fn io_err(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> LocalStoreError {
    let path = path.display().to_string();
    move |source| LocalStoreError::Io {
        action,
        path,
        source,
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("collection.json");
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    parent.join(format!(".{file_name}.{now_nanos}.tmp"))
}

// Advisory local copies of the last known player snapshot.
use crate::{
    error::{
        Result,
        SyncError,
    },
    session::PlayerId,
    snapshot::PlayerSnapshot,
};
use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use sled::{
    Config,
    Db,
    Tree,
};
use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc,
        Mutex,
    },
};
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedSnapshot {
    pub snapshot: PlayerSnapshot,
    pub cached_at: DateTime<Utc>,
}

/// Best-effort snapshot store keyed by player identity. Writes never fail
/// towards the caller; the server stays the source of truth.
pub trait SnapshotCache: Send + Sync {
    /// write or overwrite the entry for `identity`, stamping it with the current time
    fn put(&self, identity: &PlayerId, snapshot: &PlayerSnapshot);

    /// retrieve the last entry written for `identity`
    fn get(&self, identity: &PlayerId) -> Option<CachedSnapshot>;
}

#[derive(Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<Mutex<HashMap<PlayerId, CachedSnapshot>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|guard| guard.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotCache for InMemoryCache {
    fn put(&self, identity: &PlayerId, snapshot: &PlayerSnapshot) {
        let record = CachedSnapshot {
            snapshot: snapshot.clone(),
            cached_at: Utc::now(),
        };
        match self.entries.lock() {
            Ok(mut guard) => {
                guard.insert(identity.clone(), record);
            }
            Err(_) => warn!(%identity, "snapshot cache lock poisoned; entry left stale"),
        }
    }

    fn get(&self, identity: &PlayerId) -> Option<CachedSnapshot> {
        self.entries.lock().ok()?.get(identity).cloned()
    }
}

#[derive(Clone)]
pub struct SledCache {
    tree: Tree,
}

impl SledCache {
    pub fn new(db: &Db) -> Result<Self> {
        let tree = db
            .open_tree("player_snapshots")
            .map_err(|e| SyncError::LocalStorage(format!("open player_snapshots tree: {e}")))?;
        Ok(Self { tree })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Config::default()
            .path(path)
            .open()
            .map_err(|e| SyncError::LocalStorage(format!("open sled database: {e}")))?;
        Self::new(&db)
    }

    pub fn try_put(&self, identity: &PlayerId, snapshot: &PlayerSnapshot) -> Result<()> {
        let record = CachedSnapshot {
            snapshot: snapshot.clone(),
            cached_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&record).map_err(|e| {
            SyncError::LocalStorage(format!("serialize cached snapshot: {e}"))
        })?;
        self.tree
            .insert(identity.as_str().as_bytes(), bytes)
            .map_err(|e| SyncError::LocalStorage(format!("persist cached snapshot: {e}")))?;
        self.tree
            .flush()
            .map_err(|e| SyncError::LocalStorage(format!("flush cached snapshot: {e}")))?;
        Ok(())
    }

    pub fn try_get(&self, identity: &PlayerId) -> Result<Option<CachedSnapshot>> {
        let Some(value) = self
            .tree
            .get(identity.as_str().as_bytes())
            .map_err(|e| SyncError::LocalStorage(format!("read cached snapshot: {e}")))?
        else {
            return Ok(None);
        };
        let record = serde_json::from_slice(value.as_ref()).map_err(|e| {
            SyncError::LocalStorage(format!("deserialize cached snapshot: {e}"))
        })?;
        Ok(Some(record))
    }
}

impl SnapshotCache for SledCache {
    fn put(&self, identity: &PlayerId, snapshot: &PlayerSnapshot) {
        if let Err(err) = self.try_put(identity, snapshot) {
            warn!(%identity, %err, "snapshot cache write failed; entry left stale");
        }
    }

    fn get(&self, identity: &PlayerId) -> Option<CachedSnapshot> {
        match self.try_get(identity) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%identity, %err, "snapshot cache read failed");
                None
            }
        }
    }
}

impl<T: SnapshotCache + ?Sized> SnapshotCache for Arc<T> {
    fn put(&self, identity: &PlayerId, snapshot: &PlayerSnapshot) {
        (**self).put(identity, snapshot)
    }

    fn get(&self, identity: &PlayerId) -> Option<CachedSnapshot> {
        (**self).get(identity)
    }
}

use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::Identity;
use crate::error::StoreError;

/// A pluggable mapping from [`Identity`] to stored values.
///
/// Entries are conceptually immutable: `put` for an existing key is an
/// idempotent overwrite, and implementations must tolerate concurrent
/// writers to the same key (last write wins is sufficient, because equal
/// identities imply equivalent values).
pub trait Store<T>: Send + Sync {
    fn contains(&self, id: &Identity) -> bool;

    /// Fails with [`StoreError::NotFound`] for absent keys, or an I/O error
    /// for unreadable entries.
    fn get(&self, id: &Identity) -> Result<Arc<T>, StoreError>;

    fn put(&self, id: Identity, value: Arc<T>) -> Result<(), StoreError>;

    fn invalidate(&self, id: &Identity);

    fn invalidate_all(&self);
}

struct Lru<T> {
    entries: HashMap<Identity, (Arc<T>, u64)>,
    tick: u64,
}

/// An in-process bounded store with least-recently-used eviction.
///
/// Reads bump an access stamp; when an insert pushes the store past its
/// capacity, the entry with the oldest stamp is dropped.
pub struct MemoryStore<T> {
    inner: Mutex<Lru<T>>,
    capacity: usize,
}

impl<T> MemoryStore<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Lru {
                entries: HashMap::new(),
                tick: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> Store<T> for MemoryStore<T>
where
    T: Send + Sync,
{
    fn contains(&self, id: &Identity) -> bool {
        self.inner.lock().unwrap().entries.contains_key(id)
    }

    fn get(&self, id: &Identity) -> Result<Arc<T>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;

        match inner.entries.get_mut(id) {
            Some((value, stamp)) => {
                *stamp = tick;
                Ok(Arc::clone(value))
            }
            None => Err(StoreError::NotFound(*id)),
        }
    }

    fn put(&self, id: Identity, value: Arc<T>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;
        inner.entries.insert(id, (value, tick));

        if inner.entries.len() > self.capacity {
            // Linear scan is fine at the capacities this store is meant for.
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, (_, stamp))| *stamp)
                .map(|(id, _)| *id)
            {
                inner.entries.remove(&oldest);
            }
        }

        Ok(())
    }

    fn invalidate(&self, id: &Identity) {
        self.inner.lock().unwrap().entries.remove(id);
    }

    fn invalidate_all(&self) {
        self.inner.lock().unwrap().entries.clear();
    }
}

/// A filesystem-backed store, one `<hex-identity>.cbor` file per entry.
///
/// Writes go through a temporary file followed by a rename, so concurrent
/// writers of the same key settle on last-write-wins without torn entries.
pub struct FileStore<T> {
    root: Utf8PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FileStore<T> {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            _marker: PhantomData,
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path(&self, id: &Identity) -> Utf8PathBuf {
        self.root.join(id.to_hex()).with_extension("cbor")
    }

    /// Unique per call, so concurrent writers of one key never share a
    /// temp inode.
    fn temp_path(&self, id: &Identity) -> Utf8PathBuf {
        static NONCE: AtomicU64 = AtomicU64::new(0);
        let nonce = NONCE.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(format!("{}.{}.{nonce}.tmp", id.to_hex(), std::process::id()))
    }
}

impl<T> Store<T> for FileStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn contains(&self, id: &Identity) -> bool {
        self.path(id).exists()
    }

    fn get(&self, id: &Identity) -> Result<Arc<T>, StoreError> {
        let file = match fs::File::open(self.path(id)) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(*id));
            }
            Err(err) => return Err(err.into()),
        };

        let value: T =
            ciborium::from_reader(BufReader::new(file)).map_err(std::io::Error::other)?;
        Ok(Arc::new(value))
    }

    fn put(&self, id: Identity, value: Arc<T>) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)?;

        let path = self.path(&id);
        let temp = self.temp_path(&id);

        let mut writer = BufWriter::new(fs::File::create(&temp)?);
        ciborium::into_writer(value.as_ref(), &mut writer).map_err(std::io::Error::other)?;
        writer.flush()?;
        fs::rename(&temp, &path)?;

        Ok(())
    }

    fn invalidate(&self, id: &Identity) {
        if let Err(err) = fs::remove_file(self.path(id)) {
            if err.kind() != ErrorKind::NotFound {
                tracing::warn!(identity = ?id, error = %err, "Failed to drop store entry");
            }
        }
    }

    fn invalidate_all(&self) {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return,
            Err(err) => {
                tracing::warn!(root = %self.root, error = %err, "Failed to list store root");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "cbor") {
                if let Err(err) = fs::remove_file(&path) {
                    tracing::warn!(error = %err, "Failed to drop store entry");
                }
            }
        }
    }
}

/// An LRU front over a durable back, populated lazily on read-through.
pub struct TieredStore<T> {
    front: MemoryStore<T>,
    back: FileStore<T>,
}

impl<T> TieredStore<T> {
    pub fn new(capacity: usize, root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            front: MemoryStore::new(capacity),
            back: FileStore::new(root),
        }
    }
}

impl<T> Store<T> for TieredStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn contains(&self, id: &Identity) -> bool {
        self.front.contains(id) || self.back.contains(id)
    }

    fn get(&self, id: &Identity) -> Result<Arc<T>, StoreError> {
        match self.front.get(id) {
            Ok(value) => Ok(value),
            Err(StoreError::NotFound(_)) => {
                let value = self.back.get(id)?;
                self.front.put(*id, Arc::clone(&value))?;
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }

    fn put(&self, id: Identity, value: Arc<T>) -> Result<(), StoreError> {
        self.front.put(id, Arc::clone(&value))?;
        self.back.put(id, value)
    }

    fn invalidate(&self, id: &Identity) {
        self.front.invalidate(id);
        self.back.invalidate(id);
    }

    fn invalidate_all(&self) {
        self.front.invalidate_all();
        self.back.invalidate_all();
    }
}

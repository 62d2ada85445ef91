//! Handle table shared by every connection of a server.

use {
    crate::{error::Error, fcall::INVALID_HANDLE, io_err, store::FileStore, utils::Result},
    log::{debug, info},
    std::{
        collections::HashMap,
        path::{Path, PathBuf},
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
    },
    tokio::sync::Mutex,
};

/// Maps handles to live [`FileStore`] instances.
///
/// Handles are assigned from a counter starting at 1 and are never reused,
/// so a late request naming a destroyed handle can only miss. The map is
/// guarded by one lock that is held for the map access alone: stores are
/// opened before and dropped after the critical section, and callers run
/// their filesystem work on an `Arc` clone with the lock released.
pub struct Registry<S> {
    base_dir: PathBuf,
    next: AtomicU32,
    entries: Mutex<HashMap<u32, Arc<S>>>,
}

impl<S: FileStore> Registry<S> {
    /// Create an empty registry. `CREATE` paths that are empty or relative
    /// resolve against `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Registry<S> {
        Registry {
            base_dir: base_dir.into(),
            next: AtomicU32::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory a `CREATE` for `path` binds to.
    pub fn resolve(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.base_dir.clone()
        } else {
            // `join` keeps absolute paths as they are.
            self.base_dir.join(path)
        }
    }

    fn next_handle(&self) -> Option<u32> {
        // 0 marks exhaustion: it is stored after u32::MAX was handed out.
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |h| {
                (h != INVALID_HANDLE).then(|| h.wrapping_add(1))
            })
            .ok()
    }

    /// Open a store for `path` and register it under a fresh handle.
    pub async fn create(&self, path: &str) -> Result<u32> {
        let root = self.resolve(path);
        let store = S::open(&root).await.map_err(|source| Error::ResourceInit {
            path: root.clone(),
            source,
        })?;

        let handle = self.next_handle().ok_or_else(|| Error::ResourceInit {
            path: root.clone(),
            source: io_err!(Other, "handle space exhausted"),
        })?;

        self.entries.lock().await.insert(handle, Arc::new(store));
        info!("handle {} bound to {:?}", handle, root);
        Ok(handle)
    }

    pub async fn get(&self, handle: u32) -> Option<Arc<S>> {
        self.entries.lock().await.get(&handle).cloned()
    }

    /// Like [`get`](Self::get) but a missing handle is an error.
    pub async fn lookup(&self, handle: u32) -> Result<Arc<S>> {
        self.get(handle).await.ok_or(Error::HandleNotFound(handle))
    }

    /// Remove `handle`, returning whether it existed.
    pub async fn destroy(&self, handle: u32) -> bool {
        let removed = self.entries.lock().await.remove(&handle);
        match removed {
            Some(store) => {
                info!("handle {} released ({:?})", handle, store.root());
                true
            }
            None => false,
        }
    }

    /// Remove every handle in `handles`, returning how many existed.
    pub async fn destroy_all(&self, handles: impl IntoIterator<Item = u32>) -> usize {
        let removed: Vec<Arc<S>> = {
            let mut entries = self.entries.lock().await;
            handles
                .into_iter()
                .filter_map(|h| entries.remove(&h))
                .collect()
        };
        debug!("released {} handle(s)", removed.len());
        removed.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::store::DiskStore, std::collections::HashSet};

    fn registry(base: &Path) -> Arc<Registry<DiskStore>> {
        Arc::new(Registry::new(base))
    }

    #[tokio::test]
    async fn handles_start_at_one_and_are_not_reused() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());

        let a = reg.create("a").await.unwrap();
        let b = reg.create("b").await.unwrap();
        assert_eq!((a, b), (1, 2));

        assert!(reg.destroy(a).await);
        assert!(!reg.destroy(a).await);
        assert_eq!(reg.create("a").await.unwrap(), 3);
        assert_eq!(reg.len().await, 2);
    }

    #[tokio::test]
    async fn lookup_after_destroy() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());

        let h = reg.create("").await.unwrap();
        assert_eq!(reg.lookup(h).await.unwrap().root(), tmp.path());
        reg.destroy(h).await;
        assert!(reg.get(h).await.is_none());
        assert!(matches!(reg.lookup(h).await, Err(Error::HandleNotFound(x)) if x == h));
    }

    #[tokio::test]
    async fn in_flight_clone_survives_destroy() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());

        let h = reg.create("x").await.unwrap();
        let store = reg.lookup(h).await.unwrap();
        reg.destroy(h).await;
        store.write("late.txt", b"ok").await.unwrap();
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn failed_create_registers_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("file"), b"x").unwrap();
        let reg = registry(tmp.path());

        match reg.create("file").await {
            Err(Error::ResourceInit { path, .. }) => assert_eq!(path, tmp.path().join("file")),
            r => panic!("unexpected {:?}", r.map(|_| ())),
        }
        assert!(reg.is_empty().await);
        assert_eq!(reg.create("ok").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn paths_resolve_against_base() {
        let reg: Registry<DiskStore> = Registry::new("/srv/files");
        assert_eq!(reg.resolve(""), PathBuf::from("/srv/files"));
        assert_eq!(reg.resolve("sub"), PathBuf::from("/srv/files/sub"));
        assert_eq!(reg.resolve("/tmp/x"), PathBuf::from("/tmp/x"));
    }

    #[tokio::test]
    async fn exhausted_counter() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        reg.next.store(u32::MAX, Ordering::SeqCst);

        assert_eq!(reg.create("a").await.unwrap(), u32::MAX);
        assert!(matches!(
            reg.create("b").await,
            Err(Error::ResourceInit { .. })
        ));
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_are_distinct() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());

        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let reg = reg.clone();
                tokio::spawn(async move { reg.create(&format!("d{}", i % 4)).await.unwrap() })
            })
            .collect();

        let mut seen = HashSet::new();
        for task in tasks {
            assert!(seen.insert(task.await.unwrap()));
        }
        assert_eq!(seen.len(), 64);
        assert_eq!(reg.destroy_all(seen.iter().copied().chain([999])).await, 64);
        assert!(reg.is_empty().await);
    }
}

//! Filesystem collaborator behind every handle.

use {
    crate::{fcall::MAX_READ, io_err},
    async_trait::async_trait,
    log::debug,
    std::{
        io,
        path::{Component, Path, PathBuf},
    },
    tokio::fs,
    tokio_stream::{StreamExt, wrappers::ReadDirStream},
};

/// Directory-scoped file storage a handle is bound to.
///
/// One instance is created per `CREATE` request and owned by the registry.
/// Instances are not synchronized internally: two connections working on the
/// same handle may interleave at the filesystem level.
#[async_trait]
pub trait FileStore: Send + Sync + 'static {
    /// Bind a new store to `root`.
    async fn open(root: &Path) -> io::Result<Self>
    where
        Self: Sized;

    /// The directory the store is bound to.
    fn root(&self) -> &Path;

    /// Names of the regular files in the root, sorted.
    async fn list(&self) -> io::Result<Vec<String>>;

    /// Whole contents of `name`. Files over [`MAX_READ`] bytes are refused.
    async fn read(&self, name: &str) -> io::Result<Vec<u8>>;

    /// Replace the contents of `name` with `data`, returning the byte count written.
    async fn write(&self, name: &str, data: &[u8]) -> io::Result<usize>;
}

/// [`FileStore`] backed by a directory on the local disk.
#[derive(Clone, Debug)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Map `name` to a path inside the root.
    ///
    /// Only a single plain path component is accepted, so a name can never
    /// reach outside the root.
    fn path_of(&self, name: &str) -> io::Result<PathBuf> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(file)), None) => Ok(self.root.join(file)),
            _ => Err(io_err!(InvalidInput, format!("invalid file name {:?}", name))),
        }
    }
}

#[async_trait]
impl FileStore for DiskStore {
    async fn open(root: &Path) -> io::Result<Self> {
        if !fs::try_exists(root).await? {
            fs::create_dir_all(root).await?;
        }
        if !fs::metadata(root).await?.is_dir() {
            return Err(io_err!(InvalidInput, "store root must be a directory"));
        }

        Ok(DiskStore {
            root: root.to_path_buf(),
        })
    }

    fn root(&self) -> &Path {
        &self.root
    }

    async fn list(&self) -> io::Result<Vec<String>> {
        let mut entries = ReadDirStream::new(fs::read_dir(&self.root).await?);
        let mut names = Vec::new();
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            if !entry.file_type().await?.is_file() {
                continue;
            }
            // A lossy name could not be opened again by READ.
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => debug!("skipping non UTF-8 file name {:?}", raw),
            }
        }
        names.sort();
        Ok(names)
    }

    async fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        let path = self.path_of(name)?;
        let size = fs::metadata(&path).await?.len();
        if size > MAX_READ as u64 {
            return Err(io_err!(
                InvalidData,
                format!("{:?} has {} bytes, more than one frame carries", name, size)
            ));
        }
        fs::read(path).await
    }

    async fn write(&self, name: &str, data: &[u8]) -> io::Result<usize> {
        fs::write(self.path_of(name)?, data).await?;
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("a").join("b");
        let store = DiskStore::open(&root).await.unwrap();
        assert!(root.is_dir());
        assert_eq!(store.root(), root.as_path());
    }

    #[tokio::test]
    async fn open_rejects_regular_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        let err = DiskStore::open(&file).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn write_read_list() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskStore::open(tmp.path()).await.unwrap();

        assert_eq!(store.write("b.txt", b"bee").await.unwrap(), 3);
        assert_eq!(store.write("a.txt", b"hi").await.unwrap(), 2);
        std::fs::create_dir(tmp.path().join("subdir")).unwrap();

        assert_eq!(store.read("a.txt").await.unwrap(), b"hi");
        assert_eq!(store.list().await.unwrap(), vec!["a.txt", "b.txt"]);

        // Writes replace, they do not append.
        store.write("a.txt", b"x").await.unwrap();
        assert_eq!(store.read("a.txt").await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskStore::open(tmp.path()).await.unwrap();
        let err = store.read("nope").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn oversized_file_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskStore::open(tmp.path()).await.unwrap();

        // Sparse files: nothing of this size is actually written.
        let at_limit = std::fs::File::create(tmp.path().join("fits")).unwrap();
        at_limit.set_len(MAX_READ as u64).unwrap();
        let over = std::fs::File::create(tmp.path().join("big")).unwrap();
        over.set_len(MAX_READ as u64 + 1).unwrap();

        assert_eq!(store.read("fits").await.unwrap().len(), MAX_READ);
        let err = store.read("big").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn non_utf8_names_are_not_listed() {
        use std::{ffi::OsStr, os::unix::ffi::OsStrExt};

        let tmp = tempfile::tempdir().unwrap();
        let store = DiskStore::open(tmp.path()).await.unwrap();
        std::fs::write(tmp.path().join(OsStr::from_bytes(b"bad\xff")), b"x").unwrap();
        store.write("good", b"y").await.unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["good"]);
    }

    #[tokio::test]
    async fn names_stay_inside_root() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskStore::open(&tmp.path().join("root")).await.unwrap();

        for name in ["", ".", "..", "../escape", "a/b", "/etc/passwd"] {
            let err = store.write(name, b"x").await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "{:?}", name);
        }
        assert!(!tmp.path().join("escape").exists());
    }
}

//! Filesystem primitives and the mapping between wire paths and the local root.

use std::io;
use std::path::{Component, Path, PathBuf};

use tokio::fs;
use walkdir::WalkDir;

use crate::protocol::DIGEST_LEN;
use crate::rsync::is_temp_path;

/// The synchronized directory. Wire paths are relative to it and always use
/// `/` as the separator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
    base: PathBuf,
}

impl Root {
    /// Creates the directory if needed and canonicalizes it so that watcher
    /// paths can be stripped against it.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        Ok(Self {
            base: std::fs::canonicalize(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.base
    }

    /// Maps a wire path to a local one, refusing anything that could escape
    /// the root.
    pub fn local(&self, relative: &str) -> Result<PathBuf, String> {
        if relative.is_empty() {
            return Err("empty path".to_string());
        }
        let mut local = self.base.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => local.push(part),
                Component::CurDir => {}
                _ => return Err(format!("path {relative:?} escapes the sync root")),
            }
        }
        if local == self.base {
            return Err(format!("path {relative:?} names the sync root"));
        }
        Ok(local)
    }

    /// Inverse of [`Root::local`]. `None` for the root itself and for paths
    /// outside it.
    pub fn relative(&self, path: &Path) -> Option<String> {
        let stripped = path.strip_prefix(&self.base).ok()?;
        let parts = stripped
            .components()
            .map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }
}

/// Files the synchronizer never propagates.
pub fn is_ignored(path: &Path) -> bool {
    path.file_name().is_some_and(|name| name == ".DS_Store") || is_temp_path(path)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Every entry below `root` (the root excluded), parents before children.
pub async fn list_tree(root: &Path) -> io::Result<Vec<TreeEntry>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut entries = Vec::new();
        for entry in WalkDir::new(&root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_ignored(e.path()))
        {
            let entry = entry.map_err(io::Error::from)?;
            entries.push(TreeEntry {
                is_dir: entry.file_type().is_dir(),
                path: entry.into_path(),
            });
        }
        Ok::<_, io::Error>(entries)
    })
    .await
    .map_err(io::Error::other)?
}

pub async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

pub async fn is_directory(path: &Path) -> bool {
    fs::metadata(path).await.is_ok_and(|m| m.is_dir())
}

/// Creates (or truncates) an empty file, creating parent directories.
pub async fn create(path: &Path) -> io::Result<()> {
    ensure_parent(path).await?;
    fs::File::create(path).await?;
    Ok(())
}

pub async fn create_if_absent(path: &Path) -> io::Result<()> {
    if exists(path).await {
        return Ok(());
    }
    create(path).await
}

pub async fn mkdir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path).await
}

/// Removes a file or a whole directory tree. Already gone is fine.
pub async fn delete_recursive(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

pub async fn rename(old: &Path, new: &Path) -> io::Result<()> {
    ensure_parent(new).await?;
    fs::rename(old, new).await
}

/// Opens `path` for a sequential rewrite from offset 0.
pub async fn open_for_write(path: &Path) -> io::Result<fs::File> {
    ensure_parent(path).await?;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
}

/// Whole-file digest, same width as a checksum record's content hash.
pub async fn content_hash(path: &Path) -> io::Result<[u8; DIGEST_LEN]> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = blake3::Hasher::new();
        io::copy(&mut file, &mut hasher)?;
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&hasher.finalize().as_bytes()[..DIGEST_LEN]);
        Ok::<_, io::Error>(digest)
    })
    .await
    .map_err(io::Error::other)?
}

async fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent).await,
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_wire_paths_inside_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = Root::open(dir.path()).unwrap();

        let local = root.local("sub/a.txt").unwrap();
        assert_eq!(local, root.path().join("sub").join("a.txt"));
        assert_eq!(root.relative(&local).as_deref(), Some("sub/a.txt"));
        assert_eq!(root.relative(root.path()), None);
        assert_eq!(root.relative(Path::new("/elsewhere/x")), None);
    }

    #[test]
    fn rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let root = Root::open(dir.path()).unwrap();
        assert!(root.local("../etc/passwd").is_err());
        assert!(root.local("a/../../b").is_err());
        assert!(root.local("/etc/passwd").is_err());
        assert!(root.local("").is_err());
        assert!(root.local(".").is_err());
    }

    #[test]
    fn ignores_os_artifacts_and_scratch_files() {
        assert!(is_ignored(Path::new("/x/.DS_Store")));
        assert!(is_ignored(Path::new("/x/a.txt.dirsync-tmp")));
        assert!(!is_ignored(Path::new("/x/a.txt")));
    }

    #[tokio::test]
    async fn list_tree_is_sorted_and_skips_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = Root::open(dir.path()).unwrap();
        std::fs::create_dir_all(root.path().join("sub/deeper")).unwrap();
        std::fs::write(root.path().join("sub/deeper/z.txt"), b"z").unwrap();
        std::fs::write(root.path().join("a.txt"), b"hello").unwrap();
        std::fs::write(root.path().join(".DS_Store"), b"junk").unwrap();

        let entries = list_tree(root.path()).await.unwrap();
        let listed: Vec<_> = entries
            .iter()
            .map(|e| (root.relative(&e.path).unwrap(), e.is_dir))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("a.txt".to_string(), false),
                ("sub".to_string(), true),
                ("sub/deeper".to_string(), true),
                ("sub/deeper/z.txt".to_string(), false),
            ]
        );
    }

    #[tokio::test]
    async fn primitives() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();

        let file = base.join("n/e/w.txt");
        create(&file).await.unwrap();
        assert!(exists(&file).await);
        assert!(!is_directory(&file).await);
        assert_eq!(std::fs::metadata(&file).unwrap().len(), 0);

        std::fs::write(&file, b"keep").unwrap();
        create_if_absent(&file).await.unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"keep");

        let moved = base.join("m/w.txt");
        rename(&file, &moved).await.unwrap();
        assert!(!exists(&file).await);
        assert_eq!(
            content_hash(&moved).await.unwrap(),
            crate::rsync::strong_hash(b"keep")
        );

        delete_recursive(&base.join("n")).await.unwrap();
        assert!(!exists(&base.join("n")).await);
        delete_recursive(&base.join("never-existed")).await.unwrap();
    }
}

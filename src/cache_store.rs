use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use log::debug;
use log::trace;
use tokio::io::AsyncReadExt as _;
use tokio::io::AsyncWriteExt as _;

use crate::error::ProxyCacheError;
use crate::uri_path::HashPath;

/// Longest cache path, in characters, that is still cached.
pub(crate) const MAX_CACHE_PATH_LEN: usize = 248;

const REDIRECT_STUB_STATUS: &str = "HTTP/1.1 301 Moved Permanently\r\n";
const REDIRECT_STUB_PREFIX: &[u8] = REDIRECT_STUB_STATUS.as_bytes();

/// Upper bound on the size of a redirect stub read back from the cache.
const REDIRECT_STUB_MAX_LEN: u64 = 8 * 1024;

/// Outcome of preparing a cache path for a download.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CacheSlot {
    /// A non-empty entry of the given size already exists.
    Satisfied(u64),
    /// The path is free and its directory exists.
    Vacant,
}

/// Filesystem-backed cache tree rooted at a single directory.
#[derive(Clone, Debug)]
pub(crate) struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    #[must_use]
    pub(crate) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the entry for `file_name` inside bucket `hash_path`.
    ///
    /// Only normal components of `file_name` are used, so a name can never
    /// leave its bucket.
    #[must_use]
    pub(crate) fn entry_path(&self, hash_path: &HashPath, file_name: &str) -> PathBuf {
        let mut path = self.root.join(hash_path.as_path());
        path.extend(
            Path::new(file_name)
                .components()
                .filter(|c| matches!(c, Component::Normal(_))),
        );
        path
    }

    #[must_use]
    pub(crate) fn is_cacheable(path: &Path) -> bool {
        path.as_os_str().len() <= MAX_CACHE_PATH_LEN
    }

    /// Size of the regular file at `path`, `0` when absent or unreadable.
    pub(crate) async fn size(path: &Path) -> u64 {
        match tokio::fs::metadata(path).await {
            Ok(md) if md.is_file() => md.len(),
            Ok(_) => 0,
            Err(err) => {
                trace!("No cache entry at `{}`:  {err}", path.display());
                0
            }
        }
    }

    pub(crate) async fn ensure_parent(path: &Path) -> Result<(), ProxyCacheError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Removes the entry at `path`; a missing entry is not an error.
    pub(crate) async fn delete(path: &Path) -> Result<(), ProxyCacheError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!("Removed cache entry `{}`", path.display());
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) async fn create(path: &Path) -> Result<tokio::fs::File, ProxyCacheError> {
        Ok(tokio::fs::File::create(path).await?)
    }

    /// Makes `path` ready for a download: ensures its directory, and either
    /// reports an existing non-empty entry or clears whatever is there.
    pub(crate) async fn prepare(
        path: &Path,
        force_replace: bool,
    ) -> Result<CacheSlot, ProxyCacheError> {
        Self::ensure_parent(path).await?;

        let size = Self::size(path).await;
        if size > 0 && !force_replace {
            return Ok(CacheSlot::Satisfied(size));
        }

        Self::delete(path).await?;

        Ok(CacheSlot::Vacant)
    }

    /// Leaves a minimal 301 response at `path` pointing at `location`.
    pub(crate) async fn write_redirect_stub(
        path: &Path,
        location: &str,
    ) -> Result<(), ProxyCacheError> {
        Self::ensure_parent(path).await?;

        let location_line = format!("Location: {location}\r\n\r\n");
        let mut file = Self::create(path).await?;
        file.write_all(REDIRECT_STUB_PREFIX).await?;
        file.write_all(location_line.as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }

    #[must_use]
    pub(crate) fn is_redirect_stub(content: &[u8]) -> bool {
        content.starts_with(REDIRECT_STUB_PREFIX)
    }

    /// Location a redirect stub points at; `None` for any other content.
    #[must_use]
    pub(crate) fn redirect_target(content: &str) -> Option<&str> {
        content
            .strip_prefix(REDIRECT_STUB_STATUS)?
            .lines()
            .find_map(|line| line.strip_prefix("Location: "))
            .map(str::trim_end)
            .filter(|location| !location.is_empty())
    }

    /// Target of the redirect stub at `path`; `None` when the entry is missing
    /// or holds a regular body.
    pub(crate) async fn read_redirect_target(path: &Path) -> Option<String> {
        let file = tokio::fs::File::open(path).await.ok()?;
        let mut head = Vec::new();
        file.take(REDIRECT_STUB_MAX_LEN)
            .read_to_end(&mut head)
            .await
            .ok()?;

        Self::redirect_target(&String::from_utf8_lossy(&head)).map(str::to_string)
    }

    /// Reads a cache entry as text, replacing invalid UTF-8. A missing or
    /// unreadable entry yields `None`.
    pub(crate) async fn read_text(path: &Path) -> Option<String> {
        match tokio::fs::read(path).await {
            Ok(content) => Some(String::from_utf8_lossy(&content).into_owned()),
            Err(err) => {
                debug!("Failed to read cache entry `{}`:  {err}", path.display());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_path_stays_in_bucket() {
        let store = CacheStore::new(PathBuf::from("/srv/cache"));
        let hash_path = HashPath {
            bucket1: 12,
            bucket2: 345,
        };

        assert_eq!(
            store.entry_path(&hash_path, "example.com/index.html"),
            Path::new("/srv/cache/12/345/example.com/index.html")
        );
        assert_eq!(
            store.entry_path(&hash_path, "/example.com/../../etc/passwd"),
            Path::new("/srv/cache/12/345/example.com/etc/passwd")
        );
        assert_eq!(store.entry_path(&hash_path, ""), Path::new("/srv/cache/12/345"));
    }

    #[test]
    fn cacheable_path_length() {
        let short = PathBuf::from(format!("/c/{}", "a".repeat(245)));
        let long = PathBuf::from(format!("/c/{}", "a".repeat(246)));

        assert_eq!(short.as_os_str().len(), 248);
        assert!(CacheStore::is_cacheable(&short));
        assert!(!CacheStore::is_cacheable(&long));
    }

    #[tokio::test]
    async fn prepare_respects_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1/2/example.com/index.html");

        assert_eq!(CacheStore::prepare(&path, false).await.unwrap(), CacheSlot::Vacant);
        assert!(path.parent().unwrap().is_dir());

        tokio::fs::write(&path, b"cached").await.unwrap();
        assert_eq!(
            CacheStore::prepare(&path, false).await.unwrap(),
            CacheSlot::Satisfied(6)
        );
        assert!(path.exists());

        assert_eq!(CacheStore::prepare(&path, true).await.unwrap(), CacheSlot::Vacant);
        assert!(!path.exists());

        tokio::fs::write(&path, b"").await.unwrap();
        assert_eq!(CacheStore::prepare(&path, false).await.unwrap(), CacheSlot::Vacant);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn delete_and_size_of_missing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.html");

        assert_eq!(CacheStore::size(&path).await, 0);
        assert_eq!(CacheStore::size(dir.path()).await, 0);
        CacheStore::delete(&path).await.unwrap();
        assert_eq!(CacheStore::read_text(&path).await, None);
    }

    #[tokio::test]
    async fn redirect_stub_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/old.html");

        CacheStore::write_redirect_stub(&path, "http://example.com/new.html")
            .await
            .unwrap();

        let content = tokio::fs::read(&path).await.unwrap();
        assert_eq!(
            content,
            b"HTTP/1.1 301 Moved Permanently\r\nLocation: http://example.com/new.html\r\n\r\n"
        );
        assert!(CacheStore::is_redirect_stub(&content));
        assert!(!CacheStore::is_redirect_stub(b"<html></html>"));

        let text = String::from_utf8(content).unwrap();
        assert_eq!(
            CacheStore::redirect_target(&text),
            Some("http://example.com/new.html")
        );
        assert_eq!(CacheStore::redirect_target("Location: http://example.com/"), None);
        assert_eq!(
            CacheStore::read_redirect_target(&path).await.as_deref(),
            Some("http://example.com/new.html")
        );

        let body = dir.path().join("a/b/body.html");
        tokio::fs::write(&body, b"<html></html>").await.unwrap();
        assert_eq!(CacheStore::read_redirect_target(&body).await, None);
        assert_eq!(CacheStore::read_redirect_target(&dir.path().join("none")).await, None);
    }

    #[tokio::test]
    async fn read_text_is_lossy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        tokio::fs::write(&path, b"caf\xe9 <cite>").await.unwrap();

        assert_eq!(
            CacheStore::read_text(&path).await.as_deref(),
            Some("caf\u{fffd} <cite>")
        );
    }
}

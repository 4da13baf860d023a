use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use flate2::Compression;
use flate2::write::GzEncoder;
use log::debug;
use parking_lot::Mutex;

use crate::cache_store::CacheStore;
use crate::error::ProxyCacheError;
use crate::mkstemp;
use crate::record::RequestRecord;
use crate::record::RequestStatus;
use crate::uri_path::HashPath;

const PACKAGE_EXTENSION: &str = "gzip";

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    /// The entry is already cached with the given size.
    CacheHit(u64),
    Queued,
    AlreadyQueued,
}

/// Node-wide queue of requests awaiting fulfillment, keyed by item id and
/// kept in admission order.
#[derive(Debug, Default)]
pub(crate) struct RequestQueue {
    entries: Mutex<Vec<RequestRecord>>,
}

impl RequestQueue {
    /// Consults the cache first; only misses are queued.
    pub(crate) async fn admit(&self, record: RequestRecord) -> Admission {
        let size = CacheStore::size(&record.cache_file_name).await;
        if size > 0 {
            return Admission::CacheHit(size);
        }

        if self.enqueue(record) {
            Admission::Queued
        } else {
            Admission::AlreadyQueued
        }
    }

    /// Adds `record` as pending unless an open entry with its item id exists.
    ///
    /// Callers only enqueue cache misses, so a finished entry with the same
    /// item id failed or lost its cache file and is reopened for another try.
    pub(crate) fn enqueue(&self, mut record: RequestRecord) -> bool {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.iter_mut().find(|e| e.item_id() == record.item_id()) {
            if matches!(entry.status, RequestStatus::Pending | RequestStatus::Downloading) {
                return false;
            }

            debug!("Reopening {} entry for {}", entry.status, entry.uri());
            entry.status = RequestStatus::Pending;
            entry.start_time = record.start_time;
            entry.finish_time = None;
            entry.file_size = 0;
            return true;
        }

        record.status = RequestStatus::Pending;
        entries.push(record);
        true
    }

    /// Removes the entry with `item_id`; `false` when there was none.
    pub(crate) fn remove(&self, item_id: &str) -> bool {
        let mut entries = self.entries.lock();

        match entries.iter().position(|e| e.item_id() == item_id) {
            Some(pos) => {
                entries.remove(pos);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    #[must_use]
    pub(crate) fn contains(&self, item_id: &str) -> bool {
        self.entries.lock().iter().any(|e| e.item_id() == item_id)
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub(crate) fn snapshot(&self) -> Vec<RequestRecord> {
        self.entries.lock().clone()
    }

    /// Claims every pending entry by marking it downloading.
    #[must_use]
    pub(crate) fn claim_pending(&self) -> Vec<RequestRecord> {
        let mut entries = self.entries.lock();

        entries
            .iter_mut()
            .filter(|e| e.status == RequestStatus::Pending)
            .map(|e| {
                e.status = RequestStatus::Downloading;
                e.clone()
            })
            .collect()
    }

    /// Stores the outcome of a claimed entry; a removed entry stays removed.
    pub(crate) fn update(&self, record: &RequestRecord) {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.iter_mut().find(|e| e.item_id() == record.item_id()) {
            entry.status = record.status;
            entry.file_size = record.file_size;
            entry.finish_time = record.finish_time;
        }
    }
}

/// Package path of a cache entry: `<packages>/<hash path>/<file name>.gzip`.
#[must_use]
pub(crate) fn package_path(packages_root: &Path, hash_path: &HashPath, file_name: &str) -> PathBuf {
    let packages = CacheStore::new(packages_root.to_path_buf());
    let mut path = packages.entry_path(hash_path, file_name).into_os_string();
    path.push(".");
    path.push(PACKAGE_EXTENSION);
    PathBuf::from(path)
}

/// Compresses the cache entry of `record` into its package and returns the
/// package path. The package appears atomically.
pub(crate) async fn write_package(
    packages_root: &Path,
    record: &RequestRecord,
) -> Result<PathBuf, ProxyCacheError> {
    let package = package_path(packages_root, &record.hash_path, &record.file_name);
    let source = record.cache_file_name.clone();
    let target = package.clone();

    tokio::task::spawn_blocking(move || compress_into(&source, &target))
        .await
        .map_err(|err| ProxyCacheError::Io(std::io::Error::other(err)))??;

    debug!(
        "Packaged `{}` into `{}`",
        record.cache_file_name.display(),
        package.display()
    );

    Ok(package)
}

fn compress_into(source: &Path, target: &Path) -> Result<(), ProxyCacheError> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = std::fs::read(source)?;
    let (file, tmp_path) = mkstemp(target)?;

    if let Err(err) = gzip_into(file, &content).and_then(|()| std::fs::rename(&tmp_path, target))
    {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(err.into());
    }

    Ok(())
}

fn gzip_into(file: std::fs::File, content: &[u8]) -> std::io::Result<()> {
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(content)?;
    encoder.finish()?.sync_all()
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;

    use flate2::read::GzDecoder;

    use super::*;

    fn record(cache: &CacheStore, uri: &str) -> RequestRecord {
        RequestRecord::new(cache, uri, "", "")
    }

    #[test]
    fn enqueue_rejects_duplicates() {
        let cache = CacheStore::new(PathBuf::from("/srv/cache"));
        let queue = RequestQueue::default();

        assert!(queue.enqueue(record(&cache, "http://example.com/a.html")));
        assert!(!queue.enqueue(record(&cache, "http://example.com/a.html")));
        assert!(queue.enqueue(record(&cache, "http://example.com/b.html")));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn finished_entries_are_reopened() {
        let cache = CacheStore::new(PathBuf::from("/srv/cache"));
        let queue = RequestQueue::default();
        queue.enqueue(record(&cache, "http://example.com/a.html"));
        queue.enqueue(record(&cache, "http://example.com/b.html"));

        let mut claimed = queue.claim_pending();
        claimed[0].finish(RequestStatus::Failed);
        queue.update(&claimed[0]);
        claimed[1].file_size = 9;
        claimed[1].finish(RequestStatus::Completed);
        queue.update(&claimed[1]);

        assert!(queue.enqueue(record(&cache, "http://example.com/a.html")));
        assert!(queue.enqueue(record(&cache, "http://example.com/b.html")));
        assert!(!queue.enqueue(record(&cache, "http://example.com/a.html")));
        assert_eq!(queue.len(), 2);

        for entry in queue.snapshot() {
            assert_eq!(entry.status, RequestStatus::Pending);
            assert_eq!(entry.finish_time, None);
            assert_eq!(entry.file_size, 0);
        }
        assert_eq!(queue.claim_pending().len(), 2);
    }

    #[test]
    fn downloading_entries_are_not_reopened() {
        let cache = CacheStore::new(PathBuf::from("/srv/cache"));
        let queue = RequestQueue::default();
        queue.enqueue(record(&cache, "http://example.com/a.html"));

        assert_eq!(queue.claim_pending().len(), 1);
        assert!(!queue.enqueue(record(&cache, "http://example.com/a.html")));
        assert!(queue.claim_pending().is_empty());
    }

    #[test]
    fn remove_reports_presence() {
        let cache = CacheStore::new(PathBuf::from("/srv/cache"));
        let queue = RequestQueue::default();
        let rec = record(&cache, "http://example.com/a.html");
        let id = rec.item_id().to_string();

        assert!(!queue.remove(&id));
        queue.enqueue(rec);
        assert!(queue.contains(&id));
        assert!(queue.remove(&id));
        assert!(!queue.remove(&id));
        assert!(!queue.contains(&id));
    }

    #[test]
    fn claim_and_update() {
        let cache = CacheStore::new(PathBuf::from("/srv/cache"));
        let queue = RequestQueue::default();
        queue.enqueue(record(&cache, "http://example.com/a.html"));
        queue.enqueue(record(&cache, "http://example.com/b.html"));

        let mut claimed = queue.claim_pending();
        assert_eq!(claimed.len(), 2);
        assert!(queue.claim_pending().is_empty());

        claimed[0].file_size = 42;
        claimed[0].finish(RequestStatus::Completed);
        queue.update(&claimed[0]);

        queue.remove(claimed[1].item_id());
        claimed[1].finish(RequestStatus::Failed);
        queue.update(&claimed[1]);

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, RequestStatus::Completed);
        assert_eq!(snapshot[0].file_size, 42);
    }

    #[tokio::test]
    async fn admit_checks_cache_first() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path().to_path_buf());
        let queue = RequestQueue::default();

        let cached = record(&cache, "http://example.com/cached.html");
        CacheStore::ensure_parent(&cached.cache_file_name).await.unwrap();
        tokio::fs::write(&cached.cache_file_name, b"12345").await.unwrap();

        assert_eq!(queue.admit(cached).await, Admission::CacheHit(5));
        assert_eq!(
            queue.admit(record(&cache, "http://example.com/new.html")).await,
            Admission::Queued
        );
        assert_eq!(
            queue.admit(record(&cache, "http://example.com/new.html")).await,
            Admission::AlreadyQueued
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn package_naming() {
        let hash_path = HashPath {
            bucket1: 1,
            bucket2: 2,
        };

        assert_eq!(
            package_path(Path::new("/srv/packages"), &hash_path, "example.com/index.html"),
            Path::new("/srv/packages/1/2/example.com/index.html.gzip")
        );
    }

    #[tokio::test]
    async fn package_decompresses_to_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path().join("cache"));
        let packages = dir.path().join("packages");

        let rec = record(&cache, "http://example.com/page.html");
        CacheStore::ensure_parent(&rec.cache_file_name).await.unwrap();
        let content = b"<html>".repeat(100);
        tokio::fs::write(&rec.cache_file_name, &content).await.unwrap();

        let package = write_package(&packages, &rec).await.unwrap();
        assert!(package.starts_with(&packages));
        assert!(package.to_string_lossy().ends_with("page.html.gzip"));

        let mut decoded = Vec::new();
        GzDecoder::new(std::fs::File::open(&package).unwrap())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, content);

        let leftovers = std::fs::read_dir(package.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn package_of_missing_entry_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path().join("cache"));
        let rec = record(&cache, "http://example.com/missing.html");

        assert!(write_package(&dir.path().join("packages"), &rec).await.is_err());
    }
}

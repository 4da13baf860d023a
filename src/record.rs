use std::hash::Hash;
use std::hash::Hasher;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Notify;

use crate::cache_store::CacheStore;
use crate::uri_path::HashPath;
use crate::uri_path::to_file_path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RequestStatus {
    Failed,
    Pending,
    Downloading,
    Completed,
}

impl RequestStatus {
    /// Numeric code used in log lines.
    #[must_use]
    pub(crate) const fn code(self) -> i32 {
        match self {
            Self::Failed => -1,
            Self::Pending => 0,
            Self::Downloading => 1,
            Self::Completed => 2,
        }
    }

    #[must_use]
    pub(crate) const fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::Failed),
            0 => Some(Self::Pending),
            1 => Some(Self::Downloading),
            2 => Some(Self::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed => f.write_str("failed"),
            Self::Pending => f.write_str("pending"),
            Self::Downloading => f.write_str("downloading"),
            Self::Completed => f.write_str("completed"),
        }
    }
}

/// Fixed set of one-shot completion signals shared by the children of a
/// fan-out and the parent waiting for them.
#[derive(Debug)]
pub(crate) struct CompletionSet {
    signals: Box<[AtomicBool]>,
    remaining: AtomicUsize,
    notify: Notify,
}

impl CompletionSet {
    #[must_use]
    pub(crate) fn new(children: usize) -> Arc<Self> {
        Arc::new(Self {
            signals: (0..children).map(|_| AtomicBool::new(false)).collect(),
            remaining: AtomicUsize::new(children),
            notify: Notify::new(),
        })
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.signals.len()
    }

    /// Signals completion of `child`. Out-of-range indices and repeated
    /// signals are ignored.
    pub(crate) fn set(&self, child: usize) {
        let Some(signal) = self.signals.get(child) else {
            return;
        };

        if !signal.swap(true, Ordering::AcqRel)
            && self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
        {
            self.notify.notify_waiters();
        }
    }

    #[cfg(test)]
    #[must_use]
    pub(crate) fn is_set(&self, child: usize) -> bool {
        self.signals
            .get(child)
            .is_some_and(|signal| signal.load(Ordering::Acquire))
    }

    #[must_use]
    pub(crate) fn is_complete(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }

    /// Resolves once every child has signalled.
    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }
}

/// A single client request and its progress. Two records are equal when their
/// URIs are equal.
#[derive(Clone, Debug)]
pub(crate) struct RequestRecord {
    uri: String,
    item_id: String,
    pub(crate) file_name: String,
    pub(crate) hash_path: HashPath,
    pub(crate) cache_file_name: PathBuf,
    pub(crate) status: RequestStatus,
    pub(crate) file_size: u64,
    pub(crate) start_time: OffsetDateTime,
    pub(crate) finish_time: Option<OffsetDateTime>,
    pub(crate) anchor_text: String,
    pub(crate) referer_uri: String,
    child_number: usize,
    completion: Option<Arc<CompletionSet>>,
}

impl RequestRecord {
    #[must_use]
    pub(crate) fn new(cache: &CacheStore, uri: &str, anchor_text: &str, referer: &str) -> Self {
        let file_name = to_file_path(uri);
        let hash_path = HashPath::from_file_name(&file_name);

        Self {
            uri: uri.to_string(),
            item_id: hash_path.item_id(),
            cache_file_name: cache.entry_path(&hash_path, &file_name),
            file_name,
            hash_path,
            status: RequestStatus::Pending,
            file_size: 0,
            start_time: OffsetDateTime::now_utc(),
            finish_time: None,
            anchor_text: anchor_text.to_string(),
            referer_uri: referer.to_string(),
            child_number: 0,
            completion: None,
        }
    }

    #[must_use]
    pub(crate) fn uri(&self) -> &str {
        &self.uri
    }

    #[must_use]
    pub(crate) fn item_id(&self) -> &str {
        &self.item_id
    }

    #[must_use]
    pub(crate) fn child_number(&self) -> usize {
        self.child_number
    }

    /// A `None` timeout never expires.
    #[must_use]
    pub(crate) fn is_timed_out(&self, timeout: Option<Duration>) -> bool {
        self.is_timed_out_at(timeout, OffsetDateTime::now_utc())
    }

    #[must_use]
    fn is_timed_out_at(&self, timeout: Option<Duration>, now: OffsetDateTime) -> bool {
        timeout.is_some_and(|timeout| now - self.start_time >= timeout)
    }

    /// Makes this record child `child_number` of a fan-out.
    pub(crate) fn attach_completion(
        &mut self,
        completion: Arc<CompletionSet>,
        child_number: usize,
    ) {
        self.completion = Some(completion);
        self.child_number = child_number;
    }

    /// Signals this record's slot in its fan-out, if any.
    pub(crate) fn set_done(&self) {
        if let Some(completion) = &self.completion {
            completion.set(self.child_number);
        }
    }

    pub(crate) fn finish(&mut self, status: RequestStatus) {
        self.status = status;
        self.finish_time = Some(OffsetDateTime::now_utc());
    }
}

impl PartialEq for RequestRecord {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
    }
}

impl Eq for RequestRecord {}

impl Hash for RequestRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uri.hash(state);
    }
}

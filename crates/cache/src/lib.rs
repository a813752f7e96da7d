//! helmsync package cache: chart archives fetched from chart repositories,
//! stored under the cache directory and never fetched twice. Concurrent
//! callers for one archive share a single download and its outcome.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Identity of a chart archive: repository URL, chart name and version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageKey {
    pub repository: String,
    pub name: String,
    pub version: String,
}

impl PackageKey {
    pub fn new(repository: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self { repository: repository.into(), name: name.into(), version: version.into() }
    }

    pub fn file_name(&self) -> String {
        format!("{}-{}.tgz", self.name, self.version)
    }
}

/// Cloneable so every caller waiting on one download gets its error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("fetching {name}-{version} from {repository}: {reason}")]
    Download { repository: String, name: String, version: String, reason: String },
    #[error("chart cache io: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        FetchError::Io(Arc::new(e))
    }
}

impl FetchError {
    pub fn download(key: &PackageKey, reason: impl Into<String>) -> Self {
        FetchError::Download {
            repository: key.repository.clone(),
            name: key.name.clone(),
            version: key.version.clone(),
            reason: reason.into(),
        }
    }
}

/// Fetches a chart archive from its repository.
#[async_trait::async_trait]
pub trait ChartDownloader: Send + Sync {
    /// Write the archive for `key` to the file `dest`.
    async fn download(&self, key: &PackageKey, dest: &Path) -> Result<(), FetchError>;
}

type InFlight = Shared<BoxFuture<'static, Result<PathBuf, FetchError>>>;

enum Entry {
    Ready(PathBuf),
    Fetching(InFlight),
}

pub struct PackageCache {
    dir: PathBuf,
    downloader: Arc<dyn ChartDownloader>,
    entries: Mutex<FxHashMap<PackageKey, Entry>>,
    part_seq: AtomicU64,
}

impl PackageCache {
    pub fn new(dir: impl Into<PathBuf>, downloader: Arc<dyn ChartDownloader>) -> Self {
        Self { dir: dir.into(), downloader, entries: Mutex::new(FxHashMap::default()), part_seq: AtomicU64::new(0) }
    }

    /// Where the archive for `key` lives once fetched.
    pub fn artifact_path(&self, key: &PackageKey) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.repository.as_bytes()));
        self.dir.join(&digest[..16]).join(key.file_name())
    }

    /// Local path of the chart archive, downloading it first if needed.
    /// Concurrent callers for the same key share a single download and all
    /// see its result, error included. A failed download is forgotten once it
    /// settles, so the next call tries again.
    pub async fn fetch(&self, repository: &str, name: &str, version: &str) -> Result<PathBuf, FetchError> {
        let key = PackageKey::new(repository, name, version);
        let inflight = {
            let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            match entries.get(&key) {
                Some(Entry::Ready(path)) => return Ok(path.clone()),
                Some(Entry::Fetching(f)) => f.clone(),
                None => {
                    let f = self.start_fetch(key.clone());
                    entries.insert(key.clone(), Entry::Fetching(f.clone()));
                    f
                }
            }
        };
        let result = inflight.clone().await;

        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        // Only settle the entry this call waited on; a retry may already own the slot.
        if matches!(entries.get(&key), Some(Entry::Fetching(f)) if f.ptr_eq(&inflight)) {
            match &result {
                Ok(path) => {
                    entries.insert(key, Entry::Ready(path.clone()));
                }
                Err(_) => {
                    entries.remove(&key);
                }
            }
        }
        result
    }

    fn start_fetch(&self, key: PackageKey) -> InFlight {
        let path = self.artifact_path(&key);
        let part = path.with_extension(format!("tgz.part-{}", self.part_seq.fetch_add(1, Ordering::Relaxed)));
        let downloader = Arc::clone(&self.downloader);
        async move { fetch_uncached(downloader.as_ref(), &key, path, part).await }.boxed().shared()
    }
}

async fn fetch_uncached(downloader: &dyn ChartDownloader, key: &PackageKey, path: PathBuf, part: PathBuf) -> Result<PathBuf, FetchError> {
    if tokio::fs::try_exists(&path).await? {
        debug!(chart = %key.name, version = %key.version, path = %path.display(), "chart already in cache");
        counter!("chart_cache_hits_total", 1u64);
        return Ok(path);
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let started = Instant::now();
    counter!("chart_fetch_total", 1u64);
    if let Err(e) = downloader.download(key, &part).await {
        let _ = tokio::fs::remove_file(&part).await;
        counter!("chart_fetch_errors_total", 1u64);
        return Err(e);
    }
    tokio::fs::rename(&part, &path).await?;
    histogram!("chart_fetch_ms", started.elapsed().as_secs_f64() * 1000.0);
    info!(repository = %key.repository, chart = %key.name, version = %key.version, "chart fetched");
    Ok(path)
}

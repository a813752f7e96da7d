//! helmsync chart sources: one record per `HelmRelease` that takes its chart
//! from git, holding the exported checkout and the last synced revision.
//!
//! Reconciliation reads a source through [`ChartSourceLock`]; only
//! [`ChartSourceRegistry::sync_mirrors`] replaces the export and advances
//! the head.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use helmsync_core::{ChartSourceSpec, DesiredRelease, ResourceKey};
use metrics::{counter, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

pub mod git;

pub use git::GitMirrors;

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("git {args}: {stderr}")]
    Git { args: String, stderr: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("ref {git_ref} not found in {url}")]
    RefNotFound { url: String, git_ref: String },
}

/// Local mirrors of git repositories.
#[async_trait::async_trait]
pub trait Mirrors: Send + Sync {
    /// Make sure a mirror for `url` exists. Returns false while it is not usable yet.
    async fn ensure(&self, url: &str) -> Result<bool, MirrorError>;
    /// Fetch new commits from upstream.
    async fn refresh(&self, url: &str) -> Result<(), MirrorError>;
    /// Commit currently pointed to by `git_ref` in the mirror.
    async fn head(&self, url: &str, git_ref: &str) -> Result<String, MirrorError>;
    /// Write a checkout of `revision` into `dest`, which must not exist yet.
    async fn export(&self, url: &str, revision: &str, dest: &Path) -> Result<(), MirrorError>;
}

/// Last synced revision of a chart source. `seq` grows by one on every advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    revision: String,
    seq: u64,
}

impl Head {
    pub fn revision(&self) -> &str { &self.revision }
    pub fn seq(&self) -> u64 { self.seq }
}

struct SourceState {
    export_dir: PathBuf,
    head: Head,
}

impl SourceState {
    /// Swap in a new export and advance the head; returns the replaced directory.
    fn advance(&mut self, export_dir: PathBuf, revision: String) -> PathBuf {
        self.head = Head { revision, seq: self.head.seq + 1 };
        std::mem::replace(&mut self.export_dir, export_dir)
    }
}

/// Chart source tracked for a single resource.
pub struct ChartSource {
    key: ResourceKey,
    url: String,
    git_ref: String,
    state: Arc<tokio::sync::Mutex<SourceState>>,
}

impl ChartSource {
    /// Acquire this source's lock. The export and head stay put until the
    /// returned guard is dropped.
    pub async fn lock(&self) -> ChartSourceLock {
        ChartSourceLock { guard: Arc::clone(&self.state).lock_owned().await }
    }
}

/// Read-only view of a locked chart source.
pub struct ChartSourceLock {
    guard: OwnedMutexGuard<SourceState>,
}

impl ChartSourceLock {
    pub fn export_dir(&self) -> &Path { &self.guard.export_dir }
    pub fn head(&self) -> &Head { &self.guard.head }
    pub fn chart_path(&self, rel: &str) -> PathBuf { self.guard.export_dir.join(rel) }
}

/// Registry of chart sources keyed by resource identity.
pub struct ChartSourceRegistry {
    mirrors: Arc<dyn Mirrors>,
    export_root: PathBuf,
    sources: Mutex<FxHashMap<ResourceKey, Arc<ChartSource>>>,
    export_seq: AtomicU64,
}

impl ChartSourceRegistry {
    pub fn new(mirrors: Arc<dyn Mirrors>, export_root: impl Into<PathBuf>) -> Self {
        Self {
            mirrors,
            export_root: export_root.into(),
            sources: Mutex::new(FxHashMap::default()),
            export_seq: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize { self.map().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn map(&self) -> std::sync::MutexGuard<'_, FxHashMap<ResourceKey, Arc<ChartSource>>> {
        self.sources.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Chart source for `hr`, created on first reference. `None` when `hr`
    /// does not use a git chart or its mirror is not ready yet.
    pub async fn load(&self, hr: &DesiredRelease) -> Option<Arc<ChartSource>> {
        let ChartSourceSpec::Git { git, git_ref, .. } = &hr.spec.chart else { return None };
        let git_ref = git_ref.as_deref().unwrap_or(ChartSourceSpec::DEFAULT_REF);
        let key = hr.key();

        let stale = {
            let mut map = self.map();
            let current = map.get(&key).cloned();
            match current {
                Some(src) if src.url == *git && src.git_ref == git_ref => return Some(src),
                Some(_) => map.remove(&key),
                None => None,
            }
        };
        if let Some(old) = stale {
            debug!(resource = %key, "chart source changed; dropping previous export");
            self.discard(old).await;
        }

        match self.create(&key, git, git_ref).await {
            Ok(Some(created)) => {
                let (src, loser) = {
                    let mut map = self.map();
                    let existing = map.get(&key).cloned();
                    match existing {
                        Some(existing) => (existing, Some(created)),
                        None => {
                            map.insert(key.clone(), Arc::clone(&created));
                            (created, None)
                        }
                    }
                };
                if let Some(loser) = loser {
                    self.discard(loser).await;
                }
                Some(src)
            }
            Ok(None) => {
                info!(resource = %key, url = %git, "git mirror not ready yet");
                None
            }
            Err(e) => {
                warn!(resource = %key, url = %git, error = %e, "unable to export chart source");
                None
            }
        }
    }

    async fn create(&self, key: &ResourceKey, url: &str, git_ref: &str) -> Result<Option<Arc<ChartSource>>, MirrorError> {
        if !self.mirrors.ensure(url).await? {
            return Ok(None);
        }
        let revision = self.mirrors.head(url, git_ref).await?;
        let dir = self.next_export_dir(key);
        self.mirrors.export(url, &revision, &dir).await?;
        info!(resource = %key, url = %url, revision = %revision, "chart source exported");
        Ok(Some(Arc::new(ChartSource {
            key: key.clone(),
            url: url.to_string(),
            git_ref: git_ref.to_string(),
            state: Arc::new(tokio::sync::Mutex::new(SourceState { export_dir: dir, head: Head { revision, seq: 1 } })),
        })))
    }

    fn next_export_dir(&self, key: &ResourceKey) -> PathBuf {
        let n = self.export_seq.fetch_add(1, Ordering::Relaxed);
        self.export_root.join(format!("{}-{}-{}", key.namespace, key.name, n))
    }

    /// Refresh every tracked mirror from upstream and move sources whose ref
    /// has new commits onto a fresh export. Returns the resources whose head
    /// advanced.
    pub async fn sync_mirrors(&self) -> Vec<ResourceKey> {
        let started = Instant::now();
        let sources: Vec<Arc<ChartSource>> = self.map().values().cloned().collect();

        let mut refreshed: FxHashSet<String> = FxHashSet::default();
        let mut failed: FxHashSet<String> = FxHashSet::default();
        for src in &sources {
            if refreshed.contains(&src.url) || failed.contains(&src.url) {
                continue;
            }
            match self.mirrors.refresh(&src.url).await {
                Ok(()) => { refreshed.insert(src.url.clone()); }
                Err(e) => {
                    warn!(url = %src.url, error = %e, "mirror refresh failed");
                    failed.insert(src.url.clone());
                }
            }
        }

        let mut changed = Vec::new();
        for src in sources.iter().filter(|s| refreshed.contains(&s.url)) {
            match self.sync_one(src).await {
                Ok(true) => changed.push(src.key.clone()),
                Ok(false) => {}
                Err(e) => warn!(resource = %src.key, url = %src.url, error = %e, "chart source sync failed"),
            }
        }
        histogram!("mirror_sync_ms", started.elapsed().as_secs_f64() * 1000.0);
        if !changed.is_empty() {
            info!(count = changed.len(), "chart sources advanced");
        }
        changed
    }

    /// Whether `src` is still the record tracked for its resource.
    fn is_tracked(&self, src: &Arc<ChartSource>) -> bool {
        self.map().get(&src.key).is_some_and(|cur| Arc::ptr_eq(cur, src))
    }

    async fn sync_one(&self, src: &Arc<ChartSource>) -> Result<bool, MirrorError> {
        let upstream = self.mirrors.head(&src.url, &src.git_ref).await?;
        if src.lock().await.head().revision() == upstream {
            return Ok(false);
        }
        // Export outside the lock; the new directory is invisible until swapped in.
        let dir = self.next_export_dir(&src.key);
        self.mirrors.export(&src.url, &upstream, &dir).await?;

        let (advanced, stale) = {
            let mut state = src.state.lock().await;
            // Deleted or replaced while exporting. Checked under the source lock,
            // so a concurrent `delete` discards whatever export ends up here.
            if state.head.revision == upstream || !self.is_tracked(src) {
                (false, dir)
            } else {
                let old = state.advance(dir, upstream.clone());
                debug!(resource = %src.key, revision = %upstream, seq = state.head.seq, "chart source advanced");
                (true, old)
            }
        };
        // Readers only reach the export through the lock, so the stale one is unreachable now.
        remove_dir(&stale);
        if advanced {
            counter!("chart_source_swaps_total", 1u64);
        }
        Ok(advanced)
    }

    /// Stop tracking the chart source of a deleted resource.
    pub async fn delete(&self, key: &ResourceKey) {
        let removed = self.map().remove(key);
        if let Some(src) = removed {
            self.discard(src).await;
            debug!(resource = %key, "chart source removed");
        }
    }

    async fn discard(&self, src: Arc<ChartSource>) {
        let state = src.state.lock().await;
        remove_dir(&state.export_dir);
    }
}

fn remove_dir(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "failed to remove chart export");
        }
    }
}

#[cfg(test)]
mod tests;

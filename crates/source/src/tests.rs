use super::*;
use helmsync_core::DesiredRelease;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

#[derive(Default)]
struct FakeMirrors {
    not_ready: std::sync::atomic::AtomicBool,
    heads: Mutex<FxHashMap<String, String>>,
    refreshes: AtomicUsize,
    exports: AtomicUsize,
    export_delay_ms: AtomicU64,
}

impl FakeMirrors {
    fn push(&self, url: &str, rev: &str) {
        self.heads.lock().unwrap().insert(url.to_string(), rev.to_string());
    }
}

#[async_trait::async_trait]
impl Mirrors for FakeMirrors {
    async fn ensure(&self, _url: &str) -> Result<bool, MirrorError> {
        Ok(!self.not_ready.load(Ordering::SeqCst))
    }

    async fn refresh(&self, _url: &str) -> Result<(), MirrorError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn head(&self, url: &str, git_ref: &str) -> Result<String, MirrorError> {
        self.heads
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| MirrorError::RefNotFound { url: url.into(), git_ref: git_ref.into() })
    }

    async fn export(&self, _url: &str, revision: &str, dest: &Path) -> Result<(), MirrorError> {
        self.exports.fetch_add(1, Ordering::SeqCst);
        let delay = self.export_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        std::fs::create_dir_all(dest.join("chart"))?;
        std::fs::write(dest.join("chart").join("REVISION"), revision)?;
        Ok(())
    }
}

const URL: &str = "https://example.com/charts.git";

fn git_hr(name: &str) -> DesiredRelease {
    serde_json::from_value(serde_json::json!({
        "metadata": { "namespace": "apps", "name": name, "generation": 1 },
        "spec": { "chart": { "git": URL, "ref": "main", "path": "chart" } }
    }))
    .unwrap()
}

fn setup() -> (tempfile::TempDir, Arc<FakeMirrors>, ChartSourceRegistry) {
    let dir = tempfile::tempdir().unwrap();
    let mirrors = Arc::new(FakeMirrors::default());
    mirrors.push(URL, "aaa");
    let reg = ChartSourceRegistry::new(mirrors.clone(), dir.path().join("exports"));
    (dir, mirrors, reg)
}

#[tokio::test]
async fn load_creates_once_and_reuses() {
    let (_dir, mirrors, reg) = setup();
    let hr = git_hr("podinfo");
    let a = reg.load(&hr).await.expect("source");
    let b = reg.load(&hr).await.expect("source");
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(mirrors.exports.load(Ordering::SeqCst), 1);
    let view = a.lock().await;
    assert_eq!(view.head().revision(), "aaa");
    assert_eq!(view.head().seq(), 1);
    assert_eq!(std::fs::read_to_string(view.chart_path("chart/REVISION")).unwrap(), "aaa");
}

#[tokio::test]
async fn load_skips_repo_charts_and_unready_mirrors() {
    let (_dir, mirrors, reg) = setup();
    let repo: DesiredRelease = serde_json::from_value(serde_json::json!({
        "metadata": { "namespace": "apps", "name": "redis" },
        "spec": { "chart": { "repository": "https://charts.example.com", "name": "redis", "version": "1.0.0" } }
    }))
    .unwrap();
    assert!(reg.load(&repo).await.is_none());

    mirrors.not_ready.store(true, Ordering::SeqCst);
    assert!(reg.load(&git_hr("podinfo")).await.is_none());
    assert!(reg.is_empty());
}

#[tokio::test]
async fn sync_advances_only_changed_sources() {
    let (_dir, mirrors, reg) = setup();
    let src = reg.load(&git_hr("podinfo")).await.unwrap();
    let old_dir = src.lock().await.export_dir().to_path_buf();

    assert!(reg.sync_mirrors().await.is_empty());
    assert_eq!(src.lock().await.head().seq(), 1);

    mirrors.push(URL, "bbb");
    let changed = reg.sync_mirrors().await;
    assert_eq!(changed, vec![ResourceKey::new("apps", "podinfo")]);
    let view = src.lock().await;
    assert_eq!(view.head().revision(), "bbb");
    assert_eq!(view.head().seq(), 2);
    assert_ne!(view.export_dir(), old_dir);
    assert!(!old_dir.exists(), "stale export should be removed");
    assert_eq!(std::fs::read_to_string(view.chart_path("chart/REVISION")).unwrap(), "bbb");
}

#[tokio::test]
async fn one_refresh_per_distinct_mirror() {
    let (_dir, mirrors, reg) = setup();
    reg.load(&git_hr("a")).await.unwrap();
    reg.load(&git_hr("b")).await.unwrap();
    reg.sync_mirrors().await;
    assert_eq!(mirrors.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sync_waits_for_readers_holding_the_lock() {
    let (_dir, mirrors, reg) = setup();
    let reg = Arc::new(reg);
    let src = reg.load(&git_hr("podinfo")).await.unwrap();

    let view = src.lock().await;
    let path_at_start = view.export_dir().to_path_buf();
    mirrors.push(URL, "bbb");

    let sync = tokio::spawn({
        let reg = Arc::clone(&reg);
        async move { reg.sync_mirrors().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!sync.is_finished());
    // The reader still sees the export it started with.
    assert_eq!(view.export_dir(), path_at_start);
    assert_eq!(view.head().revision(), "aaa");
    assert!(path_at_start.exists());
    drop(view);

    let changed = tokio::time::timeout(Duration::from_secs(5), sync).await.unwrap().unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(src.lock().await.head().revision(), "bbb");
}

#[tokio::test]
async fn head_never_moves_without_sync() {
    let (_dir, mirrors, reg) = setup();
    let hr = git_hr("podinfo");
    let src = reg.load(&hr).await.unwrap();
    mirrors.push(URL, "bbb");

    let mut last = src.lock().await.head().seq();
    for round in 0..4 {
        // Reconciliation-side access: load + lock, repeatedly.
        let again = reg.load(&hr).await.unwrap();
        let seq = again.lock().await.head().seq();
        assert_eq!(seq, last, "round {round}: load must not advance the head");
        if round % 2 == 1 {
            reg.sync_mirrors().await;
            let seq = src.lock().await.head().seq();
            assert!(seq >= last);
            last = seq;
        }
    }
    assert_eq!(src.lock().await.head().revision(), "bbb");
}

#[tokio::test]
async fn delete_drops_record_and_export() {
    let (_dir, _mirrors, reg) = setup();
    let src = reg.load(&git_hr("podinfo")).await.unwrap();
    let dir = src.lock().await.export_dir().to_path_buf();
    assert!(dir.exists());
    reg.delete(&ResourceKey::new("apps", "podinfo")).await;
    assert!(reg.is_empty());
    assert!(!dir.exists());
}

#[tokio::test]
async fn changed_git_url_recreates_source() {
    let (_dir, mirrors, reg) = setup();
    let a = reg.load(&git_hr("podinfo")).await.unwrap();
    mirrors.push("https://example.com/fork.git", "ccc");
    let mut hr = git_hr("podinfo");
    if let ChartSourceSpec::Git { git, .. } = &mut hr.spec.chart {
        *git = "https://example.com/fork.git".into();
    }
    let b = reg.load(&hr).await.unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(b.url, "https://example.com/fork.git");
    assert_eq!(b.lock().await.head().revision(), "ccc");
    assert_eq!(reg.len(), 1);
}

#[tokio::test]
async fn delete_during_sync_leaves_no_export_behind() {
    let (dir, mirrors, reg) = setup();
    let reg = Arc::new(reg);
    reg.load(&git_hr("podinfo")).await.unwrap();
    mirrors.push(URL, "bbb");
    mirrors.export_delay_ms.store(100, Ordering::SeqCst);

    let sync = tokio::spawn({
        let reg = Arc::clone(&reg);
        async move { reg.sync_mirrors().await }
    });
    // Let the sync reach the slow export, then delete underneath it.
    tokio::time::sleep(Duration::from_millis(30)).await;
    reg.delete(&ResourceKey::new("apps", "podinfo")).await;

    let changed = tokio::time::timeout(Duration::from_secs(5), sync).await.unwrap().unwrap();
    assert!(changed.is_empty(), "{changed:?}");
    assert!(reg.is_empty());
    let left: Vec<_> = std::fs::read_dir(dir.path().join("exports"))
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert!(left.is_empty(), "exports left behind: {left:?}");
}

//! Mirrors backed by the `git` binary: one bare mirror clone per URL,
//! exports are local clones checked out at a fixed commit.

use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{MirrorError, Mirrors};

pub struct GitMirrors {
    git_bin: PathBuf,
    root: PathBuf,
    /// Serializes the initial clone per URL.
    cloning: Mutex<FxHashMap<String, std::sync::Arc<Mutex<()>>>>,
}

impl GitMirrors {
    pub fn new(git_bin: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self { git_bin: git_bin.into(), root: root.into(), cloning: Mutex::new(FxHashMap::default()) }
    }

    fn mirror_dir(&self, url: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(url.as_bytes()));
        self.root.join(format!("{}.git", &digest[..16]))
    }

    async fn git(&self, args: &[&str]) -> Result<String, MirrorError> {
        debug!(args = ?args, "git");
        let output = Command::new(&self.git_bin)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await?;
        if !output.status.success() {
            return Err(MirrorError::Git {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait::async_trait]
impl Mirrors for GitMirrors {
    async fn ensure(&self, url: &str) -> Result<bool, MirrorError> {
        let dir = self.mirror_dir(url);
        let gate = {
            let mut cloning = self.cloning.lock().await;
            std::sync::Arc::clone(cloning.entry(url.to_string()).or_default())
        };
        let _held = gate.lock().await;
        if tokio::fs::try_exists(dir.join("HEAD")).await? {
            return Ok(true);
        }
        tokio::fs::create_dir_all(&self.root).await?;
        let dir_s = dir.to_string_lossy().to_string();
        info!(url = %url, dir = %dir_s, "cloning git mirror");
        match self.git(&["clone", "--mirror", "--quiet", url, &dir_s]).await {
            Ok(_) => Ok(true),
            Err(e) => {
                // A half-written mirror would be taken as ready next time.
                let _ = tokio::fs::remove_dir_all(&dir).await;
                Err(e)
            }
        }
    }

    async fn refresh(&self, url: &str) -> Result<(), MirrorError> {
        let dir = self.mirror_dir(url).to_string_lossy().to_string();
        self.git(&["--git-dir", &dir, "remote", "update", "--prune"]).await.map(|_| ())
    }

    async fn head(&self, url: &str, git_ref: &str) -> Result<String, MirrorError> {
        let dir = self.mirror_dir(url).to_string_lossy().to_string();
        let spec = format!("{git_ref}^{{commit}}");
        match self.git(&["--git-dir", &dir, "rev-parse", "--verify", "--quiet", &spec]).await {
            Ok(rev) if !rev.is_empty() => Ok(rev),
            Ok(_) | Err(MirrorError::Git { .. }) => {
                Err(MirrorError::RefNotFound { url: url.to_string(), git_ref: git_ref.to_string() })
            }
            Err(e) => Err(e),
        }
    }

    async fn export(&self, url: &str, revision: &str, dest: &Path) -> Result<(), MirrorError> {
        if tokio::fs::try_exists(dest).await? {
            tokio::fs::remove_dir_all(dest).await?;
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mirror = self.mirror_dir(url).to_string_lossy().to_string();
        let dest_s = dest.to_string_lossy().to_string();
        self.git(&["clone", "--quiet", "--no-checkout", &mirror, &dest_s]).await?;
        if let Err(e) = self.git(&["-C", &dest_s, "checkout", "--quiet", "--detach", revision]).await {
            let _ = tokio::fs::remove_dir_all(dest).await;
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_dirs_are_stable_per_url() {
        let m = GitMirrors::new("git", "/var/cache/helmsync");
        let a = m.mirror_dir("https://example.com/charts.git");
        assert_eq!(a, m.mirror_dir("https://example.com/charts.git"));
        assert_ne!(a, m.mirror_dir("https://example.com/other.git"));
        assert!(a.starts_with("/var/cache/helmsync"));
        assert!(a.to_string_lossy().ends_with(".git"));
    }
}

//! Repository→hosts binding config.
//!
//! A YAML file lists which repositories deploy where on push:
//!
//! ```yaml
//! apps:
//!   - repository: myorg/web
//!     hosts: [web-01, web-02]
//!     deploy_on_push: true
//!     branches: [main]
//! ```
//!
//! Repository patterns use glob syntax (`myorg/*`); an exact name is a valid
//! pattern. An empty branch list matches every branch. The loader holds the
//! parsed set behind a lock and `reload` re-reads the file, so a watcher task
//! can hot-swap the config without restarting the controller.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{info, warn};

use crate::error::{DeployError, Result};

// ---------------------------------------------------------------------------
// RepoBinding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoBinding {
    pub repository: String,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub deploy_on_push: bool,
    #[serde(default)]
    pub branches: Vec<String>,
}

impl RepoBinding {
    /// Whether a push to `repo`@`branch` should deploy through this binding.
    pub fn matches(&self, repo: &str, branch: &str) -> bool {
        if !self.deploy_on_push {
            return false;
        }
        let repo_match = match Pattern::new(&self.repository) {
            Ok(pattern) => pattern.matches(repo),
            Err(_) => self.repository == repo,
        };
        if !repo_match {
            return false;
        }
        self.branches.is_empty() || self.branches.iter().any(|b| b == branch)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BindingsFile {
    #[serde(default)]
    apps: Vec<RepoBinding>,
}

// ---------------------------------------------------------------------------
// ConfigLoader
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ConfigLoader {
    path: PathBuf,
    bindings: RwLock<Vec<RepoBinding>>,
}

impl ConfigLoader {
    /// Parse the bindings file at `path`. A missing file yields an empty
    /// binding set (pushes are acknowledged and dropped); a malformed file
    /// is a config error.
    pub fn load(path: &Path) -> Result<Self> {
        let bindings = read_bindings(path)?;
        info!(path = %path.display(), count = bindings.len(), "repo bindings loaded");
        Ok(Self {
            path: path.to_path_buf(),
            bindings: RwLock::new(bindings),
        })
    }

    /// Re-read the file, replacing the in-memory set. Returns the new
    /// binding count.
    pub fn reload(&self) -> Result<usize> {
        let bindings = read_bindings(&self.path)?;
        let count = bindings.len();
        *self.bindings.write().expect("bindings lock poisoned") = bindings;
        info!(path = %self.path.display(), count, "repo bindings reloaded");
        Ok(count)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every binding matching the pushed repo and branch.
    pub fn matching(&self, repo: &str, branch: &str) -> Vec<RepoBinding> {
        self.bindings
            .read()
            .expect("bindings lock poisoned")
            .iter()
            .filter(|b| b.matches(repo, branch))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<RepoBinding> {
        self.bindings
            .read()
            .expect("bindings lock poisoned")
            .clone()
    }
}

fn read_bindings(path: &Path) -> Result<Vec<RepoBinding>> {
    if !path.exists() {
        warn!(path = %path.display(), "bindings file missing; no repos will deploy on push");
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)?;
    let file: BindingsFile = serde_yaml::from_str(&raw)
        .map_err(|e| DeployError::Config(format!("{}: {e}", path.display())))?;
    Ok(file.apps)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

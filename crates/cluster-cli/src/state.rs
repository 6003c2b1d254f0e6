//! Cluster state persisted between invocations as pretty-printed JSON.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cluster_core::Cluster;
use tracing::debug;

const STATE_DIR: &str = ".clusterctl";

#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default location for `cluster_name`, relative to the working directory.
    pub fn for_cluster(cluster_name: &str) -> Self {
        Self::new(Path::new(STATE_DIR).join(format!("{cluster_name}.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The recorded cluster, or `None` when nothing has been recorded yet.
    pub fn load(&self) -> Result<Option<Cluster>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read state file {}", self.path.display()))
            }
        };
        let cluster = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt state file {}", self.path.display()))?;
        Ok(Some(cluster))
    }

    /// Write `cluster` atomically, creating parent directories as needed.
    pub fn save(&self, cluster: &Cluster) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create state directory {}", dir.display()))?;

        let json = serde_json::to_string_pretty(cluster)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.persist(&self.path)
            .with_context(|| format!("failed to write state file {}", self.path.display()))?;
        debug!(path = %self.path.display(), instances = cluster.len(), "saved cluster state");
        Ok(())
    }

    /// Delete the state file; a missing file is not an error.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("failed to remove state file {}", self.path.display())),
        }
    }

    /// Save the cluster a phase returned, or remove the file once it is gone.
    pub fn record(&self, cluster: Option<&Cluster>) -> Result<()> {
        match cluster {
            Some(cluster) => self.save(cluster),
            None => self.remove(),
        }
    }
}

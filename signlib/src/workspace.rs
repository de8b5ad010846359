use crate::artifact::Role;
use crate::error::{JobError, Result};
use crate::types::JobId;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Allocates one isolated directory per job under a configured root.
#[derive(Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the per-job directory. Names derive from the job id, so a
    /// collision means a duplicate id rather than a reusable directory.
    pub async fn allocate(&self, job_id: JobId) -> Result<Workspace> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|err| exhausted("workspace root", &self.root, err))?;
        let path = self.root.join(format!("job-{}", job_id));
        tokio::fs::create_dir(&path)
            .await
            .map_err(|err| exhausted("workspace", &path, err))?;
        Ok(Workspace {
            path,
            released: false,
        })
    }

    /// Remove leftover `job-*` directories older than `max_age`. Run once
    /// at startup to reclaim workspaces orphaned by a previous crash;
    /// per-entry failures are logged and skipped.
    pub async fn sweep_stale(&self, max_age: Duration) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            // nothing to sweep before the first allocation
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(exhausted("workspace root", &self.root, err)),
        };
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with("job-") {
                continue;
            }
            let stale = entry
                .metadata()
                .await
                .ok()
                .and_then(|meta| meta.modified().ok())
                .and_then(|modified| modified.elapsed().ok())
                .map_or(false, |age| age >= max_age);
            if !stale {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    tracing::info!(path = %entry.path().display(), "swept stale workspace");
                    removed += 1;
                }
                Err(err) => {
                    tracing::warn!(path = %entry.path().display(), %err, "failed to sweep workspace");
                }
            }
        }
        Ok(removed)
    }
}

fn exhausted(what: &str, path: &Path, err: std::io::Error) -> JobError {
    JobError::ResourceExhausted(format!("cannot create {} at {}: {}", what, path.display(), err))
}

/// One job's private directory. Dropping it removes the directory, so the
/// workspace survives exactly as long as something owns it: the worker
/// during the pipeline, then the signed package until delivery completes.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fixed on-disk location for a role within this workspace.
    pub fn role_path(&self, role: Role) -> PathBuf {
        self.path.join(role.file_name())
    }

    pub async fn has(&self, role: Role) -> bool {
        tokio::fs::try_exists(self.role_path(role))
            .await
            .unwrap_or(false)
    }

    /// Explicitly tear the directory down. Consuming `self` makes a second
    /// release impossible; the `Drop` fallback is flagged off.
    pub async fn release(mut self) {
        self.released = true;
        if let Err(err) = tokio::fs::remove_dir_all(&self.path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), %err, "workspace release failed");
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = std::fs::remove_dir_all(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), %err, "workspace cleanup on drop failed");
            }
        }
    }
}

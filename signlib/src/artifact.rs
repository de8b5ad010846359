use crate::config::UploadLimits;
use crate::error::{JobError, Result};
use crate::types::ByteSource;
use crate::workspace::Workspace;
use futures::StreamExt;
use std::fmt;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// An IPA is a zip container; anything without the local-file-header
/// magic is rejected before the tool ever sees it.
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];

/// What a file in a workspace is for. Each role appears at most once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Package,
    Certificate,
    Profile,
    Entitlements,
    Output,
}

impl Role {
    /// Fixed file name inside a workspace. Callers never choose names, so
    /// uploaded file names cannot traverse out of the workspace.
    pub fn file_name(self) -> &'static str {
        match self {
            Role::Package => "package.ipa",
            Role::Certificate => "certificate.p12",
            Role::Profile => "profile.mobileprovision",
            Role::Entitlements => "entitlements.plist",
            Role::Output => "signed.ipa",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Package => "package",
            Role::Certificate => "certificate",
            Role::Profile => "profile",
            Role::Entitlements => "entitlements",
            Role::Output => "output",
        };
        f.write_str(name)
    }
}

/// One staged or produced file.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub role: Role,
    pub path: PathBuf,
    pub len: u64,
}

/// Streams uploads onto disk inside a workspace, enforcing per-role size
/// limits and cheap structural checks. Deep validation of the package is
/// the signing tool's job.
#[derive(Clone)]
pub struct ArtifactStore {
    limits: UploadLimits,
}

impl ArtifactStore {
    pub fn new(limits: UploadLimits) -> Self {
        Self { limits }
    }

    /// Write one role's bytes into the workspace. Fails with
    /// `PayloadTooLarge` the moment the role's limit is crossed and with
    /// `InvalidArtifact` for empty or structurally bogus inputs; a partial
    /// file never survives a failure. Re-staging a role truncates the
    /// previous file.
    pub async fn stage(
        &self,
        workspace: &Workspace,
        role: Role,
        source: ByteSource,
    ) -> Result<Artifact> {
        let staged = self.write_role(workspace, role, source).await?;
        if staged.len == 0 {
            self.discard(&staged).await;
            return Err(JobError::InvalidArtifact {
                role,
                reason: "file is empty".into(),
            });
        }
        if role == Role::Package && staged.head != ZIP_MAGIC {
            self.discard(&staged).await;
            return Err(JobError::InvalidArtifact {
                role,
                reason: "not a zip container".into(),
            });
        }
        Ok(Artifact {
            role,
            path: staged.path,
            len: staged.len,
        })
    }

    /// Like `stage`, but an empty source means the caller did not supply
    /// the role at all (used for entitlements).
    pub async fn stage_optional(
        &self,
        workspace: &Workspace,
        role: Role,
        source: ByteSource,
    ) -> Result<Option<Artifact>> {
        let staged = self.write_role(workspace, role, source).await?;
        if staged.len == 0 {
            self.discard(&staged).await;
            return Ok(None);
        }
        Ok(Some(Artifact {
            role,
            path: staged.path,
            len: staged.len,
        }))
    }

    async fn write_role(
        &self,
        workspace: &Workspace,
        role: Role,
        mut source: ByteSource,
    ) -> Result<Staged> {
        let limit = self.limits.for_role(role);
        let path = workspace.role_path(role);
        let mut file = tokio::fs::File::create(&path).await.map_err(|err| {
            JobError::ResourceExhausted(format!("cannot create {} file: {}", role, err))
        })?;

        let mut written: u64 = 0;
        let mut head = [0u8; 4];
        while let Some(chunk) = source.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    // upload interrupted (e.g. caller disconnect)
                    tracing::debug!(%role, %err, "artifact source failed mid-stream");
                    self.remove(&path).await;
                    return Err(JobError::Aborted);
                }
            };
            for (i, byte) in chunk.iter().take(4).enumerate() {
                let pos = written as usize + i;
                if pos < 4 {
                    head[pos] = *byte;
                }
            }
            written += chunk.len() as u64;
            if written > limit {
                self.remove(&path).await;
                return Err(JobError::PayloadTooLarge { role, limit });
            }
            if let Err(err) = file.write_all(&chunk).await {
                self.remove(&path).await;
                return Err(JobError::ResourceExhausted(format!(
                    "cannot write {} file: {}",
                    role, err
                )));
            }
        }
        if let Err(err) = file.flush().await {
            self.remove(&path).await;
            return Err(JobError::ResourceExhausted(format!(
                "cannot flush {} file: {}",
                role, err
            )));
        }
        Ok(Staged {
            path,
            len: written,
            head,
        })
    }

    async fn discard(&self, staged: &Staged) {
        self.remove(&staged.path).await;
    }

    async fn remove(&self, path: &std::path::Path) {
        if let Err(err) = tokio::fs::remove_file(path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), %err, "failed to remove partial artifact");
            }
        }
    }
}

struct Staged {
    path: PathBuf,
    len: u64,
    head: [u8; 4],
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{bytes_source, failing_source, SAMPLE_PACKAGE};
    use crate::workspace::WorkspaceManager;
    use uuid::Uuid;

    async fn fixture() -> (tempfile::TempDir, Workspace) {
        let root = tempfile::tempdir().unwrap();
        let workspace = WorkspaceManager::new(root.path())
            .allocate(Uuid::new_v4())
            .await
            .unwrap();
        (root, workspace)
    }

    fn store() -> ArtifactStore {
        ArtifactStore::new(UploadLimits {
            package: 64,
            certificate: 16,
            profile: 16,
            entitlements: 16,
        })
    }

    #[tokio::test]
    async fn stage_writes_one_file() {
        let (_root, workspace) = fixture().await;
        let artifact = store()
            .stage(&workspace, Role::Package, bytes_source(SAMPLE_PACKAGE))
            .await
            .unwrap();
        assert_eq!(artifact.len, SAMPLE_PACKAGE.len() as u64);
        let on_disk = tokio::fs::read(&artifact.path).await.unwrap();
        assert_eq!(on_disk, SAMPLE_PACKAGE);
    }

    #[tokio::test]
    async fn oversized_upload_leaves_no_partial_file() {
        let (_root, workspace) = fixture().await;
        let big = vec![0x50u8; 128];
        let err = store()
            .stage(&workspace, Role::Package, bytes_source(big))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::PayloadTooLarge { role: Role::Package, .. }));
        assert!(!workspace.has(Role::Package).await);
    }

    #[tokio::test]
    async fn empty_certificate_is_invalid() {
        let (_root, workspace) = fixture().await;
        let err = store()
            .stage(&workspace, Role::Certificate, bytes_source(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidArtifact { role: Role::Certificate, .. }));
        assert!(!workspace.has(Role::Certificate).await);
    }

    #[tokio::test]
    async fn package_must_look_like_a_zip() {
        let (_root, workspace) = fixture().await;
        let err = store()
            .stage(&workspace, Role::Package, bytes_source(b"not a zip".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidArtifact { role: Role::Package, .. }));
        assert!(!workspace.has(Role::Package).await);
    }

    #[tokio::test]
    async fn interrupted_source_aborts_and_cleans_up() {
        let (_root, workspace) = fixture().await;
        let err = store()
            .stage(&workspace, Role::Package, failing_source(b"PK\x03\x04".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Aborted));
        assert!(!workspace.has(Role::Package).await);
    }

    #[tokio::test]
    async fn missing_entitlements_stage_to_none() {
        let (_root, workspace) = fixture().await;
        let staged = store()
            .stage_optional(&workspace, Role::Entitlements, bytes_source(Vec::new()))
            .await
            .unwrap();
        assert!(staged.is_none());
        assert!(!workspace.has(Role::Entitlements).await);
    }

    #[tokio::test]
    async fn restaging_overwrites() {
        let (_root, workspace) = fixture().await;
        let store = store();
        store
            .stage(&workspace, Role::Profile, bytes_source(b"first".to_vec()))
            .await
            .unwrap();
        let second = store
            .stage(&workspace, Role::Profile, bytes_source(b"second profile".to_vec()))
            .await
            .unwrap();
        let on_disk = tokio::fs::read(&second.path).await.unwrap();
        assert_eq!(on_disk, b"second profile");
    }
}

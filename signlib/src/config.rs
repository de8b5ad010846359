use crate::artifact::Role;
use std::path::PathBuf;
use std::time::Duration;

/// Per-role upload ceilings in bytes. Credentials are tiny; only the
/// package itself is allowed to be large.
#[derive(Clone, Copy, Debug)]
pub struct UploadLimits {
    pub package: u64,
    pub certificate: u64,
    pub profile: u64,
    pub entitlements: u64,
}

impl UploadLimits {
    pub fn for_role(&self, role: Role) -> u64 {
        match role {
            Role::Package => self.package,
            Role::Certificate => self.certificate,
            Role::Profile => self.profile,
            Role::Entitlements => self.entitlements,
            // produced by the tool, never staged from a caller
            Role::Output => u64::MAX,
        }
    }
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            package: 512 * 1024 * 1024,
            certificate: 5 * 1024 * 1024,
            profile: 1024 * 1024,
            entitlements: 1024 * 1024,
        }
    }
}

/// Tuning knobs for the coordinator and its collaborators.
#[derive(Clone, Debug)]
pub struct Config {
    /// Upper bound on signing-tool processes running at once.
    pub max_concurrent_invocations: usize,
    /// Admitted jobs allowed to wait for a slot before `submit`
    /// rejects with `Overloaded`.
    pub max_queue_depth: usize,
    pub upload_limits: UploadLimits,
    /// Per-invocation wall-clock budget for the external tool.
    pub invocation_timeout: Duration,
    /// Budget for the whole pipeline, measured from admission.
    pub max_job_lifetime: Duration,
    /// Directory under which per-job workspaces are created.
    pub workspace_root: PathBuf,
    /// Path to the external signing executable.
    pub signer_program: PathBuf,
    /// Captured stderr tail size; anything older is discarded.
    pub max_stderr_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_invocations: 2,
            max_queue_depth: 8,
            upload_limits: UploadLimits::default(),
            invocation_timeout: Duration::from_secs(300),
            max_job_lifetime: Duration::from_secs(600),
            workspace_root: std::env::temp_dir().join("signd-workspaces"),
            signer_program: PathBuf::from("zsign"),
            max_stderr_bytes: 16 * 1024,
        }
    }
}

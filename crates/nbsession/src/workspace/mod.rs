//! Per-user workspace provisioning.
//!
//! Every sandbox gets a private directory under `{root}/sandboxes/{user_id}`,
//! seeded once from the template tree and bound read-write into the container.
//! Identities listed in the [`WorkspacePolicy`] get a different strategy (the
//! controller's own root) and are never seeded or created.

mod policy;

pub use policy::{WorkspacePolicy, WorkspaceStrategy};

use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use log::{debug, info};
use thiserror::Error;

/// Errors that prevent a workspace path from being computed at all.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The user id cannot be used as a directory name.
    #[error("invalid user id '{0}': must be a single path component")]
    InvalidUserId(String),
}

/// Owner and group applied to provisioned workspaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

/// Workspace provisioner configuration.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Controller installation root.
    pub root: PathBuf,
    /// Template tree copied into new workspaces.
    pub template_dir: PathBuf,
    /// Parent directory of per-user workspaces.
    pub sandboxes_dir: PathBuf,
    /// Ownership applied after provisioning; `None` leaves it untouched.
    pub ownership: Option<Ownership>,
    /// Permission bits applied after provisioning.
    pub mode: u32,
}

impl WorkspaceConfig {
    /// Standard layout under `root`: `exam/` template and `sandboxes/` parent.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            template_dir: root.join("exam"),
            sandboxes_dir: root.join("sandboxes"),
            root,
            ownership: Some(Ownership { uid: 0, gid: 100 }),
            mode: 0o770,
        }
    }
}

/// Non-fatal problem hit while provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionIssue {
    /// Creating the workspace or copying the template failed.
    Copy { path: PathBuf, message: String },
    /// `chown` failed.
    Ownership { path: PathBuf, message: String },
    /// `chmod` failed.
    Permissions { path: PathBuf, message: String },
}

impl fmt::Display for ProvisionIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionIssue::Copy { path, message } => {
                write!(f, "seeding workspace {} failed: {}", path.display(), message)
            }
            ProvisionIssue::Ownership { path, message } => {
                write!(f, "chown {} failed: {}", path.display(), message)
            }
            ProvisionIssue::Permissions { path, message } => {
                write!(f, "chmod {} failed: {}", path.display(), message)
            }
        }
    }
}

/// Result of a provisioning call.
#[derive(Debug, Clone)]
pub struct Provisioned {
    /// Directory to bind into the sandbox.
    pub path: PathBuf,
    /// Whether this call created and seeded the directory.
    pub created: bool,
    /// Problems that did not stop provisioning.
    pub issues: Vec<ProvisionIssue>,
}

/// Creates and locates per-user workspaces.
#[derive(Debug, Clone)]
pub struct WorkspaceProvisioner {
    config: WorkspaceConfig,
    policy: WorkspacePolicy,
}

impl WorkspaceProvisioner {
    pub fn new(config: WorkspaceConfig, policy: WorkspacePolicy) -> Self {
        Self { config, policy }
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    /// Directory that would back `user_id`'s sandbox.
    pub fn workspace_path(&self, user_id: &str) -> Result<PathBuf, WorkspaceError> {
        match self.policy.strategy_for(user_id) {
            WorkspaceStrategy::ControllerRoot => Ok(self.config.root.clone()),
            WorkspaceStrategy::Provisioned => {
                validate_user_id(user_id)?;
                Ok(self.config.sandboxes_dir.join(user_id))
            }
        }
    }

    /// Ensure `user_id`'s workspace exists.
    ///
    /// The template is copied only when this call creates the directory; an
    /// existing directory is reused untouched. Copy, ownership and permission
    /// failures are collected as issues rather than returned as errors.
    pub fn provision(&self, user_id: &str) -> Result<Provisioned, WorkspaceError> {
        let path = self.workspace_path(user_id)?;

        if self.policy.strategy_for(user_id) == WorkspaceStrategy::ControllerRoot {
            debug!("user {} uses the controller root {}", user_id, path.display());
            return Ok(Provisioned {
                path,
                created: false,
                issues: Vec::new(),
            });
        }

        let mut issues = Vec::new();
        let created = self.seed(&path, &mut issues);

        if path.is_dir() {
            self.apply_access(&path, &mut issues);
        }

        Ok(Provisioned {
            path,
            created,
            issues,
        })
    }

    /// Claim and seed `path`; returns whether this call created it.
    fn seed(&self, path: &Path, issues: &mut Vec<ProvisionIssue>) -> bool {
        if let Err(e) = fs::create_dir_all(&self.config.sandboxes_dir) {
            issues.push(ProvisionIssue::Copy {
                path: self.config.sandboxes_dir.clone(),
                message: e.to_string(),
            });
            return false;
        }

        // Non-recursive create is the claim; a concurrent provision for the
        // same user sees AlreadyExists and reuses.
        match fs::create_dir(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!("reusing existing workspace {}", path.display());
                return false;
            }
            Err(e) => {
                issues.push(ProvisionIssue::Copy {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                });
                return false;
            }
        }

        match copy_dir_recursive(&self.config.template_dir, path) {
            Ok(()) => info!(
                "seeded workspace {} from {}",
                path.display(),
                self.config.template_dir.display()
            ),
            Err(e) => issues.push(ProvisionIssue::Copy {
                path: path.to_path_buf(),
                message: format!(
                    "copying template {}: {}",
                    self.config.template_dir.display(),
                    e
                ),
            }),
        }
        true
    }

    fn apply_access(&self, path: &Path, issues: &mut Vec<ProvisionIssue>) {
        if let Some(owner) = self.config.ownership {
            if let Err(e) = std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid)) {
                issues.push(ProvisionIssue::Ownership {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                });
            }
        }

        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(self.config.mode)) {
            issues.push(ProvisionIssue::Permissions {
                path: path.to_path_buf(),
                message: e.to_string(),
            });
        }
    }
}

/// Reject user ids that would escape or alias the sandboxes directory.
pub fn validate_user_id(user_id: &str) -> Result<(), WorkspaceError> {
    let invalid = user_id.is_empty()
        || user_id == "."
        || user_id == ".."
        || user_id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(WorkspaceError::InvalidUserId(user_id.to_string()));
    }
    Ok(())
}

/// Recursively copy the contents of `src` into the existing directory `dst`.
fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&dst_path)?;
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

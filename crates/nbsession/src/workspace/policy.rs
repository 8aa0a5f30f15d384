//! Identity to workspace strategy mapping.

use std::collections::HashMap;

/// How a user's workspace directory is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkspaceStrategy {
    /// Private directory under the sandboxes parent, seeded from the template.
    #[default]
    Provisioned,
    /// The controller's own root, bound as-is. Never created, seeded or removed.
    ControllerRoot,
}

/// Lookup table from identity to [`WorkspaceStrategy`].
///
/// Identities not in the table are provisioned normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePolicy {
    overrides: HashMap<String, WorkspaceStrategy>,
}

impl WorkspacePolicy {
    /// Policy with no overrides.
    pub fn empty() -> Self {
        Self {
            overrides: HashMap::new(),
        }
    }

    /// Policy binding the controller root for each of `identities`.
    pub fn with_privileged<I, S>(identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut policy = Self::empty();
        for identity in identities {
            policy = policy.with(identity, WorkspaceStrategy::ControllerRoot);
        }
        policy
    }

    /// Add or replace the strategy for one identity.
    pub fn with(mut self, identity: impl Into<String>, strategy: WorkspaceStrategy) -> Self {
        self.overrides.insert(identity.into(), strategy);
        self
    }

    pub fn strategy_for(&self, user_id: &str) -> WorkspaceStrategy {
        self.overrides.get(user_id).copied().unwrap_or_default()
    }
}

impl Default for WorkspacePolicy {
    fn default() -> Self {
        Self::with_privileged(["admin"])
    }
}

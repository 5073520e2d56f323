//! Role-aware authorization over workspace/project/config membership.
//!
//! Grounded on the teacher's `Principal` model (`sem_os_core::principal`):
//! a principal carries explicit roles and claims, and gate functions take
//! it by reference rather than reading a thread-local identity.

use crate::types::{ConfigMemberRole, Project};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceRole {
    Admin,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectRole {
    Admin,
    Maintainer,
    Viewer,
}

/// Effective role on a common scale, ordered weakest to strongest so that
/// `>=` comparisons express the gate thresholds directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EffectiveRole {
    Viewer,
    Editor,
    Maintainer,
    Admin,
}

/// The identity evaluating a permission check: its roles at each scope
/// relevant to a single config.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_email: String,
    pub workspace_role: Option<WorkspaceRole>,
    pub project_role: Option<ProjectRole>,
    pub config_role: Option<ConfigMemberRole>,
}

fn workspace_effective(role: Option<WorkspaceRole>) -> EffectiveRole {
    match role {
        Some(WorkspaceRole::Admin) => EffectiveRole::Admin,
        _ => EffectiveRole::Viewer,
    }
}

fn project_effective(role: Option<ProjectRole>) -> EffectiveRole {
    match role {
        Some(ProjectRole::Admin) => EffectiveRole::Admin,
        Some(ProjectRole::Maintainer) => EffectiveRole::Maintainer,
        Some(ProjectRole::Viewer) | None => EffectiveRole::Viewer,
    }
}

fn config_effective(role: Option<ConfigMemberRole>) -> EffectiveRole {
    match role {
        Some(ConfigMemberRole::Maintainer) => EffectiveRole::Maintainer,
        Some(ConfigMemberRole::Editor) => EffectiveRole::Editor,
        None => EffectiveRole::Viewer,
    }
}

/// The strongest of workspace-admin, project role, and config role.
pub fn effective_role(ctx: &AuthContext) -> EffectiveRole {
    workspace_effective(ctx.workspace_role)
        .max(project_effective(ctx.project_role))
        .max(config_effective(ctx.config_role))
}

pub fn can_read_config(ctx: &AuthContext) -> bool {
    effective_role(ctx) >= EffectiveRole::Viewer
}

pub fn can_edit_config(ctx: &AuthContext) -> bool {
    effective_role(ctx) >= EffectiveRole::Editor
}

pub fn can_manage_config(ctx: &AuthContext) -> bool {
    effective_role(ctx) >= EffectiveRole::Maintainer
}

pub fn can_create_config(ctx: &AuthContext) -> bool {
    effective_role(ctx) >= EffectiveRole::Maintainer
}

/// Approval additionally consults `project.allow_self_approvals` when the
/// reviewer is also the proposer.
pub fn can_approve_proposal(ctx: &AuthContext, project: &Project, proposer_email: &str) -> bool {
    if effective_role(ctx) < EffectiveRole::Maintainer {
        return false;
    }
    if !project.allow_self_approvals && ctx.user_email == proposer_email {
        return false;
    }
    true
}

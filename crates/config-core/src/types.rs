//! Core data model: projects, configs, variants, overrides, versions,
//! proposals, and audit entries. Pure value types — no storage dependency.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::condition::Condition;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub name: String,
    pub require_proposals: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub environments: Vec<Environment>,
    pub require_proposals: bool,
    pub allow_self_approvals: bool,
}

impl Project {
    pub fn environment(&self, environment_id: &str) -> Option<&Environment> {
        self.environments.iter().find(|e| e.id == environment_id)
    }

    /// True if a direct write to `environment_id` (or the base, when `None`)
    /// must go through the proposal workflow.
    pub fn requires_proposal_for(&self, environment_id: Option<&str>) -> bool {
        if self.require_proposals {
            return true;
        }
        match environment_id {
            Some(id) => self
                .environment(id)
                .map(|e| e.require_proposals)
                .unwrap_or(false),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigMemberRole {
    Maintainer,
    Editor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigMember {
    pub user_email: String,
    pub role: ConfigMemberRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Override {
    pub name: String,
    pub conditions: Vec<Condition>,
    pub value: serde_json::Value,
}

/// A variant's mutable fields — shared shape between the base variant
/// (carried directly on `Config`) and an environment's `Variant`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantBody {
    pub value: serde_json::Value,
    pub schema: Option<serde_json::Value>,
    pub overrides: Vec<Override>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub id: Uuid,
    pub config_id: Uuid,
    pub environment_id: String,
    pub body: VariantBody,
    /// When true, the base variant's schema is used for validation instead
    /// of this variant's own `schema` field.
    pub use_base_schema: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub description: String,
    pub base: VariantBody,
    pub version: i64,
    pub members: Vec<ConfigMember>,
    pub variants: Vec<Variant>,
}

impl Config {
    pub fn variant_for(&self, environment_id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.environment_id == environment_id)
    }

    pub fn member_role(&self, user_email: &str) -> Option<ConfigMemberRole> {
        self.members
            .iter()
            .find(|m| m.user_email == user_email)
            .map(|m| m.role)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigVersionSnapshot {
    pub config_id: Uuid,
    pub version: i64,
    pub description: String,
    pub base: VariantBody,
    pub variants: Vec<Variant>,
    pub members: Vec<ConfigMember>,
    pub author: Option<String>,
    pub originating_proposal_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    RejectedExplicitly,
    ConfigEdited,
    ConfigDeleted,
    AnotherProposalApproved,
}

/// A three-state sentinel per proposed field: the proposal either leaves
/// the field unchanged, or proposes a new value for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum ProposedField<T> {
    Unchanged,
    New(T),
}

impl<T: Clone> ProposedField<T> {
    /// Resolve the field's effective value given the current persisted value.
    pub fn resolve(&self, current: &T) -> T {
        match self {
            ProposedField::Unchanged => current.clone(),
            ProposedField::New(v) => v.clone(),
        }
    }

    pub fn is_changed(&self) -> bool {
        matches!(self, ProposedField::New(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedVariant {
    pub environment_id: Option<String>, // None = base
    pub value: ProposedField<serde_json::Value>,
    pub schema: ProposedField<Option<serde_json::Value>>,
    pub overrides: ProposedField<Vec<Override>>,
    pub use_base_schema: ProposedField<bool>,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Uuid,
    pub config_id: Uuid,
    pub proposer_id: String,
    pub base_config_version: i64,
    pub description: ProposedField<String>,
    pub members: ProposedField<Vec<ConfigMember>>,
    pub delete: bool,
    pub variants: Vec<ProposedVariant>,
    pub status: ProposalStatus,
    pub reviewer_id: Option<String>,
    pub rejection_reason: Option<RejectionReason>,
    pub rejected_in_favor_of_proposal_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
}

impl Proposal {
    pub fn is_terminal(&self) -> bool {
        self.status != ProposalStatus::Pending
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditPayload {
    ConfigCreated {
        config_id: Uuid,
        after: Box<Config>,
    },
    ConfigUpdated {
        config_id: Uuid,
        before: Box<Config>,
        after: Box<Config>,
    },
    ConfigDeleted {
        config_id: Uuid,
        before: Box<Config>,
    },
    ConfigMembersChanged {
        config_id: Uuid,
        before: Vec<ConfigMember>,
        after: Vec<ConfigMember>,
    },
    ConfigProposalCreated {
        proposal_id: Uuid,
        config_id: Uuid,
    },
    ConfigProposalApproved {
        proposal_id: Uuid,
        config_id: Uuid,
        reviewer_id: String,
    },
    ConfigProposalRejected {
        proposal_id: Uuid,
        config_id: Uuid,
        reason: RejectionReason,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor_id: Option<String>,
    pub payload: AuditPayload,
    pub created_at: DateTime<Utc>,
}

//! SQLx row types and their conversions to `config-core` domain types.
//! Isolates sqlx from `config-core`, mirroring the teacher's
//! `sqlx_types.rs` split.

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use config_core::types::{
    AuditEntry, AuditPayload, Config, ConfigMember, ConfigMemberRole, Environment, Project,
    Proposal, ProposalStatus, ProposedVariant, RejectionReason, Variant, VariantBody,
};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, FromRow)]
pub struct ProjectRow {
    pub id: Uuid,
    pub name: String,
    pub require_proposals: bool,
    pub allow_self_approvals: bool,
}

#[derive(Debug, FromRow)]
pub struct EnvironmentRow {
    pub id: String,
    pub name: String,
    pub require_proposals: bool,
}

pub fn project_from_rows(row: ProjectRow, environments: Vec<EnvironmentRow>) -> Project {
    Project {
        id: row.id,
        name: row.name,
        environments: environments
            .into_iter()
            .map(|e| Environment {
                id: e.id,
                name: e.name,
                require_proposals: e.require_proposals,
            })
            .collect(),
        require_proposals: row.require_proposals,
        allow_self_approvals: row.allow_self_approvals,
    }
}

#[derive(Debug, FromRow)]
pub struct ConfigRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub description: String,
    pub version: i64,
    pub base_value: serde_json::Value,
    pub base_schema: Option<serde_json::Value>,
    pub base_overrides: serde_json::Value,
}

#[derive(Debug, FromRow)]
pub struct VariantRow {
    pub id: Uuid,
    pub config_id: Uuid,
    pub environment_id: String,
    pub value: serde_json::Value,
    pub schema: Option<serde_json::Value>,
    pub overrides: serde_json::Value,
    pub use_base_schema: bool,
}

#[derive(Debug, FromRow)]
pub struct MemberRow {
    pub user_email: String,
    pub role: String,
}

pub fn member_role_from_str(s: &str) -> anyhow::Result<ConfigMemberRole> {
    match s {
        "maintainer" => Ok(ConfigMemberRole::Maintainer),
        "editor" => Ok(ConfigMemberRole::Editor),
        other => Err(anyhow!("unknown config member role {other}")),
    }
}

pub fn member_role_to_str(role: ConfigMemberRole) -> &'static str {
    match role {
        ConfigMemberRole::Maintainer => "maintainer",
        ConfigMemberRole::Editor => "editor",
    }
}

pub fn config_from_rows(
    row: ConfigRow,
    variant_rows: Vec<VariantRow>,
    member_rows: Vec<MemberRow>,
) -> anyhow::Result<Config> {
    let overrides = serde_json::from_value(row.base_overrides).context("decoding base_overrides")?;
    let mut variants = Vec::with_capacity(variant_rows.len());
    for v in variant_rows {
        variants.push(Variant {
            id: v.id,
            config_id: v.config_id,
            environment_id: v.environment_id,
            body: VariantBody {
                value: v.value,
                schema: v.schema,
                overrides: serde_json::from_value(v.overrides).context("decoding variant overrides")?,
            },
            use_base_schema: v.use_base_schema,
        });
    }
    let mut members = Vec::with_capacity(member_rows.len());
    for m in member_rows {
        members.push(ConfigMember {
            role: member_role_from_str(&m.role)?,
            user_email: m.user_email,
        });
    }
    Ok(Config {
        id: row.id,
        project_id: row.project_id,
        name: row.name,
        description: row.description,
        base: VariantBody {
            value: row.base_value,
            schema: row.base_schema,
            overrides,
        },
        version: row.version,
        members,
        variants,
    })
}

#[derive(Debug, FromRow)]
pub struct ProposalRow {
    pub id: Uuid,
    pub config_id: Uuid,
    pub proposer_id: String,
    pub base_config_version: i64,
    pub description: serde_json::Value,
    pub members: serde_json::Value,
    pub delete: bool,
    pub variants: serde_json::Value,
    pub status: String,
    pub reviewer_id: Option<String>,
    pub rejection_reason: Option<String>,
    pub rejected_in_favor_of_proposal_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
}

fn proposal_status_from_str(s: &str) -> anyhow::Result<ProposalStatus> {
    match s {
        "pending" => Ok(ProposalStatus::Pending),
        "approved" => Ok(ProposalStatus::Approved),
        "rejected" => Ok(ProposalStatus::Rejected),
        other => Err(anyhow!("unknown proposal status {other}")),
    }
}

pub fn proposal_status_to_str(status: ProposalStatus) -> &'static str {
    match status {
        ProposalStatus::Pending => "pending",
        ProposalStatus::Approved => "approved",
        ProposalStatus::Rejected => "rejected",
    }
}

fn rejection_reason_from_str(s: &str) -> anyhow::Result<RejectionReason> {
    match s {
        "rejected_explicitly" => Ok(RejectionReason::RejectedExplicitly),
        "config_edited" => Ok(RejectionReason::ConfigEdited),
        "config_deleted" => Ok(RejectionReason::ConfigDeleted),
        "another_proposal_approved" => Ok(RejectionReason::AnotherProposalApproved),
        other => Err(anyhow!("unknown rejection reason {other}")),
    }
}

pub fn rejection_reason_to_str(reason: RejectionReason) -> &'static str {
    match reason {
        RejectionReason::RejectedExplicitly => "rejected_explicitly",
        RejectionReason::ConfigEdited => "config_edited",
        RejectionReason::ConfigDeleted => "config_deleted",
        RejectionReason::AnotherProposalApproved => "another_proposal_approved",
    }
}

impl TryFrom<ProposalRow> for Proposal {
    type Error = anyhow::Error;

    fn try_from(row: ProposalRow) -> anyhow::Result<Self> {
        Ok(Proposal {
            id: row.id,
            config_id: row.config_id,
            proposer_id: row.proposer_id,
            base_config_version: row.base_config_version,
            description: serde_json::from_value(row.description).context("decoding proposal description")?,
            members: serde_json::from_value(row.members).context("decoding proposal members")?,
            delete: row.delete,
            variants: serde_json::from_value::<Vec<ProposedVariant>>(row.variants)
                .context("decoding proposal variants")?,
            status: proposal_status_from_str(&row.status)?,
            reviewer_id: row.reviewer_id,
            rejection_reason: row.rejection_reason.as_deref().map(rejection_reason_from_str).transpose()?,
            rejected_in_favor_of_proposal_id: row.rejected_in_favor_of_proposal_id,
            created_at: row.created_at,
            approved_at: row.approved_at,
            rejected_at: row.rejected_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct AuditRow {
    pub id: Uuid,
    pub actor_id: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = anyhow::Error;

    fn try_from(row: AuditRow) -> anyhow::Result<Self> {
        Ok(AuditEntry {
            id: row.id,
            actor_id: row.actor_id,
            payload: serde_json::from_value::<AuditPayload>(row.payload).context("decoding audit payload")?,
            created_at: row.created_at,
        })
    }
}

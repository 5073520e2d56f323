//! Config service write path: create/update/delete, schema and condition
//! validation, optimistic concurrency, proposal gating, and audit/event
//! side effects. Read paths (evaluation) live in [`crate::evaluator`] and
//! are driven directly off whatever [`crate::types::Config`] the caller's
//! store adapter returns — there is no read-path service wrapper, since
//! reads need no permission gate beyond [`crate::permission::can_read_config`].

use std::sync::Arc;

use uuid::Uuid;

use crate::condition::Condition;
use crate::error::{ConfigError, Result};
use crate::permission::{can_create_config, can_edit_config, can_manage_config, AuthContext};
use crate::ports::{ConfigChangeEvent, ConfigChangeKind, ConfigWriteInput, EventBusClient, PrimaryStore};
use crate::schema::validate_value;
use crate::types::{AuditEntry, AuditPayload, Config, ConfigMember, ConfigMemberRole, Project, RejectionReason};

pub struct ConfigService {
    store: Arc<dyn PrimaryStore>,
    events: Arc<dyn EventBusClient>,
}

impl ConfigService {
    pub fn new(store: Arc<dyn PrimaryStore>, events: Arc<dyn EventBusClient>) -> Self {
        Self { store, events }
    }

    pub async fn create_config(
        &self,
        ctx: &AuthContext,
        project: &Project,
        input: ConfigWriteInput,
    ) -> Result<Config> {
        if !can_create_config(ctx) {
            return Err(ConfigError::forbidden("requires maintainer role on the project"));
        }
        validate_write_input(&input, project)?;

        let config = self
            .store
            .create_config(project.id, input, Some(&ctx.user_email))
            .await?;

        self.store
            .append_audit_entry(audit_entry(
                Some(ctx.user_email.clone()),
                AuditPayload::ConfigCreated {
                    config_id: config.id,
                    after: Box::new(config.clone()),
                },
            ))
            .await?;

        self.publish(&config, ConfigChangeKind::Upsert).await?;
        Ok(config)
    }

    /// Direct (non-proposal) update. Rejects outright if any touched
    /// environment — or the base, when a base-only edit is made — requires
    /// proposals; the caller should route those edits through
    /// [`crate::proposal`] instead.
    pub async fn update_config(
        &self,
        ctx: &AuthContext,
        project: &Project,
        config_id: Uuid,
        expected_version: i64,
        input: ConfigWriteInput,
    ) -> Result<Config> {
        if !can_edit_config(ctx) {
            return Err(ConfigError::forbidden("requires editor role on the config"));
        }
        let before = self.store.get_config(config_id).await?;
        if before.version != expected_version {
            return Err(ConfigError::StaleVersion {
                expected: expected_version,
                current: before.version,
            });
        }
        if project.requires_proposal_for(None) {
            return Err(ConfigError::forbidden(
                "base requires a proposal; use the proposal workflow",
            ));
        }
        for env in &input.environments {
            if project.requires_proposal_for(Some(&env.environment_id)) {
                return Err(ConfigError::forbidden(format!(
                    "environment {} requires a proposal; use the proposal workflow",
                    env.environment_id
                )));
            }
        }
        validate_write_input(&input, project)?;

        if diff_requires_maintainer(&before, &input) && !can_manage_config(ctx) {
            return Err(ConfigError::forbidden(
                "schema, override, or member changes require maintainer role on the config",
            ));
        }

        let after = self
            .store
            .update_config(config_id, expected_version, input, Some(&ctx.user_email), None)
            .await?;

        self.store
            .append_audit_entry(audit_entry(
                Some(ctx.user_email.clone()),
                AuditPayload::ConfigUpdated {
                    config_id,
                    before: Box::new(before),
                    after: Box::new(after.clone()),
                },
            ))
            .await?;

        self.reject_pending_proposals(config_id, RejectionReason::ConfigEdited, None)
            .await?;
        self.publish(&after, ConfigChangeKind::Upsert).await?;
        Ok(after)
    }

    pub async fn delete_config(
        &self,
        ctx: &AuthContext,
        config_id: Uuid,
        expected_version: i64,
    ) -> Result<()> {
        if !can_manage_config(ctx) {
            return Err(ConfigError::forbidden("requires maintainer role on the config"));
        }
        let before = self.store.get_config(config_id).await?;
        if before.version != expected_version {
            return Err(ConfigError::StaleVersion {
                expected: expected_version,
                current: before.version,
            });
        }

        self.store
            .delete_config(config_id, expected_version, Some(&ctx.user_email))
            .await?;

        self.store
            .append_audit_entry(audit_entry(
                Some(ctx.user_email.clone()),
                AuditPayload::ConfigDeleted {
                    config_id,
                    before: Box::new(before.clone()),
                },
            ))
            .await?;

        self.reject_pending_proposals(config_id, RejectionReason::ConfigDeleted, None)
            .await?;

        self.events
            .notify(&ConfigChangeEvent {
                config_id,
                version: expected_version,
                kind: ConfigChangeKind::Delete,
            })
            .await?;
        Ok(())
    }

    /// Mark every still-pending proposal on `config_id` as rejected for
    /// `reason`. `originating_proposal_id`, when given, is the proposal that
    /// just got approved: it's skipped if still present in the pending list,
    /// and every rejected sibling has its `rejected_in_favor_of_proposal_id`
    /// set to it. Used by direct edits/deletes (no originating proposal) and
    /// by proposal approval (the approved proposal's id), both of which
    /// invalidate sibling proposals.
    pub(crate) async fn reject_pending_proposals(
        &self,
        config_id: Uuid,
        reason: RejectionReason,
        originating_proposal_id: Option<Uuid>,
    ) -> Result<()> {
        let pending = self.store.list_pending_proposals(config_id).await?;
        for mut proposal in pending {
            if Some(proposal.id) == originating_proposal_id {
                continue;
            }
            proposal.status = crate::types::ProposalStatus::Rejected;
            proposal.rejection_reason = Some(reason);
            proposal.rejected_in_favor_of_proposal_id = originating_proposal_id;
            proposal.rejected_at = Some(chrono::Utc::now());
            let proposal_id = proposal.id;
            self.store.save_proposal(proposal).await?;
            self.store
                .append_audit_entry(audit_entry(
                    None,
                    AuditPayload::ConfigProposalRejected {
                        proposal_id,
                        config_id,
                        reason,
                    },
                ))
                .await?;
        }
        Ok(())
    }

    async fn publish(&self, config: &Config, kind: ConfigChangeKind) -> Result<()> {
        self.events
            .notify(&ConfigChangeEvent {
                config_id: config.id,
                version: config.version,
                kind,
            })
            .await
    }

}

/// Per §4.L point 4: any schema, override, or membership change requires
/// maintainer; a pure value change (base or any environment) only requires
/// editor. Diffs by `(environmentId, value, schema, overrides,
/// useBaseSchema)` structural equality per §4.L point 3 — created/deleted
/// environments and schema/override/use_base_schema changes on an existing
/// one all count as maintainer-sensitive, value-only edits don't.
fn diff_requires_maintainer(before: &Config, input: &ConfigWriteInput) -> bool {
    if members_changed(&before.members, &input.members) {
        return true;
    }
    if before.base.schema != input.base.schema || before.base.overrides != input.base.overrides {
        return true;
    }

    let mut remaining: std::collections::HashMap<&str, &crate::types::Variant> = before
        .variants
        .iter()
        .map(|v| (v.environment_id.as_str(), v))
        .collect();
    for env in &input.environments {
        match remaining.remove(env.environment_id.as_str()) {
            None => return true,
            Some(existing) => {
                if existing.body.schema != env.body.schema
                    || existing.body.overrides != env.body.overrides
                    || existing.use_base_schema != env.use_base_schema
                {
                    return true;
                }
            }
        }
    }
    // Any environment variant left in `remaining` was dropped by this write.
    !remaining.is_empty()
}

fn members_changed(before: &[ConfigMember], after: &[ConfigMember]) -> bool {
    fn to_map(ms: &[ConfigMember]) -> std::collections::HashMap<&str, ConfigMemberRole> {
        ms.iter().map(|m| (m.user_email.as_str(), m.role)).collect()
    }
    to_map(before) != to_map(after)
}

/// Validate a whole write input: member email uniqueness, base + every
/// environment variant's schema (if the value is present), and every
/// override condition (structural rules, plus same-project reference
/// scoping).
pub(crate) fn validate_write_input(input: &ConfigWriteInput, project: &Project) -> Result<()> {
    let mut seen_emails = std::collections::HashSet::new();
    for member in &input.members {
        if !seen_emails.insert(member.user_email.as_str()) {
            return Err(ConfigError::bad_request(format!(
                "duplicate member email {}",
                member.user_email
            )));
        }
    }

    validate_variant(&input.base.value, input.base.schema.as_ref(), &input.base.overrides, project)?;
    for env in &input.environments {
        if project.environment(&env.environment_id).is_none() {
            return Err(ConfigError::bad_request(format!(
                "unknown environment id {}",
                env.environment_id
            )));
        }
        let schema = if env.use_base_schema {
            input.base.schema.as_ref()
        } else {
            env.body.schema.as_ref()
        };
        validate_variant(&env.body.value, schema, &env.body.overrides, project)?;
    }
    Ok(())
}

fn validate_variant(
    value: &serde_json::Value,
    schema: Option<&serde_json::Value>,
    overrides: &[crate::types::Override],
    project: &Project,
) -> Result<()> {
    if let Some(schema) = schema {
        let result = validate_value(value, schema);
        if !result.valid {
            return Err(ConfigError::bad_request(format!(
                "value fails schema validation: {}",
                result.errors.join("; ")
            )));
        }
    }
    for ov in overrides {
        if let Some(schema) = schema {
            let result = validate_value(&ov.value, schema);
            if !result.valid {
                return Err(ConfigError::bad_request(format!(
                    "override {} value fails schema validation: {}",
                    ov.name,
                    result.errors.join("; ")
                )));
            }
        }
        for condition in &ov.conditions {
            validate_condition(condition, project)?;
        }
    }
    Ok(())
}

fn validate_condition(condition: &Condition, project: &Project) -> Result<()> {
    condition.validate()?;
    for (project_id, _, _) in condition.references() {
        if *project_id != project.id {
            return Err(ConfigError::bad_request(
                "references may only target configs in the same project",
            ));
        }
    }
    Ok(())
}

fn audit_entry(actor_id: Option<String>, payload: AuditPayload) -> AuditEntry {
    AuditEntry {
        id: Uuid::new_v4(),
        actor_id,
        payload,
        created_at: chrono::Utc::now(),
    }
}

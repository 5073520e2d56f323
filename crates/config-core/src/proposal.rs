//! Proposal service: the governed-edit workflow for environments (or
//! projects) that require review before a change takes effect.
//!
//! A proposal carries a sparse diff (`ProposedField::Unchanged` fields
//! inherit the config's current value) against the config's state *as of
//! `base_config_version`*. Approval re-checks that version, resolves the
//! diff into a full [`crate::ports::ConfigWriteInput`], and runs it through
//! the same validation and persistence path as a direct edit.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{ConfigError, Result};
use crate::permission::{can_approve_proposal, can_edit_config, AuthContext};
use crate::ports::{ConfigWriteInput, EnvironmentVariantInput, EventBusClient, PrimaryStore};
use crate::service::{validate_write_input, ConfigService};
use crate::types::{
    AuditEntry, AuditPayload, Config, Project, Proposal, ProposalStatus, ProposedVariant,
    RejectionReason, VariantBody,
};

pub struct ProposalService {
    store: Arc<dyn PrimaryStore>,
    configs: ConfigService,
}

impl ProposalService {
    pub fn new(store: Arc<dyn PrimaryStore>, events: Arc<dyn EventBusClient>) -> Self {
        Self {
            store: store.clone(),
            configs: ConfigService::new(store, events),
        }
    }

    pub async fn create_proposal(
        &self,
        ctx: &AuthContext,
        project: &Project,
        config: &Config,
        mut proposal: Proposal,
    ) -> Result<Proposal> {
        if !can_edit_config(ctx) {
            return Err(ConfigError::forbidden("requires editor role on the config"));
        }
        if proposal.base_config_version != config.version {
            return Err(ConfigError::StaleVersion {
                expected: proposal.base_config_version,
                current: config.version,
            });
        }
        let resolved = resolve_write_input(config, &proposal);
        validate_write_input(&resolved, project)?;

        proposal.id = Uuid::new_v4();
        proposal.proposer_id = ctx.user_email.clone();
        proposal.status = ProposalStatus::Pending;
        proposal.reviewer_id = None;
        proposal.rejection_reason = None;
        proposal.rejected_in_favor_of_proposal_id = None;
        proposal.created_at = Utc::now();
        proposal.approved_at = None;
        proposal.rejected_at = None;

        let saved = self.store.create_proposal(proposal).await?;
        self.store
            .append_audit_entry(audit_entry(
                Some(ctx.user_email.clone()),
                AuditPayload::ConfigProposalCreated {
                    proposal_id: saved.id,
                    config_id: config.id,
                },
            ))
            .await?;
        Ok(saved)
    }

    /// Approve a pending proposal: resolve its diff against the config's
    /// current state, persist through the same path a direct edit takes,
    /// mark the proposal approved, and reject every other proposal still
    /// pending on the same config (they were diffed against a base version
    /// that no longer exists).
    pub async fn approve_proposal(
        &self,
        ctx: &AuthContext,
        project: &Project,
        proposal: Proposal,
    ) -> Result<Config> {
        if !can_approve_proposal(ctx, project, &proposal.proposer_id) {
            return Err(ConfigError::forbidden(
                "requires maintainer role and, unless self-approvals are allowed, a different reviewer",
            ));
        }
        if proposal.is_terminal() {
            return Err(ConfigError::bad_request("proposal already resolved"));
        }

        let config = self.store.get_config(proposal.config_id).await?;
        if proposal.base_config_version != config.version {
            return Err(ConfigError::StaleVersion {
                expected: proposal.base_config_version,
                current: config.version,
            });
        }

        if proposal.delete {
            self.store
                .delete_config(config.id, config.version, Some(&ctx.user_email))
                .await?;
            self.store
                .append_audit_entry(audit_entry(
                    Some(ctx.user_email.clone()),
                    AuditPayload::ConfigDeleted {
                        config_id: config.id,
                        before: Box::new(config.clone()),
                    },
                ))
                .await?;
            self.finalize_approval(&ctx.user_email, proposal, config.id).await?;
            self.configs
                .reject_pending_proposals(config.id, RejectionReason::ConfigDeleted, None)
                .await?;
            return Ok(config);
        }

        let resolved = resolve_write_input(&config, &proposal);
        validate_write_input(&resolved, project)?;

        let after = self
            .store
            .update_config(
                config.id,
                config.version,
                resolved,
                Some(&ctx.user_email),
                Some(proposal.id),
            )
            .await?;

        self.store
            .append_audit_entry(audit_entry(
                Some(ctx.user_email.clone()),
                AuditPayload::ConfigUpdated {
                    config_id: config.id,
                    before: Box::new(config.clone()),
                    after: Box::new(after.clone()),
                },
            ))
            .await?;

        let approved_id = proposal.id;
        self.finalize_approval(&ctx.user_email, proposal, config.id).await?;
        self.configs
            .reject_pending_proposals(config.id, RejectionReason::AnotherProposalApproved, Some(approved_id))
            .await?;

        Ok(after)
    }

    async fn finalize_approval(&self, reviewer: &str, mut proposal: Proposal, config_id: Uuid) -> Result<()> {
        let proposal_id = proposal.id;
        proposal.status = ProposalStatus::Approved;
        proposal.reviewer_id = Some(reviewer.to_string());
        proposal.approved_at = Some(Utc::now());
        self.store.save_proposal(proposal).await?;
        self.store
            .append_audit_entry(audit_entry(
                Some(reviewer.to_string()),
                AuditPayload::ConfigProposalApproved {
                    proposal_id,
                    config_id,
                    reviewer_id: reviewer.to_string(),
                },
            ))
            .await
    }

    /// Explicit rejection by a maintainer, or withdrawal by the proposer.
    pub async fn reject_proposal(
        &self,
        ctx: &AuthContext,
        project: &Project,
        mut proposal: Proposal,
        rejected_in_favor_of: Option<Uuid>,
    ) -> Result<Proposal> {
        let is_self_withdrawal = ctx.user_email == proposal.proposer_id;
        if !is_self_withdrawal && !can_approve_proposal(ctx, project, &proposal.proposer_id) {
            return Err(ConfigError::forbidden(
                "requires maintainer role, or the proposer withdrawing their own proposal",
            ));
        }
        if proposal.is_terminal() {
            return Err(ConfigError::bad_request("proposal already resolved"));
        }

        proposal.status = ProposalStatus::Rejected;
        proposal.reviewer_id = Some(ctx.user_email.clone());
        proposal.rejection_reason = Some(RejectionReason::RejectedExplicitly);
        proposal.rejected_in_favor_of_proposal_id = rejected_in_favor_of;
        proposal.rejected_at = Some(Utc::now());

        let saved = self.store.save_proposal(proposal).await?;
        self.store
            .append_audit_entry(audit_entry(
                Some(ctx.user_email.clone()),
                AuditPayload::ConfigProposalRejected {
                    proposal_id: saved.id,
                    config_id: saved.config_id,
                    reason: RejectionReason::RejectedExplicitly,
                },
            ))
            .await?;
        Ok(saved)
    }
}

/// Resolve a proposal's sparse diff against a config's current state into a
/// full write input. Deleted variants are dropped; non-deleted variants not
/// present in the proposal pass the config's existing body through
/// unchanged (a proposal only ever lists variants it touches).
fn resolve_write_input(config: &Config, proposal: &Proposal) -> ConfigWriteInput {
    let base_proposed = proposal.variants.iter().find(|v| v.environment_id.is_none());
    let base = match base_proposed {
        Some(p) => resolve_variant_body(&config.base, p),
        None => config.base.clone(),
    };

    let mut environments = Vec::new();
    for variant in &config.variants {
        let proposed = proposal
            .variants
            .iter()
            .find(|v| v.environment_id.as_deref() == Some(variant.environment_id.as_str()));
        match proposed {
            Some(p) if p.deleted => continue,
            Some(p) => environments.push(EnvironmentVariantInput {
                environment_id: variant.environment_id.clone(),
                body: resolve_variant_body(&variant.body, p),
                use_base_schema: p.use_base_schema.resolve(&variant.use_base_schema),
            }),
            None => environments.push(EnvironmentVariantInput {
                environment_id: variant.environment_id.clone(),
                body: variant.body.clone(),
                use_base_schema: variant.use_base_schema,
            }),
        }
    }
    for p in &proposal.variants {
        let Some(env_id) = &p.environment_id else { continue };
        if p.deleted {
            continue;
        }
        if config.variant_for(env_id).is_some() {
            continue;
        }
        environments.push(EnvironmentVariantInput {
            environment_id: env_id.clone(),
            body: VariantBody {
                value: p.value.resolve(&serde_json::Value::Null),
                schema: p.schema.resolve(&None),
                overrides: p.overrides.resolve(&Vec::new()),
            },
            use_base_schema: p.use_base_schema.resolve(&false),
        });
    }

    ConfigWriteInput {
        name: config.name.clone(),
        description: proposal.description.resolve(&config.description),
        base,
        environments,
        members: proposal.members.resolve(&config.members),
    }
}

fn resolve_variant_body(current: &VariantBody, proposed: &ProposedVariant) -> VariantBody {
    VariantBody {
        value: proposed.value.resolve(&current.value),
        schema: proposed.schema.resolve(&current.schema),
        overrides: proposed.overrides.resolve(&current.overrides),
    }
}

fn audit_entry(actor_id: Option<String>, payload: AuditPayload) -> AuditEntry {
    AuditEntry {
        id: Uuid::new_v4(),
        actor_id,
        payload,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ConfigChangeEvent;
    use crate::types::{
        ConfigMember, ConfigMemberRole, Environment, ProposedField, Variant,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct FakeStore {
        configs: Mutex<std::collections::HashMap<Uuid, Config>>,
        proposals: Mutex<std::collections::HashMap<Uuid, Proposal>>,
        audits: Mutex<Vec<AuditEntry>>,
    }

    impl FakeStore {
        fn with(config: Config) -> Self {
            let mut map = std::collections::HashMap::new();
            map.insert(config.id, config);
            Self {
                configs: Mutex::new(map),
                proposals: Mutex::new(std::collections::HashMap::new()),
                audits: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PrimaryStore for FakeStore {
        async fn get_config_by_name(&self, _project_id: Uuid, _name: &str) -> Result<Option<Config>> {
            Ok(None)
        }
        async fn get_config(&self, config_id: Uuid) -> Result<Config> {
            self.configs
                .lock()
                .unwrap()
                .get(&config_id)
                .cloned()
                .ok_or_else(|| ConfigError::not_found("config"))
        }
        async fn get_project(&self, _project_id: Uuid) -> Result<Project> {
            unimplemented!()
        }
        async fn create_config(
            &self,
            _project_id: Uuid,
            _input: ConfigWriteInput,
            _author: Option<&str>,
        ) -> Result<Config> {
            unimplemented!()
        }
        async fn update_config(
            &self,
            config_id: Uuid,
            expected_version: i64,
            input: ConfigWriteInput,
            _author: Option<&str>,
            _originating_proposal_id: Option<Uuid>,
        ) -> Result<Config> {
            let mut configs = self.configs.lock().unwrap();
            let existing = configs.get(&config_id).unwrap();
            if existing.version != expected_version {
                return Err(ConfigError::StaleVersion {
                    expected: expected_version,
                    current: existing.version,
                });
            }
            let mut updated = existing.clone();
            updated.description = input.description;
            updated.base = input.base;
            updated.members = input.members;
            updated.version += 1;
            configs.insert(config_id, updated.clone());
            Ok(updated)
        }
        async fn delete_config(&self, config_id: Uuid, _expected_version: i64, _author: Option<&str>) -> Result<()> {
            self.configs.lock().unwrap().remove(&config_id);
            Ok(())
        }
        async fn append_audit_entry(&self, entry: AuditEntry) -> Result<()> {
            self.audits.lock().unwrap().push(entry);
            Ok(())
        }
        async fn create_proposal(&self, proposal: Proposal) -> Result<Proposal> {
            self.proposals.lock().unwrap().insert(proposal.id, proposal.clone());
            Ok(proposal)
        }
        async fn get_proposal(&self, proposal_id: Uuid) -> Result<Proposal> {
            self.proposals
                .lock()
                .unwrap()
                .get(&proposal_id)
                .cloned()
                .ok_or_else(|| ConfigError::not_found("proposal"))
        }
        async fn save_proposal(&self, proposal: Proposal) -> Result<Proposal> {
            self.proposals.lock().unwrap().insert(proposal.id, proposal.clone());
            Ok(proposal)
        }
        async fn list_pending_proposals(&self, config_id: Uuid) -> Result<Vec<Proposal>> {
            Ok(self
                .proposals
                .lock()
                .unwrap()
                .values()
                .filter(|p| p.config_id == config_id && p.status == ProposalStatus::Pending)
                .cloned()
                .collect())
        }
    }

    struct FakeBus;

    #[async_trait]
    impl EventBusClient for FakeBus {
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn notify(&self, _event: &ConfigChangeEvent) -> Result<()> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ConfigChangeEvent> {
            tokio::sync::broadcast::channel(1).1
        }
    }

    fn project() -> Project {
        Project {
            id: Uuid::new_v4(),
            name: "p".into(),
            environments: vec![Environment {
                id: "prod".into(),
                name: "Production".into(),
                require_proposals: true,
            }],
            require_proposals: false,
            allow_self_approvals: true,
        }
    }

    fn config(project_id: Uuid) -> Config {
        Config {
            id: Uuid::new_v4(),
            project_id,
            name: "flag".into(),
            description: "desc".into(),
            base: VariantBody {
                value: json!(false),
                schema: None,
                overrides: vec![],
            },
            version: 3,
            members: vec![ConfigMember {
                user_email: "editor@example.com".into(),
                role: ConfigMemberRole::Editor,
            }],
            variants: vec![Variant {
                id: Uuid::new_v4(),
                config_id: Uuid::new_v4(),
                environment_id: "prod".into(),
                body: VariantBody {
                    value: json!("old"),
                    schema: None,
                    overrides: vec![],
                },
                use_base_schema: false,
            }],
        }
    }

    fn pending_proposal(config_id: Uuid, base_version: i64) -> Proposal {
        Proposal {
            id: Uuid::new_v4(),
            config_id,
            proposer_id: "editor@example.com".into(),
            base_config_version: base_version,
            description: ProposedField::Unchanged,
            members: ProposedField::Unchanged,
            delete: false,
            variants: vec![ProposedVariant {
                environment_id: Some("prod".into()),
                value: ProposedField::New(json!("new")),
                schema: ProposedField::Unchanged,
                overrides: ProposedField::Unchanged,
                use_base_schema: ProposedField::Unchanged,
                deleted: false,
            }],
            status: ProposalStatus::Pending,
            reviewer_id: None,
            rejection_reason: None,
            rejected_in_favor_of_proposal_id: None,
            created_at: Utc::now(),
            approved_at: None,
            rejected_at: None,
        }
    }

    fn maintainer_ctx(email: &str) -> AuthContext {
        AuthContext {
            user_email: email.into(),
            workspace_role: None,
            project_role: None,
            config_role: Some(ConfigMemberRole::Maintainer),
        }
    }

    #[tokio::test]
    async fn approve_resolves_diff_and_bumps_version() {
        let project = project();
        let cfg = config(project.id);
        let proposal = pending_proposal(cfg.id, cfg.version);
        let store = Arc::new(FakeStore::with(cfg.clone()));
        store.create_proposal(proposal.clone()).await.unwrap();
        let svc = ProposalService::new(store.clone(), Arc::new(FakeBus));

        let after = svc
            .approve_proposal(&maintainer_ctx("maintainer@example.com"), &project, proposal.clone())
            .await
            .unwrap();
        assert_eq!(after.version, 4);

        let stored_proposal = store.get_proposal(proposal.id).await.unwrap();
        assert_eq!(stored_proposal.status, ProposalStatus::Approved);
    }

    #[tokio::test]
    async fn approve_rejects_self_approval_when_disallowed() {
        let mut project = project();
        project.allow_self_approvals = false;
        let cfg = config(project.id);
        let proposal = pending_proposal(cfg.id, cfg.version);
        let store = Arc::new(FakeStore::with(cfg.clone()));
        store.create_proposal(proposal.clone()).await.unwrap();
        let svc = ProposalService::new(store, Arc::new(FakeBus));

        let err = svc
            .approve_proposal(&maintainer_ctx("editor@example.com"), &project, proposal)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Forbidden(_)));
    }

    #[tokio::test]
    async fn approve_rejects_stale_base_version() {
        let project = project();
        let cfg = config(project.id);
        let proposal = pending_proposal(cfg.id, cfg.version - 1);
        let store = Arc::new(FakeStore::with(cfg.clone()));
        store.create_proposal(proposal.clone()).await.unwrap();
        let svc = ProposalService::new(store, Arc::new(FakeBus));

        let err = svc
            .approve_proposal(&maintainer_ctx("maintainer@example.com"), &project, proposal)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::StaleVersion { .. }));
    }

    #[tokio::test]
    async fn approving_one_proposal_cascades_rejection_to_siblings() {
        let project = project();
        let cfg = config(project.id);
        let winner = pending_proposal(cfg.id, cfg.version);
        let loser = pending_proposal(cfg.id, cfg.version);
        let store = Arc::new(FakeStore::with(cfg.clone()));
        store.create_proposal(winner.clone()).await.unwrap();
        store.create_proposal(loser.clone()).await.unwrap();
        let svc = ProposalService::new(store.clone(), Arc::new(FakeBus));

        svc.approve_proposal(&maintainer_ctx("maintainer@example.com"), &project, winner.clone())
            .await
            .unwrap();

        let loser_after = store.get_proposal(loser.id).await.unwrap();
        assert_eq!(loser_after.status, ProposalStatus::Rejected);
        assert_eq!(
            loser_after.rejection_reason,
            Some(RejectionReason::AnotherProposalApproved)
        );
        assert_eq!(loser_after.rejected_in_favor_of_proposal_id, Some(winner.id));
    }

    #[tokio::test]
    async fn proposer_can_withdraw_own_proposal() {
        let project = project();
        let cfg = config(project.id);
        let proposal = pending_proposal(cfg.id, cfg.version);
        let store = Arc::new(FakeStore::with(cfg.clone()));
        store.create_proposal(proposal.clone()).await.unwrap();
        let svc = ProposalService::new(store.clone(), Arc::new(FakeBus));

        let ctx = AuthContext {
            user_email: "editor@example.com".into(),
            workspace_role: None,
            project_role: None,
            config_role: Some(ConfigMemberRole::Editor),
        };
        let withdrawn = svc.reject_proposal(&ctx, &project, proposal, None).await.unwrap();
        assert_eq!(withdrawn.status, ProposalStatus::Rejected);
        assert_eq!(withdrawn.rejection_reason, Some(RejectionReason::RejectedExplicitly));
    }
}

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use tollgate_core::approvals::{apply_action, recompute_aggregate, validate_target};
use tollgate_core::audit::{ActorContext, HistoryEvent, PiiHasher};
use tollgate_core::config::ApprovalsConfig;
use tollgate_core::domain::approval::{
    Approval, ApprovalAggregate, ApprovalId, ApprovalStatus, CartId,
};
use tollgate_core::domain::history::ApprovalHistory;
use tollgate_core::domain::purchase::PurchaseContext;
use tollgate_core::domain::rule::{
    ApprovalRule, ApprovalRuleId, ApprovalRuleUpdate, NewApprovalRule,
};
use tollgate_core::domain::settings::{ApprovalSettings, ApprovalSettingsUpdate, CompanyId};
use tollgate_core::errors::{ApplicationError, DomainError};
use tollgate_core::escalation::should_escalate;
use tollgate_core::rules::{MatchedRequirement, RuleMatcher};
use tollgate_db::repositories::CreateOutcome;

use crate::audit_trail::AuditTrailRecorder;
use crate::saga::{Compensation, Step};
use crate::stores::ApprovalStores;

pub const REASON_REQUESTED: &str = "approval_requested";
pub const REASON_RESTORED: &str = "approval_restored";
pub const REASON_ESCALATION_TIMEOUT: &str = "escalation_timeout";

const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestedApprovals {
    /// One approval per required type, highest-priority requirement first.
    pub approvals: Vec<Approval>,
    pub aggregate_status: ApprovalStatus,
}

/// An approver's decision on one approval, with the identity the caller already resolved.
#[derive(Clone, Debug)]
pub struct ApprovalDecision {
    pub target: ApprovalStatus,
    pub actor: ActorContext,
    pub comment: Option<String>,
    pub cart_total: Option<Decimal>,
}

impl ApprovalDecision {
    pub fn new(target: ApprovalStatus, actor: ActorContext) -> Self {
        Self { target, actor, comment: None, cart_total: None }
    }

    pub fn approve(actor: ActorContext) -> Self {
        Self::new(ApprovalStatus::Approved, actor)
    }

    pub fn reject(actor: ActorContext) -> Self {
        Self::new(ApprovalStatus::Rejected, actor)
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_cart_total(mut self, cart_total: Decimal) -> Self {
        self.cart_total = Some(cart_total);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActedApproval {
    pub approval: Approval,
    pub aggregate_status: ApprovalStatus,
    /// False when the actor had already approved; nothing was written.
    pub changed: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EscalationSweep {
    pub examined: usize,
    pub escalated: Vec<ApprovalId>,
    pub skipped_unconfigured: usize,
}

struct AggregateChange {
    aggregate: ApprovalAggregate,
    compensation: Option<Compensation>,
}

/// The approval engine: rule evaluation, approver decisions, aggregate gating, escalation,
/// and the administrative CRUD it depends on.
#[derive(Clone)]
pub struct ApprovalService {
    stores: ApprovalStores,
    matcher: RuleMatcher,
    audit: AuditTrailRecorder,
    max_attempts: u32,
}

impl ApprovalService {
    pub fn new(stores: ApprovalStores, hasher: PiiHasher) -> Self {
        let audit = AuditTrailRecorder::new(stores.history.clone(), hasher);
        Self { stores, matcher: RuleMatcher, audit, max_attempts: DEFAULT_MAX_ATTEMPTS }
    }

    pub fn from_config(stores: ApprovalStores, config: &ApprovalsConfig) -> Self {
        Self::new(stores, PiiHasher::new(config.pii_hash_pepper.clone()))
            .with_max_attempts(config.aggregate_max_attempts)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub async fn evaluate_and_request_approvals(
        &self,
        company_id: &CompanyId,
        cart_id: &CartId,
        context: &PurchaseContext,
    ) -> Result<Step<RequestedApprovals>, ApplicationError> {
        self.evaluate_and_request_approvals_at(company_id, cart_id, context, Utc::now()).await
    }

    /// Matches the company's rules against `context` and makes sure one approval exists per
    /// required type. Partial work is compensated before an error is returned.
    pub async fn evaluate_and_request_approvals_at(
        &self,
        company_id: &CompanyId,
        cart_id: &CartId,
        context: &PurchaseContext,
        now: DateTime<Utc>,
    ) -> Result<Step<RequestedApprovals>, ApplicationError> {
        let settings = self.get_settings(company_id).await?;
        let rules = self.stores.rules.list_for_company(company_id).await?;
        let requirements = self.matcher.requirements_with_settings(&settings, &rules, context, now);
        debug!(
            event_name = "approval.rules_evaluated",
            company_id = %company_id.0,
            cart_id = %cart_id.0,
            rule_count = rules.len(),
            requirement_count = requirements.len(),
            "approval rules evaluated"
        );

        let mut step = Step::new(RequestedApprovals {
            approvals: Vec::new(),
            aggregate_status: ApprovalStatus::Pending,
        });
        let result =
            self.request_requirements(&mut step, company_id, cart_id, context, &requirements, now)
                .await;

        match result {
            Ok(()) => Ok(step),
            Err(failure) => {
                warn!(
                    event_name = "approval.request_failed",
                    company_id = %company_id.0,
                    cart_id = %cart_id.0,
                    error = %failure,
                    "approval request failed; compensating partial work"
                );
                if let Err(compensation_error) = self.compensate_at(step.compensations, now).await {
                    error!(
                        event_name = "approval.compensation_failed",
                        cart_id = %cart_id.0,
                        error = %compensation_error,
                        "compensation after failed approval request did not complete"
                    );
                }
                Err(failure)
            }
        }
    }

    async fn request_requirements(
        &self,
        step: &mut Step<RequestedApprovals>,
        company_id: &CompanyId,
        cart_id: &CartId,
        context: &PurchaseContext,
        requirements: &[MatchedRequirement],
        now: DateTime<Utc>,
    ) -> Result<(), ApplicationError> {
        // New pending rows reopen an approved gate in storage; undo restores it after them.
        let before = self.stores.aggregates.find_by_cart(cart_id).await?;
        let mut gate_restorable = false;

        for matched in requirements {
            let requirement = matched.requirement;
            let candidate = Approval::new_pending(
                cart_id.clone(),
                company_id.clone(),
                requirement.approval_type,
                requirement.required_count,
                now,
            );

            let outcome = self.stores.approvals.create_if_absent(candidate, now).await?;
            let (approval, recorded) = match outcome {
                CreateOutcome::Created(approval) => (approval, Some((None, REASON_REQUESTED))),
                CreateOutcome::Restored(approval) => {
                    let previous_status = Some(approval.status);
                    (approval, Some((previous_status, REASON_RESTORED)))
                }
                CreateOutcome::Existing(approval) => (approval, None),
            };

            if let Some((previous_status, reason)) = recorded {
                if !gate_restorable {
                    gate_restorable = true;
                    step.compensations.push(Compensation::RestoreAggregate {
                        cart_id: cart_id.clone(),
                        previous: before.clone(),
                    });
                }
                step.compensations
                    .push(Compensation::SoftDeleteApproval { approval_id: approval.id.clone() });
                self.audit
                    .record(
                        HistoryEvent::for_approval(&approval, previous_status, ActorContext::system())
                            .with_reason(Some(reason.to_string()))
                            .with_cart_total(Some(context.total)),
                        now,
                    )
                    .await?;
                info!(
                    event_name = "approval.requested",
                    approval_id = %approval.id.0,
                    company_id = %company_id.0,
                    cart_id = %cart_id.0,
                    approval_type = approval.approval_type.as_str(),
                    required_count = approval.required_count,
                    reason,
                    "approval requested"
                );
            } else {
                info!(
                    event_name = "approval.idempotent_hit",
                    approval_id = %approval.id.0,
                    cart_id = %cart_id.0,
                    approval_type = approval.approval_type.as_str(),
                    "approval already requested for cart and type"
                );
            }
            push_unique(&mut step.value.approvals, approval);
        }

        let change = self.reconcile_aggregate(cart_id, ApprovalStatus::Pending, now).await?;
        step.value.aggregate_status = change.aggregate.status;
        if !gate_restorable {
            step.compensations.extend(change.compensation);
        }
        Ok(())
    }

    pub async fn act_on_approval(
        &self,
        approval_id: &ApprovalId,
        decision: ApprovalDecision,
    ) -> Result<Step<ActedApproval>, ApplicationError> {
        self.act_on_approval_at(approval_id, decision, Utc::now()).await
    }

    /// Applies an approver decision, records it in the audit trail, and recomputes the cart
    /// aggregate. Invalid targets fail before anything is read or written.
    pub async fn act_on_approval_at(
        &self,
        approval_id: &ApprovalId,
        decision: ApprovalDecision,
        now: DateTime<Utc>,
    ) -> Result<Step<ActedApproval>, ApplicationError> {
        let target = validate_target(decision.target)?;

        let mut attempt = 0;
        let (outcome, previous) = loop {
            attempt += 1;
            let current = self.live_approval(approval_id).await?;
            let outcome = apply_action(&current, target, &decision.actor, now)?;
            if !outcome.changed {
                let change =
                    self.reconcile_aggregate(&current.cart_id, current.status, now).await?;
                return Ok(Step::new(ActedApproval {
                    approval: outcome.approval,
                    aggregate_status: change.aggregate.status,
                    changed: false,
                }));
            }
            if self.stores.approvals.update_if_version(&outcome.approval, current.version).await? {
                break (outcome, current);
            }
            debug!(
                event_name = "approval.version_conflict",
                approval_id = %approval_id.0,
                attempt,
                "approval changed concurrently; retrying"
            );
            if attempt >= self.max_attempts {
                return Err(ApplicationError::Conflict(format!(
                    "approval `{}` kept changing after {attempt} attempts",
                    approval_id.0
                )));
            }
        };

        let approval = outcome.approval;
        let actor_role = decision.actor.role.clone();
        let event =
            HistoryEvent::for_approval(&approval, Some(outcome.previous_status), decision.actor)
                .with_reason(decision.comment)
                .with_cart_total(decision.cart_total);
        if let Err(failure) = self.audit.record(event, now).await {
            self.revert_unaudited(&approval, previous, now).await;
            return Err(failure.into());
        }

        let change = self.reconcile_aggregate(&approval.cart_id, approval.status, now).await?;
        info!(
            event_name = "approval.acted",
            approval_id = %approval.id.0,
            cart_id = %approval.cart_id.0,
            previous_status = outcome.previous_status.as_str(),
            new_status = approval.status.as_str(),
            actor_role = %actor_role,
            remaining_approvals = approval.remaining_approvals(),
            aggregate_status = change.aggregate.status.as_str(),
            "approval decision applied"
        );

        let mut step = Step::new(ActedApproval {
            approval,
            aggregate_status: change.aggregate.status,
            changed: true,
        });
        if let Some(compensation) = change.compensation {
            step.compensations.push(compensation);
        }
        Ok(step)
    }

    pub async fn get_aggregate_status(
        &self,
        cart_id: &CartId,
    ) -> Result<ApprovalStatus, ApplicationError> {
        self.stores
            .aggregates
            .find_by_cart(cart_id)
            .await?
            .map(|aggregate| aggregate.status)
            .ok_or_else(|| ApplicationError::not_found("approval_status", cart_id.0.clone()))
    }

    pub async fn has_pending_approvals(&self, cart_id: &CartId) -> Result<bool, ApplicationError> {
        let summary = self.stores.approvals.summarize_cart(cart_id).await?;
        Ok(summary.has_pending())
    }

    pub async fn list_approvals_for_cart(
        &self,
        cart_id: &CartId,
    ) -> Result<Vec<Approval>, ApplicationError> {
        Ok(self.stores.approvals.list_for_cart(cart_id).await?)
    }

    pub async fn check_escalation(
        &self,
        approval_id: &ApprovalId,
    ) -> Result<bool, ApplicationError> {
        self.check_escalation_at(approval_id, Utc::now()).await
    }

    /// Read-only: reports whether the approval is due for escalation without flagging it.
    pub async fn check_escalation_at(
        &self,
        approval_id: &ApprovalId,
        now: DateTime<Utc>,
    ) -> Result<bool, ApplicationError> {
        let approval = self.live_approval(approval_id).await?;
        let settings = self.get_settings(&approval.company_id).await?;
        Ok(should_escalate(&approval, &settings, now))
    }

    pub async fn mark_escalated(
        &self,
        approval_id: &ApprovalId,
    ) -> Result<bool, ApplicationError> {
        self.mark_escalated_at(approval_id, Utc::now()).await
    }

    /// Flags a pending approval as escalated. Returns true only for the call that flipped it.
    pub async fn mark_escalated_at(
        &self,
        approval_id: &ApprovalId,
        now: DateTime<Utc>,
    ) -> Result<bool, ApplicationError> {
        let mut attempt = 0;
        let (escalated, previous) = loop {
            attempt += 1;
            let current = self.live_approval(approval_id).await?;
            if current.escalated || current.status != ApprovalStatus::Pending {
                return Ok(false);
            }

            let mut next = current.clone();
            next.escalated = true;
            next.escalated_at = Some(now);
            next.updated_at = now;
            next.version = current.version.saturating_add(1);
            if self.stores.approvals.update_if_version(&next, current.version).await? {
                break (next, current);
            }
            if attempt >= self.max_attempts {
                return Err(ApplicationError::Conflict(format!(
                    "approval `{}` kept changing while being escalated",
                    approval_id.0
                )));
            }
        };

        let recorded = self
            .audit
            .record(
                HistoryEvent::for_approval(
                    &escalated,
                    Some(ApprovalStatus::Pending),
                    ActorContext::system(),
                )
                .with_reason(Some(REASON_ESCALATION_TIMEOUT.to_string())),
                now,
            )
            .await;
        if let Err(failure) = recorded {
            self.revert_unaudited(&escalated, previous, now).await;
            return Err(failure.into());
        }
        info!(
            event_name = "approval.escalation_marked",
            approval_id = %escalated.id.0,
            cart_id = %escalated.cart_id.0,
            company_id = %escalated.company_id.0,
            "approval flagged for escalation"
        );
        Ok(true)
    }

    /// Checks up to `limit` pending approvals, oldest first, and flags the ones that are due.
    pub async fn sweep_escalations(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<EscalationSweep, ApplicationError> {
        let candidates = self.stores.approvals.list_escalation_candidates(limit).await?;
        let mut sweep = EscalationSweep { examined: candidates.len(), ..EscalationSweep::default() };
        let mut settings_by_company: HashMap<CompanyId, Option<ApprovalSettings>> = HashMap::new();

        for approval in candidates {
            if !settings_by_company.contains_key(&approval.company_id) {
                let found = self.stores.settings.find_by_company(&approval.company_id).await?;
                settings_by_company.insert(approval.company_id.clone(), found);
            }
            let Some(Some(settings)) = settings_by_company.get(&approval.company_id) else {
                warn!(
                    event_name = "approval.escalation_unconfigured",
                    approval_id = %approval.id.0,
                    company_id = %approval.company_id.0,
                    "skipping escalation check; company has no approval settings"
                );
                sweep.skipped_unconfigured += 1;
                continue;
            };

            if should_escalate(&approval, settings, now)
                && self.mark_escalated_at(&approval.id, now).await?
            {
                sweep.escalated.push(approval.id);
            }
        }

        info!(
            event_name = "approval.escalation_sweep",
            examined = sweep.examined,
            escalated = sweep.escalated.len(),
            skipped_unconfigured = sweep.skipped_unconfigured,
            "escalation sweep finished"
        );
        Ok(sweep)
    }

    /// Missing settings are a configuration error, never an implicit "no approval needed".
    pub async fn get_settings(
        &self,
        company_id: &CompanyId,
    ) -> Result<ApprovalSettings, ApplicationError> {
        self.stores
            .settings
            .find_by_company(company_id)
            .await?
            .ok_or_else(|| ApplicationError::NotConfigured { company_id: company_id.0.clone() })
    }

    pub async fn update_settings(
        &self,
        company_id: &CompanyId,
        update: &ApprovalSettingsUpdate,
    ) -> Result<Step<ApprovalSettings>, ApplicationError> {
        self.update_settings_at(company_id, update, Utc::now()).await
    }

    /// Creates the company's settings on first use, otherwise patches them.
    pub async fn update_settings_at(
        &self,
        company_id: &CompanyId,
        update: &ApprovalSettingsUpdate,
        now: DateTime<Utc>,
    ) -> Result<Step<ApprovalSettings>, ApplicationError> {
        if update.escalation_timeout_hours == Some(0) {
            return Err(DomainError::InvariantViolation(
                "escalation_timeout_hours must be at least 1".to_string(),
            )
            .into());
        }

        let previous = self.stores.settings.find_by_company(company_id).await?;
        let mut settings =
            previous.clone().unwrap_or_else(|| ApprovalSettings::new(company_id.clone(), now));
        settings.apply(update, now);
        self.stores.settings.save(settings.clone()).await?;

        info!(
            event_name = "approval.settings_updated",
            company_id = %company_id.0,
            created = previous.is_none(),
            escalation_enabled = settings.escalation_enabled,
            escalation_timeout_hours = settings.escalation_timeout_hours,
            "approval settings saved"
        );
        Ok(Step::new(settings).with_compensation(Compensation::RestoreSettings {
            company_id: company_id.clone(),
            previous,
        }))
    }

    pub async fn create_rule(
        &self,
        input: NewApprovalRule,
    ) -> Result<Step<ApprovalRule>, ApplicationError> {
        if input.rule_name.trim().is_empty() {
            return Err(
                DomainError::InvariantViolation("rule_name must not be blank".to_string()).into()
            );
        }

        let rule = ApprovalRule::from_new(input, Utc::now());
        self.stores.rules.save(rule.clone()).await?;
        info!(
            event_name = "approval.rule_created",
            rule_id = %rule.id.0,
            company_id = %rule.company_id.0,
            priority = rule.priority,
            "approval rule created"
        );

        let rule_id = rule.id.clone();
        Ok(Step::new(rule).with_compensation(Compensation::RestoreRule { rule_id, previous: None }))
    }

    pub async fn update_rule(
        &self,
        rule_id: &ApprovalRuleId,
        update: ApprovalRuleUpdate,
    ) -> Result<Step<ApprovalRule>, ApplicationError> {
        if update.rule_name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return Err(
                DomainError::InvariantViolation("rule_name must not be blank".to_string()).into()
            );
        }

        let previous = self
            .stores
            .rules
            .find_by_id(rule_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("approval_rule", rule_id.0.clone()))?;
        let mut rule = previous.clone();
        rule.apply(update, Utc::now());
        self.stores.rules.save(rule.clone()).await?;
        info!(
            event_name = "approval.rule_updated",
            rule_id = %rule.id.0,
            company_id = %rule.company_id.0,
            is_active = rule.is_active,
            "approval rule updated"
        );

        Ok(Step::new(rule).with_compensation(Compensation::RestoreRule {
            rule_id: rule_id.clone(),
            previous: Some(previous),
        }))
    }

    pub async fn deactivate_rule(
        &self,
        rule_id: &ApprovalRuleId,
    ) -> Result<Step<ApprovalRule>, ApplicationError> {
        self.update_rule(
            rule_id,
            ApprovalRuleUpdate { is_active: Some(false), ..ApprovalRuleUpdate::default() },
        )
        .await
    }

    pub async fn list_rules(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<ApprovalRule>, ApplicationError> {
        Ok(self.stores.rules.list_for_company(company_id).await?)
    }

    pub async fn list_history_for_approval(
        &self,
        approval_id: &ApprovalId,
    ) -> Result<Vec<ApprovalHistory>, ApplicationError> {
        Ok(self.stores.history.list_for_approval(approval_id).await?)
    }

    pub async fn list_history_for_cart(
        &self,
        cart_id: &CartId,
    ) -> Result<Vec<ApprovalHistory>, ApplicationError> {
        Ok(self.stores.history.list_for_cart(cart_id).await?)
    }

    pub async fn compensate(
        &self,
        compensations: Vec<Compensation>,
    ) -> Result<(), ApplicationError> {
        self.compensate_at(compensations, Utc::now()).await
    }

    /// Reverses steps newest first. History rows written by the reversed steps stay in place.
    pub async fn compensate_at(
        &self,
        compensations: Vec<Compensation>,
        now: DateTime<Utc>,
    ) -> Result<(), ApplicationError> {
        for compensation in compensations.into_iter().rev() {
            let kind = compensation.kind();
            let subject_id = compensation.subject_id().to_string();

            match compensation {
                Compensation::SoftDeleteApproval { approval_id } => {
                    self.stores.approvals.soft_delete(&approval_id, now).await?;
                }
                Compensation::RestoreAggregate { cart_id, previous } => {
                    self.restore_aggregate(&cart_id, previous, now).await?;
                }
                Compensation::RestoreSettings { previous: Some(settings), .. } => {
                    self.stores.settings.save(settings).await?;
                }
                Compensation::RestoreSettings { company_id, previous: None } => {
                    self.stores.settings.delete(&company_id).await?;
                }
                Compensation::RestoreRule { previous: Some(rule), .. } => {
                    self.stores.rules.save(rule).await?;
                }
                Compensation::RestoreRule { rule_id, previous: None } => {
                    self.stores.rules.delete(&rule_id).await?;
                }
            }

            info!(
                event_name = "approval.compensated",
                kind,
                subject_id = %subject_id,
                "workflow step compensated"
            );
        }
        Ok(())
    }

    async fn live_approval(&self, approval_id: &ApprovalId) -> Result<Approval, ApplicationError> {
        self.stores
            .approvals
            .find_by_id(approval_id)
            .await?
            .filter(|approval| !approval.is_deleted())
            .ok_or_else(|| ApplicationError::not_found("approval", approval_id.0.clone()))
    }

    /// Puts back the row an unaudited transition replaced, unless another writer moved it on
    /// since. The caller still reports the audit failure.
    async fn revert_unaudited(&self, applied: &Approval, previous: Approval, now: DateTime<Utc>) {
        let mut reverted = previous;
        reverted.version = applied.version.saturating_add(1);
        reverted.updated_at = now;

        match self.stores.approvals.update_if_version(&reverted, applied.version).await {
            Ok(true) => warn!(
                event_name = "approval.transition_reverted",
                approval_id = %applied.id.0,
                cart_id = %applied.cart_id.0,
                status = reverted.status.as_str(),
                "audit write failed; approval transition reverted"
            ),
            Ok(false) => error!(
                event_name = "approval.revert_failed",
                approval_id = %applied.id.0,
                cart_id = %applied.cart_id.0,
                "audit write failed and the approval changed before it could be reverted"
            ),
            Err(revert_error) => error!(
                event_name = "approval.revert_failed",
                approval_id = %applied.id.0,
                cart_id = %applied.cart_id.0,
                error = %revert_error,
                "audit write failed and the approval transition could not be reverted"
            ),
        }
    }

    /// Compare-and-set loop over the cart aggregate. Every attempt re-reads both the stored
    /// aggregate and the pending counts. Storage refuses an approved write while any approval
    /// of the cart is pending, so a stale count only costs a retry.
    async fn reconcile_aggregate(
        &self,
        cart_id: &CartId,
        incoming: ApprovalStatus,
        now: DateTime<Utc>,
    ) -> Result<AggregateChange, ApplicationError> {
        for attempt in 1..=self.max_attempts {
            let current = self.stores.aggregates.find_by_cart(cart_id).await?;
            let summary = self.stores.approvals.summarize_cart(cart_id).await?;
            let next_status = recompute_aggregate(
                current.as_ref().map(|aggregate| aggregate.status),
                incoming,
                &summary,
            );

            let written = match (current, next_status) {
                (Some(existing), None) => {
                    return Ok(AggregateChange { aggregate: existing, compensation: None });
                }
                (None, None) => {
                    return Err(DomainError::InvariantViolation(format!(
                        "no aggregate status derived for cart `{}`",
                        cart_id.0
                    ))
                    .into());
                }
                (None, Some(status)) => {
                    let created = ApprovalAggregate::new(cart_id.clone(), status, now);
                    self.stores
                        .aggregates
                        .insert_if_absent(&created)
                        .await?
                        .then_some((created, None))
                }
                (Some(existing), Some(status)) => {
                    let mut next = existing.clone();
                    next.status = status;
                    next.version = existing.version.saturating_add(1);
                    next.updated_at = now;
                    self.stores
                        .aggregates
                        .update_if_version(&next, existing.version)
                        .await?
                        .then_some((next, Some(existing)))
                }
            };

            if let Some((aggregate, previous)) = written {
                info!(
                    event_name = "approval.aggregate_recomputed",
                    cart_id = %cart_id.0,
                    previous_status = previous.as_ref().map(|row| row.status.as_str()),
                    new_status = aggregate.status.as_str(),
                    pending = summary.pending,
                    approved = summary.approved,
                    rejected = summary.rejected,
                    "cart approval status updated"
                );
                return Ok(AggregateChange {
                    aggregate,
                    compensation: Some(Compensation::RestoreAggregate {
                        cart_id: cart_id.clone(),
                        previous,
                    }),
                });
            }

            debug!(
                event_name = "approval.aggregate_conflict",
                cart_id = %cart_id.0,
                attempt,
                "cart aggregate changed concurrently; retrying"
            );
        }

        Err(ApplicationError::Conflict(format!(
            "approval status of cart `{}` kept changing after {} attempts",
            cart_id.0, self.max_attempts
        )))
    }

    async fn restore_aggregate(
        &self,
        cart_id: &CartId,
        previous: Option<ApprovalAggregate>,
        now: DateTime<Utc>,
    ) -> Result<(), ApplicationError> {
        let Some(previous) = previous else {
            self.stores.aggregates.delete(cart_id).await?;
            return Ok(());
        };

        for _ in 0..self.max_attempts {
            let Some(current) = self.stores.aggregates.find_by_cart(cart_id).await? else {
                if self.stores.aggregates.insert_if_absent(&previous).await? {
                    return Ok(());
                }
                if self.gate_held_open(cart_id, previous.status).await? {
                    return Ok(());
                }
                continue;
            };

            let mut restored = current.clone();
            restored.status = previous.status;
            restored.version = current.version.saturating_add(1);
            restored.updated_at = now;
            if self.stores.aggregates.update_if_version(&restored, current.version).await? {
                return Ok(());
            }
            if self.gate_held_open(cart_id, previous.status).await? {
                return Ok(());
            }
        }

        Err(ApplicationError::Conflict(format!(
            "approval status of cart `{}` could not be restored",
            cart_id.0
        )))
    }

    /// An approved gate cannot come back while another request keeps an approval pending.
    async fn gate_held_open(
        &self,
        cart_id: &CartId,
        wanted: ApprovalStatus,
    ) -> Result<bool, ApplicationError> {
        if wanted != ApprovalStatus::Approved
            || !self.stores.approvals.summarize_cart(cart_id).await?.has_pending()
        {
            return Ok(false);
        }
        info!(
            event_name = "approval.aggregate_restore_skipped",
            cart_id = %cart_id.0,
            "cart keeps pending status; a live approval is still open"
        );
        Ok(true)
    }
}

fn push_unique(approvals: &mut Vec<Approval>, approval: Approval) {
    if !approvals.iter().any(|existing| existing.id == approval.id) {
        approvals.push(approval);
    }
}

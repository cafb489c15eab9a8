//! Fund release: precondition checks, the single-winner reservation, and the
//! ledger submit/poll/retry loop.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rand::Rng;
use tokio::time::{sleep, timeout, Duration};
use tracing::{error, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::auth::Actor;
use crate::config::{LedgerPolicy, ReleaseDefaults};
use crate::error::{EngineError, EngineResult};
use crate::ledger::{LedgerClient, LedgerError, TransferStatus};
use crate::models::{
    Approval, ApprovalCount, AuditEventKind, CreateAllocationRequest, ExecuteReleaseRequest,
    FundAllocation, NewAuditEntry, OperationKind, ReleaseReceipt, ReleaseStatus,
    ReleaseTransaction, TriggerReason, VerificationStatus,
};
use crate::services::audit_service::{elapsed_ms, AuditLogger};
use crate::store::{EngineStore, ReleaseReservation};

const CONFIDENCE_EPSILON: f64 = 1e-9;
const MAX_JITTER: f64 = 0.2;

/// Outcome of the precondition checks
struct Cleared {
    trigger: TriggerReason,
    /// Ledger attempts already spent on earlier releases of the milestone
    prior_attempts: u32,
}

/// How one ledger round ended
enum TransferOutcome {
    Confirmed,
    Failed(String),
    /// Submitted, but the reference never left `pending` within the poll budget.
    Unresolved(String),
}

pub struct ReleaseService {
    store: Arc<dyn EngineStore>,
    audit: Arc<AuditLogger>,
    ledger: Arc<dyn LedgerClient>,
    defaults: ReleaseDefaults,
    ledger_policy: LedgerPolicy,
}

impl ReleaseService {
    pub fn new(
        store: Arc<dyn EngineStore>,
        audit: Arc<AuditLogger>,
        ledger: Arc<dyn LedgerClient>,
        defaults: ReleaseDefaults,
        ledger_policy: LedgerPolicy,
    ) -> Self {
        Self {
            store,
            audit,
            ledger,
            defaults,
            ledger_policy,
        }
    }

    pub async fn create_allocation(
        &self,
        request: CreateAllocationRequest,
        actor: &Actor,
    ) -> EngineResult<FundAllocation> {
        request.validate()?;
        let condition = request
            .condition
            .unwrap_or_else(|| self.defaults.condition.clone());
        if !condition.require_milestone_completion {
            return Err(EngineError::Validation(
                "require_milestone_completion cannot be disabled".into(),
            ));
        }
        if condition.backoff_max_ms < condition.backoff_base_ms {
            return Err(EngineError::Validation(
                "backoff_max_ms must not be below backoff_base_ms".into(),
            ));
        }

        if self.store.get_milestone(request.milestone_id).await?.is_none() {
            return Err(EngineError::NotFound(format!(
                "milestone {}",
                request.milestone_id
            )));
        }

        let allocation = FundAllocation {
            id: Uuid::new_v4(),
            milestone_id: request.milestone_id,
            recipient: request.recipient,
            amount: request.amount,
            condition,
            created_at: Utc::now(),
        };
        self.store.insert_allocation(&allocation).await?;
        info!(
            allocation_id = %allocation.id,
            milestone_id = %allocation.milestone_id,
            amount = allocation.amount,
            actor = %actor,
            "allocation created"
        );
        Ok(allocation)
    }

    /// Record the caller's approval. Repeat approvals by the same actor are counted once.
    pub async fn add_approval(&self, allocation_id: Uuid, actor: &Actor) -> EngineResult<ApprovalCount> {
        if !actor.role.can_approve() {
            return Err(EngineError::Unauthorized(format!(
                "{} may not approve releases",
                actor.id
            )));
        }
        let allocation = self.allocation(allocation_id).await?;

        let added = self
            .store
            .add_approval(&Approval {
                allocation_id,
                approver_id: actor.id.clone(),
                approved_at: Utc::now(),
            })
            .await?;
        let approvals = self.store.list_approvals(allocation_id).await?.len();

        self.audit
            .record(
                NewAuditEntry::new(
                    AuditEventKind::ReleaseDecision,
                    actor.id.as_str(),
                    if added {
                        format!(
                            "approval {} of {} recorded for allocation {}",
                            approvals, allocation.condition.approval_threshold, allocation_id
                        )
                    } else {
                        format!("repeat approval for allocation {} ignored", allocation_id)
                    },
                )
                .milestone(allocation.milestone_id)
                .status("APPROVED"),
            )
            .await?;

        Ok(ApprovalCount {
            allocation_id,
            approvals,
        })
    }

    pub async fn execute_release(
        &self,
        allocation_id: Uuid,
        request: ExecuteReleaseRequest,
        actor: &Actor,
    ) -> EngineResult<ReleaseReceipt> {
        let allocation = match self.allocation(allocation_id).await {
            Ok(allocation) => allocation,
            Err(err) => {
                self.audit
                    .record(
                        NewAuditEntry::new(
                            AuditEventKind::ReleaseDecision,
                            actor.id.as_str(),
                            format!("release from allocation {} refused: {}", allocation_id, err),
                        )
                        .status(err.kind())
                        .failed(),
                    )
                    .await?;
                return Err(err);
            }
        };
        if let Err(err) = check_request(&allocation, &request) {
            self.audit_decision(&allocation, actor, &err.to_string(), Some(&err))
                .await?;
            return Err(err);
        }

        self.release(&allocation, request.amount, &request.approvals, actor)
            .await
    }

    /// Release every `auto_release` allocation of a freshly verified milestone
    /// in the background. Outcomes are audited; the verification is unaffected.
    pub fn spawn_auto_release(self: &Arc<Self>, milestone_id: Uuid) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = service.auto_release(milestone_id).await {
                error!(%milestone_id, error = %err, "auto-release failed");
            }
        });
    }

    pub async fn auto_release(&self, milestone_id: Uuid) -> EngineResult<Option<ReleaseReceipt>> {
        let system = Actor::system();
        for allocation in self.store.list_allocations(milestone_id).await? {
            if !allocation.condition.auto_release {
                continue;
            }
            match self.release(&allocation, allocation.amount, &[], &system).await {
                Ok(receipt) => return Ok(Some(receipt)),
                Err(EngineError::AlreadyReleased { .. }) => return Ok(None),
                Err(err) => {
                    warn!(
                        %milestone_id,
                        allocation_id = %allocation.id,
                        error = %err,
                        "auto-release of allocation refused"
                    );
                }
            }
        }
        Ok(None)
    }

    async fn allocation(&self, allocation_id: Uuid) -> EngineResult<FundAllocation> {
        self.store
            .get_allocation(allocation_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("allocation {}", allocation_id)))
    }

    async fn release(
        &self,
        allocation: &FundAllocation,
        amount: i64,
        supplied_approvals: &[String],
        actor: &Actor,
    ) -> EngineResult<ReleaseReceipt> {
        let started = Instant::now();

        let cleared = match self
            .check_preconditions(allocation, amount, supplied_approvals)
            .await
        {
            Ok(cleared) => cleared,
            Err(err) => {
                self.audit_decision(allocation, actor, &err.to_string(), Some(&err))
                    .await?;
                return Err(err);
            }
        };
        let trigger = cleared.trigger;

        match self.store.reserve_release(allocation.milestone_id).await? {
            ReleaseReservation::Reserved => {}
            ReleaseReservation::AlreadyReserved | ReleaseReservation::AlreadyConfirmed => {
                let err = EngineError::AlreadyReleased {
                    milestone_id: allocation.milestone_id,
                };
                self.audit_decision(allocation, actor, &err.to_string(), Some(&err))
                    .await?;
                return Err(err);
            }
            ReleaseReservation::MilestoneMissing => {
                let err = EngineError::NotFound(format!("milestone {}", allocation.milestone_id));
                self.audit_decision(allocation, actor, &err.to_string(), Some(&err))
                    .await?;
                return Err(err);
            }
        }

        let mut release = ReleaseTransaction::new(allocation, amount, trigger);
        let recorded = self
            .audit_decision(
                allocation,
                actor,
                &format!("release {} of {} approved ({:?})", release.id, amount, trigger),
                None,
            )
            .await;
        // Nothing moves without a decision on record.
        if let Err(err) = recorded {
            self.store.settle_release(allocation.milestone_id, false).await?;
            return Err(err);
        }

        if let Err(err) = self.store.insert_release(&release).await {
            self.store.settle_release(allocation.milestone_id, false).await?;
            return Err(err);
        }
        release.status = ReleaseStatus::Processing;
        release.updated_at = Utc::now();
        self.store.update_release(&release).await?;

        self.drive_transfer(&mut release, allocation, cleared.prior_attempts, actor, started)
            .await
    }

    /// Checks that must pass before anything is reserved, in order.
    async fn check_preconditions(
        &self,
        allocation: &FundAllocation,
        amount: i64,
        supplied_approvals: &[String],
    ) -> EngineResult<Cleared> {
        let milestone_id = allocation.milestone_id;
        let condition = &allocation.condition;

        let milestone = self
            .store
            .get_milestone(milestone_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("milestone {}", milestone_id)))?;
        let attempt = match milestone.current_attempt_id {
            Some(id) => self.store.get_attempt(id).await?,
            None => None,
        };
        let trigger = match attempt {
            Some(attempt) if attempt.status == VerificationStatus::Verified => {
                if attempt.confidence + CONFIDENCE_EPSILON < condition.min_confidence {
                    return Err(EngineError::BelowConfidenceThreshold {
                        actual: attempt.confidence,
                        required: condition.min_confidence,
                    });
                }
                TriggerReason::Automatic
            }
            Some(attempt) if attempt.status == VerificationStatus::ManualOverride => {
                TriggerReason::ManualOverride
            }
            _ => return Err(EngineError::NotVerified { milestone_id }),
        };

        if self
            .store
            .count_releases(milestone_id, ReleaseStatus::Confirmed)
            .await?
            > 0
        {
            return Err(EngineError::AlreadyReleased { milestone_id });
        }

        if amount > condition.high_value_threshold {
            let mut approvers: BTreeSet<String> = self
                .store
                .list_approvals(allocation.id)
                .await?
                .into_iter()
                .map(|approval| approval.approver_id)
                .collect();
            approvers.extend(
                supplied_approvals
                    .iter()
                    .map(|id| id.trim())
                    .filter(|id| !id.is_empty())
                    .map(str::to_string),
            );
            let need = condition.approval_threshold as usize;
            if approvers.len() < need {
                return Err(EngineError::InsufficientApprovals {
                    have: approvers.len(),
                    need,
                });
            }
        }

        // The cap covers ledger attempts across every release of the milestone.
        let prior_attempts: u32 = self
            .store
            .list_releases(milestone_id)
            .await?
            .iter()
            .map(|release| release.retry_count.max(0) as u32)
            .sum();
        if prior_attempts >= condition.max_retries {
            return Err(EngineError::RetriesExhausted {
                attempts: prior_attempts,
            });
        }

        Ok(Cleared {
            trigger,
            prior_attempts,
        })
    }

    async fn drive_transfer(
        &self,
        release: &mut ReleaseTransaction,
        allocation: &FundAllocation,
        prior_attempts: u32,
        actor: &Actor,
        started: Instant,
    ) -> EngineResult<ReleaseReceipt> {
        let condition = &allocation.condition;

        loop {
            let outcome = match release.external_ref.clone() {
                // A pending reference is polled again, never resubmitted.
                Some(reference) => self.await_confirmation(&reference).await,
                None => self.submit(release).await,
            };

            let reason = match outcome {
                TransferOutcome::Confirmed => {
                    release.status = ReleaseStatus::Confirmed;
                    release.last_error = None;
                    release.updated_at = Utc::now();
                    self.store.update_release(release).await?;
                    self.store.settle_release(release.milestone_id, true).await?;

                    self.audit
                        .record_or_warn(
                            NewAuditEntry::new(
                                AuditEventKind::ReleaseExecution,
                                actor.id.as_str(),
                                format!(
                                    "release {} confirmed with reference {}",
                                    release.id,
                                    release.external_ref.as_deref().unwrap_or("-")
                                ),
                            )
                            .milestone(release.milestone_id)
                            .status("CONFIRMED")
                            .timed(OperationKind::Release, elapsed_ms(started)),
                        )
                        .await;
                    info!(
                        release_id = %release.id,
                        milestone_id = %release.milestone_id,
                        amount = release.amount,
                        retries = release.retry_count,
                        "funds released"
                    );
                    return Ok(receipt(release));
                }
                TransferOutcome::Failed(reason) => {
                    // The ledger gave up on this reference; the next round submits afresh.
                    release.external_ref = None;
                    reason
                }
                TransferOutcome::Unresolved(reference) => {
                    format!("transfer {} still pending", reference)
                }
            };

            release.retry_count += 1;
            release.last_error = Some(reason.clone());
            release.updated_at = Utc::now();
            self.store.update_release(release).await?;

            self.audit
                .record_or_warn(
                    NewAuditEntry::new(
                        AuditEventKind::ReleaseExecution,
                        actor.id.as_str(),
                        format!(
                            "release {} attempt {} failed: {}",
                            release.id, release.retry_count, reason
                        ),
                    )
                    .milestone(release.milestone_id)
                    .status("RETRY")
                    .failed(),
                )
                .await;

            let attempts = prior_attempts + release.retry_count as u32;
            if attempts >= condition.max_retries {
                return self.give_up(release, attempts, actor, started).await;
            }

            let jitter = rand::thread_rng().gen_range(0.0..MAX_JITTER);
            let delay = backoff_delay(
                condition.backoff_base_ms,
                condition.backoff_max_ms,
                attempts - 1,
                jitter,
            );
            warn!(
                release_id = %release.id,
                retry = release.retry_count,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "ledger transfer failed; backing off"
            );
            sleep(delay).await;
        }
    }

    async fn give_up(
        &self,
        release: &mut ReleaseTransaction,
        attempts: u32,
        actor: &Actor,
        started: Instant,
    ) -> EngineResult<ReleaseReceipt> {
        let err = EngineError::RetriesExhausted { attempts };

        let detail = if let Some(reference) = &release.external_ref {
            // The transfer may still land; keep the milestone reserved so nothing pays twice.
            error!(
                release_id = %release.id,
                reference = %reference,
                "release left processing with an unresolved ledger reference"
            );
            format!(
                "release {} unresolved after {} attempts; reference {} needs manual reconciliation",
                release.id, attempts, reference
            )
        } else {
            release.status = ReleaseStatus::Failed;
            release.updated_at = Utc::now();
            self.store.update_release(release).await?;
            self.store.settle_release(release.milestone_id, false).await?;
            error!(release_id = %release.id, attempts, "release failed; manual intervention required");
            format!("release {} failed after {} attempts", release.id, attempts)
        };

        self.audit
            .record(
                NewAuditEntry::new(AuditEventKind::ReleaseExecution, actor.id.as_str(), detail)
                    .milestone(release.milestone_id)
                    .status(err.kind())
                    .failed()
                    .timed(OperationKind::Release, elapsed_ms(started)),
            )
            .await?;
        Err(err)
    }

    async fn submit(&self, release: &mut ReleaseTransaction) -> TransferOutcome {
        let started = Instant::now();
        let submitted = match timeout(
            self.request_timeout(),
            self.ledger
                .submit_transfer(release.id, &release.recipient, release.amount),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout),
        };

        let outcome = match submitted {
            Ok(reference) => {
                release.external_ref = Some(reference.clone());
                release.updated_at = Utc::now();
                if let Err(err) = self.store.update_release(release).await {
                    warn!(release_id = %release.id, error = %err, "could not persist ledger reference");
                }
                self.await_confirmation(&reference).await
            }
            Err(err) => TransferOutcome::Failed(
                EngineError::LedgerSubmissionFailed(err.to_string()).to_string(),
            ),
        };

        self.audit
            .record_or_warn(
                NewAuditEntry::new(
                    AuditEventKind::ReleaseExecution,
                    Actor::system().id,
                    format!("ledger submission for release {}", release.id),
                )
                .milestone(release.milestone_id)
                .timed(OperationKind::LedgerSubmission, elapsed_ms(started)),
            )
            .await;
        outcome
    }

    /// Poll the reference until it settles or the poll budget runs out.
    async fn await_confirmation(&self, reference: &str) -> TransferOutcome {
        let interval = Duration::from_millis(self.ledger_policy.confirmation_poll_interval_ms);
        let polls = self.ledger_policy.confirmation_max_polls.max(1);

        for poll in 0..polls {
            let status = timeout(
                self.request_timeout(),
                self.ledger.get_transfer_status(reference),
            )
            .await;

            match status {
                Ok(Ok(TransferStatus::Confirmed)) => return TransferOutcome::Confirmed,
                Ok(Ok(TransferStatus::Failed(reason))) => return TransferOutcome::Failed(reason),
                Ok(Ok(TransferStatus::Pending)) => {}
                Ok(Err(err)) => {
                    warn!(reference, error = %err, "transfer status check failed");
                }
                Err(_) => {
                    warn!(reference, "transfer status check timed out");
                }
            }

            if poll + 1 < polls {
                sleep(interval).await;
            }
        }
        TransferOutcome::Unresolved(reference.to_string())
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_policy.request_timeout_ms.max(1))
    }

    async fn audit_decision(
        &self,
        allocation: &FundAllocation,
        actor: &Actor,
        detail: &str,
        refused: Option<&EngineError>,
    ) -> EngineResult<()> {
        let mut entry = NewAuditEntry::new(AuditEventKind::ReleaseDecision, actor.id.as_str(), detail)
            .milestone(allocation.milestone_id);
        entry = match refused {
            Some(err) => entry.status(err.kind()).failed(),
            None => entry.status("RESERVED"),
        };
        self.audit.record(entry).await?;
        Ok(())
    }
}

/// Request-level checks against the allocation it draws on.
fn check_request(allocation: &FundAllocation, request: &ExecuteReleaseRequest) -> EngineResult<()> {
    request.validate()?;
    if request.recipient != allocation.recipient {
        return Err(EngineError::Validation(
            "recipient does not match the allocation".into(),
        ));
    }
    if request.amount > allocation.amount {
        return Err(EngineError::Validation(format!(
            "amount {} exceeds allocation of {}",
            request.amount, allocation.amount
        )));
    }
    Ok(())
}

fn receipt(release: &ReleaseTransaction) -> ReleaseReceipt {
    ReleaseReceipt {
        transaction_id: release.id,
        status: release.status,
        external_ref: release.external_ref.clone(),
        retry_count: release.retry_count,
    }
}

/// `min(base * 2^retry, max)`, shortened by `jitter` (a fraction in [0, 0.2)).
pub fn backoff_delay(base_ms: u64, max_ms: u64, retry: u32, jitter: f64) -> Duration {
    let raw = base_ms
        .saturating_mul(2u64.saturating_pow(retry.min(32)))
        .min(max_ms);
    let jitter = jitter.clamp(0.0, MAX_JITTER);
    Duration::from_millis((raw as f64 * (1.0 - jitter)).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn backoff_grows_then_caps() {
        assert_eq!(backoff_delay(500, 30_000, 0, 0.0), Duration::from_millis(500));
        assert_eq!(backoff_delay(500, 30_000, 1, 0.0), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(500, 30_000, 3, 0.0), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(500, 30_000, 10, 0.0), Duration::from_millis(30_000));
        assert_eq!(backoff_delay(500, 30_000, u32::MAX, 0.0), Duration::from_millis(30_000));
    }

    proptest! {
        #[test]
        fn jitter_only_shortens(retry in 0u32..12, jitter in 0.0f64..0.2) {
            let full = backoff_delay(250, 10_000, retry, 0.0);
            let jittered = backoff_delay(250, 10_000, retry, jitter);
            prop_assert!(jittered <= full);
            prop_assert!(jittered.as_millis() as f64 >= full.as_millis() as f64 * 0.8 - 1.0);
        }
    }
}

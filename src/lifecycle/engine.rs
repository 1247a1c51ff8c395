//! Delegation lifecycle engine
//!
//! Orchestrates every state transition of a delegation and the credit
//! transfers that go with it. The escrow rules:
//!
//! - creation escrows `reward * max_number` from the publisher
//! - each receiver escrows `reward` of their own when accepting
//! - a settled receiver slot pays out `2 * reward` (the receiver's escrow
//!   back plus the publisher's escrow for that slot)
//! - a receiver who cancels forfeits their escrow to the publisher, who also
//!   gets the slot's escrow back
//!
//! All reads, credit mutations and delegation mutations of one operation run
//! inside a single store transaction.

use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use super::scheduler::ConfirmationScheduler;
use crate::error::{AppError, Result};
use crate::models::{
    CreateDelegationRequest, Delegation, DelegationState, QuestionnairePreview,
    Questionnaire, QuestionnaireRecord,
};
use crate::store::{Store, StoreTx};

/// A rule violation aborting a lifecycle operation
///
/// Carries no HTTP vocabulary; [`reason`](LifecycleError::reason) and
/// [`class`](LifecycleError::class) are what the boundary maps to a response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("caller is neither the publisher nor a current receiver")]
    Unauthorized,
    #[error("publisher cannot receive their own delegation")]
    SelfReceiveForbidden,
    #[error("caller already holds a receiver slot of this delegation")]
    AlreadyReceived,
    #[error("credit balance cannot cover this operation")]
    InsufficientCredit,
    #[error("cannot {operation} a delegation in state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    #[error("delegation deadline has passed")]
    Expired,
    #[error("no receiver slot left")]
    CapacityExceeded,
}

impl LifecycleError {
    /// Stable machine-readable reason string
    pub fn reason(&self) -> &'static str {
        match self {
            LifecycleError::Unauthorized => "unauthorized",
            LifecycleError::SelfReceiveForbidden => "self_receive_forbidden",
            LifecycleError::AlreadyReceived => "already_received",
            LifecycleError::InsufficientCredit => "insufficient_credit",
            LifecycleError::InvalidState { .. } => "invalid_state",
            LifecycleError::Expired => "delegation_expired",
            LifecycleError::CapacityExceeded => "capacity_exceeded",
        }
    }

    /// Numeric class: 401 authorization, 402 business-rule conflict,
    /// 403 timing
    pub fn class(&self) -> u16 {
        match self {
            LifecycleError::Unauthorized | LifecycleError::SelfReceiveForbidden => 401,
            LifecycleError::AlreadyReceived
            | LifecycleError::InsufficientCredit
            | LifecycleError::InvalidState { .. }
            | LifecycleError::CapacityExceeded => 402,
            LifecycleError::Expired => 403,
        }
    }

    fn invalid_state(operation: &'static str, state: DelegationState) -> Self {
        LifecycleError::InvalidState {
            operation,
            state: state.as_str(),
        }
    }
}

/// Delegation type tag that requires an attached questionnaire
pub const QUESTIONNAIRE_TYPE: &str = "questionnaire";

/// The core engine: validates eligibility and capacity, moves escrowed
/// credits, and drives the deferred confirmation timer. Collaborators are
/// injected at construction.
pub struct LifecycleEngine {
    store: Store,
    scheduler: ConfirmationScheduler,
}

impl LifecycleEngine {
    pub fn new(store: Store, grace: Duration) -> Self {
        Self {
            store,
            scheduler: ConfirmationScheduler::new(grace),
        }
    }

    pub fn scheduler(&self) -> &ConfirmationScheduler {
        &self.scheduler
    }

    /// Publish a new delegation, escrowing `reward * max_number` from the
    /// publisher. Debit and insert commit together or not at all.
    pub async fn create(
        &self,
        publisher_id: &str,
        request: &CreateDelegationRequest,
    ) -> Result<Delegation> {
        if request.reward < 0 || request.max_number < 1 {
            return Err(AppError::BadRequest("invalid_params".to_string()));
        }
        if request.delegation_type == QUESTIONNAIRE_TYPE && request.questionnaire.is_none() {
            return Err(AppError::BadRequest("missing_questionnaire".to_string()));
        }

        let escrow = request
            .reward
            .checked_mul(request.max_number)
            .ok_or_else(|| AppError::BadRequest("invalid_params".to_string()))?;
        let mut tx = self.store.begin().await?;

        let publisher = self.store.user_in_tx(&mut tx, publisher_id).await?;
        if publisher.credit < escrow {
            return Err(LifecycleError::InsufficientCredit.into());
        }
        self.store
            .set_credit(&mut tx, publisher_id, publisher.credit - escrow)
            .await?;

        let questionnaire_id = match &request.questionnaire {
            Some(definition) => Some(self.store.create_questionnaire(&mut tx, definition).await?),
            None => None,
        };

        let delegation = Delegation {
            id: Uuid::new_v4().to_string(),
            publisher: publisher_id.to_string(),
            receivers: vec![],
            name: request.name.clone(),
            description: request.description.clone(),
            reward: request.reward,
            start_time: Utc::now().timestamp(),
            deadline: request.deadline,
            delegation_type: request.delegation_type.clone(),
            questionnaire_id,
            max_number: request.max_number,
            current_number: 0,
            state: DelegationState::Published,
        };
        self.store.insert_delegation(&mut tx, &delegation).await?;
        tx.commit().await?;

        tracing::info!(
            delegation_id = %delegation.id,
            publisher = publisher_id,
            escrow,
            "Delegation published"
        );
        Ok(delegation)
    }

    /// Accept a receiver slot, escrowing `reward` from the receiver. Filling
    /// the last slot flips the delegation to Accepted.
    pub async fn receive(&self, receiver_id: &str, delegation_id: &str) -> Result<Delegation> {
        let mut tx = self.store.begin().await?;
        let delegation = self.store.delegation_in_tx(&mut tx, delegation_id).await?;

        if delegation.is_publisher(receiver_id) {
            return Err(LifecycleError::SelfReceiveForbidden.into());
        }
        if delegation.is_receiver(receiver_id) {
            return Err(LifecycleError::AlreadyReceived.into());
        }
        if delegation.state != DelegationState::Published {
            return Err(LifecycleError::invalid_state("receive", delegation.state).into());
        }
        if Utc::now().timestamp() >= delegation.deadline {
            return Err(LifecycleError::Expired.into());
        }

        let receiver = self.store.user_in_tx(&mut tx, receiver_id).await?;
        if receiver.credit < delegation.reward {
            return Err(LifecycleError::InsufficientCredit.into());
        }
        self.store
            .set_credit(&mut tx, receiver_id, receiver.credit - delegation.reward)
            .await?;

        // Conditional update; a lost race for the last slot surfaces here
        self.store
            .add_receiver(&mut tx, delegation_id, receiver_id)
            .await?;

        let updated = self.store.delegation_in_tx(&mut tx, delegation_id).await?;
        tx.commit().await?;

        tracing::info!(
            delegation_id,
            receiver = receiver_id,
            occupancy = updated.current_number,
            state = updated.state.as_str(),
            "Delegation received"
        );
        Ok(updated)
    }

    /// Cancel a delegation. Settlement is asymmetric: a cancelling publisher
    /// makes every receiver whole at `2 * reward`; a cancelling receiver
    /// forfeits their escrow to the publisher and their slot reopens.
    pub async fn cancel(&self, canceler_id: &str, delegation_id: &str) -> Result<Delegation> {
        let mut tx = self.store.begin().await?;
        let delegation = self.store.delegation_in_tx(&mut tx, delegation_id).await?;

        let is_publisher = delegation.is_publisher(canceler_id);
        let is_receiver = delegation.is_receiver(canceler_id);
        if !is_publisher && !is_receiver {
            return Err(LifecycleError::Unauthorized.into());
        }
        if !delegation.state.is_cancelable() {
            return Err(LifecycleError::invalid_state("cancel", delegation.state).into());
        }

        if delegation.current_number == 0 {
            // No receivers yet: full escrow back to the publisher
            let publisher = self.store.user_in_tx(&mut tx, &delegation.publisher).await?;
            self.store
                .set_credit(
                    &mut tx,
                    &delegation.publisher,
                    publisher.credit + delegation.publisher_escrow(),
                )
                .await?;
            self.store
                .set_state(&mut tx, delegation_id, DelegationState::Canceled)
                .await?;
        } else if is_publisher {
            // Each receiver gets their own escrow back plus the publisher's
            // escrow for their slot
            for receiver_id in &delegation.receivers {
                let receiver = self.store.user_in_tx(&mut tx, receiver_id).await?;
                self.store
                    .set_credit(&mut tx, receiver_id, receiver.credit + 2 * delegation.reward)
                    .await?;
            }
            self.store
                .clear_receivers(&mut tx, delegation_id, DelegationState::Canceled)
                .await?;
        } else {
            // Receiver backs out: forfeits their escrow, publisher also gets
            // the slot escrow back, the slot reopens
            let publisher = self.store.user_in_tx(&mut tx, &delegation.publisher).await?;
            self.store
                .set_credit(
                    &mut tx,
                    &delegation.publisher,
                    publisher.credit + 2 * delegation.reward,
                )
                .await?;
            let new_state = state_for_occupancy(
                delegation.current_number - 1,
                delegation.max_number,
            );
            self.store
                .remove_receiver(&mut tx, delegation_id, canceler_id, new_state, false)
                .await?;
        }

        let updated = self.store.delegation_in_tx(&mut tx, delegation_id).await?;
        tx.commit().await?;

        tracing::info!(
            delegation_id,
            canceler = canceler_id,
            state = updated.state.as_str(),
            "Delegation cancelled"
        );
        Ok(updated)
    }

    /// Report or confirm completion.
    ///
    /// A publisher confirm requires `Pending` and settles every receiver at
    /// `2 * reward`. A sole receiver's report moves the delegation to
    /// `Pending` and arms the confirmation timer; with multiple slots the
    /// finishing receiver is settled immediately and their slot is consumed.
    pub async fn finish(&self, finisher_id: &str, delegation_id: &str) -> Result<Delegation> {
        let mut tx = self.store.begin().await?;
        let delegation = self.store.delegation_in_tx(&mut tx, delegation_id).await?;

        let is_publisher = delegation.is_publisher(finisher_id);
        let is_receiver = delegation.is_receiver(finisher_id);
        if !is_publisher && !is_receiver {
            return Err(LifecycleError::Unauthorized.into());
        }

        if is_publisher {
            if delegation.state != DelegationState::Pending {
                return Err(LifecycleError::invalid_state("finish", delegation.state).into());
            }
            settle_receivers(&self.store, &mut tx, &delegation).await?;
            self.store
                .set_state(&mut tx, delegation_id, DelegationState::Finished)
                .await?;
            let updated = self.store.delegation_in_tx(&mut tx, delegation_id).await?;
            tx.commit().await?;

            self.scheduler.cancel(delegation_id).await;
            tracing::info!(delegation_id, "Delegation confirmed by publisher");
            return Ok(updated);
        }

        if delegation.state != DelegationState::Accepted {
            return Err(LifecycleError::invalid_state("finish", delegation.state).into());
        }

        if delegation.max_number == 1 {
            // Await publisher confirmation; the timer auto-finalizes if the
            // publisher never acts
            self.store
                .set_state(&mut tx, delegation_id, DelegationState::Pending)
                .await?;
            let updated = self.store.delegation_in_tx(&mut tx, delegation_id).await?;
            tx.commit().await?;

            let store = self.store.clone();
            let id = delegation_id.to_string();
            self.scheduler
                .arm(delegation_id, async move {
                    if let Err(e) = auto_confirm(&store, &id).await {
                        tracing::error!(delegation_id = %id, "Auto-confirm failed: {}", e);
                    }
                })
                .await;

            tracing::info!(delegation_id, receiver = finisher_id, "Completion reported");
            return Ok(updated);
        }

        // Multiple slots settle individually; the settled slot is consumed
        // rather than reopened
        let finisher = self.store.user_in_tx(&mut tx, finisher_id).await?;
        self.store
            .set_credit(&mut tx, finisher_id, finisher.credit + 2 * delegation.reward)
            .await?;

        let remaining_capacity = delegation.max_number - 1;
        let new_state = if remaining_capacity == 0 {
            DelegationState::Finished
        } else {
            state_for_occupancy(delegation.current_number - 1, remaining_capacity)
        };
        self.store
            .remove_receiver(&mut tx, delegation_id, finisher_id, new_state, true)
            .await?;

        let updated = self.store.delegation_in_tx(&mut tx, delegation_id).await?;
        tx.commit().await?;

        tracing::info!(
            delegation_id,
            receiver = finisher_id,
            state = updated.state.as_str(),
            "Receiver slot settled"
        );
        Ok(updated)
    }

    // Questionnaire collaborator access; eligibility rules live here so the
    // boundary stays free of them

    /// Questions only, for a receiver about to fill the survey
    pub async fn questionnaire_for_filling(
        &self,
        delegation_id: &str,
    ) -> Result<QuestionnairePreview> {
        let delegation = self.store.get_delegation(delegation_id).await?;
        let questionnaire_id = delegation
            .questionnaire_id
            .ok_or_else(|| AppError::NotFound("no_such_questionnaire".to_string()))?;
        let questionnaire = self.store.get_questionnaire(&questionnaire_id).await?;
        Ok(questionnaire.preview())
    }

    /// Full questionnaire with per-option counts; publisher only
    pub async fn full_questionnaire(
        &self,
        user_id: &str,
        delegation_id: &str,
    ) -> Result<Questionnaire> {
        let delegation = self.store.get_delegation(delegation_id).await?;
        if !delegation.is_publisher(user_id) {
            return Err(LifecycleError::Unauthorized.into());
        }
        let questionnaire_id = delegation
            .questionnaire_id
            .ok_or_else(|| AppError::NotFound("no_such_questionnaire".to_string()))?;
        self.store.get_questionnaire(&questionnaire_id).await
    }

    /// Merge one filled response into the questionnaire counts; current
    /// receivers only
    pub async fn fill_questionnaire(
        &self,
        user_id: &str,
        delegation_id: &str,
        record: &QuestionnaireRecord,
    ) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let delegation = self.store.delegation_in_tx(&mut tx, delegation_id).await?;
        if !delegation.is_receiver(user_id) {
            return Err(LifecycleError::Unauthorized.into());
        }
        let questionnaire_id = delegation
            .questionnaire_id
            .ok_or_else(|| AppError::NotFound("no_such_questionnaire".to_string()))?;

        let mut questionnaire = self
            .store
            .questionnaire_in_tx(&mut tx, &questionnaire_id)
            .await?;
        for (question, filled) in questionnaire.questions.iter_mut().zip(&record.questions) {
            for (answer, contribution) in question.answers.iter_mut().zip(&filled.answers) {
                answer.count += contribution.count;
            }
        }
        self.store
            .update_questionnaire_questions(&mut tx, &questionnaire_id, &questionnaire.questions)
            .await?;
        tx.commit().await?;

        tracing::debug!(delegation_id, receiver = user_id, "Questionnaire filled");
        Ok(())
    }
}

/// Pay every current receiver the full settlement of `2 * reward`
async fn settle_receivers(store: &Store, tx: &mut StoreTx, delegation: &Delegation) -> Result<()> {
    for receiver_id in &delegation.receivers {
        let receiver = store.user_in_tx(tx, receiver_id).await?;
        store
            .set_credit(tx, receiver_id, receiver.credit + 2 * delegation.reward)
            .await?;
    }
    Ok(())
}

/// State implied by occupancy alone: open slots mean Published, a full set
/// means Accepted
fn state_for_occupancy(current: i64, max: i64) -> DelegationState {
    if current < max {
        DelegationState::Published
    } else {
        DelegationState::Accepted
    }
}

/// Auto-finalize a delegation whose publisher never confirmed. Runs on the
/// timer task with the same store-level atomicity as request-driven calls;
/// any state other than Pending means a concurrent settlement won and this
/// is a no-op.
pub(crate) async fn auto_confirm(store: &Store, delegation_id: &str) -> Result<()> {
    let mut tx = store.begin().await?;
    let delegation = store.delegation_in_tx(&mut tx, delegation_id).await?;
    if delegation.state != DelegationState::Pending {
        tracing::debug!(
            delegation_id,
            state = delegation.state.as_str(),
            "Auto-confirm skipped, already settled"
        );
        return Ok(());
    }

    settle_receivers(store, &mut tx, &delegation).await?;
    store
        .set_state(&mut tx, delegation_id, DelegationState::Finished)
        .await?;
    tx.commit().await?;

    tracing::info!(delegation_id, "Delegation auto-confirmed after grace window");
    Ok(())
}

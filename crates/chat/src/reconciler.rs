use snafu::{OptionExt, ensure};
use tutor_delivery::DeliveryReceipt;

use super::error::{ChatResult, InvalidTransitionSnafu, UnknownMessageSnafu};
use super::ids::MessageId;
use super::message::{DeliveryFailure, FailureKind, Message, MessageStatus};
use super::retry::RetryPolicy;
use super::store::ConversationStore;

pub const INTERRUPTED_DELIVERY_MESSAGE: &str = "delivery was interrupted before confirmation";

/// Folds delivery outcomes into message records without moving them.
pub struct StatusReconciler;

impl StatusReconciler {
    /// `Pending -> Sent`. The visible content stays what the user typed.
    pub fn confirm(
        store: &mut ConversationStore,
        message_id: MessageId,
        receipt: &DeliveryReceipt,
    ) -> ChatResult<Message> {
        Self::transition(
            store,
            message_id,
            MessageStatus::Sent,
            "reconcile-confirm",
            |message| {
                message.confirmed_id = Some(receipt.confirmed_id.clone());
                message.error = None;
                message.retrying = false;
            },
        )
    }

    /// `Pending -> Failed`, charging the retry budget unless the input itself was refused.
    pub fn fail(
        store: &mut ConversationStore,
        message_id: MessageId,
        failure: DeliveryFailure,
        policy: &RetryPolicy,
    ) -> ChatResult<Message> {
        let current = Self::locate(store, message_id, "reconcile-fail")?;
        let (retry_attempt, terminal) = match failure.kind {
            FailureKind::Validation => (current.retry_attempt, true),
            FailureKind::Transient | FailureKind::Generic => {
                let attempts = current.retry_attempt.saturating_add(1).min(policy.max_attempts);
                (attempts, policy.is_exhausted(attempts))
            }
        };

        Self::transition(
            store,
            message_id,
            MessageStatus::Failed { terminal },
            "reconcile-fail",
            |message| {
                message.retry_attempt = retry_attempt;
                message.error = Some(failure);
                message.retrying = false;
            },
        )
    }

    /// Flags a failed message as waiting on its backoff timer.
    pub fn mark_retrying(
        store: &mut ConversationStore,
        message_id: MessageId,
    ) -> ChatResult<Message> {
        let current = Self::locate(store, message_id, "reconcile-mark-retrying")?;
        let expected = MessageStatus::Failed { terminal: false };
        ensure!(
            current.status == expected,
            InvalidTransitionSnafu {
                stage: "reconcile-mark-retrying",
                message_id,
                from: current.status,
                to: expected,
            }
        );

        store.update(message_id, |message| message.retrying = true)
    }

    /// `Failed -> Pending` as a retry goes out.
    pub fn resume(store: &mut ConversationStore, message_id: MessageId) -> ChatResult<Message> {
        Self::transition(
            store,
            message_id,
            MessageStatus::Pending,
            "reconcile-resume",
            |message| message.retrying = true,
        )
    }

    /// Gives a message that can still be delivered a fresh retry budget.
    ///
    /// Sent and terminal messages keep their count.
    pub fn reset_attempts(
        store: &mut ConversationStore,
        message_id: MessageId,
    ) -> ChatResult<Message> {
        let current = Self::locate(store, message_id, "reconcile-reset-attempts")?;
        if current.status.is_terminal() {
            return Ok(current);
        }

        store.update(message_id, |message| message.retry_attempt = 0)
    }

    /// Settles a message whose task was cancelled by teardown, leaving it retryable.
    pub fn interrupt(
        store: &mut ConversationStore,
        message_id: MessageId,
    ) -> ChatResult<Message> {
        let current = Self::locate(store, message_id, "reconcile-interrupt")?;
        if current.status != MessageStatus::Pending {
            return store.update(message_id, |message| message.retrying = false);
        }

        Self::transition(
            store,
            message_id,
            MessageStatus::Failed { terminal: false },
            "reconcile-interrupt",
            |message| {
                message.error = Some(DeliveryFailure::new(
                    FailureKind::Generic,
                    INTERRUPTED_DELIVERY_MESSAGE,
                ));
                message.retrying = false;
            },
        )
    }

    fn locate(
        store: &ConversationStore,
        message_id: MessageId,
        stage: &'static str,
    ) -> ChatResult<Message> {
        store
            .get(message_id)
            .context(UnknownMessageSnafu { stage, message_id })
    }

    fn transition<F>(
        store: &mut ConversationStore,
        message_id: MessageId,
        next: MessageStatus,
        stage: &'static str,
        apply: F,
    ) -> ChatResult<Message>
    where
        F: FnOnce(&mut Message),
    {
        let current = Self::locate(store, message_id, stage)?;
        ensure!(
            current.status.can_transition_to(next),
            InvalidTransitionSnafu {
                stage,
                message_id,
                from: current.status,
                to: next,
            }
        );

        store.update(message_id, |message| {
            message.status = next;
            apply(message);
        })
    }
}

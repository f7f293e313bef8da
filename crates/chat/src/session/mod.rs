use std::collections::VecDeque;
use std::sync::Arc;

use snafu::OptionExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tutor_delivery::{DeliveryClient, DeliveryReceipt, DeliveryRequest};

use crate::error::{
    AlreadySentSnafu, ChatResult, NotRetryableSnafu, RetryExhaustedSnafu, UnknownMessageSnafu,
};
use crate::events::{SessionEvent, TaskEvent};
use crate::ids::{MessageId, TempId};
use crate::inserter::OptimisticInserter;
use crate::message::{ConnectionStatus, DeliveryFailure, FailureKind, Message, MessageStatus};
use crate::reconciler::StatusReconciler;
use crate::retry::{DispatchKind, RetryCoordinator, RetryDecision, RetryPhase, RetryPolicy};
use crate::settings::ChatSettings;
use crate::store::ConversationStore;
use crate::tab::{Tab, TranscriptHandle};

#[cfg(test)]
mod tests;

/// One conversation surface: four tab transcripts sharing a delivery client.
///
/// The session is the only writer of message state. Delivery attempts and backoff timers
/// run as spawned tasks whose completions are applied by [`ChatSession::next_event`].
pub struct ChatSession {
    store: ConversationStore,
    inserter: OptimisticInserter,
    coordinator: RetryCoordinator,
    client: Arc<dyn DeliveryClient>,
    task_rx: mpsc::UnboundedReceiver<TaskEvent>,
    events: VecDeque<SessionEvent>,
    connection: ConnectionStatus,
}

impl ChatSession {
    pub fn new(client: Arc<dyn DeliveryClient>, policy: RetryPolicy) -> Self {
        Self::with_active_tab(client, policy, Tab::default())
    }

    pub fn with_settings(client: Arc<dyn DeliveryClient>, settings: &ChatSettings) -> Self {
        Self::with_active_tab(client, settings.retry_policy(), settings.default_tab)
    }

    fn with_active_tab(client: Arc<dyn DeliveryClient>, policy: RetryPolicy, active: Tab) -> Self {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        Self {
            store: ConversationStore::new(active),
            inserter: OptimisticInserter::new(),
            coordinator: RetryCoordinator::new(policy, task_tx),
            client,
            task_rx,
            events: VecDeque::new(),
            connection: ConnectionStatus::default(),
        }
    }

    pub fn client_id(&self) -> &str {
        self.client.id()
    }

    pub fn policy(&self) -> RetryPolicy {
        self.coordinator.policy()
    }

    /// Shows `content` at the tail of `tab` immediately and starts delivering it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn insert(&mut self, tab: Tab, content: &str) -> ChatResult<TempId> {
        let message = self.inserter.insert(&mut self.store, tab, content)?;
        let temp_id = message.temp_id.context(UnknownMessageSnafu {
            stage: "session-insert",
            message_id: message.id,
        })?;

        self.dispatch(&message, DispatchKind::Initial);
        self.events.push_back(SessionEvent::MessageInserted {
            message_id: message.id,
            tab,
            temp_id,
        });
        Ok(temp_id)
    }

    /// Inserts into the active tab.
    pub fn submit(&mut self, content: &str) -> ChatResult<TempId> {
        self.insert(self.active_tab(), content)
    }

    /// User-initiated retry of a failed message.
    ///
    /// Returns [`RetryDecision::Ignored`] when the message is still pending or a retry is
    /// already scheduled or in flight.
    pub fn retry(&mut self, message_id: MessageId) -> ChatResult<RetryDecision> {
        let message = self.store.get(message_id).context(UnknownMessageSnafu {
            stage: "session-retry",
            message_id,
        })?;
        let max_attempts = self.policy().max_attempts;

        match message.status {
            MessageStatus::Sent => {
                return AlreadySentSnafu {
                    stage: "session-retry",
                    message_id,
                }
                .fail();
            }
            MessageStatus::Pending => {
                tracing::debug!(message_id = %message_id, "retry ignored while delivery is pending");
                return Ok(RetryDecision::Ignored);
            }
            MessageStatus::Failed { terminal: true } => {
                if let Some(failure) = message
                    .error
                    .as_ref()
                    .filter(|failure| failure.kind == FailureKind::Validation)
                {
                    return NotRetryableSnafu {
                        stage: "session-retry",
                        message_id,
                        reason: failure.message.clone(),
                    }
                    .fail();
                }
                return RetryExhaustedSnafu {
                    stage: "session-retry",
                    message_id,
                    attempts: message.retry_attempt,
                    max_attempts,
                }
                .fail();
            }
            MessageStatus::Failed { terminal: false } => {}
        }

        if self.coordinator.policy().is_exhausted(message.retry_attempt) {
            return RetryExhaustedSnafu {
                stage: "session-retry",
                message_id,
                attempts: message.retry_attempt,
                max_attempts,
            }
            .fail();
        }

        if self.coordinator.is_active(message_id) {
            tracing::debug!(
                message_id = %message_id,
                phase = ?self.coordinator.phase(message_id),
                "retry ignored while another is outstanding"
            );
            return Ok(RetryDecision::Ignored);
        }

        self.schedule_retry(message_id, message.tab)
    }

    /// Removes a message from its tab and cancels anything outstanding for it.
    pub fn dismiss(&mut self, message_id: MessageId) -> ChatResult<Message> {
        self.coordinator.clear_retry_state(message_id);
        let removed = self.store.remove(message_id)?;

        tracing::info!(message_id = %message_id, tab = %removed.tab, "message dismissed");
        self.events.push_back(SessionEvent::MessageDismissed {
            message_id,
            tab: removed.tab,
        });
        Ok(removed)
    }

    /// Cancels any timer or in-flight delivery for the message and zeroes its attempt count.
    ///
    /// An interrupted delivery leaves the message as a retryable failure.
    pub fn clear_retry_state(&mut self, message_id: MessageId) -> bool {
        let cancelled = self.coordinator.clear_retry_state(message_id);
        let Some(message) = self.store.get(message_id) else {
            return cancelled;
        };
        if let Err(error) = StatusReconciler::reset_attempts(&mut self.store, message_id) {
            tracing::warn!(message_id = %message_id, "failed to reset retry attempts: {error}");
        }
        if message.status == MessageStatus::Pending || message.retrying {
            match StatusReconciler::interrupt(&mut self.store, message_id) {
                Ok(message) => self.push_failed(&message),
                Err(error) => {
                    tracing::warn!(message_id = %message_id, "failed to interrupt message: {error}")
                }
            }
        }
        cancelled
    }

    pub fn switch_tab(&mut self, tab: Tab) {
        if let Some(previous) = self.store.router_mut().activate(tab) {
            tracing::debug!(from = %previous, to = %tab, "tab switched");
            self.events.push_back(SessionEvent::TabSwitched {
                from: previous,
                to: tab,
            });
        }
    }

    pub fn active_tab(&self) -> Tab {
        self.store.router().active()
    }

    pub fn messages(&self, tab: Tab) -> Arc<Vec<Message>> {
        self.store.messages(tab)
    }

    /// Live view of one tab's transcript that stays valid across session writes.
    pub fn transcript(&self, tab: Tab) -> TranscriptHandle {
        self.store.transcript(tab)
    }

    pub fn message(&self, message_id: MessageId) -> Option<Message> {
        self.store.get(message_id)
    }

    pub fn find_by_temp_id(&self, temp_id: &TempId) -> Option<Message> {
        self.store.find_by_temp_id(temp_id)
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection
    }

    pub fn retry_phase(&self, message_id: MessageId) -> RetryPhase {
        self.coordinator.phase(message_id)
    }

    pub fn has_pending_work(&self) -> bool {
        !self.events.is_empty() || self.coordinator.active_count() > 0
    }

    /// Empties one tab, cancelling its outstanding deliveries and timers.
    pub fn reset_tab(&mut self, tab: Tab) {
        let removed = self.store.clear_tab(tab);
        for message_id in &removed {
            self.coordinator.clear_retry_state(*message_id);
        }
        self.events.retain(|event| {
            event.tab() != Some(tab) || matches!(event, SessionEvent::TabReset { .. })
        });

        tracing::info!(tab = %tab, removed = removed.len(), "tab reset");
        self.events.push_back(SessionEvent::TabReset { tab });
    }

    /// Empties every tab and returns the connection indicator to online.
    pub fn reset(&mut self) {
        self.coordinator.clear_all();
        let removed = self.store.clear_all();
        self.events.clear();
        self.events
            .extend(Tab::ALL.into_iter().map(|tab| SessionEvent::TabReset { tab }));
        self.set_connection(ConnectionStatus::Online);
        tracing::info!(removed = removed.len(), "conversation reset");
    }

    /// Cancels all outstanding work, leaving unconfirmed messages as retryable failures.
    pub fn teardown(&mut self) {
        let unsettled = Tab::ALL
            .into_iter()
            .flat_map(|tab| self.store.messages(tab).iter().cloned().collect::<Vec<_>>())
            .filter(|message| message.status == MessageStatus::Pending || message.retrying)
            .map(|message| message.id)
            .collect::<Vec<_>>();

        let cancelled = self.coordinator.clear_all();
        for message_id in unsettled {
            self.clear_retry_state(message_id);
        }

        tracing::info!(cancelled = cancelled.len(), "session torn down");
    }

    /// Next notification, applying task completions as they arrive.
    ///
    /// Returns `None` once nothing is queued and no delivery or timer is outstanding.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }
            if self.coordinator.active_count() == 0 {
                return None;
            }

            let task_event = self.task_rx.recv().await?;
            self.apply(task_event);
        }
    }

    /// Drains notifications until every delivery and timer has settled.
    pub async fn run_until_idle(&mut self) -> Vec<SessionEvent> {
        let mut drained = Vec::new();
        while let Some(event) = self.next_event().await {
            drained.push(event);
        }
        drained
    }

    fn apply(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::DeliverySettled {
                message_id,
                generation,
                outcome,
            } => {
                if !self.coordinator.accept_settlement(message_id, generation) {
                    tracing::debug!(
                        message_id = %message_id,
                        generation,
                        "stale delivery outcome dropped"
                    );
                    return;
                }
                match outcome {
                    Ok(receipt) => self.on_delivered(message_id, receipt),
                    Err(failure) => self.on_failed(message_id, failure),
                }
            }
            TaskEvent::RetryDue {
                message_id,
                generation,
            } => {
                if !self.coordinator.accept_timer(message_id, generation) {
                    tracing::debug!(
                        message_id = %message_id,
                        generation,
                        "stale retry timer dropped"
                    );
                    return;
                }
                self.on_retry_due(message_id);
            }
        }
    }

    fn on_delivered(&mut self, message_id: MessageId, receipt: DeliveryReceipt) {
        let message = match StatusReconciler::confirm(&mut self.store, message_id, &receipt) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(message_id = %message_id, "dropping delivery receipt: {error}");
                self.coordinator.complete(message_id);
                return;
            }
        };
        self.coordinator.complete(message_id);

        tracing::info!(
            message_id = %message_id,
            tab = %message.tab,
            attempt = message.retry_attempt,
            confirmed_id = %receipt.confirmed_id,
            "message delivered"
        );
        self.events.push_back(SessionEvent::MessageSent {
            message_id,
            tab: message.tab,
            confirmed_id: receipt.confirmed_id.clone(),
        });
        self.set_connection(ConnectionStatus::Online);

        if let Some(reply) = receipt.reply {
            let reply_id = self.inserter.alloc_message_id();
            let reply =
                Message::assistant_reply(reply_id, message.tab, reply.content, reply.embedded);
            match self.store.append(reply) {
                Ok(()) => self.events.push_back(SessionEvent::ReplyAppended {
                    message_id: reply_id,
                    tab: message.tab,
                }),
                Err(error) => {
                    tracing::warn!(message_id = %message_id, "failed to append tutor reply: {error}")
                }
            }
        }
    }

    fn on_failed(&mut self, message_id: MessageId, failure: DeliveryFailure) {
        let policy = self.policy();
        let kind = failure.kind;
        let message = match StatusReconciler::fail(&mut self.store, message_id, failure, &policy) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(message_id = %message_id, "dropping delivery failure: {error}");
                return;
            }
        };

        tracing::warn!(
            message_id = %message_id,
            tab = %message.tab,
            attempt = message.retry_attempt,
            kind = ?kind,
            "delivery failed"
        );
        self.push_failed(&message);

        if message.status.is_terminal() {
            self.coordinator.mark_terminal(message_id);
            if kind != FailureKind::Validation {
                self.events.push_back(SessionEvent::RetryExhausted {
                    message_id,
                    tab: message.tab,
                });
                self.set_connection(ConnectionStatus::Reconnecting);
            }
            return;
        }

        if !policy.auto_retry {
            return;
        }
        if let Err(error) = self.schedule_retry(message_id, message.tab) {
            tracing::warn!(message_id = %message_id, "failed to schedule retry: {error}");
        }
    }

    fn on_retry_due(&mut self, message_id: MessageId) {
        let message = match StatusReconciler::resume(&mut self.store, message_id) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(
                    message_id = %message_id,
                    "retry timer fired for a settled message: {error}"
                );
                return;
            }
        };

        let attempt = self.dispatch(&message, DispatchKind::Retry);
        self.events.push_back(SessionEvent::RetryStarted {
            message_id,
            tab: message.tab,
            attempt,
        });
    }

    fn schedule_retry(&mut self, message_id: MessageId, tab: Tab) -> ChatResult<RetryDecision> {
        StatusReconciler::mark_retrying(&mut self.store, message_id)?;
        let decision = self.coordinator.schedule_retry(message_id, Instant::now());
        match decision {
            RetryDecision::Scheduled { delay } => {
                self.events.push_back(SessionEvent::RetryScheduled {
                    message_id,
                    tab,
                    delay,
                });
            }
            RetryDecision::Ignored => {
                self.store.update(message_id, |message| message.retrying = false)?;
            }
        }
        Ok(decision)
    }

    fn dispatch(&mut self, message: &Message, kind: DispatchKind) -> u32 {
        let request = DeliveryRequest::new(message.tab.as_str(), message.content.clone());
        self.coordinator
            .dispatch(message.id, kind, Arc::clone(&self.client), request)
    }

    fn push_failed(&mut self, message: &Message) {
        let MessageStatus::Failed { terminal } = message.status else {
            return;
        };
        self.events.push_back(SessionEvent::MessageFailed {
            message_id: message.id,
            tab: message.tab,
            kind: message
                .error
                .as_ref()
                .map(|failure| failure.kind)
                .unwrap_or(FailureKind::Generic),
            retry_attempt: message.retry_attempt,
            terminal,
        });
    }

    fn set_connection(&mut self, status: ConnectionStatus) {
        if self.connection == status {
            return;
        }
        tracing::info!(from = ?self.connection, to = ?status, "connection status changed");
        self.connection = status;
        self.events.push_back(SessionEvent::ConnectionChanged(status));
    }
}

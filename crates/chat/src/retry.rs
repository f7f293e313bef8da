use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tutor_delivery::{DeliveryClient, DeliveryRequest};

use crate::events::TaskEvent;
use crate::ids::MessageId;
use crate::message::DeliveryFailure;

pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_RETRY_MULTIPLIER: u32 = 2;
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Exponential backoff bounded by an attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_attempts: u32,
    /// Schedule a retry as soon as a retryable failure lands.
    pub auto_retry: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_RETRY_BASE_DELAY,
            multiplier: DEFAULT_RETRY_MULTIPLIER,
            max_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            auto_retry: true,
        }
    }
}

impl RetryPolicy {
    /// `base * multiplier^attempt`, where `attempt` counts retries already dispatched.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(self.multiplier.saturating_pow(attempt))
    }

    /// Part of the delay still owed after `elapsed` has passed since the last attempt.
    pub fn remaining_delay(&self, attempt: u32, elapsed: Duration) -> Duration {
        self.delay_for(attempt).saturating_sub(elapsed)
    }

    pub fn is_exhausted(&self, retry_attempt: u32) -> bool {
        retry_attempt >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPhase {
    #[default]
    Idle,
    Scheduled {
        delay: Duration,
    },
    InFlight,
    Terminal,
}

impl RetryPhase {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Scheduled { .. } | Self::InFlight)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled { delay: Duration },
    /// A retry is already scheduled or in flight; the request was dropped.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchKind {
    Initial,
    Retry,
}

/// Cancel side of one spawned task. Dropping it cancels the task too.
#[derive(Debug)]
pub(crate) struct TaskHandle {
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl TaskHandle {
    fn new(cancel_tx: oneshot::Sender<()>) -> Self {
        Self {
            cancel_tx: Some(cancel_tx),
        }
    }

    fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Debug, Default)]
pub struct RetryState {
    attempt: u32,
    last_attempt_at: Option<Instant>,
    phase: RetryPhase,
    generation: u64,
    handle: Option<TaskHandle>,
}

impl RetryState {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn last_attempt_at(&self) -> Option<Instant> {
        self.last_attempt_at
    }

    pub fn phase(&self) -> RetryPhase {
        self.phase
    }

    pub fn retrying(&self) -> bool {
        match self.phase {
            RetryPhase::Scheduled { .. } => true,
            RetryPhase::InFlight => self.attempt > 0,
            RetryPhase::Idle | RetryPhase::Terminal => false,
        }
    }
}

/// Per-message backoff state machine.
///
/// Each delivery and each backoff timer runs as its own task; the coordinator keeps the
/// cancel handle and reports completions over the session's task channel.
pub struct RetryCoordinator {
    policy: RetryPolicy,
    states: HashMap<MessageId, RetryState>,
    task_tx: mpsc::UnboundedSender<TaskEvent>,
    next_generation: u64,
}

impl RetryCoordinator {
    pub(crate) fn new(policy: RetryPolicy, task_tx: mpsc::UnboundedSender<TaskEvent>) -> Self {
        Self {
            policy,
            states: HashMap::new(),
            task_tx,
            next_generation: 0,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn state(&self, message_id: MessageId) -> Option<&RetryState> {
        self.states.get(&message_id)
    }

    pub fn phase(&self, message_id: MessageId) -> RetryPhase {
        self.states
            .get(&message_id)
            .map(RetryState::phase)
            .unwrap_or_default()
    }

    pub fn is_active(&self, message_id: MessageId) -> bool {
        self.phase(message_id).is_active()
    }

    pub fn active_count(&self) -> usize {
        self.states
            .values()
            .filter(|state| state.phase.is_active())
            .count()
    }

    /// Spawns one delivery attempt and returns the retry count it represents.
    pub(crate) fn dispatch(
        &mut self,
        message_id: MessageId,
        kind: DispatchKind,
        client: Arc<dyn DeliveryClient>,
        request: DeliveryRequest,
    ) -> u32 {
        let generation = self.issue_generation();
        let task_tx = self.task_tx.clone();
        let state = self.states.entry(message_id).or_default();

        if let Some(mut previous) = state.handle.take() {
            previous.cancel();
        }
        if kind == DispatchKind::Retry {
            state.attempt = state.attempt.saturating_add(1);
        }
        state.phase = RetryPhase::InFlight;
        state.generation = generation;
        state.last_attempt_at = Some(Instant::now());

        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = &mut cancel_rx => {
                    tracing::debug!(message_id = %message_id, generation, "delivery task cancelled");
                    return;
                }
                outcome = client.send(request) => outcome,
            };

            let outcome = outcome.map_err(|error| DeliveryFailure::from(&error));
            let _ = task_tx.send(TaskEvent::DeliverySettled {
                message_id,
                generation,
                outcome,
            });
        });
        state.handle = Some(TaskHandle::new(cancel_tx));

        tracing::debug!(
            message_id = %message_id,
            attempt = state.attempt,
            generation,
            "delivery dispatched"
        );
        state.attempt
    }

    /// Arms the backoff timer for a failed message.
    ///
    /// Only the part of the delay not already spent since the last attempt is waited, so
    /// repeated requests never restart the clock. Requests while a retry is scheduled or
    /// in flight are dropped.
    pub(crate) fn schedule_retry(&mut self, message_id: MessageId, now: Instant) -> RetryDecision {
        let policy = self.policy;
        if self.phase(message_id) != RetryPhase::Idle {
            tracing::debug!(
                message_id = %message_id,
                phase = ?self.phase(message_id),
                "retry request ignored"
            );
            return RetryDecision::Ignored;
        }

        let generation = self.issue_generation();
        let task_tx = self.task_tx.clone();
        let state = self.states.entry(message_id).or_default();
        let elapsed = state
            .last_attempt_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();
        let delay = policy.remaining_delay(state.attempt, elapsed);

        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = &mut cancel_rx => {
                    tracing::debug!(message_id = %message_id, generation, "retry timer cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    let _ = task_tx.send(TaskEvent::RetryDue { message_id, generation });
                }
            }
        });

        state.handle = Some(TaskHandle::new(cancel_tx));
        state.phase = RetryPhase::Scheduled { delay };
        state.generation = generation;

        tracing::debug!(
            message_id = %message_id,
            attempt = state.attempt,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );
        RetryDecision::Scheduled { delay }
    }

    /// Consumes a timer firing; false when it belongs to a cancelled or replaced timer.
    pub(crate) fn accept_timer(&mut self, message_id: MessageId, generation: u64) -> bool {
        let Some(state) = self.states.get_mut(&message_id) else {
            return false;
        };
        if state.generation != generation || !matches!(state.phase, RetryPhase::Scheduled { .. })
        {
            return false;
        }

        state.phase = RetryPhase::Idle;
        state.handle = None;
        true
    }

    /// Consumes a delivery completion; false when it is stale.
    pub(crate) fn accept_settlement(&mut self, message_id: MessageId, generation: u64) -> bool {
        let Some(state) = self.states.get_mut(&message_id) else {
            return false;
        };
        if state.generation != generation || state.phase != RetryPhase::InFlight {
            return false;
        }

        state.phase = RetryPhase::Idle;
        state.handle = None;
        true
    }

    pub(crate) fn mark_terminal(&mut self, message_id: MessageId) {
        let state = self.states.entry(message_id).or_default();
        state.phase = RetryPhase::Terminal;
        state.handle = None;
    }

    /// Forgets a delivered message.
    pub(crate) fn complete(&mut self, message_id: MessageId) {
        self.states.remove(&message_id);
    }

    /// Cancels any timer or in-flight task and zeroes the attempt count.
    ///
    /// Returns true when a task was actually cancelled.
    pub fn clear_retry_state(&mut self, message_id: MessageId) -> bool {
        let Some(mut state) = self.states.remove(&message_id) else {
            return false;
        };

        let cancelled = state
            .handle
            .take()
            .map(|mut handle| handle.cancel())
            .unwrap_or(false);
        if cancelled {
            tracing::debug!(message_id = %message_id, phase = ?state.phase, "retry state cleared");
        }
        cancelled
    }

    /// Clears every message; returns the ids that had a live task.
    pub fn clear_all(&mut self) -> Vec<MessageId> {
        let message_ids = self.states.keys().copied().collect::<Vec<_>>();
        message_ids
            .into_iter()
            .filter(|message_id| self.clear_retry_state(*message_id))
            .collect()
    }

    fn issue_generation(&mut self) -> u64 {
        self.next_generation = self.next_generation.wrapping_add(1);
        self.next_generation
    }
}

#[cfg(test)]
mod tests {
    use tutor_delivery::{ScriptedDeliveryClient, ScriptedOutcome};

    use super::*;

    fn coordinator(policy: RetryPolicy) -> (RetryCoordinator, mpsc::UnboundedReceiver<TaskEvent>) {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        (RetryCoordinator::new(policy, task_tx), task_rx)
    }

    #[test]
    fn delay_doubles_per_dispatched_retry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4_000));
        assert_eq!(
            policy.remaining_delay(1, Duration::from_millis(1_500)),
            Duration::from_millis(500)
        );
        assert_eq!(
            policy.remaining_delay(0, Duration::from_secs(30)),
            Duration::ZERO
        );
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(policy.delay_for(u32::MAX) > Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_only_the_unspent_part_of_the_delay() {
        let (mut coordinator, mut task_rx) = coordinator(RetryPolicy::default());
        let client = Arc::new(ScriptedDeliveryClient::new([
            ScriptedOutcome::network_failure("offline"),
        ]));
        let message_id = MessageId::new(7);

        coordinator.dispatch(
            message_id,
            DispatchKind::Initial,
            client.clone(),
            DeliveryRequest::new("home", "hello"),
        );
        let Some(TaskEvent::DeliverySettled {
            generation,
            outcome,
            ..
        }) = task_rx.recv().await
        else {
            panic!("expected a settled delivery");
        };
        assert!(outcome.is_err());
        assert!(coordinator.accept_settlement(message_id, generation));

        tokio::time::advance(Duration::from_millis(600)).await;
        let decision = coordinator.schedule_retry(message_id, Instant::now());
        assert_eq!(
            decision,
            RetryDecision::Scheduled {
                delay: Duration::from_millis(400)
            }
        );
        assert_eq!(
            coordinator.schedule_retry(message_id, Instant::now()),
            RetryDecision::Ignored
        );
        assert!(coordinator.state(message_id).is_some_and(RetryState::retrying));

        let scheduled_at = Instant::now();
        let Some(TaskEvent::RetryDue { generation, .. }) = task_rx.recv().await else {
            panic!("expected the retry timer to fire");
        };
        let waited = scheduled_at.elapsed();
        assert!(waited >= Duration::from_millis(400));
        assert!(waited < Duration::from_millis(1_000));
        assert!(coordinator.accept_timer(message_id, generation));
        assert!(!coordinator.accept_timer(message_id, generation));

        let attempt = coordinator.dispatch(
            message_id,
            DispatchKind::Retry,
            client.clone(),
            DeliveryRequest::new("home", "hello"),
        );
        assert_eq!(attempt, 1);
        assert_eq!(coordinator.phase(message_id), RetryPhase::InFlight);
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_cancels_the_timer_and_resets_attempts() {
        let (mut coordinator, mut task_rx) = coordinator(RetryPolicy::default());
        let message_id = MessageId::new(3);

        let decision = coordinator.schedule_retry(message_id, Instant::now());
        assert_eq!(
            decision,
            RetryDecision::Scheduled {
                delay: Duration::from_millis(1_000)
            }
        );
        assert_eq!(coordinator.active_count(), 1);

        assert!(coordinator.clear_retry_state(message_id));
        assert!(coordinator.state(message_id).is_none());
        assert_eq!(coordinator.active_count(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(task_rx.try_recv().is_err());
        assert!(!coordinator.clear_retry_state(message_id));
    }

    #[tokio::test]
    async fn stale_settlements_are_rejected() {
        let (mut coordinator, mut task_rx) = coordinator(RetryPolicy::default());
        let client: Arc<dyn DeliveryClient> = Arc::new(ScriptedDeliveryClient::default());
        let message_id = MessageId::new(1);

        coordinator.dispatch(
            message_id,
            DispatchKind::Initial,
            client.clone(),
            DeliveryRequest::new("home", "first"),
        );
        let first = match task_rx.recv().await {
            Some(TaskEvent::DeliverySettled { generation, .. }) => generation,
            other => panic!("unexpected task event: {other:?}"),
        };

        coordinator.clear_retry_state(message_id);
        coordinator.dispatch(
            message_id,
            DispatchKind::Initial,
            client,
            DeliveryRequest::new("home", "first"),
        );

        assert!(!coordinator.accept_settlement(message_id, first));
        assert_eq!(coordinator.phase(message_id), RetryPhase::InFlight);
    }
}

use std::time::Duration;

use tutor_delivery::DeliveryReceipt;

use crate::ids::{MessageId, TempId};
use crate::message::{ConnectionStatus, DeliveryFailure, FailureKind};
use crate::tab::Tab;

/// Notifications for the render surface, in the order their effects were applied.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    MessageInserted {
        message_id: MessageId,
        tab: Tab,
        temp_id: TempId,
    },
    MessageSent {
        message_id: MessageId,
        tab: Tab,
        confirmed_id: String,
    },
    MessageFailed {
        message_id: MessageId,
        tab: Tab,
        kind: FailureKind,
        retry_attempt: u32,
        terminal: bool,
    },
    RetryScheduled {
        message_id: MessageId,
        tab: Tab,
        delay: Duration,
    },
    RetryStarted {
        message_id: MessageId,
        tab: Tab,
        attempt: u32,
    },
    RetryExhausted {
        message_id: MessageId,
        tab: Tab,
    },
    ReplyAppended {
        message_id: MessageId,
        tab: Tab,
    },
    MessageDismissed {
        message_id: MessageId,
        tab: Tab,
    },
    TabSwitched {
        from: Tab,
        to: Tab,
    },
    TabReset {
        tab: Tab,
    },
    ConnectionChanged(ConnectionStatus),
}

impl SessionEvent {
    /// Tab whose transcript changed, if any.
    pub fn tab(&self) -> Option<Tab> {
        match self {
            Self::MessageInserted { tab, .. }
            | Self::MessageSent { tab, .. }
            | Self::MessageFailed { tab, .. }
            | Self::RetryScheduled { tab, .. }
            | Self::RetryStarted { tab, .. }
            | Self::RetryExhausted { tab, .. }
            | Self::ReplyAppended { tab, .. }
            | Self::MessageDismissed { tab, .. }
            | Self::TabReset { tab } => Some(*tab),
            Self::TabSwitched { .. } | Self::ConnectionChanged(_) => None,
        }
    }
}

/// Completion reported by a spawned delivery or timer task.
///
/// `generation` identifies the task issuance; anything older than the coordinator's
/// current generation for that message is stale and dropped.
#[derive(Debug)]
pub(crate) enum TaskEvent {
    DeliverySettled {
        message_id: MessageId,
        generation: u64,
        outcome: Result<DeliveryReceipt, DeliveryFailure>,
    },
    RetryDue {
        message_id: MessageId,
        generation: u64,
    },
}

use std::time::{SystemTime, UNIX_EPOCH};

use tutor_delivery::{DeliveryError, EmbeddedPayload, FailureCategory};

use super::ids::{MessageId, TempId};
use super::tab::Tab;

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Author {
    User,
    Assistant,
}

/// Delivery lifecycle of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Pending,
    Sent,
    /// `terminal` failures accept no further retries.
    Failed { terminal: bool },
}

impl MessageStatus {
    /// Allowed moves: `Pending -> Sent | Failed` and `Failed(retryable) -> Pending`.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Sent)
                | (Self::Pending, Self::Failed { .. })
                | (Self::Failed { terminal: false }, Self::Pending)
                | (Self::Failed { terminal: false }, Self::Failed { terminal: true })
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed { terminal: true })
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "sending",
            Self::Sent => "sent",
            Self::Failed { terminal: false } => "failed",
            Self::Failed { terminal: true } => "not delivered",
        }
    }
}

/// Failure taxonomy as the conversation sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Network or timeout-like failure.
    Transient,
    /// Any other service failure; retried exactly like `Transient`.
    Generic,
    /// The service refused the input itself. Never retried and consumes no attempt.
    Validation,
}

impl FailureKind {
    pub fn headline(self) -> &'static str {
        match self {
            Self::Transient => "Connection problem",
            Self::Generic => "Couldn't send",
            Self::Validation => "Message was rejected",
        }
    }
}

impl From<FailureCategory> for FailureKind {
    fn from(category: FailureCategory) -> Self {
        match category {
            FailureCategory::Network => Self::Transient,
            FailureCategory::Validation => Self::Validation,
            FailureCategory::Other => Self::Generic,
        }
    }
}

/// Error text stored on a failed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl DeliveryFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&DeliveryError> for DeliveryFailure {
    fn from(error: &DeliveryError) -> Self {
        Self::new(error.category().into(), error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub tab: Tab,
    pub author: Author,
    pub content: String,
    pub created_at_unix_ms: u64,
    pub status: MessageStatus,
    pub temp_id: Option<TempId>,
    pub confirmed_id: Option<String>,
    pub error: Option<DeliveryFailure>,
    /// Failed delivery attempts that counted against the retry budget.
    pub retry_attempt: u32,
    /// Set while a retry is scheduled or in flight.
    pub retrying: bool,
    pub embedded: Option<EmbeddedPayload>,
}

impl Message {
    /// Creates the tentative record shown before delivery is confirmed.
    pub fn user_pending(
        id: MessageId,
        temp_id: TempId,
        tab: Tab,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id,
            tab,
            author: Author::User,
            content: content.into(),
            created_at_unix_ms: current_unix_millis(),
            status: MessageStatus::Pending,
            temp_id: Some(temp_id),
            confirmed_id: None,
            error: None,
            retry_attempt: 0,
            retrying: false,
            embedded: None,
        }
    }

    /// Creates a tutor reply; replies arrive already delivered.
    pub fn assistant_reply(
        id: MessageId,
        tab: Tab,
        content: impl Into<String>,
        embedded: Option<EmbeddedPayload>,
    ) -> Self {
        Self {
            id,
            tab,
            author: Author::Assistant,
            content: content.into(),
            created_at_unix_ms: current_unix_millis(),
            status: MessageStatus::Sent,
            temp_id: None,
            confirmed_id: None,
            error: None,
            retry_attempt: 0,
            retrying: false,
            embedded,
        }
    }

    /// Status text that tells a refused message apart from one that ran out of retries.
    pub fn status_label(&self) -> &'static str {
        let refused = self
            .error
            .as_ref()
            .is_some_and(|failure| failure.kind == FailureKind::Validation);
        match self.status {
            MessageStatus::Failed { terminal: true } if refused => "rejected",
            status => status.label(),
        }
    }

    /// Whether the inline retry control should be enabled.
    pub fn can_retry(&self) -> bool {
        matches!(self.status, MessageStatus::Failed { terminal: false }) && !self.retrying
    }
}

/// Conversation-level delivery health shown next to the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionStatus {
    #[default]
    Online,
    /// A message exhausted its retries and nothing has been delivered since.
    Reconnecting,
}

impl ConnectionStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Online => "Online",
            Self::Reconnecting => "Reconnecting…",
        }
    }
}

pub(crate) fn current_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

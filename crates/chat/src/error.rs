use snafu::Snafu;

use super::ids::{MessageId, TempId};
use super::message::MessageStatus;
use super::tab::Tab;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("cannot send an empty message to the '{tab}' tab"))]
    EmptyContent { stage: &'static str, tab: Tab },
    #[snafu(display("message {message_id} was not found"))]
    UnknownMessage {
        stage: &'static str,
        message_id: MessageId,
    },
    #[snafu(display("temporary id {temp_id} is already bound to a live message"))]
    DuplicateTempId {
        stage: &'static str,
        temp_id: TempId,
    },
    #[snafu(display("message {message_id} cannot move from {from:?} to {to:?}"))]
    InvalidTransition {
        stage: &'static str,
        message_id: MessageId,
        from: MessageStatus,
        to: MessageStatus,
    },
    #[snafu(display("message {message_id} was already delivered"))]
    AlreadySent {
        stage: &'static str,
        message_id: MessageId,
    },
    #[snafu(display(
        "message {message_id} exhausted its retries ({attempts} of {max_attempts})"
    ))]
    RetryExhausted {
        stage: &'static str,
        message_id: MessageId,
        attempts: u32,
        max_attempts: u32,
    },
    #[snafu(display("message {message_id} cannot be retried: {reason}"))]
    NotRetryable {
        stage: &'static str,
        message_id: MessageId,
        reason: String,
    },
    #[snafu(display("unknown conversation tab '{raw}'"))]
    UnknownTab { stage: &'static str, raw: String },
    #[snafu(display("temporary id '{raw}' is not a valid uuid"))]
    InvalidTempId {
        stage: &'static str,
        raw: String,
        source: uuid::Error,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;

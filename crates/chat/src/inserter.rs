use snafu::ensure;

use super::error::{ChatResult, EmptyContentSnafu};
use super::ids::{MessageId, TempId};
use super::message::Message;
use super::store::ConversationStore;
use super::tab::Tab;

/// Issues ids and appends tentative messages without touching the network.
#[derive(Debug)]
pub struct OptimisticInserter {
    next_message_id: u64,
}

impl Default for OptimisticInserter {
    fn default() -> Self {
        Self { next_message_id: 1 }
    }
}

impl OptimisticInserter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_message_id(&mut self) -> MessageId {
        let id = MessageId::new(self.next_message_id);
        self.next_message_id = self.next_message_id.saturating_add(1);
        id
    }

    /// Appends a `Pending` user message to the tail of `tab`.
    ///
    /// Whitespace-only content is rejected before any id is issued.
    pub fn insert(
        &mut self,
        store: &mut ConversationStore,
        tab: Tab,
        content: &str,
    ) -> ChatResult<Message> {
        ensure!(
            !content.trim().is_empty(),
            EmptyContentSnafu {
                stage: "optimistic-insert",
                tab,
            }
        );

        let message_id = self.alloc_message_id();
        let message = Message::user_pending(message_id, TempId::new_v7(), tab, content);
        store.append(message.clone())?;

        tracing::debug!(
            message_id = %message.id,
            tab = %tab,
            "optimistic message inserted"
        );
        Ok(message)
    }
}

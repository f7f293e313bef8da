use std::collections::HashMap;
use std::sync::Arc;

use snafu::{OptionExt, ensure};

use super::error::{ChatResult, DuplicateTempIdSnafu, UnknownMessageSnafu};
use super::ids::{MessageId, TempId};
use super::message::Message;
use super::tab::{Tab, TabRouter, TranscriptHandle};

/// Owns every tab's message sequence.
///
/// Sequences are never edited in place: each write builds the next sequence (append or
/// replace-by-id) and publishes it for exactly one tab.
pub struct ConversationStore {
    router: TabRouter,
    locations: HashMap<MessageId, Tab>,
    temp_ids: HashMap<TempId, MessageId>,
}

impl ConversationStore {
    pub fn new(active: Tab) -> Self {
        Self {
            router: TabRouter::new(active),
            locations: HashMap::new(),
            temp_ids: HashMap::new(),
        }
    }

    pub fn router(&self) -> &TabRouter {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut TabRouter {
        &mut self.router
    }

    pub fn messages(&self, tab: Tab) -> Arc<Vec<Message>> {
        self.router.snapshot(tab)
    }

    pub fn transcript(&self, tab: Tab) -> TranscriptHandle {
        self.router.handle(tab)
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn tab_of(&self, message_id: MessageId) -> Option<Tab> {
        self.locations.get(&message_id).copied()
    }

    pub fn get(&self, message_id: MessageId) -> Option<Message> {
        let tab = self.tab_of(message_id)?;
        self.router
            .snapshot(tab)
            .iter()
            .find(|message| message.id == message_id)
            .cloned()
    }

    pub fn find_by_temp_id(&self, temp_id: &TempId) -> Option<Message> {
        let message_id = self.temp_ids.get(temp_id)?;
        self.get(*message_id)
    }

    /// Appends to the tail of the message's own tab.
    pub fn append(&mut self, message: Message) -> ChatResult<()> {
        if let Some(temp_id) = message.temp_id {
            ensure!(
                !self.temp_ids.contains_key(&temp_id),
                DuplicateTempIdSnafu {
                    stage: "store-append",
                    temp_id,
                }
            );
            self.temp_ids.insert(temp_id, message.id);
        }

        let tab = message.tab;
        let current = self.router.snapshot(tab);
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        self.locations.insert(message.id, tab);
        next.push(message);
        self.router.publish(tab, next);
        Ok(())
    }

    /// Replaces one record in place, keeping its position, and returns the new value.
    pub fn update<F>(&mut self, message_id: MessageId, apply: F) -> ChatResult<Message>
    where
        F: FnOnce(&mut Message),
    {
        let tab = self.tab_of(message_id).context(UnknownMessageSnafu {
            stage: "store-update-locate",
            message_id,
        })?;

        let current = self.router.snapshot(tab);
        let position = current
            .iter()
            .position(|message| message.id == message_id)
            .context(UnknownMessageSnafu {
                stage: "store-update-position",
                message_id,
            })?;

        let mut updated = current[position].clone();
        apply(&mut updated);
        // Identity and placement belong to the store, not to the caller.
        updated.id = message_id;
        updated.tab = tab;

        let next = current
            .iter()
            .enumerate()
            .map(|(index, message)| {
                if index == position {
                    updated.clone()
                } else {
                    message.clone()
                }
            })
            .collect::<Vec<_>>();
        self.router.publish(tab, next);
        Ok(updated)
    }

    pub fn remove(&mut self, message_id: MessageId) -> ChatResult<Message> {
        let tab = self.locations.remove(&message_id).context(UnknownMessageSnafu {
            stage: "store-remove-locate",
            message_id,
        })?;

        let current = self.router.snapshot(tab);
        let mut removed = None;
        let next = current
            .iter()
            .filter(|message| {
                if message.id == message_id {
                    removed = Some((*message).clone());
                    false
                } else {
                    true
                }
            })
            .cloned()
            .collect::<Vec<_>>();

        let removed = removed.context(UnknownMessageSnafu {
            stage: "store-remove-position",
            message_id,
        })?;
        if let Some(temp_id) = removed.temp_id {
            self.temp_ids.remove(&temp_id);
        }
        self.router.publish(tab, next);
        Ok(removed)
    }

    /// Empties one tab and returns the ids that were dropped.
    pub fn clear_tab(&mut self, tab: Tab) -> Vec<MessageId> {
        let removed = self.router.snapshot(tab);
        for message in removed.iter() {
            self.locations.remove(&message.id);
            if let Some(temp_id) = message.temp_id {
                self.temp_ids.remove(&temp_id);
            }
        }
        self.router.publish(tab, Vec::new());
        removed.iter().map(|message| message.id).collect()
    }

    pub fn clear_all(&mut self) -> Vec<MessageId> {
        Tab::ALL
            .into_iter()
            .flat_map(|tab| self.clear_tab(tab))
            .collect()
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(Tab::default())
    }
}
